//! Address registry service: loads, probes, ranks and persists the bootstrap
//! list.
//!
//! Probes run without holding the list lock; results are applied under it.
//! Identity overrides happen under the same lock so two overrides can never
//! interleave.

use burrow_protocol::{P2pInfo, TunnelTiming};
use burrow_storage::{Storage, StorageExt, BOOTSTRAP_LIST_KEY};
use libp2p::futures::future::join_all;
use libp2p::{Multiaddr, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::address::{AddressRecord, BootstrapAddress};
use crate::list::{BootstrapList, Identity};
use crate::probe::Prober;
use crate::{now_ms, RegistryError};

#[derive(Debug, Clone, Copy, Default)]
pub struct AddOptions {
    /// Replace the canonical peer id if this address disagrees with it.
    pub override_server_id: bool,
    /// Probe timeout; defaults to twice the best known latency.
    pub stats_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added {
        address: BootstrapAddress,
        /// Previous canonical id when this add overrode it.
        replaced_identity: Option<PeerId>,
    },
    AlreadyKnown,
    IdentityMismatch { current: PeerId },
    /// Probe failed and the address has no recent sighting.
    Stale,
}

pub struct Registry {
    list: Mutex<BootstrapList>,
    storage: Arc<dyn Storage>,
    prober: Arc<dyn Prober>,
    timing: TunnelTiming,
}

impl Registry {
    pub fn new(storage: Arc<dyn Storage>, prober: Arc<dyn Prober>, timing: TunnelTiming) -> Self {
        Self {
            list: Mutex::new(BootstrapList::new(timing.stale_window(), timing.address_limit)),
            storage,
            prober,
            timing,
        }
    }

    pub async fn server_id(&self) -> Option<PeerId> {
        self.list.lock().await.server_id()
    }

    pub async fn len(&self) -> usize {
        self.list.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.list.lock().await.is_empty()
    }

    /// Best addresses for dialing, bounded to the configured limit.
    pub async fn ranked_multiaddrs(&self) -> Vec<Multiaddr> {
        self.list.lock().await.ranked_multiaddrs()
    }

    /// Every address, best first, for re-seeding a dialer's address book.
    pub async fn all_multiaddrs(&self) -> Vec<Multiaddr> {
        self.list.lock().await.all_multiaddrs()
    }

    pub async fn snapshot(&self) -> Vec<BootstrapAddress> {
        self.list.lock().await.snapshot()
    }

    // ========================================================================
    // Adding addresses
    // ========================================================================

    /// Validate, probe and admit a discovered address string.
    pub async fn add_address(&self, input: &str, opts: AddOptions) -> Result<AddOutcome, RegistryError> {
        let addr = match BootstrapAddress::parse(input) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!("registry: dropping candidate: {e}");
                return Err(e.into());
            }
        };
        Ok(self.admit(addr, opts).await)
    }

    async fn admit(&self, mut addr: BootstrapAddress, opts: AddOptions) -> AddOutcome {
        let key = addr.key();
        let timeout = {
            let list = self.list.lock().await;
            if list.contains(&key) {
                return AddOutcome::AlreadyKnown;
            }
            if let Identity::Conflicts { current } = list.identity_of(&addr) {
                if !opts.override_server_id {
                    tracing::warn!(%key, %current, "registry: address peer id disagrees, dropping");
                    return AddOutcome::IdentityMismatch { current };
                }
            }
            opts.stats_timeout.unwrap_or_else(|| self.default_timeout(&list))
        };

        let latency = self.prober.probe(&addr, timeout).await;
        let now = now_ms();
        addr.observe(latency, now);
        if !addr.is_recent(now, self.timing.stale_window()) {
            tracing::debug!(%key, "registry: unreachable and not recently seen, dropping");
            return AddOutcome::Stale;
        }

        let mut list = self.list.lock().await;
        let mut replaced_identity = None;
        match list.identity_of(&addr) {
            Identity::Conflicts { current } if opts.override_server_id => {
                tracing::warn!(
                    old = %current,
                    new = %addr.server_id(),
                    rewritten = list.len(),
                    "registry: server peer id changed, overriding cached addresses"
                );
                replaced_identity = list.override_identity(addr.server_id());
            }
            Identity::Conflicts { current } => return AddOutcome::IdentityMismatch { current },
            Identity::Unset | Identity::Matches => {}
        }
        if !list.insert(addr.clone()) {
            return AddOutcome::AlreadyKnown;
        }
        tracing::info!(%key, latency = addr.latency.name(), "registry: address added");
        AddOutcome::Added {
            address: addr,
            replaced_identity,
        }
    }

    fn default_timeout(&self, list: &BootstrapList) -> Duration {
        list.best_latency()
            .map(|d| d * 2)
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_millis(self.timing.fallback_probe_timeout_ms))
    }

    /// Feed an address announced by the home peer over the relay stream.
    pub async fn add_announced(&self, input: &str) -> Result<AddOutcome, RegistryError> {
        let outcome = self
            .add_address(
                input,
                AddOptions {
                    override_server_id: false,
                    stats_timeout: Some(Duration::from_millis(self.timing.stats_timeout_ms)),
                },
            )
            .await?;
        if matches!(outcome, AddOutcome::Added { .. }) {
            self.persist().await?;
        }
        Ok(outcome)
    }

    // ========================================================================
    // Load / refresh / persist
    // ========================================================================

    /// Startup sequence: cache, then the direct-query answer and its derived
    /// hostname forms. Fails if no usable address or peer id results.
    pub async fn load(&self, direct: Option<&P2pInfo>, server_host: Option<&str>) -> Result<(), RegistryError> {
        let cached = self.load_cache().await?;
        tracing::debug!(cached, "registry: cache loaded");

        if let Some(info) = direct {
            if let Some(local) = info.local_multiaddr.as_deref() {
                let opts = AddOptions {
                    override_server_id: true,
                    stats_timeout: Some(Duration::from_millis(self.timing.local_probe_timeout_ms)),
                };
                let added_local = match self.add_address(local, opts).await {
                    Ok(AddOutcome::Added { .. }) => true,
                    Ok(outcome) => {
                        tracing::debug!(?outcome, "registry: local address not added");
                        false
                    }
                    Err(_) => false,
                };
                // Hostname forms only follow a freshly admitted local address
                if let (true, Some(host)) = (added_local, server_host) {
                    tracing::info!(%local, "registry: fetched updated local address");
                    for derived in derived_forms(local, host) {
                        let _ = self.add_address(&derived, AddOptions::default()).await;
                    }
                }
            }
            if let Some(public) = info.public_multiaddr.as_deref() {
                let _ = self.add_address(public, AddOptions::default()).await;
            }
        }

        {
            let list = self.list.lock().await;
            if list.is_empty() || list.server_id().is_none() {
                tracing::error!("registry: no usable addresses after load");
                return Err(RegistryError::NoUsableAddresses);
            }
        }
        self.persist().await?;
        Ok(())
    }

    /// Read cached records and re-admit them, keeping their last sighting.
    async fn load_cache(&self) -> Result<usize, RegistryError> {
        let records: Vec<AddressRecord> = self
            .storage
            .get_document(BOOTSTRAP_LIST_KEY)?
            .unwrap_or_default();

        let mut admitted = 0;
        for record in records {
            match BootstrapAddress::from_record(&record) {
                Ok(addr) => {
                    if let AddOutcome::Added { .. } = self.admit(addr, AddOptions::default()).await {
                        admitted += 1;
                    }
                }
                Err(e) => tracing::warn!("registry: dropping cached record: {e}"),
            }
        }
        Ok(admitted)
    }

    /// Probe every address, evict stale ones, persist. Returns the number evicted.
    pub async fn refresh_stats(&self) -> Result<usize, RegistryError> {
        let snapshot = self.snapshot().await;
        let timeout = Duration::from_millis(self.timing.stats_timeout_ms);
        let results = join_all(snapshot.iter().map(|addr| async move {
            (addr.key(), self.prober.probe(addr, timeout).await)
        }))
        .await;

        let now = now_ms();
        let evicted = {
            let mut list = self.list.lock().await;
            for (key, latency) in results {
                list.observe(&key, latency, now);
            }
            list.evict_stale(now)
        };
        for key in &evicted {
            tracing::info!(%key, "registry: evicted stale address");
        }
        if self.is_empty().await {
            tracing::error!("registry: no usable addresses after refresh");
        } else {
            self.persist().await?;
        }
        Ok(evicted.len())
    }

    /// Write the list to storage. An empty list is never written.
    pub async fn persist(&self) -> Result<bool, RegistryError> {
        let records = self.list.lock().await.records();
        if records.is_empty() {
            tracing::warn!("registry: refusing to persist an empty list");
            return Ok(false);
        }
        self.storage.put_document(BOOTSTRAP_LIST_KEY, &records)?;
        Ok(true)
    }
}

/// Alternate hostname forms of a local address: `/dns4/<host>/...` and, for
/// `.localhost` hosts, the `.local` variant.
pub fn derived_forms(local: &str, host: &str) -> Vec<String> {
    let Ok(addr) = BootstrapAddress::parse(local) else {
        return Vec::new();
    };
    let mut hosts = vec![host.to_string()];
    if let Some(stem) = host.strip_suffix(".localhost") {
        hosts.push(format!("{stem}.local"));
    }
    hosts
        .iter()
        .filter_map(|h| addr.with_dns_host(h))
        .map(|m| m.to_string())
        .filter(|s| s != local)
        .collect()
}
