//! One-time data migrations.
//!
//! Applied ids are kept under [`MIGRATION_STATE_KEY`]. A migration that fails
//! stays unrecorded and runs again on the next start.

use std::collections::BTreeSet;

use crate::{Result, Storage, StorageExt, BOOTSTRAP_LIST_KEY, MIGRATION_STATE_KEY};

/// Legacy single-address key written by early clients.
pub const LEGACY_BOOTSTRAP_KEY: &str = "p2p:bootstrap";

pub type MigrationFn = Box<dyn Fn(&dyn Storage) -> Result<()> + Send + Sync>;

pub struct Migration {
    pub id: &'static str,
    pub run: MigrationFn,
}

impl Migration {
    pub fn new(
        id: &'static str,
        run: impl Fn(&dyn Storage) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            run: Box::new(run),
        }
    }
}

#[derive(Default)]
pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner preloaded with the built-in migrations.
    pub fn with_builtin() -> Self {
        let mut runner = Self::new();
        runner.register(Migration::new("bootstrap-list-v1", migrate_legacy_bootstrap));
        runner
    }

    pub fn register(&mut self, migration: Migration) {
        self.migrations.push(migration);
    }

    /// Run every migration not yet applied. Returns the ids applied this run.
    pub fn run(&self, storage: &dyn Storage) -> Result<Vec<&'static str>> {
        let mut done: BTreeSet<String> = storage
            .get_document(MIGRATION_STATE_KEY)?
            .unwrap_or_default();
        let mut applied = Vec::new();

        for migration in &self.migrations {
            if done.contains(migration.id) {
                continue;
            }
            match (migration.run)(storage) {
                Ok(()) => {
                    tracing::info!(id = migration.id, "storage: migration applied");
                    done.insert(migration.id.to_string());
                    storage.put_document(MIGRATION_STATE_KEY, &done)?;
                    applied.push(migration.id);
                }
                Err(e) => {
                    tracing::warn!(id = migration.id, "storage: migration failed, will retry: {e}");
                }
            }
        }
        Ok(applied)
    }
}

/// Move the legacy single cached address into the bootstrap list.
fn migrate_legacy_bootstrap(storage: &dyn Storage) -> Result<()> {
    let Some(legacy) = storage.get_document::<serde_json::Value>(LEGACY_BOOTSTRAP_KEY)? else {
        return Ok(());
    };
    let Some(address) = legacy.as_str().map(str::to_string) else {
        storage.delete(LEGACY_BOOTSTRAP_KEY)?;
        return Ok(());
    };

    let mut list: Vec<serde_json::Value> = storage
        .get_document(BOOTSTRAP_LIST_KEY)?
        .unwrap_or_default();
    if !list.iter().any(|r| r["address"] == address.as_str()) {
        list.push(serde_json::json!({
            "address": address,
            "lastSeen": chrono::Utc::now().timestamp_millis(),
            "latency": null,
        }));
        storage.put_document(BOOTSTRAP_LIST_KEY, &list)?;
    }
    storage.delete(LEGACY_BOOTSTRAP_KEY)?;
    Ok(())
}
