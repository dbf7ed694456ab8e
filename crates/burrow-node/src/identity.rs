//! Ed25519 node identity -- generation, loading, persistence.
//!
//! Stored as JSON `{"id": <peer id>, "privKey": <base64 protobuf keypair>}`.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("key decode: {0}")]
    Decode(#[from] libp2p::identity::DecodingError),
    #[error("identity file id {stored} does not match key {derived}")]
    IdMismatch { stored: String, derived: PeerId },
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    id: String,
    #[serde(rename = "privKey")]
    priv_key: String,
}

/// Node identity wrapping a libp2p Ed25519 keypair.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        let keypair = Keypair::generate_ed25519();
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    pub fn from_file(path: &Path) -> Result<Self, IdentityError> {
        let file: IdentityFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let keypair = Keypair::from_protobuf_encoding(&B64.decode(file.priv_key)?)?;
        let peer_id = keypair.public().to_peer_id();
        if peer_id.to_base58() != file.id {
            return Err(IdentityError::IdMismatch {
                stored: file.id,
                derived: peer_id,
            });
        }
        Ok(Self { keypair, peer_id })
    }

    /// Load the identity at `path`, creating it on first start.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            return Self::from_file(path);
        }
        let identity = Self::generate();
        identity.save(path)?;
        tracing::info!(peer_id = %identity.peer_id, path = %path.display(), "generated node identity");
        Ok(identity)
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = IdentityFile {
            id: self.peer_id.to_base58(),
            priv_key: B64.encode(self.keypair.to_protobuf_encoding()?),
        };
        std::fs::write(path, serde_json::to_vec_pretty(&file)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn keypair(&self) -> Keypair {
        self.keypair.clone()
    }
}
