//! Node identity persistence
//!
//! The node keypair lives in `<datadir>/keys.json` as
//! `{"pub": base64, "priv": base64}`, both fields carrying libp2p protobuf
//! encodings. A missing, unreadable or inconsistent file is replaced by a
//! freshly generated keypair.

use crate::error::KeyError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use libp2p::identity::{Keypair, PublicKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// File name of the key record inside the data directory.
pub const KEY_FILE_NAME: &str = "keys.json";

#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    #[serde(rename = "pub")]
    public: String,
    #[serde(rename = "priv")]
    private: String,
}

/// Generate a new Ed25519 keypair.
pub fn generate_keypair() -> Keypair {
    Keypair::generate_ed25519()
}

/// Node identity string (libp2p PeerId) for `keypair`.
pub fn node_id(keypair: &Keypair) -> String {
    keypair.public().to_peer_id().to_string()
}

/// Write `keypair` to `path` with owner-only permissions.
pub fn save_keys(keypair: &Keypair, path: &Path) -> Result<(), KeyError> {
    let private = keypair
        .to_protobuf_encoding()
        .map_err(|_| KeyError::InvalidKeypair)?;
    let record = KeyRecord {
        public: STANDARD.encode(keypair.public().encode_protobuf()),
        private: STANDARD.encode(private),
    };
    let contents = serde_json::to_vec_pretty(&record)?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    // `mode` only applies on creation; tighten a file being replaced.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(&contents)?;
    file.sync_all()?;
    Ok(())
}

/// Read a keypair from `path`, checking that both fields agree.
pub fn load_keys(path: &Path) -> Result<Keypair, KeyError> {
    let record: KeyRecord = serde_json::from_slice(&fs::read(path)?)?;

    let keypair = Keypair::from_protobuf_encoding(&STANDARD.decode(record.private)?)
        .map_err(|_| KeyError::InvalidKeypair)?;
    let public = PublicKey::try_decode_protobuf(&STANDARD.decode(record.public)?)
        .map_err(|_| KeyError::InvalidKeypair)?;

    if public != keypair.public() {
        return Err(KeyError::Mismatch);
    }
    Ok(keypair)
}

/// Load the keypair from `datadir`, generating and persisting a new one when
/// none is usable.
///
/// Without a data directory the keypair is ephemeral. A failed write is
/// logged; the generated keypair is still returned.
pub fn load_or_generate_keys(datadir: Option<&Path>) -> Keypair {
    let Some(dir) = datadir else {
        let keypair = generate_keypair();
        info!(node_id = %node_id(&keypair), "Generated ephemeral node identity");
        return keypair;
    };

    let path = dir.join(KEY_FILE_NAME);
    if path.exists() {
        match load_keys(&path) {
            Ok(keypair) => {
                info!(node_id = %node_id(&keypair), path = %path.display(), "Loaded node identity");
                return keypair;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Key file unusable, regenerating");
            }
        }
    }

    let keypair = generate_keypair();
    match save_keys(&keypair, &path) {
        Ok(()) => info!(node_id = %node_id(&keypair), path = %path.display(), "Generated node identity"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to persist node identity"),
    }
    keypair
}
