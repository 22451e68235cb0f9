//! The viewer's Schnorr keypair, held at rest. Grounded on the teacher's
//! account/profile secret storage (`src-tauri/src/account_manager.rs`),
//! generalized to a `KeyStore` trait so `vector-cli` can swap in a plain
//! file while still zeroizing the secret hex buffer after use.

use crate::error::ConfigError;
use nostr::Keys;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub trait KeyStore: Send + Sync {
    fn load(&self) -> Result<Keys, ConfigError>;
}

/// Stores the viewer's secret key as hex in a single file. Callers are
/// responsible for the file's permissions; this type only handles encoding
/// and zeroizing the in-memory copy once parsed.
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Generates a fresh keypair and persists its secret key to `path`,
    /// for first-run setup.
    pub fn generate_and_save(path: impl AsRef<Path>) -> Result<Keys, ConfigError> {
        let keys = Keys::generate();
        let secret_hex = Zeroizing::new(keys.secret_key().to_secret_hex());
        fs::write(path.as_ref(), secret_hex.as_bytes())
            .map_err(|e| ConfigError::KeyMaterial(e.to_string()))?;
        Ok(keys)
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Keys, ConfigError> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::KeyMaterial(format!("{}: {e}", self.path.display())))?;
        let secret_hex = Zeroizing::new(raw.trim().to_string());
        Keys::parse(secret_hex.as_str()).map_err(|e| ConfigError::KeyMaterial(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewer.key");
        let generated = FileKeyStore::generate_and_save(&path).unwrap();
        let loaded = FileKeyStore::new(&path).load().unwrap();
        assert_eq!(generated.public_key(), loaded.public_key());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("absent"));
        assert!(matches!(store.load(), Err(ConfigError::KeyMaterial(_))));
    }
}
