//! Local persistence collaborator
//!
//! A small key-value store for this device's own state: the device key pair, the cached
//! identity directory, and one self-envelope per secret. Nothing stored here is ever
//! sent to the relay.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc::{CRC_32_ISO_HDLC, Crc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use zeroize::Zeroizing;

use crate::error::StoreError;

/// CRC32 appended to every file written by [`FileStore`]
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const CHECKSUM_LEN: usize = 4;

/// Key-value persistence for device-local state
pub trait SecretStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous value
    ///
    /// # Errors
    /// Returns a [`StoreError`] if the value could not be written
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Loads the value stored under `key`, if any
    ///
    /// # Errors
    /// Returns a [`StoreError`] if the value exists but cannot be read back intact
    fn load(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError>;
}

/// Serializes `value` as JSON under `key`
///
/// # Errors
/// Returns serialization or write failures
pub fn save_json<S, T>(store: &S, key: &str, value: &T) -> Result<(), StoreError>
where
    S: SecretStore + ?Sized,
    T: Serialize + ?Sized,
{
    let bytes = Zeroizing::new(serde_json::to_vec(value)?);
    store.save(key, &bytes)
}

/// Loads and deserializes the JSON value under `key`
///
/// # Errors
/// Returns read or deserialization failures
pub fn load_json<S, T>(store: &S, key: &str) -> Result<Option<T>, StoreError>
where
    S: SecretStore + ?Sized,
    T: DeserializeOwned,
{
    store
        .load(key)?
        .map(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
        .transpose()
}

/// Volatile store, for tests and throwaway sessions
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(key.to_string(), Zeroizing::new(bytes.to_vec()));
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .get(key)
            .cloned())
    }
}

/// One file per key under a root directory, each suffixed with a CRC32
///
/// A checksum mismatch is reported as [`StoreError::Corrupt`] rather than handed to a
/// deserializer.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `root`
    ///
    /// # Errors
    /// Returns an I/O error if the directory cannot be created
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let safe = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !safe {
            return Err(StoreError::Corrupt(format!("unusable store key {key:?}")));
        }
        Ok(self.root.join(key))
    }
}

impl SecretStore for FileStore {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path(key)?;
        let mut contents = Zeroizing::new(Vec::with_capacity(bytes.len() + CHECKSUM_LEN));
        contents.extend_from_slice(bytes);
        contents.extend_from_slice(&CRC32.checksum(bytes).to_le_bytes());

        let staging = self.root.join(format!("{key}.tmp"));
        std::fs::write(&staging, contents.as_slice())?;
        std::fs::rename(&staging, &path)?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreError> {
        let path = self.path(key)?;
        let contents = match std::fs::read(&path) {
            Ok(contents) => Zeroizing::new(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if contents.len() < CHECKSUM_LEN {
            return Err(StoreError::Corrupt(key.to_string()));
        }
        let (payload, checksum) = contents.split_at(contents.len() - CHECKSUM_LEN);
        let mut expected = [0u8; CHECKSUM_LEN];
        expected.copy_from_slice(checksum);
        if CRC32.checksum(payload) != u32::from_le_bytes(expected) {
            return Err(StoreError::Corrupt(key.to_string()));
        }
        Ok(Some(Zeroizing::new(payload.to_vec())))
    }
}
