//! Relay collaborator: untrusted, eventually consistent record storage shared by devices
//!
//! Each record carries a type tag, a name unique within its type, plaintext routing
//! fields the relay can query on, and opaque sensitive fields. The protocol only ever
//! saves and queries; it treats every answer as possibly stale or duplicated.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Kinds of record exchanged through the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordType {
    DeviceIdentity,
    ShareTransferPacket,
    ReassemblyRequest,
    ReassemblyResponse,
}

impl RecordType {
    /// Every record type, in a fixed order
    pub const ALL: [Self; 4] = [
        Self::DeviceIdentity,
        Self::ShareTransferPacket,
        Self::ReassemblyRequest,
        Self::ReassemblyResponse,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceIdentity => "DeviceIdentity",
            Self::ShareTransferPacket => "ShareTransferPacket",
            Self::ReassemblyRequest => "ReassemblyRequest",
            Self::ReassemblyResponse => "ReassemblyResponse",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One opaque relay record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRecord {
    pub record_type: RecordType,
    /// Unique within `record_type`; saving a record with the same name replaces it
    pub name: String,
    /// Plaintext, queryable fields
    pub routing: BTreeMap<String, String>,
    /// Fields only the owning relay account can read
    pub sensitive: BTreeMap<String, serde_json::Value>,
}

/// Query filter over routing fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    All,
    Equals { field: String, value: String },
    In { field: String, values: Vec<String> },
}

impl Predicate {
    /// Matches records whose routing `field` equals `value`
    pub fn equals(field: impl Into<String>, value: impl ToString) -> Self {
        Self::Equals {
            field: field.into(),
            value: value.to_string(),
        }
    }

    /// Matches records whose routing `field` is one of `values`
    pub fn one_of<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(|v| v.to_string()).collect(),
        }
    }

    #[must_use]
    pub fn matches(&self, record: &RelayRecord) -> bool {
        match self {
            Self::All => true,
            Self::Equals { field, value } => record.routing.get(field) == Some(value),
            Self::In { field, values } => record
                .routing
                .get(field)
                .is_some_and(|actual| values.contains(actual)),
        }
    }
}

/// Save/query access to the relay
///
/// Implementations may suspend; callers await each call before dependent steps.
/// Retries and backoff are the implementation's (or its caller's) business.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Inserts or replaces a record
    async fn save(&self, record: RelayRecord) -> Result<(), RelayError>;

    /// Returns every record of `record_type` matching `predicate`
    async fn query(
        &self,
        record_type: RecordType,
        predicate: &Predicate,
    ) -> Result<Vec<RelayRecord>, RelayError>;
}

/// In-process relay shared by clones, for tests and single-process simulations
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    records: Arc<Mutex<Vec<RelayRecord>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the relay becoming unreachable (or reachable again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of stored records of one type
    #[must_use]
    pub fn count(&self, record_type: RecordType) -> usize {
        self.records
            .lock()
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.record_type == record_type)
                    .count()
            })
            .unwrap_or(0)
    }

    fn check_online(&self) -> Result<(), RelayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RelayError::Unavailable("relay is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn save(&self, record: RelayRecord) -> Result<(), RelayError> {
        self.check_online()?;
        let mut records = self
            .records
            .lock()
            .map_err(|_| RelayError::Unavailable("relay lock poisoned".to_string()))?;

        match records
            .iter_mut()
            .find(|r| r.record_type == record.record_type && r.name == record.name)
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    async fn query(
        &self,
        record_type: RecordType,
        predicate: &Predicate,
    ) -> Result<Vec<RelayRecord>, RelayError> {
        self.check_online()?;
        let records = self
            .records
            .lock()
            .map_err(|_| RelayError::Unavailable("relay lock poisoned".to_string()))?;

        Ok(records
            .iter()
            .filter(|r| r.record_type == record_type && predicate.matches(r))
            .cloned()
            .collect())
    }
}

#[cfg(feature = "cli")]
pub use file::FileRelay;

#[cfg(feature = "cli")]
mod file {
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use tracing::warn;

    use super::{Predicate, RecordType, Relay, RelayRecord};
    use crate::error::RelayError;

    /// Relay backed by a directory tree: `<root>/<RecordType>/<name>.json`
    ///
    /// Several devices can share one directory to exchange records without a server.
    #[derive(Debug, Clone)]
    pub struct FileRelay {
        root: PathBuf,
    }

    impl FileRelay {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        #[must_use]
        pub fn root(&self) -> &Path {
            &self.root
        }

        fn type_dir(&self, record_type: RecordType) -> PathBuf {
            self.root.join(record_type.as_str())
        }
    }

    fn file_name(name: &str) -> Result<String, RelayError> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(RelayError::Unavailable(format!(
                "record name {name:?} is not a safe file name"
            )));
        }
        Ok(format!("{name}.json"))
    }

    #[async_trait]
    impl Relay for FileRelay {
        async fn save(&self, record: RelayRecord) -> Result<(), RelayError> {
            let dir = self.type_dir(record.record_type);
            tokio::fs::create_dir_all(&dir).await?;

            let json = serde_json::to_vec_pretty(&record)?;
            let path = dir.join(file_name(&record.name)?);
            let staging = path.with_extension("json.tmp");
            tokio::fs::write(&staging, json).await?;
            tokio::fs::rename(&staging, &path).await?;
            Ok(())
        }

        async fn query(
            &self,
            record_type: RecordType,
            predicate: &Predicate,
        ) -> Result<Vec<RelayRecord>, RelayError> {
            let dir = self.type_dir(record_type);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            let mut records = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = tokio::fs::read(&path).await?;
                match serde_json::from_slice::<RelayRecord>(&bytes) {
                    Ok(record) if record.record_type == record_type => {
                        if predicate.matches(&record) {
                            records.push(record);
                        }
                    }
                    Ok(_) => warn!(path = %path.display(), "skipping record filed under the wrong type"),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable relay record"),
                }
            }
            Ok(records)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::collections::BTreeMap;

        fn temp_root() -> PathBuf {
            std::env::temp_dir().join(format!("twain-relay-{}", uuid::Uuid::new_v4()))
        }

        fn record(name: &str, recipient: &str) -> RelayRecord {
            RelayRecord {
                record_type: RecordType::ShareTransferPacket,
                name: name.to_string(),
                routing: BTreeMap::from([("recipientDeviceId".to_string(), recipient.to_string())]),
                sensitive: BTreeMap::new(),
            }
        }

        #[tokio::test]
        async fn test_save_and_query_round_trip() {
            let relay = FileRelay::new(temp_root());
            relay.save(record("a", "dev-1")).await.unwrap();
            relay.save(record("b", "dev-2")).await.unwrap();

            let found = relay
                .query(
                    RecordType::ShareTransferPacket,
                    &Predicate::equals("recipientDeviceId", "dev-2"),
                )
                .await
                .unwrap();
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].name, "b");

            std::fs::remove_dir_all(relay.root()).ok();
        }

        #[tokio::test]
        async fn test_query_on_missing_directory_is_empty() {
            let relay = FileRelay::new(temp_root());
            let found = relay
                .query(RecordType::ReassemblyRequest, &Predicate::All)
                .await
                .unwrap();
            assert!(found.is_empty());
        }

        #[tokio::test]
        async fn test_unsafe_names_are_refused() {
            let relay = FileRelay::new(temp_root());
            assert!(relay.save(record("../escape", "dev-1")).await.is_err());
        }
    }
}
