use std::path::Path;

use anyhow::{Context, Result, bail};
use zeroize::Zeroizing;

use crate::domain::{CharsetOptions, DeviceId, ProtocolConfig, RequestId, ResponseId, SecretId};
use crate::identity::{DeviceIdentity, Directory, IdentityDiff};
use crate::keys::{DeviceKeys, SoftwareKeys};
use crate::manager::SecretManager;
use crate::protocol::{FilledResponse, ReassemblyRequest, ReconcileDiff};
use crate::relay::{FileRelay, Relay};
use crate::store::{FileStore, SecretStore};

/// One device's loaded state for the duration of a command
pub struct Session<R, S> {
    manager: SecretManager<R, SoftwareKeys, S>,
    directory: Directory,
}

impl Session<FileRelay, FileStore> {
    /// Opens the file-backed store and relay, creating the device on first use
    ///
    /// # Errors
    /// Returns an error if the store directory or device keys cannot be read or created
    pub fn open(store: &Path, relay: &Path, name: &str, config: ProtocolConfig) -> Result<Self> {
        let store = FileStore::open(store)
            .with_context(|| format!("Failed to open store at {}", store.display()))?;
        Self::new(FileRelay::new(relay), store, name, config)
    }
}

impl<R: Relay, S: SecretStore> Session<R, S> {
    /// Loads (or creates) this device's keys, cached directory and secret index
    ///
    /// # Errors
    /// Returns an error if the local store holds unreadable state
    pub fn new(relay: R, store: S, name: &str, config: ProtocolConfig) -> Result<Self> {
        let keys =
            SoftwareKeys::load_or_create(&store, name).context("Failed to load device keys")?;
        let directory = Directory::load(&store, keys.identity().clone())
            .context("Failed to load identity directory")?;
        let manager = SecretManager::load(relay, keys, store)
            .context("Failed to load secret index")?
            .with_config(config);
        Ok(Self { manager, directory })
    }

    #[must_use]
    pub fn manager(&self) -> &SecretManager<R, SoftwareKeys, S> {
        &self.manager
    }

    #[must_use]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    #[must_use]
    pub fn identity(&self) -> &DeviceIdentity {
        self.manager.keys().identity()
    }

    async fn sync_identities(&mut self) -> Result<IdentityDiff> {
        self.directory
            .refresh_identities(self.manager.relay(), self.manager.store())
            .await
            .context("Failed to refresh device identities")
    }

    async fn sync_reassembly(&mut self) -> Result<ReconcileDiff> {
        self.manager
            .refresh_reassembly(&self.directory)
            .await
            .context("Failed to refresh reassembly requests")
    }
}

/// A known device as shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub device_id: DeviceId,
    pub display_name: String,
    pub is_self: bool,
}

/// Result of [`sync`]
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub identities: IdentityDiff,
    pub received: Vec<SecretId>,
    pub reassembly: ReconcileDiff,
}

/// Open reassembly work, for [`pending`]
#[derive(Debug, Clone, Default)]
pub struct Pending {
    /// Other devices asking for a share
    pub incoming: Vec<ReassemblyRequest>,
    /// This device's requests still waiting
    pub waiting: Vec<ReassemblyRequest>,
    /// Responses ready to finish
    pub ready: Vec<FilledResponse>,
}

/// Publishes this device's identity
///
/// # Errors
/// Returns an error if the relay cannot be reached
pub async fn init<R: Relay, S: SecretStore>(session: &mut Session<R, S>) -> Result<DeviceId> {
    session.sync_identities().await?;
    Ok(session.identity().device_id)
}

/// Lists known devices, refreshing from the relay first
///
/// # Errors
/// Returns an error if the relay cannot be reached
pub async fn list_devices<R: Relay, S: SecretStore>(
    session: &mut Session<R, S>,
) -> Result<Vec<DeviceEntry>> {
    session.sync_identities().await?;
    let me = session.identity().device_id;
    Ok(session
        .directory
        .devices()
        .map(|d| DeviceEntry {
            device_id: d.device_id,
            display_name: d.display_name.clone(),
            is_self: d.device_id == me,
        })
        .collect())
}

/// Creates a secret shared with `with`, or with every known device when empty
///
/// # Errors
/// Returns an error if no other device is known, a listed device is unknown, or any
/// collaborator fails
pub async fn create_secret<R: Relay, S: SecretStore>(
    session: &mut Session<R, S>,
    title: &str,
    with: &[DeviceId],
) -> Result<SecretId> {
    session.sync_identities().await?;

    let participants: Vec<DeviceId> = if with.is_empty() {
        session.directory.others().map(|d| d.device_id).collect()
    } else {
        with.to_vec()
    };
    if participants.is_empty() {
        bail!("No other devices known; run `twain init` on another device and `twain sync` here");
    }

    session
        .manager
        .create_secret(title, &participants, &session.directory)
        .await
        .with_context(|| format!("Failed to create secret \"{title}\""))
}

/// Lists secrets held on this device as `(id, title)`
#[must_use]
pub fn list_secrets<R: Relay, S: SecretStore>(session: &Session<R, S>) -> Vec<(SecretId, String)> {
    session
        .manager
        .secrets()
        .map(|s| (s.secret_id, s.title.clone()))
        .collect()
}

/// Refreshes identities, takes in new shares and folds reassembly records
///
/// # Errors
/// Returns an error if a collaborator fails
pub async fn sync<R: Relay, S: SecretStore>(session: &mut Session<R, S>) -> Result<SyncSummary> {
    let identities = session.sync_identities().await?;
    let received = session
        .manager
        .refresh_secrets(&session.directory)
        .await
        .context("Failed to receive shares")?;
    let reassembly = session.sync_reassembly().await?;
    Ok(SyncSummary {
        identities,
        received,
        reassembly,
    })
}

/// Asks other devices for their share of `secret_id`
///
/// # Errors
/// Returns an error if the secret is unknown here or a collaborator fails
pub async fn request<R: Relay, S: SecretStore>(
    session: &mut Session<R, S>,
    secret_id: SecretId,
) -> Result<RequestId> {
    session
        .manager
        .request_reassembly(secret_id)
        .await
        .with_context(|| format!("Failed to request reassembly of {secret_id}"))
}

/// Collects open requests and ready responses
///
/// # Errors
/// Returns an error if a collaborator fails
pub async fn pending<R: Relay, S: SecretStore>(session: &mut Session<R, S>) -> Result<Pending> {
    session.sync_identities().await?;
    session.sync_reassembly().await?;
    let manager = &session.manager;
    Ok(Pending {
        incoming: manager.others_open_requests().cloned().collect(),
        waiting: manager.self_open_requests().cloned().collect(),
        ready: manager.filled_responses().cloned().collect(),
    })
}

/// Sends this device's share to the device behind `request_id`
///
/// # Errors
/// Returns an error if the request is unknown, stale or unverifiable, or a collaborator
/// fails
pub async fn respond<R: Relay, S: SecretStore>(
    session: &mut Session<R, S>,
    request_id: RequestId,
) -> Result<ResponseId> {
    session.sync_identities().await?;
    session.sync_reassembly().await?;
    session
        .manager
        .respond(request_id, &session.directory)
        .await
        .with_context(|| format!("Failed to respond to request {request_id}"))
}

/// Recovers the secret answered by `response_id`
///
/// # Errors
/// Returns an error if the response is unknown or stale, fails to open, or a
/// collaborator fails
pub async fn finish<R: Relay, S: SecretStore>(
    session: &mut Session<R, S>,
    response_id: ResponseId,
    options: CharsetOptions,
) -> Result<Zeroizing<String>> {
    session.sync_identities().await?;
    session.sync_reassembly().await?;
    session
        .manager
        .finish(response_id, &session.directory, options)
        .await
        .with_context(|| format!("Failed to finish reassembly from response {response_id}"))
}
