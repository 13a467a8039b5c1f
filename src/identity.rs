//! Device identities and signature validation
//!
//! A [`DeviceIdentity`] binds a device id to its signing and key-agreement public keys.
//! Identities are immutable once published: a cached identity is never overwritten by a
//! later relay record carrying different keys.
//!
//! [`validate`] is the only place a protocol signature is checked against a claimed
//! device. It takes the directory as an explicit argument and fails closed.

use std::collections::{BTreeMap, BTreeSet};

use p256::PublicKey;
use p256::ecdsa::VerifyingKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{self, base64_bytes};
use crate::domain::DeviceId;
use crate::envelope::{encode_public_key, encode_verifying_key, verify_der};
use crate::error::{RecordError, Result, StoreError};
use crate::relay::{Predicate, RecordType, Relay};
use crate::store::{SecretStore, load_json, save_json};

/// Local store key for the cached directory
pub const IDENTITIES_KEY: &str = "identities";

/// Public description of one of the user's devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredIdentity", into = "StoredIdentity")]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub display_name: String,
    pub signing_key: VerifyingKey,
    pub encryption_key: PublicKey,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    device_id: DeviceId,
    display_name: String,
    #[serde(with = "base64_bytes")]
    signing_public_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    encryption_public_key: Vec<u8>,
}

impl From<DeviceIdentity> for StoredIdentity {
    fn from(identity: DeviceIdentity) -> Self {
        Self {
            device_id: identity.device_id,
            signing_public_key: encode_verifying_key(&identity.signing_key),
            encryption_public_key: encode_public_key(&identity.encryption_key),
            display_name: identity.display_name,
        }
    }
}

impl TryFrom<StoredIdentity> for DeviceIdentity {
    type Error = RecordError;

    fn try_from(stored: StoredIdentity) -> Result<Self, Self::Error> {
        Ok(Self {
            device_id: stored.device_id,
            display_name: stored.display_name,
            signing_key: VerifyingKey::from_sec1_bytes(&stored.signing_public_key)
                .map_err(|_| RecordError::InvalidField("signingPublicKey"))?,
            encryption_key: PublicKey::from_sec1_bytes(&stored.encryption_public_key)
                .map_err(|_| RecordError::InvalidField("encryptionPublicKey"))?,
        })
    }
}

impl DeviceIdentity {
    /// Whether `other` describes the same device with the same keys
    #[must_use]
    pub fn same_keys(&self, other: &Self) -> bool {
        self.device_id == other.device_id
            && self.signing_key == other.signing_key
            && self.encryption_key == other.encryption_key
    }
}

/// Read-only lookup from device id to identity
pub trait IdentityDirectory {
    fn identity(&self, device: &DeviceId) -> Option<&DeviceIdentity>;
}

impl IdentityDirectory for BTreeMap<DeviceId, DeviceIdentity> {
    fn identity(&self, device: &DeviceId) -> Option<&DeviceIdentity> {
        self.get(device)
    }
}

/// Checks that `signature` (DER) over `signed_bytes` comes from `claimed`
///
/// Returns `false` for a device missing from the directory as well as for a bad
/// signature; neither is an error.
///
/// # Examples
///
/// ```rust
/// use std::collections::BTreeMap;
/// use p256::ecdsa::SigningKey;
/// use rand::rngs::OsRng;
/// use twain::domain::DeviceId;
/// use twain::identity::{DeviceIdentity, validate};
/// use twain::envelope::EnvelopeSigner;
///
/// let signer = SigningKey::random(&mut OsRng);
/// let device = DeviceIdentity {
///     device_id: DeviceId::new_random(),
///     display_name: "phone".to_string(),
///     signing_key: signer.signing_public_key(),
///     encryption_key: p256::SecretKey::random(&mut OsRng).public_key(),
/// };
/// let signature = signer.sign_message(b"hello").unwrap().to_der();
///
/// let mut directory = BTreeMap::new();
/// assert!(!validate(signature.as_bytes(), b"hello", &device.device_id, &directory));
///
/// directory.insert(device.device_id, device.clone());
/// assert!(validate(signature.as_bytes(), b"hello", &device.device_id, &directory));
/// assert!(!validate(signature.as_bytes(), b"other", &device.device_id, &directory));
/// ```
#[must_use]
pub fn validate<D>(signature: &[u8], signed_bytes: &[u8], claimed: &DeviceId, directory: &D) -> bool
where
    D: IdentityDirectory + ?Sized,
{
    directory
        .identity(claimed)
        .is_some_and(|identity| verify_der(&identity.signing_key, signed_bytes, signature))
}

/// Outcome of [`Directory::refresh_identities`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityDiff {
    pub added: Vec<DeviceId>,
    pub removed: Vec<DeviceId>,
    /// Relay records that disagree with an already cached identity
    pub conflicting: Vec<DeviceId>,
    pub published_self: bool,
}

impl IdentityDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.conflicting.is_empty()
            && !self.published_self
    }
}

/// The locally cached identity directory, always containing this device
#[derive(Debug, Clone)]
pub struct Directory {
    self_id: DeviceId,
    identities: BTreeMap<DeviceId, DeviceIdentity>,
}

impl IdentityDirectory for Directory {
    fn identity(&self, device: &DeviceId) -> Option<&DeviceIdentity> {
        self.identities.get(device)
    }
}

impl Directory {
    /// A directory holding only this device
    #[must_use]
    pub fn new(self_identity: DeviceIdentity) -> Self {
        let self_id = self_identity.device_id;
        Self {
            self_id,
            identities: BTreeMap::from([(self_id, self_identity)]),
        }
    }

    /// Restores the cached directory, falling back to [`Directory::new`]
    ///
    /// # Errors
    /// Returns a [`StoreError`] if the cache exists but cannot be read
    pub fn load<S>(store: &S, self_identity: DeviceIdentity) -> Result<Self, StoreError>
    where
        S: SecretStore + ?Sized,
    {
        let mut directory = Self::new(self_identity);
        let cached: Option<Vec<DeviceIdentity>> = load_json(store, IDENTITIES_KEY)?;
        for identity in cached.into_iter().flatten() {
            directory.insert(identity);
        }
        Ok(directory)
    }

    /// Persists the directory under [`IDENTITIES_KEY`]
    ///
    /// # Errors
    /// Returns a [`StoreError`] if the store refuses the write
    pub fn save<S>(&self, store: &S) -> Result<(), StoreError>
    where
        S: SecretStore + ?Sized,
    {
        let identities: Vec<&DeviceIdentity> = self.identities.values().collect();
        save_json(store, IDENTITIES_KEY, &identities)
    }

    /// Adds an identity unless one is already known for that device
    ///
    /// Returns `false` when the device was already present; its cached keys win.
    pub fn insert(&mut self, identity: DeviceIdentity) -> bool {
        if self.identities.contains_key(&identity.device_id) {
            return false;
        }
        self.identities.insert(identity.device_id, identity);
        true
    }

    #[must_use]
    pub fn self_identity(&self) -> Option<&DeviceIdentity> {
        self.identities.get(&self.self_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.identities.values()
    }

    /// Every known device other than this one
    pub fn others(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.identities
            .values()
            .filter(move |identity| identity.device_id != self.self_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Reconciles the cache with the relay's `DeviceIdentity` records
    ///
    /// Devices no longer on the relay are dropped (never this one), new ones are added,
    /// and a record contradicting a cached identity is ignored and reported. The self
    /// identity is published when the relay does not list it yet. The cache is saved
    /// whenever it changed.
    ///
    /// # Errors
    /// Returns relay or store failures; malformed records are skipped
    pub async fn refresh_identities<R, S>(&mut self, relay: &R, store: &S) -> Result<IdentityDiff>
    where
        R: Relay + ?Sized,
        S: SecretStore + ?Sized,
    {
        let records = relay
            .query(RecordType::DeviceIdentity, &Predicate::All)
            .await?;
        let fetched: Vec<DeviceIdentity> = codec::decode_all(&records);

        let mut diff = IdentityDiff::default();
        let on_relay: BTreeSet<DeviceId> = fetched.iter().map(|i| i.device_id).collect();

        for identity in fetched {
            match self.identities.get(&identity.device_id) {
                Some(known) if known.same_keys(&identity) => {}
                Some(_) => {
                    warn!(device = %identity.device_id, "relay identity conflicts with cached keys; keeping cached");
                    diff.conflicting.push(identity.device_id);
                }
                None => {
                    debug!(device = %identity.device_id, name = %identity.display_name, "new device identity");
                    diff.added.push(identity.device_id);
                    self.identities.insert(identity.device_id, identity);
                }
            }
        }

        let self_id = self.self_id;
        let stale: Vec<DeviceId> = self
            .identities
            .keys()
            .filter(|id| **id != self_id && !on_relay.contains(id))
            .copied()
            .collect();
        for id in stale {
            debug!(device = %id, "device identity no longer on relay");
            self.identities.remove(&id);
            diff.removed.push(id);
        }

        if !on_relay.contains(&self_id) {
            if let Some(me) = self.self_identity() {
                relay.save(me.to_record()).await?;
                info!(device = %self_id, "published self identity");
                diff.published_self = true;
            }
        }

        if !diff.added.is_empty() || !diff.removed.is_empty() {
            self.save(store)?;
        }
        Ok(diff)
    }
}
