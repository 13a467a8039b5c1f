//! Device key collaborator
//!
//! Private keys never leave the key store except as a scoped handle good for one
//! operation. Every acquisition names a human-readable usage, which a hardware-backed
//! implementation shows when asking the user for authorization.
//!
//! [`SoftwareKeys`] keeps a P-256 signing key and a P-256 key-agreement key in the
//! local [`SecretStore`]; it stands in for a hardware store on platforms without one.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use p256::SecretKey;
use p256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec::base64_bytes;
use crate::domain::DeviceId;
use crate::envelope::{EnvelopeSigner, KeyAgreement};
use crate::error::{KeyError, StoreError};
use crate::identity::DeviceIdentity;
use crate::store::{SecretStore, load_json, save_json};

/// Local store key for the device key pair
pub const DEVICE_KEYS_KEY: &str = "device.keys";

/// Access to this device's identity and gated private-key operations
#[async_trait]
pub trait DeviceKeys: Send + Sync {
    type Signer: EnvelopeSigner + Send;
    type Agreement: KeyAgreement + Send;

    /// This device's public identity
    fn identity(&self) -> &DeviceIdentity;

    /// Acquires the signing key for one operation described by `usage`
    ///
    /// # Errors
    /// Returns [`KeyError::Denied`] if the user refuses, or another [`KeyError`] if the
    /// key cannot be used
    async fn signer(&self, usage: &str) -> Result<Self::Signer, KeyError>;

    /// Acquires the key-agreement key for one operation described by `usage`
    ///
    /// # Errors
    /// As for [`DeviceKeys::signer`]
    async fn key_agreement(&self, usage: &str) -> Result<Self::Agreement, KeyError>;
}

/// Software-held device keys
pub struct SoftwareKeys {
    identity: DeviceIdentity,
    signing: SigningKey,
    agreement: SecretKey,
    locked: AtomicBool,
}

impl std::fmt::Debug for SoftwareKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareKeys")
            .field("device_id", &self.identity.device_id)
            .field("display_name", &self.identity.display_name)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct StoredKeys {
    #[zeroize(skip)]
    device_id: DeviceId,
    #[zeroize(skip)]
    display_name: String,
    #[serde(with = "base64_bytes")]
    signing_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    agreement_key: Vec<u8>,
}

impl SoftwareKeys {
    /// Generates a fresh device with a random id
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self::from_parts(
            DeviceId::new_random(),
            display_name.into(),
            SigningKey::random(&mut OsRng),
            SecretKey::random(&mut OsRng),
        )
    }

    #[must_use]
    pub fn from_parts(
        device_id: DeviceId,
        display_name: String,
        signing: SigningKey,
        agreement: SecretKey,
    ) -> Self {
        let identity = DeviceIdentity {
            device_id,
            display_name,
            signing_key: signing.signing_public_key(),
            encryption_key: agreement.public_key(),
        };
        Self {
            identity,
            signing,
            agreement,
            locked: AtomicBool::new(false),
        }
    }

    /// Loads the device keys from `store`, generating and saving them on first use
    ///
    /// `display_name` is only used when a new device is created.
    ///
    /// # Errors
    /// Returns a [`StoreError`] if the store fails, or [`StoreError::Corrupt`] if the
    /// stored key material does not parse
    pub fn load_or_create<S>(store: &S, display_name: &str) -> Result<Self, StoreError>
    where
        S: SecretStore + ?Sized,
    {
        if let Some(stored) = load_json::<_, StoredKeys>(store, DEVICE_KEYS_KEY)? {
            let signing = SigningKey::from_slice(&stored.signing_key)
                .map_err(|_| StoreError::Corrupt(DEVICE_KEYS_KEY.to_string()))?;
            let agreement = SecretKey::from_slice(&stored.agreement_key)
                .map_err(|_| StoreError::Corrupt(DEVICE_KEYS_KEY.to_string()))?;
            debug!(device = %stored.device_id, "loaded device keys");
            return Ok(Self::from_parts(
                stored.device_id,
                stored.display_name.clone(),
                signing,
                agreement,
            ));
        }

        let keys = Self::generate(display_name);
        let stored = StoredKeys {
            device_id: keys.identity.device_id,
            display_name: keys.identity.display_name.clone(),
            signing_key: keys.signing.to_bytes().to_vec(),
            agreement_key: keys.agreement.to_bytes().to_vec(),
        };
        save_json(store, DEVICE_KEYS_KEY, &stored)?;
        info!(device = %keys.identity.device_id, "created device keys");
        Ok(keys)
    }

    /// Makes every further acquisition fail as if the user declined
    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    fn authorize(&self, usage: &str) -> Result<(), KeyError> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(KeyError::Denied {
                usage: usage.to_string(),
            });
        }
        debug!(usage, "device key acquired");
        Ok(())
    }
}

#[async_trait]
impl DeviceKeys for SoftwareKeys {
    type Signer = SigningKey;
    type Agreement = SecretKey;

    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    async fn signer(&self, usage: &str) -> Result<Self::Signer, KeyError> {
        self.authorize(usage)?;
        Ok(self.signing.clone())
    }

    async fn key_agreement(&self, usage: &str) -> Result<Self::Agreement, KeyError> {
        self.authorize(usage)?;
        Ok(self.agreement.clone())
    }
}
