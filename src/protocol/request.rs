//! Reassembly requests and responses

use crate::domain::{DeviceId, ProtocolConfig, RequestId, ResponseId, SecretId};
use crate::envelope::{EncryptedEnvelope, EnvelopeSigner};
use crate::error::{EnvelopeError, Error};
use crate::identity::{IdentityDirectory, validate};

/// A signed, timestamped ask for other devices' shares of one secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblyRequest {
    pub uuid: RequestId,
    pub secret_id: SecretId,
    pub requester: DeviceId,
    /// Unix seconds at creation
    pub timestamp: u64,
    /// DER ECDSA signature over [`ReassemblyRequest::signed_bytes`]
    pub signature: Vec<u8>,
}

/// One device's share of a secret, sealed to the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblyResponse {
    pub uuid: ResponseId,
    pub request_id: RequestId,
    pub secret_id: SecretId,
    pub responder: DeviceId,
    pub envelope: EncryptedEnvelope,
}

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Outside the allowed request age
    Stale,
    /// Unknown requester or bad signature
    Unverified,
}

impl ReassemblyRequest {
    /// Bytes covered by the request signature
    ///
    /// `uuid || secret_id` as lowercase hyphenated UTF-8, then the timestamp as a
    /// little-endian `u64`.
    #[must_use]
    pub fn signed_bytes(uuid: &RequestId, secret_id: &SecretId, timestamp: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(36 + 36 + 8);
        bytes.extend_from_slice(uuid.to_string().as_bytes());
        bytes.extend_from_slice(secret_id.to_string().as_bytes());
        bytes.extend_from_slice(&timestamp.to_le_bytes());
        bytes
    }

    /// Builds and signs a fresh request
    ///
    /// # Errors
    /// Returns [`EnvelopeError::Signing`] if the signer refuses
    pub fn create<S>(
        secret_id: SecretId,
        requester: DeviceId,
        timestamp: u64,
        signer: &S,
    ) -> Result<Self, EnvelopeError>
    where
        S: EnvelopeSigner + ?Sized,
    {
        let uuid = RequestId::new_random();
        let signature = signer
            .sign_message(&Self::signed_bytes(&uuid, &secret_id, timestamp))?
            .to_der()
            .as_bytes()
            .to_vec();

        Ok(Self {
            uuid,
            secret_id,
            requester,
            timestamp,
            signature,
        })
    }

    /// Checks freshness at `now`, then the requester's signature
    ///
    /// # Errors
    /// Returns the first [`Rejection`] that applies; freshness is checked first and has
    /// no grace period
    pub fn admit<D>(
        &self,
        now: u64,
        config: &ProtocolConfig,
        directory: &D,
    ) -> Result<(), Rejection>
    where
        D: IdentityDirectory + ?Sized,
    {
        if !config.is_fresh(self.timestamp, now) {
            return Err(Rejection::Stale);
        }
        let signed = Self::signed_bytes(&self.uuid, &self.secret_id, self.timestamp);
        if !validate(&self.signature, &signed, &self.requester, directory) {
            return Err(Rejection::Unverified);
        }
        Ok(())
    }

    /// [`ReassemblyRequest::admit`] with the rejection mapped onto [`Error`]
    ///
    /// # Errors
    /// [`Error::StaleRequest`] or [`Error::InvalidSignature`]
    pub fn admit_or_err<D>(
        &self,
        now: u64,
        config: &ProtocolConfig,
        directory: &D,
    ) -> Result<(), Error>
    where
        D: IdentityDirectory + ?Sized,
    {
        self.admit(now, config, directory).map_err(|r| match r {
            Rejection::Stale => Error::StaleRequest(self.uuid),
            Rejection::Unverified => Error::InvalidSignature("reassembly request"),
        })
    }
}
