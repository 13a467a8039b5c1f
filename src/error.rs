//! Error types
//!
//! Every failure maps onto one of four [`ErrorKind`]s:
//! - validation failures are dropped record by record and never surface from a batch refresh
//! - cryptographic failures are reported as their own kind, never as an empty result
//! - state errors are programming or configuration mistakes and are returned loudly
//! - collaborator failures come from the relay, the key store or local persistence and
//!   are handed to the caller, who owns any retry policy

use thiserror::Error;

use crate::domain::{DeviceId, RequestId, ResponseId, SecretId};

/// Failures from field arithmetic and display encoding
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SharingError {
    #[error("at least two participants are required, got {0}")]
    TooFewParticipants(usize),
    #[error("participant x-coordinates are not distinct")]
    DuplicateCoordinate,
    #[error("participant x-coordinate is zero")]
    ZeroCoordinate,
    #[error("cannot reassemble from two shares with the same x-coordinate")]
    CoincidentPoints,
    #[error("share value is not a canonical field element")]
    NonCanonicalValue,
    #[error("at least one character class must be enabled")]
    EmptyCharset,
}

/// Failures from sealing or opening an envelope
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope signature does not verify against the claimed sender")]
    Authentication,
    #[error("envelope ciphertext could not be decrypted")]
    Decryption,
    #[error("envelope encryption failed")]
    Encryption,
    #[error("malformed public key")]
    MalformedKey,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// A relay record that could not be turned into a protocol value
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("expected a {expected} record, got {actual}")]
    WrongType {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("record is missing field `{0}`")]
    MissingField(&'static str),
    #[error("record field `{0}` is malformed")]
    InvalidField(&'static str),
}

/// Failures reported by the relay collaborator
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("relay I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("relay record could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by local persistence
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("stored entry `{0}` is corrupt")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Failures reported by the device key store
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key use denied for \"{usage}\"")]
    Denied { usage: String },
    #[error("device key material unavailable")]
    Unavailable,
    #[error("stored key material is malformed")]
    Malformed,
}

/// Coarse classification of [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Cryptographic,
    State,
    Collaborator,
}

/// Errors returned by the lifecycle and reassembly operations
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sharing(#[from] SharingError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Keys(#[from] KeyError),
    #[error("device {0} is not in the identity directory")]
    UnknownDevice(DeviceId),
    #[error("secret {0} is not known on this device")]
    UnknownSecret(SecretId),
    #[error("request {0} is not an open request from another device")]
    UnknownRequest(RequestId),
    #[error("response {0} does not answer an open request of this device")]
    UnknownResponse(ResponseId),
    #[error("request {0} is older than the allowed request age")]
    StaleRequest(RequestId),
    #[error("signature on {0} does not verify")]
    InvalidSignature(&'static str),
    #[error("share transfer packet is addressed to {0}, not this device")]
    NotAddressedToSelf(DeviceId),
}

impl Error {
    /// Classifies the error per the protocol's failure taxonomy
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Record(_)
            | Self::UnknownDevice(_)
            | Self::StaleRequest(_)
            | Self::InvalidSignature(_)
            | Self::NotAddressedToSelf(_) => ErrorKind::Validation,
            Self::Envelope(EnvelopeError::Signing(_)) => ErrorKind::Collaborator,
            Self::Envelope(_) | Self::Sharing(SharingError::NonCanonicalValue) => {
                ErrorKind::Cryptographic
            }
            Self::Sharing(_)
            | Self::UnknownSecret(_)
            | Self::UnknownRequest(_)
            | Self::UnknownResponse(_) => ErrorKind::State,
            Self::Relay(_) | Self::Store(_) | Self::Keys(_) => ErrorKind::Collaborator,
        }
    }

    /// Whether a batch refresh may skip the offending record and carry on
    #[must_use]
    pub fn is_record_fault(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::Cryptographic
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
