//! Relay record codec
//!
//! Converts protocol values to and from [`RelayRecord`]s. Routing fields stay plaintext
//! so the relay can query on them; everything else goes into the sensitive map. Byte
//! strings (keys, ciphertexts, signatures) travel as standard base64.
//!
//! | Record type | Routing fields | Sensitive fields |
//! |---|---|---|
//! | `DeviceIdentity` | `deviceId` | `displayName`, `signingPublicKey`, `encryptionPublicKey` |
//! | `ShareTransferPacket` | `uuid`, `recipientDeviceId` | `senderDeviceId`, `secretId`, `title`, envelope fields |
//! | `ReassemblyRequest` | `uuid` | `secretId`, `requesterDeviceId`, `timestamp`, `signature` |
//! | `ReassemblyResponse` | `uuid`, `requestId` | `secretId`, `responderDeviceId`, envelope fields |
//!
//! Decoding never panics: a missing or malformed field is a [`RecordError`], and batch
//! callers use [`decode_all`] to skip such records.

use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use p256::PublicKey;
use p256::ecdsa::VerifyingKey;
use serde_json::Value;
use tracing::warn;

use crate::envelope::{EncryptedEnvelope, encode_public_key, encode_verifying_key};
use crate::error::RecordError;
use crate::identity::DeviceIdentity;
use crate::manager::ShareTransferPacket;
use crate::protocol::{ReassemblyRequest, ReassemblyResponse};
use crate::relay::{RecordType, RelayRecord};

/// Routing field names shared by encoders and relay queries
pub mod fields {
    pub const DEVICE_ID: &str = "deviceId";
    pub const UUID: &str = "uuid";
    pub const RECIPIENT_DEVICE_ID: &str = "recipientDeviceId";
    pub const REQUEST_ID: &str = "requestId";
}

/// Serde adapter writing `Vec<u8>` as a standard base64 string
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    /// # Errors
    /// Propagates serializer errors
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// # Errors
    /// Fails on anything other than a valid base64 string
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

/// Decodes every record it can and logs the rest
pub fn decode_all<T>(records: &[RelayRecord]) -> Vec<T>
where
    T: for<'a> TryFrom<&'a RelayRecord, Error = RecordError>,
{
    records
        .iter()
        .filter_map(|record| match T::try_from(record) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    record_type = %record.record_type,
                    name = %record.name,
                    error = %e,
                    "skipping malformed relay record"
                );
                None
            }
        })
        .collect()
}

struct RecordBuilder(RelayRecord);

impl RecordBuilder {
    fn new(record_type: RecordType, name: impl ToString) -> Self {
        Self(RelayRecord {
            record_type,
            name: name.to_string(),
            routing: Default::default(),
            sensitive: Default::default(),
        })
    }

    fn routing(mut self, field: &str, value: impl ToString) -> Self {
        self.0.routing.insert(field.to_string(), value.to_string());
        self
    }

    fn sensitive(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.sensitive.insert(field.to_string(), value.into());
        self
    }

    fn bytes(self, field: &str, bytes: &[u8]) -> Self {
        self.sensitive(field, STANDARD.encode(bytes))
    }

    fn envelope(self, envelope: &EncryptedEnvelope) -> Self {
        self.bytes("ephemeralPublicKey", &envelope.ephemeral_public_key)
            .bytes("ciphertext", &envelope.ciphertext)
            .bytes("signature", &envelope.signature)
    }

    fn build(self) -> RelayRecord {
        self.0
    }
}

struct RecordReader<'a>(&'a RelayRecord);

impl<'a> RecordReader<'a> {
    fn expect(record: &'a RelayRecord, expected: RecordType) -> Result<Self, RecordError> {
        if record.record_type != expected {
            return Err(RecordError::WrongType {
                expected: expected.as_str(),
                actual: record.record_type.as_str(),
            });
        }
        Ok(Self(record))
    }

    fn routing<T: FromStr>(&self, field: &'static str) -> Result<T, RecordError> {
        self.0
            .routing
            .get(field)
            .ok_or(RecordError::MissingField(field))?
            .parse()
            .map_err(|_| RecordError::InvalidField(field))
    }

    fn str(&self, field: &'static str) -> Result<&'a str, RecordError> {
        self.0
            .sensitive
            .get(field)
            .ok_or(RecordError::MissingField(field))?
            .as_str()
            .ok_or(RecordError::InvalidField(field))
    }

    fn parse<T: FromStr>(&self, field: &'static str) -> Result<T, RecordError> {
        self.str(field)?
            .parse()
            .map_err(|_| RecordError::InvalidField(field))
    }

    fn u64(&self, field: &'static str) -> Result<u64, RecordError> {
        self.0
            .sensitive
            .get(field)
            .ok_or(RecordError::MissingField(field))?
            .as_u64()
            .ok_or(RecordError::InvalidField(field))
    }

    fn bytes(&self, field: &'static str) -> Result<Vec<u8>, RecordError> {
        STANDARD
            .decode(self.str(field)?)
            .map_err(|_| RecordError::InvalidField(field))
    }

    fn envelope(&self) -> Result<EncryptedEnvelope, RecordError> {
        Ok(EncryptedEnvelope {
            ephemeral_public_key: self.bytes("ephemeralPublicKey")?,
            ciphertext: self.bytes("ciphertext")?,
            signature: self.bytes("signature")?,
        })
    }
}

impl DeviceIdentity {
    #[must_use]
    pub fn to_record(&self) -> RelayRecord {
        RecordBuilder::new(RecordType::DeviceIdentity, self.device_id)
            .routing(fields::DEVICE_ID, self.device_id)
            .sensitive("displayName", self.display_name.clone())
            .bytes("signingPublicKey", &encode_verifying_key(&self.signing_key))
            .bytes("encryptionPublicKey", &encode_public_key(&self.encryption_key))
            .build()
    }
}

impl TryFrom<&RelayRecord> for DeviceIdentity {
    type Error = RecordError;

    fn try_from(record: &RelayRecord) -> Result<Self, Self::Error> {
        let r = RecordReader::expect(record, RecordType::DeviceIdentity)?;
        let signing_key = VerifyingKey::from_sec1_bytes(&r.bytes("signingPublicKey")?)
            .map_err(|_| RecordError::InvalidField("signingPublicKey"))?;
        let encryption_key = PublicKey::from_sec1_bytes(&r.bytes("encryptionPublicKey")?)
            .map_err(|_| RecordError::InvalidField("encryptionPublicKey"))?;

        Ok(Self {
            device_id: r.routing(fields::DEVICE_ID)?,
            display_name: r.str("displayName")?.to_string(),
            signing_key,
            encryption_key,
        })
    }
}

impl ShareTransferPacket {
    #[must_use]
    pub fn to_record(&self) -> RelayRecord {
        RecordBuilder::new(RecordType::ShareTransferPacket, self.uuid)
            .routing(fields::UUID, self.uuid)
            .routing(fields::RECIPIENT_DEVICE_ID, self.recipient)
            .sensitive("senderDeviceId", self.sender.to_string())
            .sensitive("secretId", self.secret_id.to_string())
            .sensitive("title", self.title.clone())
            .envelope(&self.envelope)
            .build()
    }
}

impl TryFrom<&RelayRecord> for ShareTransferPacket {
    type Error = RecordError;

    fn try_from(record: &RelayRecord) -> Result<Self, Self::Error> {
        let r = RecordReader::expect(record, RecordType::ShareTransferPacket)?;
        Ok(Self {
            uuid: r.routing(fields::UUID)?,
            recipient: r.routing(fields::RECIPIENT_DEVICE_ID)?,
            sender: r.parse("senderDeviceId")?,
            secret_id: r.parse("secretId")?,
            title: r.str("title")?.to_string(),
            envelope: r.envelope()?,
        })
    }
}

impl ReassemblyRequest {
    #[must_use]
    pub fn to_record(&self) -> RelayRecord {
        RecordBuilder::new(RecordType::ReassemblyRequest, self.uuid)
            .routing(fields::UUID, self.uuid)
            .sensitive("secretId", self.secret_id.to_string())
            .sensitive("requesterDeviceId", self.requester.to_string())
            .sensitive("timestamp", self.timestamp)
            .bytes("signature", &self.signature)
            .build()
    }
}

impl TryFrom<&RelayRecord> for ReassemblyRequest {
    type Error = RecordError;

    fn try_from(record: &RelayRecord) -> Result<Self, Self::Error> {
        let r = RecordReader::expect(record, RecordType::ReassemblyRequest)?;
        Ok(Self {
            uuid: r.routing(fields::UUID)?,
            secret_id: r.parse("secretId")?,
            requester: r.parse("requesterDeviceId")?,
            timestamp: r.u64("timestamp")?,
            signature: r.bytes("signature")?,
        })
    }
}

impl ReassemblyResponse {
    #[must_use]
    pub fn to_record(&self) -> RelayRecord {
        RecordBuilder::new(RecordType::ReassemblyResponse, self.uuid)
            .routing(fields::UUID, self.uuid)
            .routing(fields::REQUEST_ID, self.request_id)
            .sensitive("secretId", self.secret_id.to_string())
            .sensitive("responderDeviceId", self.responder.to_string())
            .envelope(&self.envelope)
            .build()
    }
}

impl TryFrom<&RelayRecord> for ReassemblyResponse {
    type Error = RecordError;

    fn try_from(record: &RelayRecord) -> Result<Self, Self::Error> {
        let r = RecordReader::expect(record, RecordType::ReassemblyResponse)?;
        Ok(Self {
            uuid: r.routing(fields::UUID)?,
            request_id: r.routing(fields::REQUEST_ID)?,
            secret_id: r.parse("secretId")?,
            responder: r.parse("responderDeviceId")?,
            envelope: r.envelope()?,
        })
    }
}
