//! Authenticated point-to-point envelope for moving shares between devices
//!
//! # Construction
//!
//! - Key agreement: a fresh P-256 ephemeral key per envelope, ECDH against the
//!   recipient's key-agreement public key
//! - KDF: HKDF-SHA256, salt [`PROTOCOL_SALT`], info =
//!   `ephemeral pub || recipient pub || sender verifying key` (SEC1 uncompressed each)
//! - AEAD: ChaCha20-Poly1305, stored as `nonce (12) || ciphertext || tag (16)`
//! - Signature: ECDSA P-256 / SHA-256 by the sender over
//!   `ciphertext || ephemeral pub || recipient pub`, DER encoded
//!
//! [`open`] verifies the signature before the ciphertext ever reaches the AEAD.
//!
//! # Examples
//!
//! ```rust
//! use p256::{SecretKey, ecdsa::SigningKey};
//! use rand::rngs::OsRng;
//! use twain::envelope::{self, EnvelopeSigner, KeyAgreement};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sender = SigningKey::random(&mut OsRng);
//! let recipient = SecretKey::random(&mut OsRng);
//!
//! let sealed = envelope::seal(b"share", &recipient.agreement_public_key(), &sender)?;
//! let opened = envelope::open(&sealed, &recipient, &sender.signing_public_key())?;
//! assert_eq!(opened.as_slice(), b"share");
//! # Ok(())
//! # }
//! ```

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use p256::ecdh::{EphemeralSecret, SharedSecret};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::codec::base64_bytes;
use crate::error::EnvelopeError;

/// HKDF salt shared by every envelope
pub const PROTOCOL_SALT: &[u8] = b"twain share envelope v1";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A sealed, signed unit of ciphertext addressed to one recipient
///
/// Replayable but unforgeable: anyone may copy it, nobody without the sender's signing
/// key can produce one the recipient accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    #[serde(with = "base64_bytes")]
    pub ephemeral_public_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// A signing key the sender holds for the duration of one operation
pub trait EnvelopeSigner {
    /// Public half, bound into the envelope's key derivation
    fn signing_public_key(&self) -> VerifyingKey;

    /// Signs `message` with ECDSA P-256 / SHA-256
    ///
    /// # Errors
    /// Returns [`EnvelopeError::Signing`] if the key refuses to sign
    fn sign_message(&self, message: &[u8]) -> Result<Signature, EnvelopeError>;
}

/// A key-agreement key the recipient holds for the duration of one operation
pub trait KeyAgreement {
    fn agreement_public_key(&self) -> PublicKey;

    /// Performs ECDH with `peer`
    ///
    /// # Errors
    /// Returns an error if the underlying key store refuses the operation
    fn agree(&self, peer: &PublicKey) -> Result<SharedSecret, EnvelopeError>;
}

impl EnvelopeSigner for SigningKey {
    fn signing_public_key(&self) -> VerifyingKey {
        self.verifying_key().clone()
    }

    fn sign_message(&self, message: &[u8]) -> Result<Signature, EnvelopeError> {
        Signer::<Signature>::try_sign(self, message)
            .map_err(|e| EnvelopeError::Signing(e.to_string()))
    }
}

impl KeyAgreement for SecretKey {
    fn agreement_public_key(&self) -> PublicKey {
        self.public_key()
    }

    fn agree(&self, peer: &PublicKey) -> Result<SharedSecret, EnvelopeError> {
        Ok(p256::ecdh::diffie_hellman(
            self.to_nonzero_scalar(),
            peer.as_affine(),
        ))
    }
}

/// SEC1 uncompressed encoding of a key-agreement public key
#[must_use]
pub fn encode_public_key(key: &PublicKey) -> Vec<u8> {
    key.to_encoded_point(false).as_bytes().to_vec()
}

/// SEC1 uncompressed encoding of a signing public key
#[must_use]
pub fn encode_verifying_key(key: &VerifyingKey) -> Vec<u8> {
    key.to_encoded_point(false).as_bytes().to_vec()
}

/// Verifies a DER-encoded ECDSA signature
///
/// Malformed signatures simply fail to verify.
#[must_use]
pub fn verify_der(key: &VerifyingKey, message: &[u8], signature_der: &[u8]) -> bool {
    Signature::from_der(signature_der)
        .and_then(|signature| key.verify(message, &signature))
        .is_ok()
}

fn signed_bytes(ciphertext: &[u8], ephemeral_public: &[u8], recipient_public: &[u8]) -> Vec<u8> {
    let mut data =
        Vec::with_capacity(ciphertext.len() + ephemeral_public.len() + recipient_public.len());
    data.extend_from_slice(ciphertext);
    data.extend_from_slice(ephemeral_public);
    data.extend_from_slice(recipient_public);
    data
}

fn derive_key(
    shared: &SharedSecret,
    ephemeral_public: &[u8],
    recipient_public: &[u8],
    sender_public: &[u8],
) -> Result<Zeroizing<[u8; 32]>, EnvelopeError> {
    let mut info =
        Vec::with_capacity(ephemeral_public.len() + recipient_public.len() + sender_public.len());
    info.extend_from_slice(ephemeral_public);
    info.extend_from_slice(recipient_public);
    info.extend_from_slice(sender_public);

    let hkdf = Hkdf::<Sha256>::new(Some(PROTOCOL_SALT), shared.raw_secret_bytes().as_slice());
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(&info, &mut key[..])
        .map_err(|_| EnvelopeError::Encryption)?;
    Ok(key)
}

/// Encrypts `plaintext` to `recipient` and signs the result as `sender`
///
/// Every call draws a fresh ephemeral key, so two seals of the same plaintext share
/// nothing but the recipient.
///
/// # Errors
/// Returns [`EnvelopeError::Signing`] if the sender's key refuses to sign, or
/// [`EnvelopeError::Encryption`] if the AEAD fails
pub fn seal<S>(
    plaintext: &[u8],
    recipient: &PublicKey,
    sender: &S,
) -> Result<EncryptedEnvelope, EnvelopeError>
where
    S: EnvelopeSigner + ?Sized,
{
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_public = encode_public_key(&ephemeral.public_key());
    let recipient_public = encode_public_key(recipient);
    let sender_public = encode_verifying_key(&sender.signing_public_key());

    let shared = ephemeral.diffie_hellman(recipient);
    let key = derive_key(&shared, &ephemeral_public, &recipient_public, &sender_public)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| EnvelopeError::Encryption)?;

    let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
    ciphertext.extend_from_slice(&nonce);
    ciphertext.extend_from_slice(&sealed);

    let signature =
        sender.sign_message(&signed_bytes(&ciphertext, &ephemeral_public, &recipient_public))?;

    Ok(EncryptedEnvelope {
        ephemeral_public_key: ephemeral_public,
        ciphertext,
        signature: signature.to_der().as_bytes().to_vec(),
    })
}

/// Verifies and decrypts an envelope addressed to `recipient`
///
/// # Errors
/// - [`EnvelopeError::Authentication`] if the signature does not verify under `sender`
///   for this recipient; nothing is decrypted in that case
/// - [`EnvelopeError::MalformedKey`] if a correctly signed envelope carries an
///   unparseable ephemeral key
/// - [`EnvelopeError::Decryption`] if the ciphertext is truncated or fails the AEAD tag
pub fn open<R>(
    envelope: &EncryptedEnvelope,
    recipient: &R,
    sender: &VerifyingKey,
) -> Result<Zeroizing<Vec<u8>>, EnvelopeError>
where
    R: KeyAgreement + ?Sized,
{
    let own_public = encode_public_key(&recipient.agreement_public_key());
    let message = signed_bytes(
        &envelope.ciphertext,
        &envelope.ephemeral_public_key,
        &own_public,
    );
    if !verify_der(sender, &message, &envelope.signature) {
        return Err(EnvelopeError::Authentication);
    }

    let ephemeral = PublicKey::from_sec1_bytes(&envelope.ephemeral_public_key)
        .map_err(|_| EnvelopeError::MalformedKey)?;
    let shared = recipient.agree(&ephemeral)?;
    let key = derive_key(
        &shared,
        &envelope.ephemeral_public_key,
        &own_public,
        &encode_verifying_key(sender),
    )?;

    if envelope.ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(EnvelopeError::Decryption);
    }
    let (nonce, sealed) = envelope.ciphertext.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map(Zeroizing::new)
        .map_err(|_| EnvelopeError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Party {
        signing: SigningKey,
        agreement: SecretKey,
    }

    impl Party {
        fn new() -> Self {
            Self {
                signing: SigningKey::random(&mut OsRng),
                agreement: SecretKey::random(&mut OsRng),
            }
        }
    }

    fn seal_between(sender: &Party, recipient: &Party, message: &[u8]) -> EncryptedEnvelope {
        seal(
            message,
            &recipient.agreement.agreement_public_key(),
            &sender.signing,
        )
        .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let (alice, bob) = (Party::new(), Party::new());
        let sealed = seal_between(&alice, &bob, b"correct horse");
        let opened = open(&sealed, &bob.agreement, alice.signing.verifying_key()).unwrap();
        assert_eq!(opened.as_slice(), b"correct horse");
    }

    #[test]
    fn test_round_trip_empty_message() {
        let (alice, bob) = (Party::new(), Party::new());
        let sealed = seal_between(&alice, &bob, b"");
        let opened = open(&sealed, &bob.agreement, alice.signing.verifying_key()).unwrap();
        assert!(opened.is_empty());
    }

    #[test]
    fn test_self_envelope() {
        let me = Party::new();
        let sealed = seal_between(&me, &me, b"my own share");
        let opened = open(&sealed, &me.agreement, me.signing.verifying_key()).unwrap();
        assert_eq!(opened.as_slice(), b"my own share");
    }

    #[test]
    fn test_each_seal_uses_fresh_ephemeral_key() {
        let (alice, bob) = (Party::new(), Party::new());
        let first = seal_between(&alice, &bob, b"same");
        let second = seal_between(&alice, &bob, b"same");
        assert_ne!(first.ephemeral_public_key, second.ephemeral_public_key);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_wrong_sender_key_is_authentication_error() {
        let (alice, bob, mallory) = (Party::new(), Party::new(), Party::new());
        let sealed = seal_between(&alice, &bob, b"secret");
        let result = open(&sealed, &bob.agreement, mallory.signing.verifying_key());
        assert_eq!(result.unwrap_err(), EnvelopeError::Authentication);
    }

    #[test]
    fn test_wrong_recipient_is_authentication_error() {
        let (alice, bob, carol) = (Party::new(), Party::new(), Party::new());
        let sealed = seal_between(&alice, &bob, b"secret");
        let result = open(&sealed, &carol.agreement, alice.signing.verifying_key());
        assert_eq!(result.unwrap_err(), EnvelopeError::Authentication);
    }

    #[test]
    fn test_tampered_fields_are_rejected() {
        let (alice, bob) = (Party::new(), Party::new());
        let sealed = seal_between(&alice, &bob, b"secret");

        let mut ciphertext = sealed.clone();
        ciphertext.ciphertext[NONCE_LEN] ^= 0x01;
        let mut ephemeral = sealed.clone();
        ephemeral.ephemeral_public_key[10] ^= 0x80;
        let mut signature = sealed.clone();
        let last = signature.signature.len() - 1;
        signature.signature[last] ^= 0x01;

        for tampered in [ciphertext, ephemeral, signature] {
            let result = open(&tampered, &bob.agreement, alice.signing.verifying_key());
            assert_eq!(result.unwrap_err(), EnvelopeError::Authentication);
        }
    }

    #[test]
    fn test_truncated_ciphertext_with_valid_signature_is_decryption_error() {
        let (alice, bob) = (Party::new(), Party::new());
        let mut sealed = seal_between(&alice, &bob, b"secret");
        sealed.ciphertext.truncate(NONCE_LEN + 4);

        // Re-sign so only the ciphertext itself is at fault
        let own_public = encode_public_key(&bob.agreement.agreement_public_key());
        let message = signed_bytes(&sealed.ciphertext, &sealed.ephemeral_public_key, &own_public);
        sealed.signature = alice
            .signing
            .sign_message(&message)
            .unwrap()
            .to_der()
            .as_bytes()
            .to_vec();

        let result = open(&sealed, &bob.agreement, alice.signing.verifying_key());
        assert_eq!(result.unwrap_err(), EnvelopeError::Decryption);
    }

    #[test]
    fn test_envelope_serde_uses_base64() {
        let (alice, bob) = (Party::new(), Party::new());
        let sealed = seal_between(&alice, &bob, b"secret");
        let json = serde_json::to_value(&sealed).unwrap();
        assert!(json["ephemeralPublicKey"].is_string());
        let back: EncryptedEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, sealed);
    }

    #[test]
    fn test_verify_der_rejects_garbage() {
        let alice = Party::new();
        assert!(!verify_der(alice.signing.verifying_key(), b"msg", &[0x30, 0x00]));
    }
}
