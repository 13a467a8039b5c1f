//! Property tests for sealing and opening share envelopes

use p256::SecretKey;
use p256::ecdsa::SigningKey;
use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;
use rand::rngs::OsRng;
use twain::envelope::{self, EnvelopeSigner, KeyAgreement};
use twain::error::EnvelopeError;

/// Wrapper for a payload between 1 and 256 bytes
#[derive(Clone, Debug)]
struct Payload(Vec<u8>);

impl Arbitrary for Payload {
    fn arbitrary(g: &mut Gen) -> Self {
        let len = (usize::arbitrary(g) % 256) + 1;
        Payload((0..len).map(|_| u8::arbitrary(g)).collect())
    }
}

/// Which envelope field a tamper hits
#[derive(Clone, Copy, Debug)]
enum Field {
    Ephemeral,
    Ciphertext,
    Signature,
}

impl Arbitrary for Field {
    fn arbitrary(g: &mut Gen) -> Self {
        *g.choose(&[Field::Ephemeral, Field::Ciphertext, Field::Signature])
            .unwrap()
    }
}

struct Parties {
    sender: SigningKey,
    recipient: SecretKey,
}

fn parties() -> Parties {
    Parties {
        sender: SigningKey::random(&mut OsRng),
        recipient: SecretKey::random(&mut OsRng),
    }
}

/// Whatever goes in comes back out for the intended recipient
#[quickcheck]
fn prop_seal_open_round_trip(payload: Payload) -> bool {
    let p = parties();
    let sealed = envelope::seal(&payload.0, &p.recipient.agreement_public_key(), &p.sender).unwrap();
    let opened = envelope::open(&sealed, &p.recipient, &p.sender.signing_public_key()).unwrap();
    opened.as_slice() == payload.0.as_slice()
}

/// Flipping any bit of any field is caught before decryption
#[quickcheck]
fn prop_tampering_is_rejected(payload: Payload, field: Field, position: usize, bit: u8) -> bool {
    let p = parties();
    let mut sealed =
        envelope::seal(&payload.0, &p.recipient.agreement_public_key(), &p.sender).unwrap();

    let bytes = match field {
        Field::Ephemeral => &mut sealed.ephemeral_public_key,
        Field::Ciphertext => &mut sealed.ciphertext,
        Field::Signature => &mut sealed.signature,
    };
    let index = position % bytes.len();
    bytes[index] ^= 1 << (bit % 8);

    envelope::open(&sealed, &p.recipient, &p.sender.signing_public_key())
        == Err(EnvelopeError::Authentication)
}

/// Only the addressed recipient can open an envelope
#[quickcheck]
fn prop_wrong_recipient_rejected(payload: Payload) -> bool {
    let p = parties();
    let eavesdropper = SecretKey::random(&mut OsRng);
    let sealed = envelope::seal(&payload.0, &p.recipient.agreement_public_key(), &p.sender).unwrap();
    envelope::open(&sealed, &eavesdropper, &p.sender.signing_public_key())
        == Err(EnvelopeError::Authentication)
}

/// An envelope does not open under someone else's claimed sender key
#[quickcheck]
fn prop_wrong_sender_rejected(payload: Payload) -> bool {
    let p = parties();
    let impostor = SigningKey::random(&mut OsRng);
    let sealed = envelope::seal(&payload.0, &p.recipient.agreement_public_key(), &p.sender).unwrap();
    envelope::open(&sealed, &p.recipient, &impostor.signing_public_key())
        == Err(EnvelopeError::Authentication)
}

/// Sealing the same payload twice never repeats ciphertext
#[quickcheck]
fn prop_seal_is_randomized(payload: Payload) -> bool {
    let p = parties();
    let recipient = p.recipient.agreement_public_key();
    let a = envelope::seal(&payload.0, &recipient, &p.sender).unwrap();
    let b = envelope::seal(&payload.0, &recipient, &p.sender).unwrap();
    a.ephemeral_public_key != b.ephemeral_public_key && a.ciphertext != b.ciphertext
}
