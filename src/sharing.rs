//! Two-of-N linear secret sharing over GF(P)
//!
//! A secret is the intercept of a random line `f(x) = slope * x + intercept` over the
//! Pallas base field, whose modulus `P` is
//! `28948022309329048855892746252171976963363056481941560715954676764349967630337`
//! (also the order of the Vesta group). The field is borrowed purely as a convenient
//! 255-bit prime; no curve arithmetic happens here.
//!
//! Each device evaluates the line at its own x-coordinate. Any two distinct points
//! determine the line, and therefore the intercept. A single point does not: for every
//! candidate intercept there is exactly one slope passing through it.
//!
//! # Participant coordinates
//!
//! A device's x-coordinate is part of the wire format:
//!
//! ```text
//! x = from_uniform_bytes(SHA-512("twain/participant-x/v1" || device uuid as 16 raw bytes))
//! ```
//!
//! Reducing 512 uniform bits modulo `P` keeps the bias negligible, and collisions
//! between devices are checked before a split anyway.
//!
//! # Examples
//!
//! ```rust
//! use twain::domain::DeviceId;
//! use twain::sharing::{reassemble, split_for_devices};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let devices = [DeviceId::new_random(), DeviceId::new_random(), DeviceId::new_random()];
//! let shares = split_for_devices(&devices)?;
//!
//! let a = reassemble(&shares[&devices[0]], &shares[&devices[1]])?;
//! let b = reassemble(&shares[&devices[1]], &shares[&devices[2]])?;
//! assert_eq!(a, b);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ff::{Field, FromUniformBytes, PrimeField};
use halo2curves::pasta::Fp;
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::domain::DeviceId;
use crate::error::SharingError;

/// Element of GF(P)
pub type FieldElement = Fp;

/// Domain separator for the device-id to x-coordinate hash
pub const PARTICIPANT_X_DOMAIN: &[u8] = b"twain/participant-x/v1";

/// Length of an encoded share value
pub const SHARE_VALUE_LEN: usize = 32;

/// One evaluation `(x, f(x))` of a sharing line
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SharePoint {
    pub x: FieldElement,
    pub y: FieldElement,
}

impl fmt::Debug for SharePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharePoint")
            .field("x", &self.x)
            .field("y", &"[REDACTED]")
            .finish()
    }
}

/// The reconstructed constant term of a sharing line
///
/// Never persisted. Converting it for display with
/// [`FullSecret::stringify`](crate::sharing::FullSecret::stringify) consumes it.
#[derive(PartialEq, Eq)]
pub struct FullSecret(pub(crate) FieldElement);

impl From<FieldElement> for FullSecret {
    fn from(value: FieldElement) -> Self {
        Self(value)
    }
}

impl fmt::Debug for FullSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FullSecret([REDACTED])")
    }
}

impl Drop for FullSecret {
    fn drop(&mut self) {
        self.0 = FieldElement::ZERO;
    }
}

struct Line {
    slope: FieldElement,
    intercept: FieldElement,
}

impl Line {
    fn random() -> Self {
        Self {
            slope: random_nonzero(),
            intercept: random_nonzero(),
        }
    }

    fn eval(&self, x: FieldElement) -> FieldElement {
        self.slope * x + self.intercept
    }
}

impl Drop for Line {
    fn drop(&mut self) {
        self.slope = FieldElement::ZERO;
        self.intercept = FieldElement::ZERO;
    }
}

fn random_nonzero() -> FieldElement {
    loop {
        let value = FieldElement::random(OsRng);
        if !bool::from(value.is_zero()) {
            return value;
        }
    }
}

/// Maps a device id to its x-coordinate on every sharing line
#[must_use]
pub fn participant_x(device: &DeviceId) -> FieldElement {
    let mut hasher = Sha512::new();
    hasher.update(PARTICIPANT_X_DOMAIN);
    hasher.update(device.as_bytes());
    let digest = hasher.finalize();

    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    FieldElement::from_uniform_bytes(&wide)
}

/// Computes x-coordinates for a set of devices, refusing unusable sets
///
/// Duplicate device ids collapse into one participant.
///
/// # Errors
/// Returns an error if fewer than two distinct devices are given, if any coordinate is
/// zero, or if two devices collide on the same coordinate
pub fn participant_xs(
    devices: &[DeviceId],
) -> Result<BTreeMap<DeviceId, FieldElement>, SharingError> {
    let distinct: BTreeSet<DeviceId> = devices.iter().copied().collect();
    if distinct.len() < 2 {
        return Err(SharingError::TooFewParticipants(distinct.len()));
    }

    let xs: BTreeMap<DeviceId, FieldElement> = distinct
        .into_iter()
        .map(|device| (device, participant_x(&device)))
        .collect();

    let coordinates: Vec<FieldElement> = xs.values().copied().collect();
    check_coordinates(&coordinates)?;
    Ok(xs)
}

fn check_coordinates(xs: &[FieldElement]) -> Result<(), SharingError> {
    if xs.len() < 2 {
        return Err(SharingError::TooFewParticipants(xs.len()));
    }
    for (i, x) in xs.iter().enumerate() {
        if bool::from(x.is_zero()) {
            return Err(SharingError::ZeroCoordinate);
        }
        if xs[i + 1..].contains(x) {
            return Err(SharingError::DuplicateCoordinate);
        }
    }
    Ok(())
}

/// Draws a fresh random line and evaluates it at every given x-coordinate
///
/// Points come back in the order of `xs`.
///
/// # Errors
/// Returns an error if fewer than two coordinates are given, if any is zero (that
/// point would be the secret itself), or if two coincide
pub fn split_secret(xs: &[FieldElement]) -> Result<Vec<SharePoint>, SharingError> {
    check_coordinates(xs)?;

    let line = Line::random();
    Ok(xs
        .iter()
        .map(|&x| SharePoint { x, y: line.eval(x) })
        .collect())
}

/// Splits a fresh secret across devices, keyed by device id
///
/// # Errors
/// See [`participant_xs`]
pub fn split_for_devices(
    devices: &[DeviceId],
) -> Result<BTreeMap<DeviceId, SharePoint>, SharingError> {
    let xs = participant_xs(devices)?;
    let ids: Vec<DeviceId> = xs.keys().copied().collect();
    let coordinates: Vec<FieldElement> = xs.values().copied().collect();

    let points = split_secret(&coordinates)?;
    Ok(ids.into_iter().zip(points).collect())
}

/// Recovers the intercept of the line through two points
///
/// The slope is `(y1 - y2) / (x1 - x2)`; the division inverts `x1 - x2`, which for a
/// prime modulus is exponentiation by `P - 2`.
///
/// # Errors
/// Returns [`SharingError::CoincidentPoints`] if both points share an x-coordinate; there
/// is no line to recover and the caller has mislabelled a share
pub fn reassemble(first: &SharePoint, second: &SharePoint) -> Result<FullSecret, SharingError> {
    let denominator = first.x - second.x;
    let inverse: Option<FieldElement> = denominator.invert().into();
    let inverse = inverse.ok_or(SharingError::CoincidentPoints)?;

    let slope = (first.y - second.y) * inverse;
    Ok(FullSecret(first.y - slope * first.x))
}

/// Encodes a share value as its canonical 32-byte little-endian representation
#[must_use]
pub fn encode_share_value(value: &FieldElement) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(value.to_repr().as_ref().to_vec())
}

/// Decodes a share value produced by [`encode_share_value`]
///
/// # Errors
/// Returns [`SharingError::NonCanonicalValue`] for the wrong length or a value `>= P`
pub fn decode_share_value(bytes: &[u8]) -> Result<FieldElement, SharingError> {
    if bytes.len() != SHARE_VALUE_LEN {
        return Err(SharingError::NonCanonicalValue);
    }
    let mut repr = <FieldElement as PrimeField>::Repr::default();
    repr.as_mut().copy_from_slice(bytes);

    let value: Option<FieldElement> = FieldElement::from_repr(repr).into();
    value.ok_or(SharingError::NonCanonicalValue)
}
