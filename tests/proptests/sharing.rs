//! Property tests for splitting and reassembling

use ff::{Field, FromUniformBytes};
use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;
use twain::domain::{CharsetOptions, DeviceId};
use twain::error::SharingError;
use twain::sharing::{
    FieldElement, SharePoint, decode_share_value, encode_share_value, participant_x,
    reassemble, split_for_devices, split_secret,
};

/// Wrapper for a uniformly drawn field element
#[derive(Clone, Copy, Debug)]
struct AnyElement(FieldElement);

impl Arbitrary for AnyElement {
    fn arbitrary(g: &mut Gen) -> Self {
        let mut wide = [0u8; 64];
        for byte in &mut wide {
            *byte = u8::arbitrary(g);
        }
        AnyElement(FieldElement::from_uniform_bytes(&wide))
    }
}

/// Wrapper for 3 to 12 distinct, nonzero x-coordinates
#[derive(Clone, Debug)]
struct Coordinates(Vec<FieldElement>);

impl Arbitrary for Coordinates {
    fn arbitrary(g: &mut Gen) -> Self {
        let count = (usize::arbitrary(g) % 10) + 3; // 3..=12
        let mut xs: Vec<FieldElement> = Vec::with_capacity(count);
        while xs.len() < count {
            let AnyElement(x) = AnyElement::arbitrary(g);
            if !bool::from(x.is_zero()) && !xs.contains(&x) {
                xs.push(x);
            }
        }
        Coordinates(xs)
    }
}

/// Indices of two different shares out of `len`
fn pick_pair(g: &mut Gen, len: usize) -> (usize, usize) {
    let i = usize::arbitrary(g) % len;
    let j = (i + 1 + usize::arbitrary(g) % (len - 1)) % len;
    (i, j)
}

/// Every pair of shares recovers the same intercept
#[quickcheck]
fn prop_any_two_shares_agree(coordinates: Coordinates, seed: u64) -> bool {
    let Coordinates(xs) = coordinates;
    let shares = split_secret(&xs).unwrap();

    let mut g = Gen::new(seed as usize % 64 + 1);
    let (i, j) = pick_pair(&mut g, shares.len());
    let (k, l) = pick_pair(&mut g, shares.len());

    let first = reassemble(&shares[i], &shares[j]).unwrap();
    let second = reassemble(&shares[k], &shares[l]).unwrap();
    first == second
}

/// Reassembly does not depend on the order of the two shares
#[quickcheck]
fn prop_reassemble_is_symmetric(coordinates: Coordinates) -> bool {
    let Coordinates(xs) = coordinates;
    let shares = split_secret(&xs).unwrap();
    reassemble(&shares[0], &shares[1]).unwrap() == reassemble(&shares[1], &shares[0]).unwrap()
}

/// Each split draws a fresh line
#[quickcheck]
fn prop_splits_are_independent(coordinates: Coordinates) -> bool {
    let Coordinates(xs) = coordinates;
    let a = split_secret(&xs).unwrap();
    let b = split_secret(&xs).unwrap();
    reassemble(&a[0], &a[1]).unwrap() != reassemble(&b[0], &b[1]).unwrap()
}

/// Two points with the same x never reassemble
#[quickcheck]
fn prop_coincident_points_fail(x: AnyElement, y1: AnyElement, y2: AnyElement) -> bool {
    let first = SharePoint { x: x.0, y: y1.0 };
    let second = SharePoint { x: x.0, y: y2.0 };
    reassemble(&first, &second) == Err(SharingError::CoincidentPoints)
}

/// A repeated coordinate is refused before any line is drawn
#[quickcheck]
fn prop_duplicate_coordinates_rejected(coordinates: Coordinates) -> bool {
    let Coordinates(mut xs) = coordinates;
    xs.push(xs[0]);
    split_secret(&xs).unwrap_err() == SharingError::DuplicateCoordinate
}

/// Share values survive their 32-byte wire encoding
#[quickcheck]
fn prop_share_value_encoding(value: AnyElement) -> bool {
    let bytes = encode_share_value(&value.0);
    bytes.len() == 32 && decode_share_value(&bytes) == Ok(value.0)
}

/// Device coordinates are stable and land on the shares handed out
#[quickcheck]
fn prop_device_shares_use_participant_x(count: u8) -> bool {
    let count = usize::from(count % 6) + 2;
    let devices: Vec<DeviceId> = (0..count).map(|_| DeviceId::new_random()).collect();
    let shares = split_for_devices(&devices).unwrap();

    shares.len() == count
        && devices
            .iter()
            .all(|d| shares[d].x == participant_x(d) && participant_x(d) == participant_x(d))
}

/// A single share says nothing: every candidate intercept has a line through it
#[quickcheck]
fn prop_single_share_fits_any_secret(x: AnyElement, y: AnyElement, guess: AnyElement) -> bool {
    if bool::from(x.0.is_zero()) {
        return true;
    }
    let share = SharePoint { x: x.0, y: y.0 };
    // The line through (0, guess) and the share
    let slope = (y.0 - guess.0) * x.0.invert().unwrap();
    let other_x = x.0 + FieldElement::ONE;
    let other = SharePoint {
        x: other_x,
        y: slope * other_x + guess.0,
    };

    let digits = CharsetOptions {
        include_upper: false,
        include_lower: false,
        include_digits: true,
        include_special: false,
    };
    let recovered = reassemble(&share, &other).unwrap().stringify(digits).unwrap();
    let expected = twain::sharing::FullSecret::from(guess.0)
        .stringify(digits)
        .unwrap();
    recovered == expected
}
