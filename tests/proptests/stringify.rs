//! Property tests for displaying a recovered secret

use ff::FromUniformBytes;
use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;
use twain::domain::{Alphabet, CharsetOptions};
use twain::error::SharingError;
use twain::sharing::{FieldElement, FullSecret};

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

/// Any combination of character classes with at least one enabled
#[derive(Clone, Copy, Debug)]
struct NonEmptyCharset(CharsetOptions);

impl Arbitrary for NonEmptyCharset {
    fn arbitrary(g: &mut Gen) -> Self {
        loop {
            let options = CharsetOptions {
                include_upper: bool::arbitrary(g),
                include_lower: bool::arbitrary(g),
                include_digits: bool::arbitrary(g),
                include_special: bool::arbitrary(g),
            };
            if Alphabet::new(options).is_ok() {
                return NonEmptyCharset(options);
            }
        }
    }
}

fn show(value: FieldElement, options: CharsetOptions) -> String {
    FullSecret::from(value).stringify(options).unwrap().to_string()
}

/// The same secret always renders the same way
#[quickcheck]
fn prop_stringify_is_deterministic(value: AnyElement, charset: NonEmptyCharset) -> bool {
    show(value.0, charset.0) == show(value.0, charset.0)
}

/// Output only uses the enabled classes
#[quickcheck]
fn prop_stringify_stays_in_alphabet(value: AnyElement, charset: NonEmptyCharset) -> bool {
    let options = charset.0;
    show(value.0, options).chars().all(|c| {
        (options.include_upper && c.is_ascii_uppercase())
            || (options.include_lower && c.is_ascii_lowercase())
            || (options.include_digits && c.is_ascii_digit())
            || (options.include_special && c.is_ascii_punctuation())
    })
}

/// Enabling more classes never makes the rendering longer
#[quickcheck]
fn prop_larger_charset_is_never_longer(value: AnyElement, charset: NonEmptyCharset) -> bool {
    let all = CharsetOptions::default();
    show(value.0, all).chars().count() <= show(value.0, charset.0).chars().count()
}

/// Decimal rendering matches the integer the element encodes
#[quickcheck]
fn prop_decimal_matches_u64(value: u64) -> bool {
    let digits = CharsetOptions {
        include_upper: false,
        include_lower: false,
        include_digits: true,
        include_special: false,
    };
    show(FieldElement::from(value), digits) == value.to_string()
}

/// No class enabled is an error, whatever the secret
#[quickcheck]
fn prop_empty_charset_rejected(value: AnyElement) -> bool {
    let none = CharsetOptions {
        include_upper: false,
        include_lower: false,
        include_digits: false,
        include_special: false,
    };
    FullSecret::from(value.0).stringify(none) == Err(SharingError::EmptyCharset)
}
