//! Display encoding for a recovered secret
//!
//! The field element is written in positional notation over the enabled character
//! classes, most significant digit first, by repeated division by the radix. This is a
//! one-way display transform: nothing ever parses the output back.

use ff::PrimeField;
use zeroize::Zeroizing;

use crate::domain::{Alphabet, CharsetOptions};
use crate::error::SharingError;
use crate::sharing::FullSecret;

impl FullSecret {
    /// Consumes the secret and renders it for display
    ///
    /// # Errors
    /// Returns [`SharingError::EmptyCharset`] if no character class is enabled
    ///
    /// # Examples
    ///
    /// ```rust
    /// use twain::domain::CharsetOptions;
    /// use twain::sharing::{FieldElement, FullSecret};
    ///
    /// let digits = CharsetOptions {
    ///     include_upper: false,
    ///     include_lower: false,
    ///     include_digits: true,
    ///     include_special: false,
    /// };
    /// let shown = FullSecret::from(FieldElement::from(90210u64)).stringify(digits).unwrap();
    /// assert_eq!(shown.as_str(), "90210");
    /// ```
    pub fn stringify(self, options: CharsetOptions) -> Result<Zeroizing<String>, SharingError> {
        let alphabet = Alphabet::new(options)?;
        let repr = self.0.to_repr();
        Ok(encode_mixed_radix(repr.as_ref(), &alphabet))
    }
}

/// Writes a little-endian unsigned integer in base `alphabet.radix()`
#[allow(
    clippy::cast_possible_truncation,
    reason = "each quotient digit is below 256 because the running remainder is below the radix"
)]
fn encode_mixed_radix(value_le: &[u8], alphabet: &Alphabet) -> Zeroizing<String> {
    let radix = alphabet.radix();
    let mut quotient: Zeroizing<Vec<u8>> = Zeroizing::new(value_le.iter().rev().copied().collect());
    let mut digits: Zeroizing<Vec<u32>> = Zeroizing::new(Vec::new());

    loop {
        let mut remainder: u32 = 0;
        let mut more = false;
        for byte in quotient.iter_mut() {
            let acc = (remainder << 8) | u32::from(*byte);
            // remainder < radix, so acc / radix < 256
            *byte = (acc / radix) as u8;
            remainder = acc % radix;
            more |= *byte != 0;
        }
        digits.push(remainder);
        if !more {
            break;
        }
    }

    Zeroizing::new(digits.iter().rev().map(|&d| alphabet.symbol(d)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharing::FieldElement;
    use ff::Field;

    fn only(upper: bool, lower: bool, digits: bool, special: bool) -> CharsetOptions {
        CharsetOptions {
            include_upper: upper,
            include_lower: lower,
            include_digits: digits,
            include_special: special,
        }
    }

    fn show(value: FieldElement, options: CharsetOptions) -> String {
        FullSecret::from(value)
            .stringify(options)
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_zero_is_first_symbol() {
        assert_eq!(show(FieldElement::from(0u64), CharsetOptions::default()), "A");
    }

    #[test]
    fn test_digits_match_decimal() {
        let digits = only(false, false, true, false);
        assert_eq!(show(FieldElement::from(0u64), digits), "0");
        assert_eq!(show(FieldElement::from(7u64), digits), "7");
        assert_eq!(show(FieldElement::from(1_234_567_890u64), digits), "1234567890");
    }

    #[test]
    fn test_most_significant_digit_first() {
        // 27 = 1 * 26 + 1 in base 26 over A..Z
        let upper = only(true, false, false, false);
        assert_eq!(show(FieldElement::from(27u64), upper), "BB");
        assert_eq!(show(FieldElement::from(26u64), upper), "BA");
    }

    #[test]
    fn test_modulus_minus_one_in_decimal() {
        let digits = only(false, false, true, false);
        let value = -FieldElement::ONE;
        assert_eq!(
            show(value, digits),
            "28948022309329048855892746252171976963363056481941560715954676764349967630336"
        );
    }

    #[test]
    fn test_empty_charset_fails() {
        let none = only(false, false, false, false);
        let result = FullSecret::from(FieldElement::ONE).stringify(none);
        assert_eq!(result.unwrap_err(), SharingError::EmptyCharset);
    }

    #[test]
    fn test_larger_alphabet_never_lengthens_output() {
        let value = -FieldElement::from(12345u64);
        let digits = show(value, only(false, false, true, false));
        let alnum = show(value, only(true, true, true, false));
        let all = show(value, CharsetOptions::default());
        assert!(alnum.len() <= digits.len());
        assert!(all.len() <= alnum.len());
    }
}
