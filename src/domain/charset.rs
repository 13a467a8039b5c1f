//! Character classes used to display a recovered secret

use crate::error::SharingError;

const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const DIGITS: &str = "0123456789";
const SPECIAL: &str = "!#$%&()*+,-./:;<=>?@[]^_{|}~";

/// Which character classes a displayed secret may use
///
/// Classes are concatenated in a fixed order: upper, lower, digits, special.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct CharsetOptions {
    pub include_upper: bool,
    pub include_lower: bool,
    pub include_digits: bool,
    pub include_special: bool,
}

impl Default for CharsetOptions {
    fn default() -> Self {
        Self {
            include_upper: true,
            include_lower: true,
            include_digits: true,
            include_special: true,
        }
    }
}

/// Ordered, non-empty set of output symbols
///
/// Invariant: at least one symbol (enforced at construction), so the radix is never 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alphabet(Vec<char>);

impl Alphabet {
    /// Builds the alphabet for the enabled character classes
    ///
    /// # Errors
    /// Returns [`SharingError::EmptyCharset`] if every class is disabled
    ///
    /// # Examples
    ///
    /// ```rust
    /// use twain::domain::{Alphabet, CharsetOptions};
    ///
    /// let digits_only = CharsetOptions {
    ///     include_upper: false,
    ///     include_lower: false,
    ///     include_digits: true,
    ///     include_special: false,
    /// };
    /// assert_eq!(Alphabet::new(digits_only).unwrap().radix(), 10);
    ///
    /// let nothing = CharsetOptions {
    ///     include_digits: false,
    ///     ..digits_only
    /// };
    /// assert!(Alphabet::new(nothing).is_err());
    /// ```
    pub fn new(options: CharsetOptions) -> Result<Self, SharingError> {
        let classes = [
            (options.include_upper, UPPER),
            (options.include_lower, LOWER),
            (options.include_digits, DIGITS),
            (options.include_special, SPECIAL),
        ];
        let symbols: Vec<char> = classes
            .iter()
            .filter(|(enabled, _)| *enabled)
            .flat_map(|(_, class)| class.chars())
            .collect();

        if symbols.is_empty() {
            return Err(SharingError::EmptyCharset);
        }
        Ok(Self(symbols))
    }

    /// Number of distinct symbols
    #[must_use]
    pub fn radix(&self) -> u32 {
        // At most 26 + 26 + 10 + 28 symbols
        self.0.len() as u32
    }

    /// Symbol for a digit below [`Alphabet::radix`]
    #[must_use]
    pub fn symbol(&self, digit: u32) -> char {
        self.0[digit as usize]
    }
}
