//! Fractal Numerals
//!
//! Base-N digit strings used as fractal addresses and partition keys.
//!
//! A cluster working on a job with `N` anchor points hands out addresses in
//! base `N`: digit `d` at position `k` selects anchor `d` at subdivision
//! depth `k`. Addresses are allocated in [`Numeral::successor`] order starting
//! from the genesis address `"0"`.
//!
//! # Successor Order
//!
//! ```text
//! base 3:  0 → 1 → 2 → 01 → 02 → 11 → 12 → 21 → 22 → 001 → ...
//! ```
//!
//! Addresses never end in `0` (except genesis): a trailing zero would name
//! the same region as its parent one level up.

use std::cmp::Ordering;

use thiserror::Error;

/// Smallest supported base.
pub const MIN_BASE: u32 = 2;

/// Largest supported base (digits are ASCII `0`-`9`).
pub const MAX_BASE: u32 = 10;

/// Result type for numeral operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the numeral codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Base outside `MIN_BASE..=MAX_BASE`.
    #[error("unsupported base {0} (expected {MIN_BASE}..={MAX_BASE})")]
    InvalidBase(u32),

    /// Empty digit string.
    #[error("empty digit string")]
    Empty,

    /// A character that is not a digit of this base.
    #[error("invalid digit {digit:?} for base {base}")]
    InvalidDigit { digit: char, base: u32 },

    /// Value does not fit in a u64.
    #[error("numeral {0:?} overflows u64")]
    Overflow(String),
}

/// A base-N numeral system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Numeral {
    base: u32,
}

impl Numeral {
    /// Create a codec for `base`.
    pub fn new(base: u32) -> Result<Self> {
        if !(MIN_BASE..=MAX_BASE).contains(&base) {
            return Err(Error::InvalidBase(base));
        }
        Ok(Self { base })
    }

    /// The base of this numeral system.
    pub const fn base(&self) -> u32 {
        self.base
    }

    /// Render `n` as a digit string, most significant digit first.
    pub fn encode(&self, mut n: u64) -> String {
        if n == 0 {
            return "0".to_string();
        }
        let base = u64::from(self.base);
        let mut digits = Vec::new();
        while n > 0 {
            digits.push(digit_char((n % base) as u32));
            n /= base;
        }
        digits.iter().rev().collect()
    }

    /// Parse a digit string back into an integer.
    pub fn decode(&self, digits: &str) -> Result<u64> {
        let base = u64::from(self.base);
        self.digits(digits)?.into_iter().try_fold(0u64, |acc, d| {
            acc.checked_mul(base)
                .and_then(|v| v.checked_add(u64::from(d)))
                .ok_or_else(|| Error::Overflow(digits.to_string()))
        })
    }

    /// Next fractal address after `digits`.
    ///
    /// Increments with carry. A full wrap grows the address by one leading
    /// zero, and a trailing `0` is always raised to `1`.
    pub fn successor(&self, digits: &str) -> Result<String> {
        let mut values = self.digits(digits)?;

        let mut carry = true;
        for d in values.iter_mut().rev() {
            *d += 1;
            if *d == self.base {
                *d = 0;
            } else {
                carry = false;
                break;
            }
        }
        if carry {
            values.insert(0, 0);
        }
        if let Some(last) = values.last_mut() {
            if *last == 0 {
                *last = 1;
            }
        }

        Ok(values.into_iter().map(digit_char).collect())
    }

    /// Order two addresses: shorter first, then by value.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    }

    /// Highest address in `addresses` by [`Numeral::compare`].
    pub fn max<'a, I>(&self, addresses: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        addresses.into_iter().max_by(|a, b| self.compare(a, b))
    }

    fn digits(&self, digits: &str) -> Result<Vec<u32>> {
        if digits.is_empty() {
            return Err(Error::Empty);
        }
        digits
            .chars()
            .map(|c| match c.to_digit(10) {
                Some(d) if d < self.base => Ok(d),
                _ => Err(Error::InvalidDigit {
                    digit: c,
                    base: self.base,
                }),
            })
            .collect()
    }
}

/// Number of differing positions between two digit strings.
///
/// The shorter string is zero-padded on the left so digits of equal weight
/// are compared against each other.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let width = a.len().max(b.len());

    let padded = |s: &[char], i: usize| -> char {
        let pad = width - s.len();
        if i < pad {
            '0'
        } else {
            s[i - pad]
        }
    };

    (0..width).filter(|&i| padded(&a, i) != padded(&b, i)).count()
}

fn digit_char(d: u32) -> char {
    char::from_digit(d, 10).unwrap_or('0')
}
