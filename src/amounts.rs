//! Exact money amounts
//!
//! Amounts are `{currency, value, fraction}` with a fixed fractional base.
//! All arithmetic is integer-only and checked; there is no floating point
//! anywhere on the money path.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of fractional units per value unit.
pub const FRACTIONAL_BASE: u64 = 100_000_000;

/// Digits needed to print the fractional part. Must match lg(FRACTIONAL_BASE).
pub const FRACTIONAL_LENGTH: usize = 8;

/// Maximum allowed value field of an amount.
pub const MAX_VALUE: u64 = 1 << 52;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Mismatched currency: {0} and {1}")]
    CurrencyMismatch(String, String),

    #[error("Amount overflow")]
    Overflow,

    #[error("Amount underflow")]
    Underflow,

    #[error("Can't parse amount: {0}")]
    Parse(String),
}

/// Non-negative financial amount. Fractions are multiples of 1e-8.
///
/// Serialized in records as the structured form; the canonical string form
/// is `CUR:12.5` (see [`Amount::parse`] / [`fmt::Display`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub currency: String,
    /// Integer units. Invariant: `value <= MAX_VALUE`.
    pub value: u64,
    /// Fractional units. Invariant: `fraction < FRACTIONAL_BASE`.
    pub fraction: u64,
}

impl Amount {
    pub fn new(currency: &str, value: u64, fraction: u64) -> Self {
        let mut a = Amount {
            currency: currency.to_uppercase(),
            value,
            fraction,
        };
        a.normalize();
        a
    }

    pub fn zero(currency: &str) -> Self {
        Amount {
            currency: currency.to_uppercase(),
            value: 0,
            fraction: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0 && self.fraction == 0
    }

    fn normalize(&mut self) {
        self.value += self.fraction / FRACTIONAL_BASE;
        self.fraction %= FRACTIONAL_BASE;
    }

    fn check_currency(&self, other: &Amount) -> Result<(), AmountError> {
        if self.currency != other.currency {
            return Err(AmountError::CurrencyMismatch(
                self.currency.clone(),
                other.currency.clone(),
            ));
        }
        Ok(())
    }

    /// Checked addition. Errors on currency mismatch or overflow past
    /// `MAX_VALUE` (never wraps or saturates silently).
    pub fn checked_add(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.check_currency(other)?;
        let fraction = self.fraction + other.fraction;
        let value = self
            .value
            .checked_add(other.value)
            .and_then(|v| v.checked_add(fraction / FRACTIONAL_BASE))
            .ok_or(AmountError::Overflow)?;
        if value > MAX_VALUE {
            return Err(AmountError::Overflow);
        }
        Ok(Amount {
            currency: self.currency.clone(),
            value,
            fraction: fraction % FRACTIONAL_BASE,
        })
    }

    /// Checked subtraction. Errors on currency mismatch or when the result
    /// would be negative.
    pub fn checked_sub(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.check_currency(other)?;
        let mut value = self.value;
        let mut fraction = self.fraction;
        if fraction < other.fraction {
            if value == 0 {
                return Err(AmountError::Underflow);
            }
            value -= 1;
            fraction += FRACTIONAL_BASE;
        }
        fraction -= other.fraction;
        if value < other.value {
            return Err(AmountError::Underflow);
        }
        value -= other.value;
        Ok(Amount {
            currency: self.currency.clone(),
            value,
            fraction,
        })
    }

    /// Multiply by a small integer factor.
    pub fn checked_mul(&self, n: u64) -> Result<Amount, AmountError> {
        let mut acc = Amount::zero(&self.currency);
        for _ in 0..n {
            acc = acc.checked_add(self)?;
        }
        Ok(acc)
    }

    /// Sum an iterator of amounts, starting from zero of `currency`.
    pub fn sum<'a, I>(currency: &str, amounts: I) -> Result<Amount, AmountError>
    where
        I: IntoIterator<Item = &'a Amount>,
    {
        let mut acc = Amount::zero(currency);
        for a in amounts {
            acc = acc.checked_add(a)?;
        }
        Ok(acc)
    }

    /// Compare two amounts of the same currency.
    pub fn cmp_value(&self, other: &Amount) -> Result<Ordering, AmountError> {
        self.check_currency(other)?;
        Ok((self.value, self.fraction).cmp(&(other.value, other.fraction)))
    }

    /// Parse the canonical string form, e.g. `EUR:10.5`.
    pub fn parse(s: &str) -> Result<Amount, AmountError> {
        let err = || AmountError::Parse(s.to_string());
        let (currency, rest) = s.split_once(':').ok_or_else(err)?;
        if currency.is_empty()
            || !currency
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(err());
        }
        let (value_str, frac_str) = match rest.split_once('.') {
            Some((v, f)) => (v, Some(f)),
            None => (rest, None),
        };
        if value_str.is_empty() || !value_str.chars().all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        let value: u64 = value_str.parse().map_err(|_| err())?;
        if value > MAX_VALUE {
            return Err(err());
        }
        let fraction = match frac_str {
            None => 0,
            Some(f) => {
                if f.is_empty()
                    || f.len() > FRACTIONAL_LENGTH
                    || !f.chars().all(|c| c.is_ascii_digit())
                {
                    return Err(err());
                }
                let digits: u64 = f.parse().map_err(|_| err())?;
                digits * 10u64.pow((FRACTIONAL_LENGTH - f.len()) as u32)
            }
        };
        Ok(Amount {
            currency: currency.to_uppercase(),
            value,
            fraction,
        })
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.currency, self.value)?;
        if self.fraction != 0 {
            let mut frac = self.fraction;
            let mut digits = String::new();
            while frac > 0 {
                digits.push(
                    char::from_digit((frac / (FRACTIONAL_BASE / 10)) as u32, 10).unwrap_or('0'),
                );
                frac = (frac * 10) % FRACTIONAL_BASE;
            }
            write!(f, ".{}", digits)?;
        }
        Ok(())
    }
}
