//! Key and value generation.
//!
//! Keys and values are zero-padded decimal record numbers, so the same record
//! number always produces the same bytes. A size of `n` bytes holds record
//! numbers up to `10^(n-1) - 1`.

use std::fmt;

use bytes::{BufMut, BytesMut};
use rand::Rng;

use crate::error::ConfigError;

/// Smallest key or value size that holds a record number.
pub const MIN_KV_SIZE: usize = 2;

/// Fill pattern for the value bytes after the record number.
const VALUE_FILL: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Largest record number a key or value of `size` bytes can hold.
fn max_for_size(size: usize) -> u64 {
    let digits = u32::try_from(size.saturating_sub(1)).unwrap_or(u32::MAX);
    10u64
        .checked_pow(digits)
        .map_or(u64::MAX, |p| p - 1)
        .max(1)
}

/// Writes `n` as zero-padded decimal filling exactly `width` bytes.
fn put_zero_filled(buf: &mut BytesMut, mut n: u64, width: usize) {
    // u64::MAX has 20 decimal digits.
    let mut digits = [0u8; 20];
    let mut start = digits.len();
    loop {
        start -= 1;
        #[allow(clippy::cast_possible_truncation)] // a single decimal digit
        let digit = (n % 10) as u8;
        digits[start] = b'0' + digit;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    let digits = &digits[start..];
    buf.put_bytes(b'0', width.saturating_sub(digits.len()));
    buf.put_slice(&digits[digits.len().saturating_sub(width)..]);
}

/// Skew of a Pareto-style key distribution.
///
/// `mass_fraction` of the accesses land in the lowest `hot_fraction` of the
/// record numbers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParetoSkew {
    /// Fraction of the record range that is hot, in (0, 1].
    pub hot_fraction: f64,
    /// Fraction of accesses that go to the hot range, in [0, 1].
    pub mass_fraction: f64,
}

impl ParetoSkew {
    /// Creates a validated skew.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSkew`] if a fraction is out of range.
    pub fn new(hot_fraction: f64, mass_fraction: f64) -> Result<Self, ConfigError> {
        let hot_ok = hot_fraction > 0.0 && hot_fraction <= 1.0;
        let mass_ok = (0.0..=1.0).contains(&mass_fraction);
        if !hot_ok || !mass_ok {
            return Err(ConfigError::InvalidSkew {
                hot_fraction: hot_fraction.to_string(),
                mass_fraction: mass_fraction.to_string(),
            });
        }
        Ok(Self {
            hot_fraction,
            mass_fraction,
        })
    }

    /// Returns the number of hot record numbers out of `max`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn hot_count(&self, max: u64) -> u64 {
        ((max as f64 * self.hot_fraction).ceil() as u64).clamp(1, max.max(1))
    }

    fn sample<R: Rng>(&self, max: u64, rng: &mut R) -> u64 {
        let hot = self.hot_count(max);
        if hot >= max || rng.gen::<f64>() < self.mass_fraction {
            rng.gen_range(1..=hot)
        } else {
            rng.gen_range(hot + 1..=max)
        }
    }
}

impl Default for ParetoSkew {
    fn default() -> Self {
        Self {
            hot_fraction: 0.2,
            mass_fraction: 0.8,
        }
    }
}

/// How existing records are picked for reads, updates and removes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum KeyType {
    /// Sequential record numbers for inserts.
    #[default]
    Append,
    /// Skewed toward the lowest record numbers.
    Pareto(ParetoSkew),
    /// Uniform over all existing record numbers.
    Uniform,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Append => write!(f, "append"),
            Self::Pareto(skew) => write!(
                f,
                "pareto(hot={}, mass={})",
                skew.hot_fraction, skew.mass_fraction
            ),
            Self::Uniform => write!(f, "uniform"),
        }
    }
}

/// Key generator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Key {
    key_type: KeyType,
    size: usize,
    max: u64,
}

impl Key {
    /// Creates a key generator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::KeySizeTooSmall`] if `size` cannot hold a
    /// record number.
    pub fn new(key_type: KeyType, size: usize) -> Result<Self, ConfigError> {
        if size < MIN_KV_SIZE {
            return Err(ConfigError::KeySizeTooSmall {
                size,
                min: MIN_KV_SIZE,
            });
        }
        Ok(Self {
            key_type,
            size,
            max: max_for_size(size),
        })
    }

    /// Returns the key type.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Returns the key size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the largest record number this key can encode.
    #[must_use]
    pub const fn max(&self) -> u64 {
        self.max
    }

    /// Encodes a record number into `buf`, replacing its contents.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RecnoOutOfRange`] if `recno` exceeds [`Key::max`].
    pub fn encode(&self, recno: u64, buf: &mut BytesMut) -> Result<(), ConfigError> {
        if recno > self.max {
            return Err(ConfigError::RecnoOutOfRange {
                what: "key",
                recno,
                size: self.size,
            });
        }
        buf.clear();
        put_zero_filled(buf, recno, self.size);
        Ok(())
    }

    /// Picks an existing record number in `[1, current_max]`.
    ///
    /// Returns `None` when the table has no records yet.
    pub fn sample<R: Rng>(&self, current_max: u64, rng: &mut R) -> Option<u64> {
        if current_max == 0 {
            return None;
        }
        let recno = match self.key_type {
            KeyType::Append | KeyType::Uniform => rng.gen_range(1..=current_max),
            KeyType::Pareto(skew) => skew.sample(current_max, rng),
        };
        Some(recno)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key: type {}, size {}", self.key_type, self.size)
    }
}

/// Value generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    size: usize,
    max: u64,
}

impl Value {
    /// Creates a value generator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValueSizeTooSmall`] if `size` cannot hold a
    /// record number.
    pub fn new(size: usize) -> Result<Self, ConfigError> {
        if size < MIN_KV_SIZE {
            return Err(ConfigError::ValueSizeTooSmall {
                size,
                min: MIN_KV_SIZE,
            });
        }
        Ok(Self {
            size,
            max: max_for_size(size),
        })
    }

    /// Returns the value size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the largest record number this value can encode.
    #[must_use]
    pub const fn max(&self) -> u64 {
        self.max
    }

    /// Encodes the value for a record number into `buf`, replacing its contents.
    ///
    /// The record number fills the first `min(size, 20)` bytes; the rest is a
    /// fill pattern rotated by the record number.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RecnoOutOfRange`] if `recno` exceeds [`Value::max`].
    #[allow(clippy::cast_possible_truncation)] // modulo pattern length
    pub fn encode(&self, recno: u64, buf: &mut BytesMut) -> Result<(), ConfigError> {
        if recno > self.max {
            return Err(ConfigError::RecnoOutOfRange {
                what: "value",
                recno,
                size: self.size,
            });
        }
        buf.clear();
        let prefix = self.size.min(20);
        put_zero_filled(buf, recno, prefix);
        let rotate = (recno % VALUE_FILL.len() as u64) as usize;
        buf.extend(
            VALUE_FILL
                .iter()
                .cycle()
                .skip(rotate)
                .take(self.size - prefix),
        );
        Ok(())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value: size {}", self.size)
    }
}
