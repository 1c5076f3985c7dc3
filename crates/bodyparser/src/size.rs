//! Byte sizes that can be written either as a plain number of bytes or as a
//! human readable string such as `"20mb"` or `"1.5 KB"`.
//!
//! A [`ByteSize`] is resolved to an absolute byte count as soon as it is parsed,
//! and formats back using the largest unit that keeps the value above one, with
//! at most two decimals (`1048576` formats as `1MB`, `2000` as `1.95KB`).

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::BodyParserError;

const UNITS: [(&str, u64); 6] =
    [("pb", 1 << 50), ("tb", 1 << 40), ("gb", 1 << 30), ("mb", 1 << 20), ("kb", 1 << 10), ("b", 1)];

/// An absolute number of bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "ByteSizeRepr")]
pub struct ByteSize(u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum ByteSizeRepr {
    Number(u64),
    Text(String),
}

impl TryFrom<ByteSizeRepr> for ByteSize {
    type Error = BodyParserError;

    fn try_from(repr: ByteSizeRepr) -> Result<Self, Self::Error> {
        match repr {
            ByteSizeRepr::Number(bytes) => Ok(ByteSize(bytes)),
            ByteSizeRepr::Text(text) => text.parse(),
        }
    }
}

impl ByteSize {
    #[inline]
    pub const fn b(bytes: u64) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn kb(kb: u64) -> Self {
        Self(kb << 10)
    }

    #[inline]
    pub const fn mb(mb: u64) -> Self {
        Self(mb << 20)
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ByteSize {
    fn from(bytes: u64) -> Self {
        Self(bytes)
    }
}

impl FromStr for ByteSize {
    type Err = BodyParserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split_at = trimmed.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split_at);

        let number: f64 = number.parse().map_err(|_parse_error| BodyParserError::invalid_size(s))?;
        let unit = unit.trim().to_ascii_lowercase();
        let multiplier = if unit.is_empty() {
            1
        } else {
            UNITS
                .iter()
                .find(|(name, _)| *name == unit)
                .map(|(_, multiplier)| *multiplier)
                .ok_or_else(|| BodyParserError::invalid_size(s))?
        };

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss,
            reason = "sizes are far below 2^52"
        )]
        let bytes = (number * multiplier as f64).floor() as u64;
        Ok(ByteSize(bytes))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (unit, multiplier) =
            UNITS.iter().find(|(_, multiplier)| self.0 >= *multiplier).copied().unwrap_or(("b", 1));

        #[allow(clippy::cast_precision_loss, reason = "only used for display")]
        let value = self.0 as f64 / multiplier as f64;
        let value = format!("{value:.2}");
        let value = value.trim_end_matches('0').trim_end_matches('.');
        write!(f, "{value}{}", unit.to_ascii_uppercase())
    }
}
