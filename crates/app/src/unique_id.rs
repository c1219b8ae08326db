//! Short identifiers for workspace and resource names.
//!
//! A counter (usually the current UTC second) is written in base 62 over
//! `0-9A-Za-z` and left-padded with `'0'` to [`MIN_LEN`] characters. Larger
//! counters simply produce longer strings.

use chrono::Utc;
use thiserror::Error;

pub const ALPHABET: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
pub const MIN_LEN: usize = 6;

const BASE: u64 = ALPHABET.len() as u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UniqueIdError {
    #[error("counter must be non-negative, got {0}")]
    Negative(i64),
    #[error("cannot decode an empty identifier")]
    Empty,
    #[error("symbol {symbol:?} at position {position} is not in the base-62 alphabet")]
    InvalidSymbol { symbol: char, position: usize },
    #[error("identifier {0:?} does not fit in 64 bits")]
    Overflow(String),
}

/// Encode `n` in base 62, most significant symbol first, padded to [`MIN_LEN`].
pub fn encode(mut n: u64) -> String {
    let mut digits = Vec::with_capacity(11);
    while n > 0 {
        digits.push(ALPHABET[(n % BASE) as usize]);
        n /= BASE;
    }
    while digits.len() < MIN_LEN {
        digits.push(ALPHABET[0]);
    }
    digits.iter().rev().map(|&b| b as char).collect()
}

/// Signed entry point for clock values. Negative counters are rejected rather
/// than collapsed onto the all-zero identifier.
pub fn encode_signed(n: i64) -> Result<String, UniqueIdError> {
    let n = u64::try_from(n).map_err(|_| UniqueIdError::Negative(n))?;
    Ok(encode(n))
}

/// Inverse of [`encode`]. Leading padding is harmless since `'0'` has value zero.
pub fn decode(id: &str) -> Result<u64, UniqueIdError> {
    if id.is_empty() {
        return Err(UniqueIdError::Empty);
    }
    id.chars().enumerate().try_fold(0u64, |acc, (position, symbol)| {
        let digit = symbol_value(symbol).ok_or(UniqueIdError::InvalidSymbol { symbol, position })?;
        acc.checked_mul(BASE)
            .and_then(|v| v.checked_add(digit))
            .ok_or_else(|| UniqueIdError::Overflow(id.to_string()))
    })
}

/// Identifier for the current UTC second, lowercased for use in resource names.
pub fn from_clock() -> Result<String, UniqueIdError> {
    encode_signed(Utc::now().timestamp()).map(|id| id.to_ascii_lowercase())
}

fn symbol_value(symbol: char) -> Option<u64> {
    let value = match symbol {
        '0'..='9' => symbol as u32 - '0' as u32,
        'A'..='Z' => symbol as u32 - 'A' as u32 + 10,
        'a'..='z' => symbol as u32 - 'a' as u32 + 36,
        _ => return None,
    };
    Some(u64::from(value))
}
