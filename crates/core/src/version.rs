//! Watermark versions.
//!
//! Versions are strings whose lexicographic order is their chronological
//! order. `Version::from_u64` produces the replication feed's encoding: a
//! single base-36 digit holding the length of the remaining base-36 digits,
//! followed by those digits, so that shorter numbers always sort first.

use core::fmt;
use serde::Serialize;

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A monotonically increasing watermark.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    /// Wraps an already-encoded version string.
    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    /// Encodes a counter so that string order matches numeric order.
    pub fn from_u64(n: u64) -> Self {
        let mut digits = Vec::new();
        let mut rest = n;
        loop {
            digits.push(DIGITS[(rest % 36) as usize]);
            rest /= 36;
            if rest == 0 {
                break;
            }
        }
        digits.reverse();
        // At most 13 base-36 digits for a u64, so the length prefix is one digit.
        let mut out = String::with_capacity(digits.len() + 1);
        out.push(DIGITS[digits.len() - 1] as char);
        out.extend(digits.iter().map(|&d| d as char));
        Self(out)
    }

    /// Decodes a version produced by `from_u64`.
    pub fn to_u64(&self) -> Option<u64> {
        let bytes = self.0.as_bytes();
        let (&len, digits) = bytes.split_first()?;
        let len = digit_value(len)? as usize + 1;
        if digits.len() != len {
            return None;
        }
        digits.iter().try_fold(0u64, |acc, &d| {
            acc.checked_mul(36)?.checked_add(digit_value(d)? as u64)
        })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn digit_value(d: u8) -> Option<u8> {
    match d {
        b'0'..=b'9' => Some(d - b'0'),
        b'a'..=b'z' => Some(d - b'a' + 10),
        _ => None,
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}
