use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::ProvisionError;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Convert a disk size string (`"40G"`, `"512m"`) into bytes.
///
/// Only `<digits><g|G|m|M>` is accepted; `G` is 1024³ and `M` is 1024².
pub fn disk_size_to_bytes(s: &str) -> Result<u64, ProvisionError> {
    let invalid = || ProvisionError::Validation {
        message: format!("invalid disk size '{s}' (expected a number followed by G or M)"),
    };

    let Some(suffix) = s.chars().last() else {
        return Err(invalid());
    };
    let digits = &s[..s.len() - suffix.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let multiplier = match suffix {
        'g' | 'G' => GIB,
        'm' | 'M' => MIB,
        _ => return Err(invalid()),
    };

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(|| ProvisionError::Validation {
        message: format!("disk size overflows: '{s}'"),
    })
}

/// Parse a duration string such as `"10s"`, `"1m30s"`, `"1.5h"` or `"250ms"`.
///
/// A bare `"0"` is accepted. Units: `ns`, `us`, `ms`, `s`, `m`, `h`.
pub fn parse_duration(s: &str) -> Result<Duration, ProvisionError> {
    let invalid = |why: &str| ProvisionError::Validation {
        message: format!("invalid duration '{s}': {why}"),
    };

    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid("empty"));
    }

    let mut total_nanos: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
        let (whole, frac) = match rest[..num_len].split_once('.') {
            Some((w, f)) => (w, f),
            None => (&rest[..num_len], ""),
        };
        if (whole.is_empty() && frac.is_empty()) || frac.contains('.') {
            return Err(invalid("expected a number"));
        }
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos: u128 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "\u{b5}s" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            other => return Err(invalid(&format!("unknown unit '{other}'"))),
        };
        rest = &rest[unit_len..];

        let overflow = || invalid("out of range");
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| overflow())?
        };
        let mut nanos = whole.checked_mul(unit_nanos).ok_or_else(overflow)?;
        let mut scale = unit_nanos;
        for digit in frac.bytes() {
            scale /= 10;
            nanos += u128::from(digit - b'0') * scale;
        }
        total_nanos = total_nanos.checked_add(nanos).ok_or_else(overflow)?;
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000).map_err(|_| invalid("out of range"))?;
    Ok(Duration::new(secs, (total_nanos % 1_000_000_000) as u32))
}

/// Source of random name fragments (VM names, rule names, temp dirs).
pub trait NameSource {
    /// Return `len` random ASCII alphanumeric characters.
    fn random_seq(&mut self, len: usize) -> String;
}

/// [`NameSource`] backed by a seedable RNG.
pub struct RandomNames {
    rng: StdRng,
}

impl RandomNames {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomNames {
    fn default() -> Self {
        Self::new()
    }
}

impl NameSource for RandomNames {
    fn random_seq(&mut self, len: usize) -> String {
        (&mut self.rng)
            .sample_iter(Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }
}

/// Always hands out the same fragment.
#[cfg(test)]
pub struct FixedNames(pub &'static str);

#[cfg(test)]
impl NameSource for FixedNames {
    fn random_seq(&mut self, len: usize) -> String {
        self.0.chars().cycle().take(len).collect()
    }
}
