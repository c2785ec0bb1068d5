//! Time-derived, strictly increasing packet identifiers.
//!
//! Rendered as `YYYY-MM-DD_HHMMSS` (UTC) with an optional `-NNN` sequence
//! suffix for packets allocated within the same second. Ordering compares
//! `(stamp, sequence)` and never the raw string.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const STAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";
const STAMP_LEN: usize = 17;
/// Largest sequence suffix that still renders as three digits.
pub const MAX_SEQUENCE: u32 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId {
    stamp: NaiveDateTime,
    sequence: u32,
}

/// Allocate the identifier following `newest`.
///
/// Uses the current second when it is later than the newest stamp; otherwise
/// stays on the newest stamp and bumps the sequence, so identifiers keep
/// increasing under sub-second reinvocation and backwards clock steps.
pub fn next_packet_id(now: DateTime<Utc>, newest: Option<&PacketId>) -> Result<PacketId> {
    let stamp = now.naive_utc().trunc_subsecs(0);
    match newest {
        Some(last) if last.stamp >= stamp => {
            let sequence = last.sequence + 1;
            if sequence > MAX_SEQUENCE {
                let stamp = last.stamp.format(STAMP_FORMAT);
                bail!("packet id sequence exhausted for {stamp}");
            }
            Ok(PacketId {
                stamp: last.stamp,
                sequence,
            })
        }
        _ => Ok(PacketId { stamp, sequence: 0 }),
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stamp.format(STAMP_FORMAT))?;
        if self.sequence > 0 {
            write!(f, "-{:03}", self.sequence)?;
        }
        Ok(())
    }
}

impl FromStr for PacketId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() < STAMP_LEN || !s.is_char_boundary(STAMP_LEN) {
            return Err(anyhow!("invalid packet id '{s}'"));
        }
        let (stamp_raw, rest) = s.split_at(STAMP_LEN);
        let stamp = NaiveDateTime::parse_from_str(stamp_raw, STAMP_FORMAT)
            .map_err(|err| anyhow!("invalid packet id '{s}': {err}"))?;
        let sequence = match rest.strip_prefix('-') {
            None if rest.is_empty() => 0,
            Some(digits) if digits.len() == 3 && digits.bytes().all(|b| b.is_ascii_digit()) => {
                let n: u32 = digits
                    .parse()
                    .map_err(|err| anyhow!("invalid packet id '{s}': {err}"))?;
                if n == 0 {
                    return Err(anyhow!("invalid packet id '{s}': sequence 000 is implicit"));
                }
                n
            }
            _ => return Err(anyhow!("invalid packet id '{s}'")),
        };
        Ok(Self { stamp, sequence })
    }
}

impl Serialize for PacketId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PacketId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
