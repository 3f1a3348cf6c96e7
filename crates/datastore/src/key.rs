//! Keys and the numeric id helpers shared by both backends.
//!
//! A file-backed key name doubles as the file name. Ids below 2^32 render as
//! a single decimal, larger ids as `<high32>.<low32>` so that each half can be
//! matched as its own key part.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of keys fetched or deleted in one go.
pub const MAX_KEYS: usize = 500;
/// Largest encoded entity the cloud backend accepts (1MB).
pub const MAX_BLOB: usize = 1_000_000;

/// Start of the AusOcean epoch, 2017-01-01 00:00:00 UTC.
pub const EPOCH_START: i64 = 1_483_228_800;
/// End of the epoch.
pub const EPOCH_END: i64 = i64::MAX;
/// Bits reserved below the timestamp for the sub-time disambiguator.
pub const SUB_TIME_BITS: u32 = 3;

const LOW32: u64 = 0xffff_ffff;

/// Address of a stored record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub kind: String,
    /// Numeric id, 0 when the key is name-only or incomplete.
    pub id: i64,
    /// Name; populated for ID keys too.
    pub name: String,
}

impl Key {
    /// ID key with its name rendered per the file naming rule.
    pub fn with_id(kind: impl Into<String>, id: i64) -> Self {
        Self {
            kind: kind.into(),
            id,
            name: id_file_name(id),
        }
    }

    pub fn with_name(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: 0,
            name: name.into(),
        }
    }

    /// Key without an identifier; resolved on a successful write.
    pub fn incomplete(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: 0,
            name: String::new(),
        }
    }

    /// Key recovered from a file name, picking up a numeric id when the name
    /// is one or two dot-separated unsigned integers.
    pub fn from_file_name(kind: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: kind.into(),
            id: extract_id(&name),
            name,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        self.id == 0 && self.name.is_empty()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_incomplete() {
            write!(f, "{}/<incomplete>", self.kind)
        } else if self.name.is_empty() {
            write!(f, "{}/{}", self.kind, self.id)
        } else {
            write!(f, "{}/{}", self.kind, self.name)
        }
    }
}

/// Renders an id as a file name: one decimal below 2^32, else `high.low`.
pub fn id_file_name(id: i64) -> String {
    let id = id as u64;
    if id <= LOW32 {
        id.to_string()
    } else {
        format!("{}.{}", id >> 32, id & LOW32)
    }
}

/// Recovers an id from a file name, returning 0 for non-numeric names.
pub fn extract_id(name: &str) -> i64 {
    match name.split_once('.') {
        None => name.parse::<u64>().map(|n| n as i64).unwrap_or(0),
        Some((msb, lsb)) => match (msb.parse::<u64>(), lsb.parse::<u64>()) {
            (Ok(msb), Ok(lsb)) => ((msb << 32) | (lsb & LOW32)) as i64,
            _ => 0,
        },
    }
}

/// Packs an id, a Unix timestamp and a sub-time into one key id:
/// the low 32 bits of `id` in the high word, then the timestamp relative to
/// [`EPOCH_START`] (29 bits), then `st` ([`SUB_TIME_BITS`] bits).
///
/// Timestamps before the epoch are clamped to the epoch start.
pub fn id_key(id: i64, ts: i64, st: i64) -> i64 {
    let ts = ts.saturating_sub(EPOCH_START).max(0);
    (id << 32) | (ts << SUB_TIME_BITS) | (st & sub_time_mask())
}

/// Inverse of [`id_key`], returning `(id, timestamp, sub_time)`.
pub fn split_id_key(id: i64) -> (i64, i64, i64) {
    (
        ((id as u64) >> 32) as i64,
        ((id & LOW32 as i64) >> SUB_TIME_BITS) + EPOCH_START,
        id & sub_time_mask(),
    )
}

fn sub_time_mask() -> i64 {
    (1 << SUB_TIME_BITS) - 1
}
