//! Offset codec and position types.

use std::cmp::Ordering;
use std::fmt;

/// Canonical start-of-stream sentinel.
///
/// Byte-compares below every encoded token (`'-'` sorts before `'0'`), so
/// plain lexicographic comparison of wire offsets stays correct.
pub const START_SENTINEL: &str = "-1";

/// A concrete stream position: `(segment, position)`.
///
/// Tokens render as two 16-digit zero-padded decimal fields joined by `_`,
/// e.g. `0000000000000000_0000000000000003`. Fixed width makes lexicographic
/// byte order agree with numeric order, which is what makes storage range
/// scans return messages in append order.
///
/// The segment field is reserved for future truncation; all offsets are
/// currently assigned in segment 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OffsetToken {
    pub segment: u64,
    pub position: u64,
}

const FIELD_WIDTH: usize = 16;

impl OffsetToken {
    /// The offset assigned to the first message of a stream.
    pub fn first() -> Self {
        OffsetToken {
            segment: 0,
            position: 1,
        }
    }

    /// The offset that follows this one.
    pub fn successor(&self) -> Self {
        OffsetToken {
            segment: self.segment,
            position: self.position + 1,
        }
    }

    /// Encode as a sortable wire token.
    pub fn encode(&self) -> String {
        format!(
            "{:0width$}_{:0width$}",
            self.segment,
            self.position,
            width = FIELD_WIDTH
        )
    }

    /// Decode a wire token. Returns `None` for the sentinel or malformed input.
    pub fn decode(token: &str) -> Option<Self> {
        let (seg, pos) = token.split_once('_')?;
        if seg.len() != FIELD_WIDTH || pos.len() != FIELD_WIDTH {
            return None;
        }
        if !seg.bytes().all(|b| b.is_ascii_digit()) || !pos.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(OffsetToken {
            segment: seg.parse().ok()?,
            position: pos.parse().ok()?,
        })
    }
}

impl fmt::Display for OffsetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Compare two wire offsets, treating the `-1` sentinel as less than any
/// real token. Agrees with lexicographic byte order of the encoded form.
pub fn compare(a: &str, b: &str) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}

/// Stream position specification as it appears in requests.
///
/// Offsets are:
/// - Opaque: clients do not interpret offset structure
/// - Lexicographically sortable: compare offsets to determine ordering
/// - Persistent: valid for the stream's lifetime
/// - Unique: each position has exactly one offset
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Offset {
    /// Start from the beginning of the stream (sentinel "-1")
    Beginning,
    /// Start from the current tail (only future data, sentinel "now")
    Now,
    /// Start after a specific offset token
    At(String),
}

impl Offset {
    /// Parse from protocol string
    pub fn parse(s: &str) -> Self {
        match s {
            "-1" => Offset::Beginning,
            "now" => Offset::Now,
            "" => Offset::Beginning,
            other => Offset::At(other.to_string()),
        }
    }

    /// The wire form, as echoed in `Stream-Next-Offset`.
    pub fn as_str(&self) -> &str {
        match self {
            Offset::Beginning => START_SENTINEL,
            Offset::Now => "now",
            Offset::At(s) => s.as_str(),
        }
    }

    /// Check if this is the beginning sentinel
    pub fn is_beginning(&self) -> bool {
        matches!(self, Offset::Beginning)
    }

    /// The concrete token, if this is a positioned offset.
    pub fn token(&self) -> Option<OffsetToken> {
        match self {
            Offset::At(s) => OffsetToken::decode(s),
            _ => None,
        }
    }
}

impl Default for Offset {
    fn default() -> Self {
        Offset::Beginning
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for Offset {
    fn from(s: &str) -> Self {
        Offset::parse(s)
    }
}
