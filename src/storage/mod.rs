//! Storage backend abstraction.
//!
//! The engine only needs an ordered byte-map: point gets, atomic write
//! batches, range scans in key order, and prefix deletes. Atomicity is
//! required within a single batch only, never across streams.

mod memory;

#[cfg(feature = "fjall")]
mod fjall;

pub use memory::MemoryBackend;

#[cfg(feature = "fjall")]
pub use self::fjall::FjallBackend;

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;

use crate::offset::OffsetToken;

/// Error from the storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("corrupt record at {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A set of writes committed atomically.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<WriteOp>,
}

#[derive(Debug)]
pub(crate) enum WriteOp {
    Put { key: Vec<u8>, value: Bytes },
    Delete { key: Vec<u8> },
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: impl Into<Bytes>) {
        self.ops.push(WriteOp::Put {
            key,
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { key });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered byte-map with atomic batches.
///
/// Implementations must scan keys in ascending byte order; the offset
/// codec's sortability is what turns that into append order.
pub trait StorageBackend: Send + Sync + 'static {
    /// Point lookup.
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError>;

    /// Commit a batch atomically: either every op lands or none do.
    fn apply(&self, batch: WriteBatch) -> Result<(), StorageError>;

    /// Scan up to `limit` entries with keys starting with `prefix`,
    /// strictly after `after` (when given), in ascending key order.
    fn scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Bytes)>, StorageError>;

    /// Remove every key starting with `prefix`.
    fn delete_prefix(&self, prefix: &[u8]) -> Result<(), StorageError>;
}

// Percent-encode path separators and the escape character itself so a stream
// path can never collide with the layout's own `/` delimiters ("/a" vs
// "/a/messages" style aliasing).
const KEY_SEGMENT: &AsciiSet = &CONTROLS.add(b'/').add(b'%');

fn encode_segment(raw: &str) -> String {
    utf8_percent_encode(raw, KEY_SEGMENT).to_string()
}

/// Key prefix owned by one stream.
pub fn stream_prefix(path: &str) -> Vec<u8> {
    format!("streams/{}/", encode_segment(path)).into_bytes()
}

pub fn meta_key(path: &str) -> Vec<u8> {
    let mut k = stream_prefix(path);
    k.extend_from_slice(b"meta");
    k
}

pub fn messages_prefix(path: &str) -> Vec<u8> {
    let mut k = stream_prefix(path);
    k.extend_from_slice(b"messages/");
    k
}

pub fn message_key(path: &str, offset: OffsetToken) -> Vec<u8> {
    let mut k = messages_prefix(path);
    k.extend_from_slice(offset.encode().as_bytes());
    k
}

pub fn producers_prefix(path: &str) -> Vec<u8> {
    let mut k = stream_prefix(path);
    k.extend_from_slice(b"producers/");
    k
}

pub fn producer_key(path: &str, producer_id: &str) -> Vec<u8> {
    let mut k = producers_prefix(path);
    k.extend_from_slice(encode_segment(producer_id).as_bytes());
    k
}

/// Prefix under which all webhook subscriptions live.
pub const SUBS_PREFIX: &[u8] = b"subs/";

pub fn sub_key(pattern: &str, name: &str) -> Vec<u8> {
    format!(
        "subs/{}/{}",
        encode_segment(pattern),
        encode_segment(name)
    )
    .into_bytes()
}

/// Offset token at the tail of a message key, for scan results.
pub fn offset_from_message_key(prefix_len: usize, key: &[u8]) -> Option<OffsetToken> {
    let tail = key.get(prefix_len..)?;
    OffsetToken::decode(std::str::from_utf8(tail).ok()?)
}
