//! Per-stream log: the append path and historical reads.
//!
//! Single-writer discipline: at most one append is in flight per stream;
//! concurrent appenders queue FIFO on the writer lock. That lock is what
//! makes offset assignment monotonic and fence checks race-free. Readers
//! never take it - they work from storage scans and a snapshotted head.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::EngineError;
use crate::fence::{self, FenceEntry, FenceOutcome, ProducerClaims};
use crate::notify::{NotifyBus, StreamSignal};
use crate::offset::{OffsetToken, START_SENTINEL};
use crate::storage::{
    self, message_key, messages_prefix, meta_key, producer_key, StorageBackend, WriteBatch,
};

/// Persisted stream metadata (`streams/<path>/meta`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMeta {
    pub content_type: String,
    /// Unix millis.
    pub created_at: i64,
    /// Encoded token of the newest message; absent while the stream is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_offset: Option<String>,
    pub count: u64,
    /// Per-stream salt for the producer duplicate-detection hash.
    pub hash_salt: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    /// RFC 3339 expiry, mutually exclusive with `ttl_seconds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl StreamMeta {
    /// Absolute expiry instant, if the stream has one.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        if let Some(ttl) = self.ttl_seconds {
            let created = DateTime::<Utc>::from_timestamp_millis(self.created_at)?;
            return created.checked_add_signed(chrono::Duration::seconds(ttl as i64));
        }
        if let Some(at) = &self.expires_at {
            return DateTime::parse_from_rfc3339(at)
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
        }
        None
    }
}

/// Where a historical read starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadFrom {
    /// From the first message (`offset=-1`).
    Start,
    /// From the current head (`offset=now`): only future data.
    Head,
    /// Strictly after this committed offset.
    After(OffsetToken),
}

/// One page of a historical read.
#[derive(Debug)]
pub struct ReadPage {
    pub messages: Vec<(OffsetToken, Bytes)>,
    /// Offset token the client passes back next ("-1" when nothing has ever
    /// been read and the stream is empty).
    pub next_offset: String,
    /// Whether the scan reached the stream head.
    pub up_to_date: bool,
}

/// Result of a successful append.
#[derive(Debug)]
pub struct AppendOutcome {
    /// Offset of the last message involved (newly written or replayed).
    pub last_offset: String,
    /// True when the fence table short-circuited an identical replay.
    pub duplicate: bool,
    /// Newly written messages, in order, for webhook fan-out.
    pub appended: Vec<(OffsetToken, Bytes)>,
}

#[derive(Debug)]
struct LogState {
    meta: StreamMeta,
    head: Option<OffsetToken>,
    fences: HashMap<String, FenceEntry>,
}

/// Owns all state for one stream.
pub struct StreamLog {
    path: String,
    backend: Arc<dyn StorageBackend>,
    config: Arc<ServerConfig>,
    state: RwLock<LogState>,
    write_lock: Mutex<()>,
    bus: NotifyBus,
    /// Set on delete so a racing append cannot resurrect storage keys and
    /// stale readers fail over to a fresh lookup.
    deleted: AtomicBool,
}

impl std::fmt::Debug for StreamLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLog")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl StreamLog {
    pub fn new(
        path: String,
        meta: StreamMeta,
        fences: HashMap<String, FenceEntry>,
        backend: Arc<dyn StorageBackend>,
        config: Arc<ServerConfig>,
    ) -> Arc<Self> {
        let head = meta.head_offset.as_deref().and_then(OffsetToken::decode);
        Arc::new(Self {
            path,
            backend,
            config,
            state: RwLock::new(LogState {
                meta,
                head,
                fences,
            }),
            write_lock: Mutex::new(()),
            bus: NotifyBus::new(),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn meta(&self) -> StreamMeta {
        self.state.read().meta.clone()
    }

    pub fn content_type(&self) -> String {
        self.state.read().meta.content_type.clone()
    }

    pub fn is_json(&self) -> bool {
        content_type_is_json(&self.state.read().meta.content_type)
    }

    pub fn count(&self) -> u64 {
        self.state.read().meta.count
    }

    pub fn head(&self) -> Option<OffsetToken> {
        self.state.read().head
    }

    /// Wire form of the head: the token of the newest message, or `-1`.
    pub fn head_token(&self) -> String {
        match self.state.read().head {
            Some(t) => t.encode(),
            None => START_SENTINEL.to_string(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state
            .read()
            .meta
            .expiry()
            .map(|at| now >= at)
            .unwrap_or(false)
    }

    /// Salted payload hash for fence checks.
    pub fn hash_payload(&self, payload: &[u8]) -> u64 {
        fence::payload_hash(self.state.read().meta.hash_salt, payload)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamSignal> {
        self.bus.subscribe()
    }

    /// Mark the stream deleted and signal outstanding readers.
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
        self.bus.publish(StreamSignal::Deleted);
    }

    /// Append a batch of payloads as consecutive messages.
    ///
    /// All-or-nothing: the message records, meta update, and fence update
    /// commit in one storage batch. The in-memory head only advances after
    /// the commit succeeds, so a failed commit rolls back cleanly.
    pub async fn append(
        &self,
        payloads: Vec<Bytes>,
        producer: Option<(ProducerClaims, u64)>,
        if_match: Option<&str>,
    ) -> Result<AppendOutcome, EngineError> {
        if payloads.is_empty() || payloads.iter().any(|p| p.is_empty()) {
            return Err(EngineError::EmptyAppend);
        }
        for p in &payloads {
            if p.len() > self.config.max_message_bytes {
                return Err(EngineError::bad_request(format!(
                    "message of {} bytes exceeds limit of {}",
                    p.len(),
                    self.config.max_message_bytes
                )));
            }
        }

        let _writer = self.write_lock.lock().await;

        if self.deleted.load(Ordering::Acquire) {
            return Err(EngineError::NotFound {
                path: self.path.clone(),
            });
        }

        let (head, fence_entry) = {
            let state = self.state.read();
            let entry = producer
                .as_ref()
                .and_then(|(claims, _)| state.fences.get(&claims.id).cloned());
            (state.head, entry)
        };

        if let Some(tag) = if_match {
            let head_token = match head {
                Some(t) => t.encode(),
                None => START_SENTINEL.to_string(),
            };
            if trim_etag(tag) != head_token {
                return Err(EngineError::PreconditionFailed { head: head_token });
            }
        }

        let now_ms = Utc::now().timestamp_millis();

        if let Some((claims, hash)) = &producer {
            match fence::check(
                fence_entry.as_ref(),
                claims,
                *hash,
                now_ms,
                self.config.producer_state_ttl,
            )? {
                FenceOutcome::Duplicate { offset } => {
                    debug!(path = %self.path, seq = claims.seq, "duplicate append replayed");
                    return Ok(AppendOutcome {
                        last_offset: offset,
                        duplicate: true,
                        appended: Vec::new(),
                    });
                }
                FenceOutcome::Accept => {}
            }
        }

        // Assign consecutive offsets after the head.
        let mut next = match head {
            Some(t) => t.successor(),
            None => OffsetToken::first(),
        };
        let mut appended = Vec::with_capacity(payloads.len());
        let mut batch = WriteBatch::new();
        for payload in payloads {
            batch.put(message_key(&self.path, next), payload.clone());
            appended.push((next, payload));
            next = next.successor();
        }
        let last = appended.last().map(|(t, _)| *t).expect("non-empty batch");

        let mut new_meta = {
            let state = self.state.read();
            state.meta.clone()
        };
        new_meta.head_offset = Some(last.encode());
        new_meta.count += appended.len() as u64;
        batch.put(
            meta_key(&self.path),
            serde_json::to_vec(&new_meta)
                .map_err(|e| crate::storage::StorageError::Backend(e.to_string()))?,
        );

        let new_fence = producer.as_ref().map(|(claims, hash)| {
            let entry = FenceEntry {
                epoch: claims.epoch,
                last_seq: claims.seq,
                last_offset: last.encode(),
                last_hash: *hash,
                touched_at: now_ms,
            };
            (claims.id.clone(), entry)
        });
        if let Some((id, entry)) = &new_fence {
            batch.put(
                producer_key(&self.path, id),
                serde_json::to_vec(entry)
                    .map_err(|e| crate::storage::StorageError::Backend(e.to_string()))?,
            );
        }

        self.backend.apply(batch)?;

        {
            let mut state = self.state.write();
            state.head = Some(last);
            state.meta = new_meta;
            if let Some((id, entry)) = new_fence {
                state.fences.insert(id, entry);
            }
        }

        debug!(path = %self.path, offset = %last, n = appended.len(), "appended");
        self.bus.publish(StreamSignal::Appended(last));

        Ok(AppendOutcome {
            last_offset: last.encode(),
            duplicate: false,
            appended,
        })
    }

    /// Read one page of history starting after `from`.
    pub fn read_range(
        &self,
        from: &ReadFrom,
        limit: usize,
        max_bytes: usize,
    ) -> Result<ReadPage, EngineError> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(EngineError::NotFound {
                path: self.path.clone(),
            });
        }
        let head = self.state.read().head;

        if matches!(from, ReadFrom::Head) {
            return Ok(ReadPage {
                messages: Vec::new(),
                next_offset: self.head_token(),
                up_to_date: true,
            });
        }

        let prefix = messages_prefix(&self.path);
        let after = match from {
            ReadFrom::Start => None,
            ReadFrom::After(t) => Some(message_key(&self.path, *t)),
            ReadFrom::Head => unreachable!(),
        };

        let limit = limit.min(self.config.max_read_messages).max(1);
        let rows = self
            .backend
            .scan(&prefix, after.as_deref(), limit)?;

        let mut messages = Vec::with_capacity(rows.len());
        let mut bytes = 0usize;
        for (key, value) in rows {
            let offset = storage::offset_from_message_key(prefix.len(), &key).ok_or_else(|| {
                EngineError::Storage(crate::storage::StorageError::Corrupt {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    message: "unparseable message offset".to_string(),
                })
            })?;
            // Always make progress: the first message is included even when
            // it alone exceeds the byte budget.
            if !messages.is_empty() && bytes + value.len() > max_bytes {
                break;
            }
            bytes += value.len();
            messages.push((offset, value));
        }

        let last_returned = messages.last().map(|(t, _)| *t);
        let next_offset = match (last_returned, from) {
            (Some(t), _) => t.encode(),
            (None, ReadFrom::Start) => match head {
                // Nothing stored at all: echo the start sentinel.
                None => START_SENTINEL.to_string(),
                // Scanned past everything (shouldn't happen from Start
                // unless the stream is empty), fall back to head.
                Some(h) => h.encode(),
            },
            (None, ReadFrom::After(t)) => t.encode(),
            (None, ReadFrom::Head) => unreachable!(),
        };

        let up_to_date = match head {
            None => true,
            Some(h) => match last_returned {
                Some(t) => t >= h,
                None => match from {
                    ReadFrom::Start => false,
                    ReadFrom::After(t) => *t >= h,
                    ReadFrom::Head => true,
                },
            },
        };

        Ok(ReadPage {
            messages,
            next_offset,
            up_to_date,
        })
    }
}

/// Map a wire offset to a read position, rejecting malformed tokens.
pub fn read_from(offset: &crate::offset::Offset) -> Result<ReadFrom, EngineError> {
    match offset {
        crate::offset::Offset::Beginning => Ok(ReadFrom::Start),
        crate::offset::Offset::Now => Ok(ReadFrom::Head),
        crate::offset::Offset::At(s) => OffsetToken::decode(s)
            .map(ReadFrom::After)
            .ok_or_else(|| EngineError::bad_request(format!("invalid offset: {s}"))),
    }
}

pub fn content_type_is_json(content_type: &str) -> bool {
    normalize_content_type(content_type).starts_with("application/json")
}

pub fn content_type_is_text(content_type: &str) -> bool {
    normalize_content_type(content_type).starts_with("text/")
}

/// Case- and parameter-insensitive form used for config comparison.
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn trim_etag(tag: &str) -> &str {
    tag.trim().trim_matches('"')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn test_log() -> Arc<StreamLog> {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let config = Arc::new(ServerConfig::default());
        let meta = StreamMeta {
            content_type: "application/octet-stream".to_string(),
            created_at: Utc::now().timestamp_millis(),
            head_offset: None,
            count: 0,
            hash_salt: 7,
            ttl_seconds: None,
            expires_at: None,
        };
        StreamLog::new("/t".to_string(), meta, HashMap::new(), backend, config)
    }

    #[tokio::test]
    async fn offsets_strictly_increase() {
        let log = test_log();
        let a = log
            .append(vec![Bytes::from("one")], None, None)
            .await
            .unwrap();
        let b = log
            .append(vec![Bytes::from("two")], None, None)
            .await
            .unwrap();
        assert!(a.last_offset < b.last_offset);
        assert_eq!(log.count(), 2);
    }

    #[tokio::test]
    async fn bytes_replayed_exactly() {
        let log = test_log();
        let payload = Bytes::from_static(&[0x00, 0xFF, 0xE2, 0x80, 0xA8]);
        log.append(vec![payload.clone()], None, None).await.unwrap();

        let page = log.read_range(&ReadFrom::Start, 10, 1 << 20).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].1, payload);
        assert!(page.up_to_date);
    }

    #[tokio::test]
    async fn empty_append_rejected() {
        let log = test_log();
        let err = log.append(vec![], None, None).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyAppend));
        let err = log
            .append(vec![Bytes::new()], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyAppend));
    }

    #[tokio::test]
    async fn batch_lands_at_consecutive_offsets() {
        let log = test_log();
        let out = log
            .append(
                vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")],
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.appended.len(), 3);
        assert_eq!(out.appended[0].0.successor(), out.appended[1].0);
        assert_eq!(out.appended[1].0.successor(), out.appended[2].0);
        assert_eq!(out.last_offset, out.appended[2].0.encode());
    }

    #[tokio::test]
    async fn resume_reconstructs_without_gaps_or_duplicates() {
        let log = test_log();
        for i in 0..10 {
            log.append(vec![Bytes::from(format!("m{i}"))], None, None)
                .await
                .unwrap();
        }

        let mut collected = Vec::new();
        let mut from = ReadFrom::Start;
        loop {
            let page = log.read_range(&from, 3, 1 << 20).unwrap();
            for (_, data) in &page.messages {
                collected.push(data.clone());
            }
            if page.up_to_date {
                break;
            }
            from = ReadFrom::After(OffsetToken::decode(&page.next_offset).unwrap());
        }
        let expected: Vec<Bytes> = (0..10).map(|i| Bytes::from(format!("m{i}"))).collect();
        assert_eq!(collected, expected);
    }

    #[tokio::test]
    async fn producer_replay_returns_same_offset() {
        let log = test_log();
        let claims = ProducerClaims {
            id: "p".to_string(),
            epoch: 1,
            seq: 0,
        };
        let body = Bytes::from("A");
        let hash = log.hash_payload(&body);

        let first = log
            .append(vec![body.clone()], Some((claims.clone(), hash)), None)
            .await
            .unwrap();
        assert!(!first.duplicate);

        let replay = log
            .append(vec![body.clone()], Some((claims, hash)), None)
            .await
            .unwrap();
        assert!(replay.duplicate);
        assert_eq!(replay.last_offset, first.last_offset);
        assert_eq!(log.count(), 1);
    }

    #[tokio::test]
    async fn read_from_now_returns_only_future_position() {
        let log = test_log();
        log.append(vec![Bytes::from("old")], None, None)
            .await
            .unwrap();
        let page = log.read_range(&ReadFrom::Head, 10, 1 << 20).unwrap();
        assert!(page.messages.is_empty());
        assert!(page.up_to_date);
        assert_eq!(page.next_offset, log.head_token());
    }

    #[tokio::test]
    async fn if_match_mismatch_fails_precondition() {
        let log = test_log();
        log.append(vec![Bytes::from("x")], None, None).await.unwrap();
        let err = log
            .append(vec![Bytes::from("y")], None, Some("\"-1\""))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));

        let head = log.head_token();
        log.append(vec![Bytes::from("y")], None, Some(&head))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn byte_budget_bounds_pages_but_always_progresses() {
        let log = test_log();
        for _ in 0..3 {
            log.append(vec![Bytes::from(vec![7u8; 100])], None, None)
                .await
                .unwrap();
        }
        let page = log.read_range(&ReadFrom::Start, 10, 150).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(!page.up_to_date);

        let page = log.read_range(&ReadFrom::Start, 10, 10).unwrap();
        assert_eq!(page.messages.len(), 1, "must include at least one message");
    }
}
