//! Stream registry: create, lookup, delete.
//!
//! The in-memory map is authoritative for hot paths; the storage backend is
//! authoritative on cold start. Lookups that miss the cache hydrate from the
//! persisted meta (and fence entries), so a restarted server serves the same
//! streams without a warm-up pass.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use percent_encoding::percent_decode_str;
use rand::Rng;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::EngineError;
use crate::fence::FenceEntry;
use crate::log::{normalize_content_type, StreamLog, StreamMeta};
use crate::storage::{
    meta_key, producers_prefix, stream_prefix, StorageBackend, WriteBatch,
};

/// Requested stream configuration (from `PUT`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfigReq {
    pub content_type: String,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<String>,
}

impl Default for StreamConfigReq {
    fn default() -> Self {
        Self {
            content_type: "application/octet-stream".to_string(),
            ttl_seconds: None,
            expires_at: None,
        }
    }
}

pub struct Registry {
    backend: Arc<dyn StorageBackend>,
    config: Arc<ServerConfig>,
    streams: RwLock<HashMap<String, Arc<StreamLog>>>,
}

impl Registry {
    pub fn new(backend: Arc<dyn StorageBackend>, config: Arc<ServerConfig>) -> Self {
        Self {
            backend,
            config,
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    /// Create a stream, idempotently.
    ///
    /// Returns `(log, true)` when the stream was created, `(log, false)` when
    /// it already existed with an equal config. A differing config is
    /// `ConflictExists`. Atomic with respect to concurrent creates of the
    /// same path: the registry lock is held across the meta write.
    pub fn create(
        &self,
        path: &str,
        req: StreamConfigReq,
    ) -> Result<(Arc<StreamLog>, bool), EngineError> {
        if req.ttl_seconds.is_some() && req.expires_at.is_some() {
            return Err(EngineError::bad_request(
                "cannot specify both Stream-TTL and Stream-Expires-At",
            ));
        }

        let mut streams = self.streams.write();

        let existing = match streams.get(path) {
            Some(log) => Some(log.clone()),
            None => self.hydrate(path)?,
        };

        if let Some(log) = existing {
            if log.is_expired(Utc::now()) {
                drop_stream(&*self.backend, &mut streams, path, &log)?;
            } else {
                let meta = log.meta();
                let same = normalize_content_type(&meta.content_type)
                    == normalize_content_type(&req.content_type)
                    && meta.ttl_seconds == req.ttl_seconds
                    && meta.expires_at == req.expires_at;
                if !same {
                    return Err(EngineError::ConflictExists);
                }
                streams.entry(path.to_string()).or_insert_with(|| log.clone());
                return Ok((log, false));
            }
        }

        let meta = StreamMeta {
            content_type: req.content_type,
            created_at: Utc::now().timestamp_millis(),
            head_offset: None,
            count: 0,
            hash_salt: rand::thread_rng().gen(),
            ttl_seconds: req.ttl_seconds,
            expires_at: req.expires_at,
        };
        let mut batch = WriteBatch::new();
        batch.put(
            meta_key(path),
            serde_json::to_vec(&meta)
                .map_err(|e| crate::storage::StorageError::Backend(e.to_string()))?,
        );
        self.backend.apply(batch)?;

        let log = StreamLog::new(
            path.to_string(),
            meta,
            HashMap::new(),
            self.backend.clone(),
            self.config.clone(),
        );
        streams.insert(path.to_string(), log.clone());
        info!(path = %path, "created stream");
        Ok((log, true))
    }

    /// Look up a stream, hydrating from storage on a cache miss. Expired
    /// streams are purged and reported as absent.
    pub fn lookup(&self, path: &str) -> Result<Option<Arc<StreamLog>>, EngineError> {
        let cached = self.streams.read().get(path).cloned();
        let log = match cached {
            Some(log) => Some(log),
            None => {
                let hydrated = self.hydrate(path)?;
                if let Some(log) = &hydrated {
                    self.streams
                        .write()
                        .entry(path.to_string())
                        .or_insert_with(|| log.clone());
                }
                hydrated
            }
        };

        match log {
            Some(log) if log.is_expired(Utc::now()) => {
                let mut streams = self.streams.write();
                drop_stream(&*self.backend, &mut streams, path, &log)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Delete a stream: storage prefix emptied, cache entry released,
    /// outstanding readers signalled.
    pub fn delete(&self, path: &str) -> Result<bool, EngineError> {
        let mut streams = self.streams.write();
        let known = match streams.get(path).cloned() {
            Some(log) => Some(log),
            None => self.hydrate(path)?,
        };
        match known {
            Some(log) => {
                drop_stream(&*self.backend, &mut streams, path, &log)?;
                info!(path = %path, "deleted stream");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rebuild a stream object from the persisted meta and fence entries.
    fn hydrate(&self, path: &str) -> Result<Option<Arc<StreamLog>>, EngineError> {
        let raw = match self.backend.get(&meta_key(path))? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let meta: StreamMeta = serde_json::from_slice(&raw).map_err(|e| {
            EngineError::Storage(crate::storage::StorageError::Corrupt {
                key: String::from_utf8_lossy(&meta_key(path)).into_owned(),
                message: e.to_string(),
            })
        })?;

        let prefix = producers_prefix(path);
        let mut fences = HashMap::new();
        let rows = self.backend.scan(&prefix, None, usize::MAX)?;
        for (key, value) in rows {
            let id_enc = &key[prefix.len()..];
            let id = percent_decode_str(std::str::from_utf8(id_enc).unwrap_or_default())
                .decode_utf8_lossy()
                .into_owned();
            if let Ok(entry) = serde_json::from_slice::<FenceEntry>(&value) {
                fences.insert(id, entry);
            }
        }

        Ok(Some(StreamLog::new(
            path.to_string(),
            meta,
            fences,
            self.backend.clone(),
            self.config.clone(),
        )))
    }
}

fn drop_stream(
    backend: &dyn StorageBackend,
    streams: &mut HashMap<String, Arc<StreamLog>>,
    path: &str,
    log: &Arc<StreamLog>,
) -> Result<(), EngineError> {
    log.mark_deleted();
    streams.remove(path);
    backend.delete_prefix(&stream_prefix(path))?;
    Ok(())
}
