//! Webhook subscriptions and delivery.
//!
//! Each subscription owns one worker task draining an ordered queue, so
//! delivery for offset O completes (or dead-letters) before O+1 is
//! attempted. Ordering across subscriptions is unconstrained.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::EngineError;
use crate::offset::OffsetToken;
use crate::retry::{parse_retry_after, status_is_retryable, DeliverySchedule};
use crate::storage::{sub_key, StorageBackend, WriteBatch, SUBS_PREFIX};

pub const SIGNATURE_HEADER: &str = "webhook-signature";
pub const STREAM_PATH_HEADER: &str = "stream-path";
pub const STREAM_OFFSET_HEADER: &str = "stream-offset";

/// Persisted subscription state (`subs/<pattern>/<name>`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub url: String,
    pub secret: String,
    /// Offset token of the last delivered (or dead-lettered) event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One queued delivery.
#[derive(Debug)]
struct Delivery {
    path: String,
    offset: OffsetToken,
    payload: Bytes,
}

struct SubHandle {
    record: SubscriptionRecord,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Fan-out point for append events.
pub struct WebhookDispatcher {
    backend: Arc<dyn StorageBackend>,
    config: Arc<ServerConfig>,
    client: reqwest::Client,
    schedule: DeliverySchedule,
    subs: RwLock<HashMap<(String, String), SubHandle>>,
}

impl WebhookDispatcher {
    pub fn new(backend: Arc<dyn StorageBackend>, config: Arc<ServerConfig>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            config,
            client: reqwest::Client::new(),
            schedule: DeliverySchedule::default(),
            subs: RwLock::new(HashMap::new()),
        })
    }

    /// Restore persisted subscriptions and spawn their workers.
    pub fn load(self: &Arc<Self>) -> Result<(), EngineError> {
        let rows = self.backend.scan(SUBS_PREFIX, None, usize::MAX)?;
        for (key, value) in rows {
            let Some((pattern, name)) = decode_sub_key(&key) else {
                continue;
            };
            match serde_json::from_slice::<SubscriptionRecord>(&value) {
                Ok(record) => self.install(pattern, name, record),
                Err(e) => warn!(key = %String::from_utf8_lossy(&key), error = %e,
                    "skipping corrupt subscription record"),
            }
        }
        Ok(())
    }

    /// Register (or update) a subscription. Returns the signing secret.
    ///
    /// Re-registering an existing `(pattern, name)` keeps its secret and
    /// cursor and updates the target URL and description.
    pub fn register(
        self: &Arc<Self>,
        pattern: &str,
        name: &str,
        url: &str,
        description: Option<String>,
    ) -> Result<String, EngineError> {
        let existing = {
            let subs = self.subs.read();
            subs.get(&(pattern.to_string(), name.to_string()))
                .map(|h| h.record.clone())
        };

        let record = match existing {
            Some(mut record) => {
                record.url = url.to_string();
                record.description = description;
                record
            }
            None => SubscriptionRecord {
                url: url.to_string(),
                secret: generate_secret(),
                cursor: None,
                description,
            },
        };

        let mut batch = WriteBatch::new();
        batch.put(
            sub_key(pattern, name),
            serde_json::to_vec(&record)
                .map_err(|e| crate::storage::StorageError::Backend(e.to_string()))?,
        );
        self.backend.apply(batch)?;

        let secret = record.secret.clone();
        self.install(pattern.to_string(), name.to_string(), record);
        Ok(secret)
    }

    fn install(self: &Arc<Self>, pattern: String, name: String, record: SubscriptionRecord) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SubHandle {
            record: record.clone(),
            tx,
        };
        self.subs
            .write()
            .insert((pattern.clone(), name.clone()), handle);

        // The worker owns only what it needs; it must not keep the
        // dispatcher alive, or the queue sender in `subs` would never drop
        // and the task would never exit.
        let worker = SubWorker {
            backend: self.backend.clone(),
            config: self.config.clone(),
            client: self.client.clone(),
            schedule: self.schedule.clone(),
            pattern,
            name,
            record,
        };
        tokio::spawn(worker.run(rx));
    }

    /// Enqueue deliveries for freshly appended messages.
    pub fn publish(&self, path: &str, appended: &[(OffsetToken, Bytes)]) {
        if appended.is_empty() {
            return;
        }
        let subs = self.subs.read();
        for ((pattern, _), handle) in subs.iter() {
            if !pattern_matches(pattern, path) {
                continue;
            }
            for (offset, payload) in appended {
                let _ = handle.tx.send(Delivery {
                    path: path.to_string(),
                    offset: *offset,
                    payload: payload.clone(),
                });
            }
        }
    }
}

struct SubWorker {
    backend: Arc<dyn StorageBackend>,
    config: Arc<ServerConfig>,
    client: reqwest::Client,
    schedule: DeliverySchedule,
    pattern: String,
    name: String,
    record: SubscriptionRecord,
}

impl SubWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            // Skip events at or below the persisted cursor (replays after a
            // reload would otherwise double-deliver).
            if let Some(cursor) = &self.record.cursor {
                if delivery.offset.encode().as_str() <= cursor.as_str() {
                    continue;
                }
            }

            self.deliver(&delivery).await;

            self.record.cursor = Some(delivery.offset.encode());
            let mut batch = WriteBatch::new();
            if let Ok(raw) = serde_json::to_vec(&self.record) {
                batch.put(sub_key(&self.pattern, &self.name), raw);
                if let Err(e) = self.backend.apply(batch) {
                    warn!(pattern = %self.pattern, name = %self.name, error = %e,
                        "failed to persist subscription cursor");
                }
            }
        }
    }

    /// Deliver one event, retrying transient failures. Permanent failures
    /// dead-letter: the event is logged and the cursor moves on.
    async fn deliver(&self, delivery: &Delivery) {
        let signature = sign(&self.record.secret, &delivery.payload);

        for attempt in 0.. {
            let result = self
                .client
                .post(&self.record.url)
                .timeout(self.config.webhook_delivery_timeout)
                .header(SIGNATURE_HEADER, &signature)
                .header(STREAM_PATH_HEADER, &delivery.path)
                .header(STREAM_OFFSET_HEADER, delivery.offset.encode())
                .body(delivery.payload.clone())
                .send()
                .await;

            let retry_after = match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %self.record.url, offset = %delivery.offset, "delivered webhook");
                    return;
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if !status_is_retryable(status) {
                        warn!(url = %self.record.url, offset = %delivery.offset, status,
                            "dead-lettering webhook delivery");
                        return;
                    }
                    resp.headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| parse_retry_after(v, self.config.retry_after_cap))
                }
                Err(e) => {
                    debug!(url = %self.record.url, error = %e, "webhook attempt failed");
                    None
                }
            };

            if self.schedule.exhausted(attempt + 1) {
                warn!(url = %self.record.url, offset = %delivery.offset,
                    "dead-lettering webhook delivery after {} attempts", attempt + 1);
                return;
            }

            tokio::time::sleep(self.schedule.delay(attempt, retry_after)).await;
        }
    }
}

/// HMAC-SHA256 signature of the delivery body, hex encoded.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Exact match, or prefix match when the pattern ends in `*`.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

fn generate_secret() -> String {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

fn decode_sub_key(key: &[u8]) -> Option<(String, String)> {
    use percent_encoding::percent_decode_str;
    let tail = std::str::from_utf8(key.strip_prefix(SUBS_PREFIX)?).ok()?;
    let (pattern, name) = tail.split_once('/')?;
    Some((
        percent_decode_str(pattern).decode_utf8().ok()?.into_owned(),
        percent_decode_str(name).decode_utf8().ok()?.into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    #[test]
    fn pattern_matching() {
        assert!(pattern_matches("/orders", "/orders"));
        assert!(!pattern_matches("/orders", "/orders/1"));
        assert!(pattern_matches("/orders/*", "/orders/1"));
        assert!(pattern_matches("/orders/*", "/orders/"));
        assert!(!pattern_matches("/orders/*", "/invoices/1"));
        assert!(pattern_matches("*", "/anything"));
    }

    #[test]
    fn signature_is_stable_and_keyed() {
        let a = sign("secret", b"body");
        assert!(a.starts_with("sha256="));
        assert_eq!(a, sign("secret", b"body"));
        assert_ne!(a, sign("other", b"body"));
        assert_ne!(a, sign("secret", b"different"));
    }

    #[tokio::test]
    async fn register_persists_and_keeps_secret_on_update() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let dispatcher =
            WebhookDispatcher::new(backend.clone(), Arc::new(ServerConfig::default()));

        let secret = dispatcher
            .register("/orders/*", "audit", "http://example.test/hook", None)
            .unwrap();
        assert_eq!(secret.len(), 64);

        let raw = backend.get(&sub_key("/orders/*", "audit")).unwrap().unwrap();
        let record: SubscriptionRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record.secret, secret);
        assert_eq!(record.url, "http://example.test/hook");

        let again = dispatcher
            .register(
                "/orders/*",
                "audit",
                "http://example.test/hook2",
                Some("updated".to_string()),
            )
            .unwrap();
        assert_eq!(again, secret);

        let raw = backend.get(&sub_key("/orders/*", "audit")).unwrap().unwrap();
        let record: SubscriptionRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record.url, "http://example.test/hook2");
    }

    #[tokio::test]
    async fn reload_restores_subscriptions() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let dispatcher =
            WebhookDispatcher::new(backend.clone(), Arc::new(ServerConfig::default()));
        let secret = dispatcher
            .register("/a", "one", "http://example.test/a", None)
            .unwrap();

        let restored = WebhookDispatcher::new(backend, Arc::new(ServerConfig::default()));
        restored.load().unwrap();
        let subs = restored.subs.read();
        let handle = subs
            .get(&("/a".to_string(), "one".to_string()))
            .expect("subscription restored");
        assert_eq!(handle.record.secret, secret);
    }
}
