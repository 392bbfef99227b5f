//! In-process coordination store
//!
//! A single-process implementation of [`CoordStore`] backing the test
//! suite and single-host deployments. One mutex around the whole state
//! makes every operation linearizable; a background sweeper expires
//! TTL'd keys and emits `Expire` events to watchers.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{CoordStore, KeyValue, StoreError, WatchAction, WatchEvent, WatchStream};

/// How often the sweeper looks for expired keys.
const SWEEP_INTERVAL: Duration = Duration::from_millis(25);

/// Events retained for watch replay before compaction kicks in.
const LOG_RETENTION: usize = 65536;

struct Entry {
    value: String,
    modified_index: u64,
    expires_at: Option<Instant>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    index: u64,
    /// Index of the oldest event still in `log`.
    oldest_logged: u64,
    entries: BTreeMap<String, Entry>,
    log: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn emit(&mut self, event: WatchEvent) {
        if self.log.is_empty() {
            self.oldest_logged = event.index;
        }
        self.log.push(event.clone());
        if self.log.len() > LOG_RETENTION {
            let dropped = self.log.len() - LOG_RETENTION;
            self.log.drain(..dropped);
            self.oldest_logged = self.log[0].index;
        }
        self.watchers
            .retain(|w| !key_in_prefix(&event.key, &w.prefix) || w.tx.send(event.clone()).is_ok());
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|t| t <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            let entry = self.entries.remove(&key).unwrap();
            let index = self.next_index();
            trace!(%key, index, "key expired");
            self.emit(WatchEvent {
                index,
                key,
                action: WatchAction::Expire,
                old_value: Some(entry.value),
                new_value: None,
            });
        }
    }
}

fn key_in_prefix(key: &str, prefix: &str) -> bool {
    key == prefix || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// In-memory [`CoordStore`]. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create a store and spawn its expiry sweeper.
    ///
    /// Must be called from within a Tokio runtime. The sweeper stops once
    /// the last clone of the store is dropped.
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.lock().purge_expired(Instant::now()),
                    None => return,
                }
            }
        });
        Self { inner }
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        if inner.entries.contains_key(key) {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }
        let index = inner.next_index();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                modified_index: index,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        inner.emit(WatchEvent {
            index,
            key: key.to_string(),
            action: WatchAction::Create,
            old_value: None,
            new_value: Some(value.to_string()),
        });
        Ok(index)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        let index = inner.next_index();
        let old = inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                modified_index: index,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        let action = if old.is_some() {
            WatchAction::Update
        } else {
            WatchAction::Create
        };
        inner.emit(WatchEvent {
            index,
            key: key.to_string(),
            action,
            old_value: old.map(|e| e.value),
            new_value: Some(value.to_string()),
        });
        Ok(index)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        prev_value: Option<&str>,
        next: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        let current = match inner.entries.get(key) {
            Some(entry) => entry.value.clone(),
            None => {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                })
            }
        };
        if let Some(expected) = prev_value {
            if current != expected {
                return Err(StoreError::Conflict {
                    key: key.to_string(),
                });
            }
        }
        let index = inner.next_index();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                modified_index: index,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        inner.emit(WatchEvent {
            index,
            key: key.to_string(),
            action: WatchAction::Update,
            old_value: Some(current),
            new_value: Some(next.to_string()),
        });
        Ok(index)
    }

    async fn get(&self, key: &str) -> Result<KeyValue, StoreError> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        match inner.entries.get(key) {
            Some(entry) => Ok(KeyValue {
                key: key.to_string(),
                value: entry.value.clone(),
                index: entry.modified_index,
            }),
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        Ok(inner
            .entries
            .iter()
            .filter(|(k, _)| key_in_prefix(k, prefix) && k.as_str() != prefix)
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                index: e.modified_index,
            })
            .collect())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        let doomed: Vec<String> = if recursive {
            inner
                .entries
                .keys()
                .filter(|k| key_in_prefix(k, key))
                .cloned()
                .collect()
        } else {
            inner.entries.contains_key(key).then(|| key.to_string()).into_iter().collect()
        };
        if doomed.is_empty() {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        for key in doomed {
            let entry = inner.entries.remove(&key).unwrap();
            let index = inner.next_index();
            inner.emit(WatchEvent {
                index,
                key,
                action: WatchAction::Delete,
                old_value: Some(entry.value),
                new_value: None,
            });
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str, from_index: u64) -> Result<WatchStream, StoreError> {
        let mut inner = self.inner.lock();
        inner.purge_expired(Instant::now());
        if !inner.log.is_empty() && from_index < inner.oldest_logged {
            return Err(StoreError::IndexCompacted {
                requested: from_index,
                oldest: inner.oldest_logged,
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for event in &inner.log {
            if event.index >= from_index && key_in_prefix(&event.key, prefix) {
                // Replay cannot fail, rx is still in scope.
                let _ = tx.send(event.clone());
            }
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn latest_index(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().index)
    }
}
