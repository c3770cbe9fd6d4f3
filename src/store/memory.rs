//! In-memory storage implementation.
//!
//! Volatile CAS-capable storage for development and testing. All data is
//! lost on restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::trace;

use super::{record_key, KvError, KvRecord, KvStore};

struct Entry {
    data: Vec<u8>,
    cas: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.map(|t| t <= Instant::now()).unwrap_or(false)
    }
}

/// In-memory KV store.
///
/// Thread-safe using RwLock; CAS versions are process-global and strictly
/// increasing, so a version observed from one key is never reused.
#[derive(Default)]
pub struct InMemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
    next_cas: AtomicU64,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_cas: AtomicU64::new(1),
        }
    }

    fn bump_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<KvRecord>, KvError> {
        let full_key = record_key(namespace, key);
        let entries = self.entries.read().unwrap();

        match entries.get(&full_key) {
            Some(entry) if !entry.expired() => Ok(Some(KvRecord {
                data: entry.data.clone(),
                cas: entry.cas,
            })),
            _ => Ok(None),
        }
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        data: &[u8],
        cas: u64,
        ttl: Duration,
    ) -> Result<(), KvError> {
        let full_key = record_key(namespace, key);
        let mut entries = self.entries.write().unwrap();

        let live = entries.get(&full_key).map(|e| !e.expired()).unwrap_or(false);

        if cas == 0 {
            // Add semantics
            if live {
                trace!(key = %full_key, "add found an existing record");
                return Err(KvError::Contention);
            }
        } else {
            // Update semantics
            match entries.get(&full_key) {
                Some(entry) if !entry.expired() && entry.cas == cas => {}
                _ => {
                    trace!(key = %full_key, cas, "CAS mismatch on update");
                    return Err(KvError::Contention);
                }
            }
        }

        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };

        entries.insert(
            full_key,
            Entry {
                data: data.to_vec(),
                cas: self.bump_cas(),
                expires_at,
            },
        );

        Ok(())
    }

    async fn delete_cas(&self, namespace: &str, key: &str, cas: u64) -> Result<(), KvError> {
        let full_key = record_key(namespace, key);
        let mut entries = self.entries.write().unwrap();

        match entries.get(&full_key) {
            Some(entry) if !entry.expired() && entry.cas == cas => {
                entries.remove(&full_key);
                Ok(())
            }
            Some(_) => Err(KvError::Contention),
            None => Err(KvError::Contention),
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), KvError> {
        let full_key = record_key(namespace, key);
        self.entries.write().unwrap().remove(&full_key);
        Ok(())
    }
}
