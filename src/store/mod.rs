//! Versioned key-value storage.
//!
//! Session state lives in an external memcached-protocol store; every record
//! carries a compare-and-swap (CAS) version that mutations must present.
//! The [`KvStore`] trait is the seam between the session layer and the
//! backend:
//!
//! - [`MemcachedKv`]: production backend speaking the memcached text
//!   protocol (`gets`/`cas`/`add`/`set`/`delete`)
//! - [`InMemoryKv`]: development and testing
//!
//! Implementations must be thread-safe (Send + Sync).

mod memcached;
mod memory;

pub use memcached::MemcachedKv;
pub use memory::InMemoryKv;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Errors from KV operations.
///
/// `Contention` is the only error callers recover from by retrying; every
/// other backend failure collapses into `Io`.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The presented CAS did not match the stored version (or an add found
    /// an existing record).
    #[error("CAS contention")]
    Contention,

    /// The backend could not be reached or returned a protocol error.
    #[error("store I/O error: {0}")]
    Io(String),
}

/// A stored record with its CAS version.
#[derive(Debug, Clone)]
pub struct KvRecord {
    /// Raw record bytes
    pub data: Vec<u8>,

    /// CAS version to present on the next mutation
    pub cas: u64,
}

/// Versioned key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a record and its CAS version. `Ok(None)` means the key is
    /// absent.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<KvRecord>, KvError>;

    /// Write a record. `cas == 0` is add semantics (fails with `Contention`
    /// if the key exists); any other value is update semantics (fails with
    /// `Contention` on version mismatch or missing key).
    async fn set(
        &self,
        namespace: &str,
        key: &str,
        data: &[u8],
        cas: u64,
        ttl: Duration,
    ) -> Result<(), KvError>;

    /// CAS-checked delete. Fails with `Contention` when the stored version
    /// has moved on since the caller read it.
    async fn delete_cas(&self, namespace: &str, key: &str, cas: u64) -> Result<(), KvError>;

    /// Delete irrespective of CAS. Deleting an absent key is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), KvError>;
}

/// Shared KV store handle.
pub type SharedKvStore = Arc<dyn KvStore>;

/// Build the namespaced backend key.
pub(crate) fn record_key(namespace: &str, key: &str) -> String {
    format!("{}\\\\{}", namespace, key)
}
