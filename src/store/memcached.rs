//! Memcached text-protocol backend.
//!
//! Speaks `gets`/`add`/`cas`/`delete` against a memcached-compatible store.
//! Connections are pooled and reused; a store that keeps failing is
//! blacklisted for a configurable window so request threads fail fast
//! instead of piling up on a dead backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::{record_key, KvError, KvRecord, KvStore};

/// Consecutive failures before the store is blacklisted.
const BLACKLIST_THRESHOLD: u32 = 3;

/// Tombstones left behind by CAS deletes expire quickly.
const TOMBSTONE_TTL_SECS: u64 = 10;

struct Connection {
    reader: BufReader<TcpStream>,
}

impl Connection {
    async fn open(address: &str, timeout: Duration) -> Result<Self, KvError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| KvError::Io(format!("connect to {} timed out", address)))?
            .map_err(|e| KvError::Io(format!("connect to {}: {}", address, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| KvError::Io(e.to_string()))?;

        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    async fn send(&mut self, command: &[u8]) -> Result<(), KvError> {
        self.reader
            .get_mut()
            .write_all(command)
            .await
            .map_err(|e| KvError::Io(e.to_string()))
    }

    async fn read_line(&mut self) -> Result<String, KvError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| KvError::Io(e.to_string()))?;
        if n == 0 {
            return Err(KvError::Io("connection closed by store".to_string()));
        }
        Ok(line.trim_end().to_string())
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, KvError> {
        let mut buf = vec![0u8; len];
        self.reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| KvError::Io(e.to_string()))?;
        Ok(buf)
    }
}

/// Memcached-backed KV store for one site.
pub struct MemcachedKv {
    address: String,
    connect_timeout: Duration,
    blacklist_duration: Duration,
    idle: Mutex<Vec<Connection>>,
    consecutive_failures: AtomicU32,
    blacklisted_until: StdMutex<Option<Instant>>,
}

impl MemcachedKv {
    pub fn new(address: impl Into<String>, blacklist_duration: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_millis(250),
            blacklist_duration,
            idle: Mutex::new(Vec::new()),
            consecutive_failures: AtomicU32::new(0),
            blacklisted_until: StdMutex::new(None),
        }
    }

    /// The configured store address.
    pub fn address(&self) -> &str {
        &self.address
    }

    fn check_blacklist(&self) -> Result<(), KvError> {
        let mut until = self.blacklisted_until.lock().unwrap();
        match *until {
            Some(t) if t > Instant::now() => {
                Err(KvError::Io(format!("store {} is blacklisted", self.address)))
            }
            Some(_) => {
                *until = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= BLACKLIST_THRESHOLD {
            warn!(
                store = %self.address,
                failures,
                blacklist_secs = self.blacklist_duration.as_secs(),
                "store blacklisted after repeated failures"
            );
            *self.blacklisted_until.lock().unwrap() =
                Some(Instant::now() + self.blacklist_duration);
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    async fn acquire(&self) -> Result<Connection, KvError> {
        self.check_blacklist()?;

        if let Some(conn) = self.idle.lock().await.pop() {
            trace!(store = %self.address, "reusing idle store connection");
            return Ok(conn);
        }

        debug!(store = %self.address, "opening store connection");
        Connection::open(&self.address, self.connect_timeout).await
    }

    async fn release(&self, conn: Connection) {
        self.idle.lock().await.push(conn);
    }

    /// Run one command round-trip, tracking failures for the blacklist.
    async fn round_trip(
        &self,
        command: Vec<u8>,
    ) -> Result<(Connection, String), KvError> {
        let mut conn = match self.acquire().await {
            Ok(c) => c,
            Err(e) => {
                self.record_failure();
                return Err(e);
            }
        };

        let result = async {
            conn.send(&command).await?;
            conn.read_line().await
        }
        .await;

        match result {
            Ok(line) => {
                self.record_success();
                Ok((conn, line))
            }
            Err(e) => {
                // Connection is in an unknown state; drop it.
                self.record_failure();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl KvStore for MemcachedKv {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<KvRecord>, KvError> {
        let full_key = record_key(namespace, key);
        let command = format!("gets {}\r\n", full_key).into_bytes();

        let (mut conn, line) = self.round_trip(command).await?;

        if line == "END" {
            self.release(conn).await;
            return Ok(None);
        }

        // VALUE <key> <flags> <bytes> <cas>
        let mut parts = line.split_whitespace();
        if parts.next() != Some("VALUE") {
            return Err(KvError::Io(format!("unexpected gets response: {}", line)));
        }
        let _key = parts.next();
        let _flags = parts.next();
        let len: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| KvError::Io(format!("bad gets length in: {}", line)))?;
        let cas: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| KvError::Io(format!("bad gets cas in: {}", line)))?;

        let data = conn.read_exact(len).await?;
        conn.read_exact(2).await?; // trailing \r\n
        let end = conn.read_line().await?;
        if end != "END" {
            return Err(KvError::Io(format!("unexpected gets trailer: {}", end)));
        }

        self.release(conn).await;

        // Tombstones from CAS deletes read back as empty records.
        if data.is_empty() {
            return Ok(None);
        }

        Ok(Some(KvRecord { data, cas }))
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
        let exptime = ttl.as_secs();

        let mut command = if cas == 0 {
            format!("add {} 0 {} {}\r\n", full_key, exptime, data.len()).into_bytes()
        } else {
            format!("cas {} 0 {} {} {}\r\n", full_key, exptime, data.len(), cas).into_bytes()
        };
        command.extend_from_slice(data);
        command.extend_from_slice(b"\r\n");

        let (conn, line) = self.round_trip(command).await?;
        self.release(conn).await;

        match line.as_str() {
            "STORED" => Ok(()),
            "NOT_STORED" | "EXISTS" | "NOT_FOUND" => Err(KvError::Contention),
            other => Err(KvError::Io(format!("unexpected store response: {}", other))),
        }
    }

    async fn delete_cas(&self, namespace: &str, key: &str, cas: u64) -> Result<(), KvError> {
        // memcached has no CAS delete. Write an empty tombstone with the
        // caller's CAS (this performs the version check), then remove the
        // record so a later add can recreate the key.
        self.set(
            namespace,
            key,
            b"",
            cas,
            Duration::from_secs(TOMBSTONE_TTL_SECS),
        )
        .await?;

        self.delete(namespace, key).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), KvError> {
        let full_key = record_key(namespace, key);
        let command = format!("delete {}\r\n", full_key).into_bytes();

        let (conn, line) = self.round_trip(command).await?;
        self.release(conn).await;

        match line.as_str() {
            "DELETED" | "NOT_FOUND" => Ok(()),
            other => Err(KvError::Io(format!("unexpected delete response: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blacklisted_store_fails_fast() {
        // Unroutable address; every attempt fails.
        let store = MemcachedKv::new("192.0.2.1:11211", Duration::from_secs(60));

        for _ in 0..BLACKLIST_THRESHOLD {
            assert!(store.get("session", "k").await.is_err());
        }

        // Now blacklisted: the next call must not attempt a connection.
        let start = Instant::now();
        let err = store.get("session", "k").await.unwrap_err();
        assert!(matches!(err, KvError::Io(_)));
        assert!(err.to_string().contains("blacklisted"));
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
