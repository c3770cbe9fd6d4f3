//! Session persistence over a [`KvStore`].

use std::time::Duration;

use tracing::{debug, warn};

use crate::store::{KvError, SharedKvStore};
use crate::telemetry::metrics::counters;

use super::codec::{BinaryCodec, JsonCodec, SessionCodec};
use super::types::{Session, SessionKey};

/// Namespace session records live under in the KV backend.
const NAMESPACE: &str = "session";

/// One site's session store.
///
/// Records are serialised with the configured write codec and read back
/// through a chain of deserialisers tried in registration order, so a
/// rolling upgrade can change the write format without stranding records.
pub struct SessionStore {
    kv: SharedKvStore,
    serializer: Box<dyn SessionCodec>,
    deserializers: Vec<Box<dyn SessionCodec>>,

    /// Label for logs: "local" or the remote site name.
    label: String,
}

impl SessionStore {
    pub fn new(kv: SharedKvStore, label: impl Into<String>) -> Self {
        Self {
            kv,
            serializer: Box::new(JsonCodec),
            deserializers: vec![Box::new(BinaryCodec), Box::new(JsonCodec)],
            label: label.into(),
        }
    }

    /// Store label for logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Read a session. Corrupt records are treated as absent after logging.
    pub async fn get(&self, key: &SessionKey) -> Result<Option<Session>, KvError> {
        let store_key = key.store_key();
        debug!(store = %self.label, key = %store_key, "retrieving session data");

        let record = match self.kv.get(NAMESPACE, &store_key).await? {
            Some(r) if !r.data.is_empty() => r,
            _ => return Ok(None),
        };

        debug!(store = %self.label, cas = record.cas, "retrieved session record");

        for codec in &self.deserializers {
            if let Some(mut session) = codec.deserialize(&record.data) {
                debug!(codec = codec.name(), "deserialization succeeded");
                session.cas = record.cas;
                return Ok(Some(session));
            }
        }

        // Could not deserialize the record. Treat it as not found.
        warn!(
            store = %self.label,
            call_id = %key.call_id,
            "failed to deserialize session record, treating as absent"
        );
        counters::session_deserialize_failed();

        Ok(None)
    }

    /// Write a session. `new_session` overrides the CAS so the write uses
    /// add semantics, resurrecting a session this store has lost. Records
    /// expire after twice the refresh window.
    pub async fn set(
        &self,
        key: &SessionKey,
        session: &Session,
        new_session: bool,
    ) -> Result<(), KvError> {
        let cas = if new_session { 0 } else { session.cas };
        let store_key = key.store_key();
        debug!(store = %self.label, key = %store_key, cas, "saving session data");

        let data = self.serializer.serialize(session);
        let ttl = Duration::from_secs(2 * u64::from(session.session_refresh_time));

        self.kv.set(NAMESPACE, &store_key, &data, cas, ttl).await
    }

    /// CAS-checked delete using the version the session was read at.
    pub async fn delete_cas(&self, key: &SessionKey, session: &Session) -> Result<(), KvError> {
        let store_key = key.store_key();
        debug!(store = %self.label, key = %store_key, cas = session.cas, "deleting session data");

        self.kv.delete_cas(NAMESPACE, &store_key, session.cas).await
    }

    /// Delete irrespective of CAS.
    pub async fn delete(&self, key: &SessionKey) -> Result<(), KvError> {
        let store_key = key.store_key();
        debug!(store = %self.label, key = %store_key, "deleting session data unconditionally");

        self.kv.delete(NAMESPACE, &store_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKv;
    use std::sync::Arc;

    fn test_key() -> SessionKey {
        SessionKey::new(
            "abcd@example.com",
            crate::session::NodeRole::ORIGINATING,
            crate::session::NodeFunctionality::SCSCF,
        )
    }

    fn test_session() -> Session {
        Session {
            session_id: "ccf;1;1".to_string(),
            ccfs: vec!["ccf1.example.com".to_string()],
            acct_record_number: 1,
            timer_id: "t1".to_string(),
            session_refresh_time: 300,
            interim_interval: 100,
            cas: 0,
        }
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let store = SessionStore::new(Arc::new(InMemoryKv::new()), "local");
        let key = test_key();

        store.set(&key, &test_session(), true).await.unwrap();

        let read = store.get(&key).await.unwrap().unwrap();
        assert_eq!(read.session_id, "ccf;1;1");
        assert_eq!(read.acct_record_number, 1);
        assert!(read.cas > 0);
    }

    #[tokio::test]
    async fn test_update_requires_fresh_cas() {
        let store = SessionStore::new(Arc::new(InMemoryKv::new()), "local");
        let key = test_key();

        store.set(&key, &test_session(), true).await.unwrap();
        let mut session = store.get(&key).await.unwrap().unwrap();

        session.acct_record_number = 2;
        store.set(&key, &session, false).await.unwrap();

        // Writing again at the same (now stale) CAS is contention.
        let err = store.set(&key, &session, false).await.unwrap_err();
        assert!(matches!(err, KvError::Contention));
    }

    #[tokio::test]
    async fn test_reads_legacy_binary_records() {
        let kv: SharedKvStore = Arc::new(InMemoryKv::new());
        let key = test_key();

        // A record written by an older node in the binary format.
        let legacy = BinaryCodec.serialize(&test_session());
        kv.set(
            NAMESPACE,
            &key.store_key(),
            &legacy,
            0,
            Duration::from_secs(600),
        )
        .await
        .unwrap();

        let store = SessionStore::new(kv, "local");
        let read = store.get(&key).await.unwrap().unwrap();
        assert_eq!(read.session_id, "ccf;1;1");
        assert_eq!(read.ccfs, vec!["ccf1.example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_record_reads_as_absent() {
        let kv: SharedKvStore = Arc::new(InMemoryKv::new());
        let key = test_key();

        kv.set(
            NAMESPACE,
            &key.store_key(),
            b"\xff\xfe not a session",
            0,
            Duration::from_secs(600),
        )
        .await
        .unwrap();

        let store = SessionStore::new(kv, "local");
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_cas_then_absent() {
        let store = SessionStore::new(Arc::new(InMemoryKv::new()), "local");
        let key = test_key();

        store.set(&key, &test_session(), true).await.unwrap();
        let session = store.get(&key).await.unwrap().unwrap();

        store.delete_cas(&key, &session).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
