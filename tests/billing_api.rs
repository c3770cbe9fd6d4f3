//! End-to-end billing API tests.
//!
//! Drive the HTTP surface against in-memory stores, a scripted CDF and a
//! recording timer service, and observe the replicated session state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use rfgwd::bootstrap::{GatewayState, SharedGatewayState, ShutdownManager};
use rfgwd::config::LoadConfig;
use rfgwd::diameter::rf::{AccountingAnswer, AccountingRequest};
use rfgwd::diameter::{AcrSender, DiameterClient, DiameterError};
use rfgwd::load::LoadMonitor;
use rfgwd::session::{
    NodeFunctionality, NodeRole, Session, SessionKey, SessionManager, SessionStore, NO_TIMER,
};
use rfgwd::store::InMemoryKv;
use rfgwd::telemetry::health::HealthChecker;
use rfgwd::timer::{TimerError, TimerRequest, TimerService};

/// Scripted CDF. Answers are popped per ACR; an empty script answers 2001.
struct ScriptedCdf {
    script: Mutex<VecDeque<ScriptEntry>>,
    sent: Mutex<Vec<SentAcr>>,
    default_session_id: String,
    default_interim: u32,
}

enum ScriptEntry {
    Answer {
        result_code: u32,
        session_id: String,
        interim_interval: u32,
    },
    Timeout,
}

#[derive(Debug, Clone)]
struct SentAcr {
    peer: String,
    record_number: u32,
    session_id: String,
}

impl ScriptedCdf {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            default_session_id: "cdf;1;1".to_string(),
            default_interim: 100,
        })
    }

    fn push_answer(&self, result_code: u32, session_id: &str, interim_interval: u32) {
        self.script.lock().unwrap().push_back(ScriptEntry::Answer {
            result_code,
            session_id: session_id.to_string(),
            interim_interval,
        });
    }

    fn push_timeout(&self) {
        self.script.lock().unwrap().push_back(ScriptEntry::Timeout);
    }

    fn sent(&self) -> Vec<SentAcr> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiameterClient for ScriptedCdf {
    async fn send_acr(
        &self,
        peer: &str,
        acr: &AccountingRequest,
        _timeout: Duration,
    ) -> Result<AccountingAnswer, DiameterError> {
        let record_number = acr
            .avps()
            .iter()
            .find(|a| a.code == 485)
            .and_then(|a| a.as_u32())
            .unwrap_or(0);

        self.sent.lock().unwrap().push(SentAcr {
            peer: peer.to_string(),
            record_number,
            session_id: acr.session_id.clone(),
        });

        match self.script.lock().unwrap().pop_front() {
            Some(ScriptEntry::Answer {
                result_code,
                session_id,
                interim_interval,
            }) => Ok(AccountingAnswer {
                result_code,
                session_id,
                interim_interval,
            }),
            Some(ScriptEntry::Timeout) => Err(DiameterError::Timeout),
            None => Ok(AccountingAnswer {
                result_code: 2001,
                session_id: self.default_session_id.clone(),
                interim_interval: self.default_interim,
            }),
        }
    }
}

/// Recording timer service handing out sequential ids.
#[derive(Default)]
struct RecordingTimers {
    next_id: AtomicU64,
    created: Mutex<Vec<TimerRequest>>,
    refreshed: Mutex<Vec<(String, TimerRequest)>>,
    cancelled: Mutex<Vec<String>>,
}

impl RecordingTimers {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TimerService for RecordingTimers {
    async fn create(&self, request: &TimerRequest) -> Result<String, TimerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.lock().unwrap().push(request.clone());
        Ok(format!("timer-{}", id))
    }

    async fn refresh(&self, timer_id: &str, request: &TimerRequest) -> Result<String, TimerError> {
        self.refreshed
            .lock()
            .unwrap()
            .push((timer_id.to_string(), request.clone()));
        Ok(timer_id.to_string())
    }

    async fn cancel(&self, timer_id: &str) -> Result<(), TimerError> {
        self.cancelled.lock().unwrap().push(timer_id.to_string());
        Ok(())
    }
}

struct Harness {
    base_url: String,
    http: reqwest::Client,
    cdf: Arc<ScriptedCdf>,
    timers: Arc<RecordingTimers>,
    local: Arc<SessionStore>,
    remote: Arc<SessionStore>,
}

impl Harness {
    async fn start() -> Self {
        let cdf = ScriptedCdf::new();
        let timers = RecordingTimers::new();

        let local = Arc::new(SessionStore::new(Arc::new(InMemoryKv::new()), "local"));
        let remote = Arc::new(SessionStore::new(Arc::new(InMemoryKv::new()), "site2"));

        let sender = Arc::new(AcrSender::new(
            cdf.clone(),
            "rfgw-1.example.com",
            "example.com",
            "billing.example.com",
            None,
            Duration::from_millis(200),
        ));

        let session_manager = Arc::new(SessionManager::new(
            local.clone(),
            vec![remote.clone()],
            sender,
            timers.clone(),
            Arc::new(HealthChecker::new()),
        ));

        let state: SharedGatewayState = Arc::new(GatewayState {
            session_manager,
            load_monitor: Arc::new(LoadMonitor::new(&LoadConfig::default())),
            health: Arc::new(HealthChecker::new()),
            shutdown: ShutdownManager::new(),
            acr_logging: false,
        });

        let app = rfgwd::http::router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");

        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server");
        });

        Self {
            base_url: format!("http://{}", addr),
            http: reqwest::Client::new(),
            cdf,
            timers,
            local,
            remote,
        }
    }

    async fn post_event(&self, call_id: &str, query: &str, body: &serde_json::Value) -> u16 {
        self.http
            .post(format!("{}/call-id/{}{}", self.base_url, call_id, query))
            .body(body.to_string())
            .send()
            .await
            .expect("billing request")
            .status()
            .as_u16()
    }

    /// Poll until `check` passes or the deadline expires.
    async fn wait_for<F, Fut>(&self, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within deadline");
    }
}

fn start_body(ccfs: &[&str], refresh: u32) -> serde_json::Value {
    json!({
        "peers": { "ccf": ccfs },
        "event": {
            "Accounting-Record-Type": 2,
            "Acct-Interim-Interval": refresh,
            "Service-Information": {
                "IMS-Information": { "Role-Of-Node": 0, "Node-Functionality": 0 }
            }
        }
    })
}

fn interim_body() -> serde_json::Value {
    json!({
        "event": {
            "Accounting-Record-Type": 3,
            "Service-Information": {
                "IMS-Information": { "Role-Of-Node": 0, "Node-Functionality": 0 }
            }
        }
    })
}

fn stop_body() -> serde_json::Value {
    json!({
        "event": {
            "Accounting-Record-Type": 4,
            "Service-Information": {
                "IMS-Information": { "Role-Of-Node": 0, "Node-Functionality": 0 }
            }
        }
    })
}

fn key(call_id: &str) -> SessionKey {
    SessionKey::new(call_id, NodeRole::ORIGINATING, NodeFunctionality::SCSCF)
}

#[tokio::test]
async fn test_ping() {
    let h = Harness::start().await;

    let response = h
        .http
        .post(format!("{}/ping", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_wrong_method_is_405() {
    let h = Harness::start().await;

    let response = h
        .http
        .get(format!("{}/call-id/some-call", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);
}

#[tokio::test]
async fn test_happy_path_start() {
    let h = Harness::start().await;
    h.cdf.push_answer(2001, "s;1;1", 100);

    let status = h
        .post_event("happy-call", "", &start_body(&["c1.example.com"], 300))
        .await;
    assert_eq!(status, 200);

    let k = key("happy-call");
    h.wait_for(|| async { h.local.get(&k).await.unwrap().is_some() })
        .await;

    let sess = h.local.get(&k).await.unwrap().unwrap();
    assert_eq!(sess.session_id, "s;1;1");
    assert_eq!(sess.acct_record_number, 1);
    assert_eq!(sess.interim_interval, 100);
    assert_eq!(sess.session_refresh_time, 300);
    assert_eq!(sess.timer_id, "timer-1");

    // Replicated to the remote site too.
    let remote_sess = h.remote.get(&k).await.unwrap().unwrap();
    assert_eq!(remote_sess.session_id, "s;1;1");

    // Timer scheduled: interval from the CDF, repeat-for the refresh
    // window, callback with the timer-interim marker.
    let created = h.timers.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].interval, 100);
    assert_eq!(created[0].repeat_for, 300);
    assert_eq!(created[0].callback_path, "/call-id/happy-call?timer-interim=true");

    // The Start ACR carried record number 1.
    let sent = h.cdf.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].peer, "c1.example.com");
    assert_eq!(sent[0].record_number, 1);

    // No session id existed yet, so the ACR carried a freshly generated
    // one rooted at this gateway's identity.
    assert!(sent[0].session_id.starts_with("rfgw-1.example.com;"));
}

#[tokio::test]
async fn test_concurrent_interims_advance_by_exactly_two() {
    let h = Harness::start().await;

    // Seed the session directly; both interims run against it.
    let sess = Session {
        session_id: "s;2;2".to_string(),
        ccfs: vec!["c1.example.com".to_string()],
        acct_record_number: 1,
        timer_id: "timer-1".to_string(),
        session_refresh_time: 300,
        interim_interval: 100,
        cas: 0,
    };
    let k = key("contended-call");
    h.local.set(&k, &sess, true).await.unwrap();
    h.remote.set(&k, &sess, true).await.unwrap();

    let body_a = interim_body();
    let body_b = interim_body();
    let (a, b) = tokio::join!(
        h.post_event("contended-call", "", &body_a),
        h.post_event("contended-call", "", &body_b),
    );
    assert_eq!((a, b), (200, 200));

    // Both interims eventually land: the record number advances by
    // exactly 2 and the two ACRs carried 2 and 3.
    h.wait_for(|| async {
        h.local
            .get(&k)
            .await
            .unwrap()
            .map(|s| s.acct_record_number == 3)
            .unwrap_or(false)
    })
    .await;

    h.wait_for(|| async { h.cdf.sent().len() == 2 }).await;
    let mut numbers: Vec<u32> = h.cdf.sent().iter().map(|s| s.record_number).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![2, 3]);
}

#[tokio::test]
async fn test_failover_to_backup_ccf() {
    let h = Harness::start().await;
    h.cdf.push_timeout();
    h.cdf.push_answer(2001, "s;3;3", 100);

    let status = h
        .post_event(
            "failover-call",
            "",
            &start_body(&["c1.example.com", "c2.example.com"], 300),
        )
        .await;
    assert_eq!(status, 200);

    let k = key("failover-call");
    h.wait_for(|| async { h.local.get(&k).await.unwrap().is_some() })
        .await;

    // Exactly one terminal outcome, reached through c2.
    let sent = h.cdf.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].peer, "c1.example.com");
    assert_eq!(sent[1].peer, "c2.example.com");

    let sess = h.local.get(&k).await.unwrap().unwrap();
    assert_eq!(sess.session_id, "s;3;3");
    assert_eq!(sess.acct_record_number, 1);
}

#[tokio::test]
async fn test_unknown_session_purges_everywhere() {
    let h = Harness::start().await;

    let sess = Session {
        session_id: "s;4;4".to_string(),
        ccfs: vec!["c1.example.com".to_string()],
        acct_record_number: 3,
        timer_id: "timer-9".to_string(),
        session_refresh_time: 300,
        interim_interval: 100,
        cas: 0,
    };
    let k = key("unknown-call");
    h.local.set(&k, &sess, true).await.unwrap();
    h.remote.set(&k, &sess, true).await.unwrap();

    h.cdf.push_answer(5002, "s;4;4", 0);
    let status = h.post_event("unknown-call", "", &interim_body()).await;
    assert_eq!(status, 200);

    h.wait_for(|| async {
        h.local.get(&k).await.unwrap().is_none() && h.remote.get(&k).await.unwrap().is_none()
    })
    .await;
}

#[tokio::test]
async fn test_timer_pop_round_trip() {
    let h = Harness::start().await;

    // Establish the session through a Start so the opaque payload is the
    // one the state machine synthesised.
    h.cdf.push_answer(2001, "s;5;5", 100);
    h.post_event("pop-call", "", &start_body(&["c1.example.com"], 300))
        .await;

    let k = key("pop-call");
    h.wait_for(|| async { h.local.get(&k).await.unwrap().is_some() })
        .await;

    let (callback_path, opaque) = {
        let created = h.timers.created.lock().unwrap();
        (created[0].callback_path.clone(), created[0].opaque.clone())
    };
    assert_eq!(callback_path, "/call-id/pop-call?timer-interim=true");

    // The timer service redelivers the opaque body verbatim to the
    // callback path.
    h.cdf.push_answer(2001, "s;5;5", 100);
    let opaque_value: serde_json::Value = serde_json::from_str(&opaque).unwrap();
    assert_eq!(opaque_value["event"]["Accounting-Record-Type"], 3);
    let status = h
        .post_event("pop-call", "?timer-interim=true", &opaque_value)
        .await;
    assert_eq!(status, 200);

    // Processed as an Interim against the stored session.
    h.wait_for(|| async {
        h.local
            .get(&k)
            .await
            .unwrap()
            .map(|s| s.acct_record_number == 2)
            .unwrap_or(false)
    })
    .await;

    // Timer pops do not refresh the timer; the service reschedules itself.
    assert!(h.timers.refreshed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_signalling_interim_refreshes_timer() {
    let h = Harness::start().await;

    h.cdf.push_answer(2001, "s;6;6", 100);
    h.post_event("refresh-call", "", &start_body(&["c1.example.com"], 300))
        .await;

    let k = key("refresh-call");
    h.wait_for(|| async { h.local.get(&k).await.unwrap().is_some() })
        .await;

    h.cdf.push_answer(2001, "s;6;6", 100);
    h.post_event("refresh-call", "", &interim_body()).await;

    h.wait_for(|| async { !h.timers.refreshed.lock().unwrap().is_empty() })
        .await;

    let refreshed = h.timers.refreshed.lock().unwrap();
    assert_eq!(refreshed[0].0, "timer-1");
    assert_eq!(refreshed[0].1.interval, 100);
    assert_eq!(refreshed[0].1.repeat_for, 300);
}

#[tokio::test]
async fn test_stop_tears_the_session_down() {
    let h = Harness::start().await;

    h.cdf.push_answer(2001, "s;7;7", 100);
    h.post_event("stop-call", "", &start_body(&["c1.example.com"], 300))
        .await;

    let k = key("stop-call");
    h.wait_for(|| async { h.local.get(&k).await.unwrap().is_some() })
        .await;

    h.cdf.push_answer(2001, "s;7;7", 0);
    h.post_event("stop-call", "", &stop_body()).await;

    h.wait_for(|| async {
        h.local.get(&k).await.unwrap().is_none() && h.remote.get(&k).await.unwrap().is_none()
    })
    .await;

    h.wait_for(|| async { !h.timers.cancelled.lock().unwrap().is_empty() })
        .await;
    assert_eq!(*h.timers.cancelled.lock().unwrap(), vec!["timer-1"]);

    // The final ACR carried record number 2.
    let sent = h.cdf.sent();
    assert_eq!(sent.last().unwrap().record_number, 2);
}

#[tokio::test]
async fn test_malformed_body_rejected_without_side_effects() {
    let h = Harness::start().await;

    // Body missing Node-Functionality.
    let body = json!({
        "peers": { "ccf": ["c1.example.com"] },
        "event": {
            "Accounting-Record-Type": 2,
            "Service-Information": {
                "IMS-Information": { "Role-Of-Node": 0 }
            }
        }
    });

    let status = h.post_event("bad-call", "", &body).await;
    assert_eq!(status, 400);

    // Give any stray processing a moment, then confirm nothing happened.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.local.get(&key("bad-call")).await.unwrap().is_none());
    assert!(h.cdf.sent().is_empty());
    assert!(h.timers.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_start_without_peers_is_acknowledged_and_dropped() {
    let h = Harness::start().await;

    let body = json!({
        "event": {
            "Accounting-Record-Type": 2,
            "Service-Information": {
                "IMS-Information": { "Role-Of-Node": 0, "Node-Functionality": 0 }
            }
        }
    });

    let status = h.post_event("peerless-call", "", &body).await;
    assert_eq!(status, 200);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.cdf.sent().is_empty());
    assert!(h.local.get(&key("peerless-call")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_interim_for_unknown_call_is_dropped_silently() {
    let h = Harness::start().await;

    let status = h.post_event("ghost-call", "", &interim_body()).await;
    assert_eq!(status, 200);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.cdf.sent().is_empty());
}

#[tokio::test]
async fn test_failed_timer_create_leaves_no_timer_sentinel() {
    // A timer service that always fails.
    struct DeadTimers;

    #[async_trait]
    impl TimerService for DeadTimers {
        async fn create(&self, _request: &TimerRequest) -> Result<String, TimerError> {
            Err(TimerError::Unreachable("down".to_string()))
        }

        async fn refresh(
            &self,
            _timer_id: &str,
            _request: &TimerRequest,
        ) -> Result<String, TimerError> {
            Err(TimerError::Unreachable("down".to_string()))
        }

        async fn cancel(&self, _timer_id: &str) -> Result<(), TimerError> {
            Err(TimerError::Unreachable("down".to_string()))
        }
    }

    let cdf = ScriptedCdf::new();
    cdf.push_answer(2001, "s;8;8", 100);

    let local = Arc::new(SessionStore::new(Arc::new(InMemoryKv::new()), "local"));
    let sender = Arc::new(AcrSender::new(
        cdf.clone(),
        "rfgw-1.example.com",
        "example.com",
        "billing.example.com",
        None,
        Duration::from_millis(200),
    ));
    let manager = SessionManager::new(
        local.clone(),
        Vec::new(),
        sender,
        Arc::new(DeadTimers),
        Arc::new(HealthChecker::new()),
    );

    let mut msg = rfgwd::session::Message::new(
        "timerless-call",
        NodeRole::ORIGINATING,
        NodeFunctionality::SCSCF,
        rfgwd::session::RecordType::Start,
        json!({ "Accounting-Record-Type": 2 }),
        300,
        false,
        1,
    );
    msg.ccfs = vec!["c1.example.com".to_string()];
    manager.handle(msg).await;

    let sess = local.get(&key("timerless-call")).await.unwrap().unwrap();
    assert_eq!(sess.timer_id, NO_TIMER);
}
