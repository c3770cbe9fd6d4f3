//! The per-call session state machine.
//!
//! `handle` drives one message through the replicated stores and hands it to
//! the ACR sender; the sender's terminal outcome comes back through
//! `on_ccf_response`, which persists session state and keeps the interim
//! timer alive. Local CAS contention restarts `handle` from a fresh read,
//! bounded so two writers can never livelock.

use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::diameter::{result_code, AcrSender, CcfOutcome};
use crate::store::KvError;
use crate::telemetry::health::HealthChecker;
use crate::telemetry::metrics::counters;
use crate::timer::{TimerRequest, TimerService};

use super::store::SessionStore;
use super::types::{Message, Session, SessionKey};

/// Timer id stored when the timer service could not allocate one; later
/// Interims retry with a fresh create.
pub const NO_TIMER: &str = "NO_TIMER";

/// Bound on handle() restarts for one message when the local store keeps
/// returning CAS contention.
pub const MAX_CAS_RETRIES: u32 = 8;

/// Characters escaped when a Call-ID is embedded in a callback path.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

enum Prepared {
    /// Store work is done; send the ACR.
    Proceed,
    /// The message relates to no known session; drop it silently.
    Drop,
    /// The local store lost a CAS race; restart from a fresh read.
    Contention,
}

/// Drives START/INTERIM/STOP/EVENT against the replicated session stores.
pub struct SessionManager {
    local_store: Arc<SessionStore>,
    remote_stores: Vec<Arc<SessionStore>>,
    sender: Arc<AcrSender>,
    timers: Arc<dyn TimerService>,
    health: Arc<HealthChecker>,
}

impl SessionManager {
    pub fn new(
        local_store: Arc<SessionStore>,
        remote_stores: Vec<Arc<SessionStore>>,
        sender: Arc<AcrSender>,
        timers: Arc<dyn TimerService>,
        health: Arc<HealthChecker>,
    ) -> Self {
        Self {
            local_store,
            remote_stores,
            sender,
            timers,
            health,
        }
    }

    /// Process one message end to end: session bookkeeping, the ACR
    /// exchange, then the response handling. Consumes the message.
    pub async fn handle(&self, mut msg: Message) {
        let mut attempts = 0;

        loop {
            match self.prepare(&mut msg).await {
                Prepared::Proceed => break,
                Prepared::Drop => return,
                Prepared::Contention => {
                    counters::store_contention();
                    attempts += 1;
                    if attempts >= MAX_CAS_RETRIES {
                        error!(
                            call_id = %msg.call_id,
                            attempts,
                            "giving up on message after repeated CAS contention"
                        );
                        return;
                    }
                }
            }
        }

        let (outcome, msg) = self.sender.send(msg).await;
        self.on_ccf_response(outcome, msg).await;
    }

    /// Run the store side of the state machine for one attempt.
    async fn prepare(&self, msg: &mut Message) -> Prepared {
        if !msg.record_type.is_interim() && !msg.record_type.is_stop() {
            // First ACR in a session (or a sessionless EVENT): record
            // number 1, CCFs already on the message from the HTTP body.
            // Session id and interim interval arrive with the CDF answer.
            msg.accounting_record_number = 1;
            return Prepared::Proceed;
        }

        let key = msg.session_key();

        // This relates to an existing session. Reads fall through from the
        // local store to each remote; finding it only remotely means the
        // local write must resurrect it with add semantics.
        let mut new_session_in_local = false;
        let mut sess = self.local_store.get(&key).await.ok().flatten();

        if sess.is_none() {
            debug!(call_id = %msg.call_id, "session not found in local store, trying remote stores");
            new_session_in_local = true;

            for remote in &self.remote_stores {
                if let Ok(Some(found)) = remote.get(&key).await {
                    sess = Some(found);
                    break;
                }
            }
        }

        let Some(mut sess) = sess else {
            // No record of the session anywhere; ignore the request.
            info!(call_id = %msg.call_id, "session not found in any store, ignoring message");
            counters::session_not_found();
            return Prepared::Drop;
        };

        sess.acct_record_number += 1;

        if msg.record_type.is_interim() {
            match self
                .local_store
                .set(&key, &sess, new_session_in_local)
                .await
            {
                Err(KvError::Contention) => return Prepared::Contention,
                Err(KvError::Io(e)) => {
                    warn!(call_id = %msg.call_id, error = %e, "local session write failed")
                }
                Ok(()) => {}
            }

            for remote in &self.remote_stores {
                self.mirror_interim(remote, &key, &sess).await;
            }
        } else {
            info!(
                call_id = %msg.call_id,
                timer_id = %sess.timer_id,
                "received STOP, deleting session and timer"
            );

            match self.local_store.delete_cas(&key, &sess).await {
                Err(KvError::Contention) => return Prepared::Contention,
                Err(KvError::Io(e)) => {
                    warn!(call_id = %msg.call_id, error = %e, "local session delete failed")
                }
                Ok(()) => {}
            }

            for remote in &self.remote_stores {
                if let Err(e) = remote.delete(&key).await {
                    warn!(store = remote.label(), error = %e, "remote session delete failed");
                }
            }
            counters::session_deleted();

            if !sess.timer_id.is_empty() && sess.timer_id != NO_TIMER {
                match self.timers.cancel(&sess.timer_id).await {
                    Ok(()) => counters::timer_cancelled(),
                    Err(e) => {
                        counters::timer_failure();
                        warn!(timer_id = %sess.timer_id, error = %e, "timer cancel failed");
                    }
                }
            }
        }

        msg.accounting_record_number = sess.acct_record_number;
        msg.ccfs = sess.ccfs.clone();
        msg.session_id = sess.session_id.clone();
        msg.timer_id = sess.timer_id.clone();
        msg.interim_interval = sess.interim_interval;

        // The refresh window might not be filled in on the HTTP message;
        // when it is, the message value wins.
        if msg.session_refresh_time == 0 {
            msg.session_refresh_time = sess.session_refresh_time;
        }

        Prepared::Proceed
    }

    /// Mirror an Interim's record-number increment to one remote store,
    /// retrying contention once with a fresh read.
    async fn mirror_interim(&self, remote: &Arc<SessionStore>, key: &SessionKey, sess: &Session) {
        for _ in 0..2 {
            let (candidate, new_session) = match remote.get(key).await {
                Ok(Some(mut remote_sess)) => {
                    remote_sess.acct_record_number += 1;
                    (remote_sess, false)
                }
                Ok(None) => {
                    // This remote has no copy; replicate ours from scratch.
                    let mut fresh = sess.clone();
                    fresh.cas = 0;
                    (fresh, true)
                }
                Err(e) => {
                    warn!(store = remote.label(), error = %e, "remote session read failed");
                    return;
                }
            };

            match remote.set(key, &candidate, new_session).await {
                Ok(()) => return,
                Err(KvError::Contention) => continue,
                Err(KvError::Io(e)) => {
                    warn!(store = remote.label(), error = %e, "remote session write failed");
                    return;
                }
            }
        }

        debug!(store = remote.label(), "remote mirror abandoned after contention");
    }

    /// Terminal outcome of the ACR exchange. Invoked exactly once per
    /// message; consumes it.
    pub async fn on_ccf_response(&self, outcome: CcfOutcome, mut msg: Message) {
        let mut interim_interval = outcome.interim_interval;
        if interim_interval == 0 {
            // No interval on the answer: prefer the stored one, then the
            // session refresh time.
            interim_interval = if msg.interim_interval == 0 {
                msg.session_refresh_time
            } else {
                msg.interim_interval
            };
        }

        if outcome.accepted {
            if msg.record_type.is_interim()
                && !msg.timer_interim
                && msg.session_refresh_time > interim_interval
            {
                // Interim from the signalling layer: push the recurring
                // timer out. Timer pops reschedule themselves, so those
                // skip this.
                let previous_id = msg.timer_id.clone();
                if let Some(timer_id) = self.send_timer_update(&msg, interim_interval).await {
                    if timer_id != previous_id {
                        self.update_timer_id(&mut msg, timer_id).await;
                    }
                }
            } else if msg.record_type.is_start() {
                self.establish_session(&mut msg, interim_interval, &outcome.session_id)
                    .await;
            }

            // Successful ACAs are an indication of healthy behaviour.
            self.health.health_check_passed();
        } else {
            warn!(
                call_id = %msg.call_id,
                result_code = outcome.result_code,
                "received error from CDF"
            );

            if msg.record_type.is_interim() {
                if outcome.result_code == result_code::DIAMETER_UNKNOWN_SESSION_ID {
                    // The CDF has no record of this session; sending more
                    // records is pointless.
                    info!(call_id = %msg.call_id, "CDF answered 5002, purging session");
                    let key = msg.session_key();

                    if let Err(e) = self.local_store.delete(&key).await {
                        warn!(error = %e, "local session purge failed");
                    }
                    for remote in &self.remote_stores {
                        if let Err(e) = remote.delete(&key).await {
                            warn!(store = remote.label(), error = %e, "remote session purge failed");
                        }
                    }
                    counters::session_deleted();
                } else if !msg.timer_interim && msg.session_refresh_time > interim_interval {
                    // The CDF probably still knows the session, so keep the
                    // interims coming. Starts are different: a rejected
                    // Start records nothing.
                    let previous_id = msg.timer_id.clone();
                    if let Some(timer_id) = self.send_timer_update(&msg, interim_interval).await {
                        if timer_id != previous_id {
                            self.update_timer_id(&mut msg, timer_id).await;
                        }
                    }
                }
            }
        }

        // The message's journey ends here.
    }

    /// A Start was accepted: schedule the interim timer and write the new
    /// session everywhere.
    async fn establish_session(
        &self,
        msg: &mut Message,
        interim_interval: u32,
        session_id: &str,
    ) {
        let mut timer_id = NO_TIMER.to_string();

        if msg.session_refresh_time > interim_interval {
            let request = self.timer_request(msg, interim_interval);
            match self.timers.create(&request).await {
                Ok(id) => {
                    counters::timer_created();
                    timer_id = id;
                }
                Err(e) => {
                    counters::timer_failure();
                    error!(call_id = %msg.call_id, error = %e, "timer create failed");
                }
            }
        }

        msg.timer_id = timer_id.clone();

        info!(call_id = %msg.call_id, session_id, "writing session to store");

        let sess = Session {
            session_id: session_id.to_string(),
            ccfs: msg.ccfs.clone(),
            acct_record_number: msg.accounting_record_number,
            timer_id,
            session_refresh_time: msg.session_refresh_time,
            interim_interval,
            cas: 0,
        };

        let key = msg.session_key();

        // Unconditional adds: if one fails, this processing has already
        // been done elsewhere.
        if let Err(e) = self.local_store.set(&key, &sess, true).await {
            debug!(error = %e, "local session add failed");
        }
        for remote in &self.remote_stores {
            if let Err(e) = remote.set(&key, &sess, true).await {
                debug!(store = remote.label(), error = %e, "remote session add failed");
            }
        }

        counters::session_created();
    }

    /// Create or refresh the recurring interim timer, returning the id to
    /// carry forward.
    async fn send_timer_update(&self, msg: &Message, interim_interval: u32) -> Option<String> {
        let request = self.timer_request(msg, interim_interval);

        if msg.timer_id.is_empty() || msg.timer_id == NO_TIMER {
            // The initial create must have failed; retry to get a timer.
            match self.timers.create(&request).await {
                Ok(id) => {
                    counters::timer_created();
                    Some(id)
                }
                Err(e) => {
                    counters::timer_failure();
                    warn!(call_id = %msg.call_id, error = %e, "timer create retry failed");
                    None
                }
            }
        } else {
            debug!(
                call_id = %msg.call_id,
                timer_id = %msg.timer_id,
                interim_interval,
                "extending interim timer"
            );
            match self.timers.refresh(&msg.timer_id, &request).await {
                Ok(id) => {
                    counters::timer_refreshed();
                    Some(id)
                }
                Err(e) => {
                    counters::timer_failure();
                    warn!(call_id = %msg.call_id, error = %e, "timer refresh failed");
                    None
                }
            }
        }
    }

    /// Persist a replacement timer id to every store that still holds the
    /// session. Best effort: contention here just means another writer
    /// already moved the session on.
    async fn update_timer_id(&self, msg: &mut Message, timer_id: String) {
        let key = msg.session_key();
        msg.timer_id = timer_id.clone();

        let stores = std::iter::once(&self.local_store).chain(self.remote_stores.iter());
        for store in stores {
            match store.get(&key).await {
                Ok(Some(mut sess)) => {
                    sess.timer_id = timer_id.clone();
                    if let Err(e) = store.set(&key, &sess, false).await {
                        debug!(store = store.label(), error = %e, "timer id update skipped");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(store = store.label(), error = %e, "timer id update read failed")
                }
            }
        }
    }

    fn timer_request(&self, msg: &Message, interim_interval: u32) -> TimerRequest {
        TimerRequest::new(
            interim_interval,
            msg.session_refresh_time,
            callback_path(&msg.call_id),
            opaque_data(msg),
        )
    }
}

/// Callback path the timer service re-enters the gateway on.
pub fn callback_path(call_id: &str) -> String {
    format!(
        "/call-id/{}?timer-interim=true",
        utf8_percent_encode(call_id, PATH_SEGMENT)
    )
}

/// Minimal body sufficient to reconstruct an Interim when a timer pops.
fn opaque_data(msg: &Message) -> String {
    let doc = json!({
        "event": {
            "Service-Information": {
                "IMS-Information": {
                    "Role-Of-Node": msg.role.0,
                    "Node-Functionality": msg.function.0,
                }
            },
            "Accounting-Record-Type": 3,
        }
    });

    let body = doc.to_string();
    debug!(call_id = %msg.call_id, body = %body, "built INTERIM request body");
    body
}
