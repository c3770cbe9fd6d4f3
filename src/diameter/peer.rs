//! Diameter peer connections.
//!
//! One TCP connection per CCF peer, established on first use with a
//! capability exchange and kept alive by answering the peer's device
//! watchdogs. Outstanding transactions are correlated by hop-by-hop id. A
//! peer that cannot be reached is blacklisted for a configurable window so
//! failover does not wait on a dead link twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::telemetry::health::CommMonitor;

use super::avp::{Avp, AvpValue, DiameterMessage, Header, CMD_FLAG_REQUEST};
use super::dictionary::{code, command};
use super::rf::{AccountingAnswer, AccountingRequest};
use super::{result_code, DiameterClient, DiameterError, RF_APPLICATION_ID};

/// Default Diameter port.
const DIAMETER_PORT: u16 = 3868;

/// How long to wait for connect plus capability exchange.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type PendingMap = StdMutex<HashMap<u32, oneshot::Sender<DiameterMessage>>>;

/// One connected peer.
struct Peer {
    address: String,
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<PendingMap>,
    next_hop_by_hop: AtomicU32,
    next_end_to_end: AtomicU32,
}

impl Peer {
    /// Connect and perform the capability exchange.
    async fn connect(
        address: &str,
        origin_host: &str,
        origin_realm: &str,
    ) -> Result<Arc<Self>, DiameterError> {
        let target = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, DIAMETER_PORT)
        };

        debug!(peer = %address, "connecting to Diameter peer");

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target))
            .await
            .map_err(|_| DiameterError::UnableToDeliver(address.to_string()))?
            .map_err(|e| {
                debug!(peer = %address, error = %e, "connect failed");
                DiameterError::UnableToDeliver(address.to_string())
            })?;

        stream
            .set_nodelay(true)
            .map_err(|e| DiameterError::UnableToDeliver(format!("{}: {}", address, e)))?;

        let local_ip = stream.local_addr().ok().map(|a| a.ip());
        let (mut read_half, mut write_half) = stream.into_split();

        // Capability exchange before anything else.
        let cer = capability_exchange_request(origin_host, origin_realm, local_ip);
        write_half
            .write_all(&cer.encode(0, 0))
            .await
            .map_err(|_| DiameterError::UnableToDeliver(address.to_string()))?;

        let cea = tokio::time::timeout(CONNECT_TIMEOUT, read_frame(&mut read_half))
            .await
            .map_err(|_| DiameterError::UnableToDeliver(address.to_string()))??;
        let cea = DiameterMessage::decode(cea)?;

        let cea_result = cea
            .find(code::RESULT_CODE)
            .and_then(|a| a.as_u32())
            .unwrap_or(0);
        if cea.header.command_code != command::CAPABILITIES_EXCHANGE
            || cea_result != result_code::DIAMETER_SUCCESS
        {
            warn!(peer = %address, result = cea_result, "capability exchange rejected");
            return Err(DiameterError::UnableToDeliver(address.to_string()));
        }

        info!(peer = %address, "Diameter peer connected");

        let peer = Arc::new(Self {
            address: address.to_string(),
            writer: Mutex::new(write_half),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            next_hop_by_hop: AtomicU32::new(1),
            next_end_to_end: AtomicU32::new(rand::random()),
        });

        peer.clone().spawn_reader(read_half, origin_host, origin_realm);

        Ok(peer)
    }

    /// Read answers and watchdogs until the connection drops.
    fn spawn_reader(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        origin_host: &str,
        origin_realm: &str,
    ) {
        let origin_host = origin_host.to_string();
        let origin_realm = origin_realm.to_string();

        tokio::spawn(async move {
            loop {
                let frame = match read_frame(&mut read_half).await {
                    Ok(f) => f,
                    Err(e) => {
                        debug!(peer = %self.address, error = %e, "peer connection closed");
                        break;
                    }
                };

                let msg = match DiameterMessage::decode(frame) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(peer = %self.address, error = %e, "dropping undecodable frame");
                        continue;
                    }
                };

                if msg.header.is_request() {
                    if msg.header.command_code == command::DEVICE_WATCHDOG {
                        trace!(peer = %self.address, "answering device watchdog");
                        let dwa = device_watchdog_answer(&msg, &origin_host, &origin_realm);
                        let bytes = dwa.encode(msg.header.hop_by_hop, msg.header.end_to_end);
                        let mut writer = self.writer.lock().await;
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    } else {
                        debug!(
                            peer = %self.address,
                            command = msg.header.command_code,
                            "ignoring unexpected request from peer"
                        );
                    }
                    continue;
                }

                let waiter = self.pending.lock().unwrap().remove(&msg.header.hop_by_hop);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => trace!(
                        peer = %self.address,
                        hop_by_hop = msg.header.hop_by_hop,
                        "answer for unknown transaction (likely timed out)"
                    ),
                }
            }

            // Wake every outstanding transaction; dropping the senders
            // surfaces the broken link as a delivery failure.
            self.pending.lock().unwrap().clear();
        });
    }

    /// Send one request and wait for its answer.
    async fn transact(
        &self,
        bytes: Vec<u8>,
        hop_by_hop: u32,
        timeout: Duration,
    ) -> Result<DiameterMessage, DiameterError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(hop_by_hop, tx);

        {
            let mut writer = self.writer.lock().await;
            if writer.write_all(&bytes).await.is_err() {
                self.pending.lock().unwrap().remove(&hop_by_hop);
                return Err(DiameterError::UnableToDeliver(self.address.clone()));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => {
                // Reader task dropped the sender: link went down.
                Err(DiameterError::UnableToDeliver(self.address.clone()))
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(&hop_by_hop);
                Err(DiameterError::Timeout)
            }
        }
    }

    fn next_ids(&self) -> (u32, u32) {
        (
            self.next_hop_by_hop.fetch_add(1, Ordering::Relaxed),
            self.next_end_to_end.fetch_add(1, Ordering::Relaxed),
        )
    }
}

/// Read one length-framed Diameter message.
async fn read_frame(read_half: &mut OwnedReadHalf) -> Result<Bytes, DiameterError> {
    let mut head = [0u8; 4];
    read_half
        .read_exact(&mut head)
        .await
        .map_err(|e| DiameterError::Codec(format!("read: {}", e)))?;

    let total_len =
        ((head[1] as usize) << 16) | ((head[2] as usize) << 8) | head[3] as usize;
    if !(20..=1 << 20).contains(&total_len) {
        return Err(DiameterError::Codec(format!("implausible frame length {}", total_len)));
    }

    let mut rest = vec![0u8; total_len - 4];
    read_half
        .read_exact(&mut rest)
        .await
        .map_err(|e| DiameterError::Codec(format!("read: {}", e)))?;

    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&head);
    frame.extend_from_slice(&rest);
    Ok(Bytes::from(frame))
}

fn capability_exchange_request(
    origin_host: &str,
    origin_realm: &str,
    local_ip: Option<std::net::IpAddr>,
) -> DiameterMessage {
    let mut avps = vec![
        Avp::new(code::ORIGIN_HOST, None, AvpValue::Utf8(origin_host.to_string())),
        Avp::new(code::ORIGIN_REALM, None, AvpValue::Utf8(origin_realm.to_string())),
        Avp::new(code::VENDOR_ID, None, AvpValue::Unsigned32(0)),
        Avp::new(code::PRODUCT_NAME, None, AvpValue::Utf8("rfgwd".to_string())),
        Avp::new(
            code::ACCT_APPLICATION_ID,
            None,
            AvpValue::Unsigned32(RF_APPLICATION_ID),
        ),
    ];

    if let Some(ip) = local_ip {
        // Host-IP-Address is an Address AVP: 2-octet family then the raw
        // address bytes.
        let mut addr = Vec::new();
        match ip {
            std::net::IpAddr::V4(v4) => {
                addr.extend_from_slice(&1u16.to_be_bytes());
                addr.extend_from_slice(&v4.octets());
            }
            std::net::IpAddr::V6(v6) => {
                addr.extend_from_slice(&2u16.to_be_bytes());
                addr.extend_from_slice(&v6.octets());
            }
        }
        avps.push(Avp::new(code::HOST_IP_ADDRESS, None, AvpValue::OctetString(addr)));
    }

    DiameterMessage {
        header: Header::new(command::CAPABILITIES_EXCHANGE, 0, CMD_FLAG_REQUEST),
        avps,
    }
}

fn device_watchdog_answer(
    dwr: &DiameterMessage,
    origin_host: &str,
    origin_realm: &str,
) -> DiameterMessage {
    DiameterMessage {
        header: Header::new(command::DEVICE_WATCHDOG, dwr.header.application_id, 0),
        avps: vec![
            Avp::new(
                code::RESULT_CODE,
                None,
                AvpValue::Unsigned32(result_code::DIAMETER_SUCCESS),
            ),
            Avp::new(code::ORIGIN_HOST, None, AvpValue::Utf8(origin_host.to_string())),
            Avp::new(code::ORIGIN_REALM, None, AvpValue::Utf8(origin_realm.to_string())),
        ],
    }
}

/// Manages the set of connected peers.
pub struct PeerManager {
    origin_host: String,
    origin_realm: String,
    max_peers: usize,
    blacklist_duration: Duration,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    blacklist: StdMutex<HashMap<String, Instant>>,
    monitor: Arc<CommMonitor>,
}

impl PeerManager {
    pub fn new(
        origin_host: impl Into<String>,
        origin_realm: impl Into<String>,
        max_peers: usize,
        blacklist_duration: Duration,
        monitor: Arc<CommMonitor>,
    ) -> Self {
        Self {
            origin_host: origin_host.into(),
            origin_realm: origin_realm.into(),
            max_peers: max_peers.max(1),
            blacklist_duration,
            peers: Mutex::new(HashMap::new()),
            blacklist: StdMutex::new(HashMap::new()),
            monitor,
        }
    }

    fn check_blacklist(&self, peer: &str) -> Result<(), DiameterError> {
        let mut blacklist = self.blacklist.lock().unwrap();
        match blacklist.get(peer) {
            Some(until) if *until > Instant::now() => {
                trace!(peer, "peer is blacklisted");
                Err(DiameterError::UnableToDeliver(peer.to_string()))
            }
            Some(_) => {
                blacklist.remove(peer);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn blacklist_peer(&self, peer: &str) {
        warn!(
            peer,
            blacklist_secs = self.blacklist_duration.as_secs(),
            "blacklisting Diameter peer"
        );
        self.blacklist
            .lock()
            .unwrap()
            .insert(peer.to_string(), Instant::now() + self.blacklist_duration);
    }

    async fn peer_for(&self, address: &str) -> Result<Arc<Peer>, DiameterError> {
        self.check_blacklist(address)?;

        {
            let peers = self.peers.lock().await;
            if let Some(peer) = peers.get(address) {
                return Ok(peer.clone());
            }
        }

        let peer = match Peer::connect(address, &self.origin_host, &self.origin_realm).await {
            Ok(p) => p,
            Err(e) => {
                self.blacklist_peer(address);
                self.monitor.failure();
                return Err(e);
            }
        };

        let mut peers = self.peers.lock().await;
        // Respect the connection bound; drop the oldest entry to make room.
        if peers.len() >= self.max_peers && !peers.contains_key(address) {
            if let Some(evict) = peers.keys().next().cloned() {
                debug!(peer = %evict, "evicting peer to respect max_peers");
                peers.remove(&evict);
            }
        }
        peers.insert(address.to_string(), peer.clone());

        Ok(peer)
    }

    async fn drop_peer(&self, address: &str) {
        self.peers.lock().await.remove(address);
    }
}

#[async_trait]
impl DiameterClient for PeerManager {
    async fn send_acr(
        &self,
        peer: &str,
        acr: &AccountingRequest,
        timeout: Duration,
    ) -> Result<AccountingAnswer, DiameterError> {
        let conn = self.peer_for(peer).await?;

        let (hop_by_hop, end_to_end) = conn.next_ids();
        let bytes = acr.encode(hop_by_hop, end_to_end);

        match conn.transact(bytes, hop_by_hop, timeout).await {
            Ok(answer) => {
                self.monitor.success();
                Ok(AccountingAnswer::from_message(&answer))
            }
            Err(DiameterError::Timeout) => {
                self.monitor.failure();
                Err(DiameterError::Timeout)
            }
            Err(e) => {
                // The link is broken; reconnect on the next attempt.
                self.drop_peer(peer).await;
                self.blacklist_peer(peer);
                self.monitor.failure();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_peer_is_blacklisted() {
        let manager = PeerManager::new(
            "rfgw-1.example.com",
            "example.com",
            2,
            Duration::from_secs(60),
            Arc::new(CommMonitor::new("cdf")),
        );

        let acr = AccountingRequest::new(
            "s;1;1",
            "rfgw-1.example.com",
            "example.com",
            "peer",
            "realm",
            1,
            &serde_json::json!({}),
        );

        // 192.0.2.0/24 is TEST-NET; connects fail.
        let err = manager
            .send_acr("192.0.2.1:3868", &acr, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DiameterError::UnableToDeliver(_)));

        // Second attempt fails fast off the blacklist.
        let start = Instant::now();
        let err = manager
            .send_acr("192.0.2.1:3868", &acr, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DiameterError::UnableToDeliver(_)));
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
