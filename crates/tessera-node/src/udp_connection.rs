//! Reliable UDP connection.
//!
//! `ReliableState` is the whole protocol with no IO: callers feed it inbound
//! messages and the current time, then drain what it wants sent and what it
//! wants delivered. `ConnectionTask` is the async driver that owns one state
//! machine, the shared socket link and the routing entry for the connection.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{Instant, MissedTickBehavior};

use tessera_protocol::{
    random_id, ConnectionEnvelope, ConnectionMessage, HandshakeMessage, TransportParams, UdpEnvelope, ID_LEN,
};

use crate::congestion::{CongestionController, CongestionParams};
use crate::seen_ids::SeenIds;
use crate::transport::{ConnectionCommand, ConnectionEnds, TransportError};
use crate::udp_link::FramedUdpLink;

/// Payload of the keepalive message. Never delivered upward.
pub const KEEPALIVE_PAYLOAD: &[u8] = b"udpKeepAlive";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Local,
    Remote,
    RetriesExhausted,
    IdleTimeout,
    ConnectTimeout,
}

#[derive(Debug)]
struct Outgoing {
    id: String,
    payload: Bytes,
    num_tries: u32,
}

#[derive(Debug)]
struct InFlight {
    msg: Outgoing,
    sent_at: Instant,
    retry_at: Instant,
}

pub struct ReliableState {
    id: String,
    state: ConnectionState,
    params: TransportParams,
    controller: CongestionController,
    /// Retransmissions; always drained before `normal`.
    priority: VecDeque<Outgoing>,
    normal: VecDeque<Outgoing>,
    unconfirmed: HashMap<String, InFlight>,
    seen: SeenIds,
    last_sent: Instant,
    last_received: Instant,
    last_prune: Instant,
    pacing_until: Option<Instant>,
    outbox: VecDeque<ConnectionMessage>,
    deliveries: VecDeque<Bytes>,
    close_reason: Option<CloseReason>,
}

impl ReliableState {
    fn new(
        id: String,
        state: ConnectionState,
        params: TransportParams,
        congestion: CongestionParams,
        now: Instant,
    ) -> Self {
        Self {
            id,
            state,
            controller: CongestionController::new(congestion, now),
            priority: VecDeque::new(),
            normal: VecDeque::new(),
            unconfirmed: HashMap::new(),
            seen: SeenIds::new(params.dedup_capacity, Duration::from_millis(params.dedup_ttl_ms)),
            last_sent: now,
            last_received: now,
            last_prune: now,
            pacing_until: None,
            outbox: VecDeque::new(),
            deliveries: VecDeque::new(),
            close_reason: None,
            params,
        }
    }

    /// An outgoing connection, waiting for `acceptConnection`.
    pub fn outgoing(id: String, params: TransportParams, congestion: CongestionParams, now: Instant) -> Self {
        Self::new(id, ConnectionState::Pending, params, congestion, now)
    }

    /// An incoming connection; open as soon as it exists.
    pub fn incoming(id: String, params: TransportParams, congestion: CongestionParams, now: Instant) -> Self {
        Self::new(id, ConnectionState::Open, params, congestion, now)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn controller(&self) -> &CongestionController {
        &self.controller
    }

    pub fn unconfirmed_count(&self) -> usize {
        self.unconfirmed.len()
    }

    pub fn queued_count(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    /// The remote accepted. Flushes anything queued while pending.
    pub fn open(&mut self, now: Instant) {
        if self.state != ConnectionState::Pending {
            return;
        }
        self.state = ConnectionState::Open;
        self.last_received = now;
        self.last_sent = now;
        self.pump(now);
    }

    /// Queue one application message.
    pub fn enqueue(&mut self, payload: Bytes, now: Instant) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.normal.push_back(Outgoing {
            id: random_id(ID_LEN),
            payload,
            num_tries: 1,
        });
        self.pump(now);
        Ok(())
    }

    /// Release queued messages while the controller allows it.
    fn pump(&mut self, now: Instant) {
        if self.state != ConnectionState::Open {
            return;
        }
        if self.pacing_until.is_some_and(|t| now < t) {
            return;
        }
        self.pacing_until = None;

        loop {
            let next_len = match self.priority.front().or_else(|| self.normal.front()) {
                Some(msg) => msg.payload.len(),
                None => return,
            };
            let delay_ms = self.controller.estimate_delay_ms(next_len);
            if delay_ms > 0.0 {
                let wait = Duration::from_secs_f64(delay_ms / 1000.0)
                    + Duration::from_millis(self.params.pacing_slack_ms);
                self.pacing_until = Some(now + wait);
                return;
            }
            let Some(msg) = self.priority.pop_front().or_else(|| self.normal.pop_front()) else {
                return;
            };
            self.transmit(msg, now);
        }
    }

    fn transmit(&mut self, msg: Outgoing, now: Instant) {
        self.controller.report_sent(msg.payload.len(), &msg.id);
        self.outbox.push_back(ConnectionMessage::Message {
            udp_message_id: msg.id.clone(),
            payload: msg.payload.to_vec(),
        });
        self.last_sent = now;
        let retry_after = self.controller.estimated_rtt().mul_f64(self.params.retry_rtt_multiplier);
        self.unconfirmed.insert(
            msg.id.clone(),
            InFlight {
                msg,
                sent_at: now,
                retry_at: now + retry_after,
            },
        );
    }

    /// Handle one message addressed to this connection.
    pub fn on_message(&mut self, message: ConnectionMessage, now: Instant) {
        if self.is_closed() {
            return;
        }
        self.last_received = now;
        match message {
            ConnectionMessage::Message { udp_message_id, payload } => {
                // Acknowledge first: our previous confirm may have been lost.
                self.outbox.push_back(ConnectionMessage::ConfirmUdpMessage {
                    udp_message_id: udp_message_id.clone(),
                });
                if !self.seen.insert(&udp_message_id, now) {
                    return;
                }
                if payload == KEEPALIVE_PAYLOAD {
                    return;
                }
                self.deliveries.push_back(Bytes::from(payload));
            }
            ConnectionMessage::ConfirmUdpMessage { udp_message_id } => {
                if let Some(inflight) = self.unconfirmed.remove(&udp_message_id) {
                    let rtt_ms = now.saturating_duration_since(inflight.sent_at).as_secs_f64() * 1000.0;
                    self.controller
                        .report_confirmed(inflight.msg.payload.len(), rtt_ms, &udp_message_id);
                    self.pump(now);
                }
            }
            ConnectionMessage::Close => self.close(false, CloseReason::Remote),
        }
    }

    /// Pacing and retransmission timers.
    pub fn on_timers(&mut self, now: Instant) {
        if self.is_closed() {
            return;
        }
        let due: Vec<String> = self
            .unconfirmed
            .iter()
            .filter(|(_, f)| f.retry_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            let Some(inflight) = self.unconfirmed.remove(&id) else {
                continue;
            };
            let mut msg = inflight.msg;
            if msg.num_tries >= self.params.max_udp_tries {
                tracing::warn!(
                    connection = %self.id,
                    tries = msg.num_tries,
                    "udp: message never confirmed, closing connection"
                );
                self.close(true, CloseReason::RetriesExhausted);
                return;
            }
            self.controller.report_lost(msg.payload.len(), &msg.id);
            msg.num_tries += 1;
            self.priority.push_back(msg);
        }
        self.pump(now);
    }

    /// Periodic tick: idle close, keepalive, trial rollover, dedup pruning.
    pub fn on_housekeeping(&mut self, now: Instant) {
        if self.state != ConnectionState::Open {
            return;
        }
        let idle_timeout = Duration::from_millis(self.params.receive_idle_timeout_ms);
        if now.saturating_duration_since(self.last_received) >= idle_timeout {
            tracing::info!(connection = %self.id, "udp: nothing received for {idle_timeout:?}, closing");
            self.close(true, CloseReason::IdleTimeout);
            return;
        }
        let keepalive_after = Duration::from_millis(self.params.keepalive_idle_ms);
        if now.saturating_duration_since(self.last_sent) >= keepalive_after && self.queued_count() == 0 {
            self.normal.push_back(Outgoing {
                id: random_id(ID_LEN),
                payload: Bytes::from_static(KEEPALIVE_PAYLOAD),
                num_tries: 1,
            });
        }
        self.controller.tick(now);
        if now.saturating_duration_since(self.last_prune) >= Duration::from_millis(self.params.dedup_prune_interval_ms) {
            self.seen.prune(now);
            self.last_prune = now;
        }
        self.pump(now);
    }

    /// Close the connection. Only the first call has any effect; `notify`
    /// queues a best-effort close notice for the remote.
    pub fn close(&mut self, notify: bool, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        if notify && self.state == ConnectionState::Open {
            self.outbox.push_back(ConnectionMessage::Close);
        }
        self.state = ConnectionState::Closed;
        self.close_reason = Some(reason);
        self.controller.halt();
        self.priority.clear();
        self.normal.clear();
        self.unconfirmed.clear();
        self.pacing_until = None;
    }

    /// Earliest pacing or retransmission deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        let retry = self.unconfirmed.values().map(|f| f.retry_at).min();
        match (self.pacing_until, retry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn drain_outbox(&mut self) -> VecDeque<ConnectionMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_deliveries(&mut self) -> VecDeque<Bytes> {
        std::mem::take(&mut self.deliveries)
    }
}

// ============================================================================
// Driver
// ============================================================================

/// What the UDP receive loop hands to a connection task.
#[derive(Debug)]
pub enum ConnectionInput {
    Accepted,
    Message(ConnectionMessage),
}

/// Routing entry: which remote owns a connection id, and its task's inbox.
#[derive(Debug, Clone)]
pub struct Route {
    pub remote: SocketAddr,
    pub tx: mpsc::UnboundedSender<ConnectionInput>,
}

pub type Routes = Arc<RwLock<HashMap<String, Route>>>;

pub struct ConnectionTask {
    pub state: ReliableState,
    pub remote: SocketAddr,
    pub link: FramedUdpLink,
    pub ends: ConnectionEnds,
    pub input: mpsc::UnboundedReceiver<ConnectionInput>,
    pub routes: Routes,
    /// Completed once an outgoing connection opens or fails.
    pub opened: Option<oneshot::Sender<Result<(), TransportError>>>,
}

impl ConnectionTask {
    pub async fn run(mut self) {
        let params = self.state.params;
        let mut housekeeping = tokio::time::interval(Duration::from_millis(params.housekeeping_interval_ms));
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut open_retry = tokio::time::interval(Duration::from_millis(params.open_retransmit_ms));
        open_retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let connect_timeout = Duration::from_millis(params.connect_timeout_ms);
        let connect_deadline = Instant::now() + connect_timeout;

        loop {
            self.flush().await;
            if self.state.is_closed() {
                break;
            }
            let pending = self.state.state() == ConnectionState::Pending;
            let deadline = self
                .state
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                cmd = self.ends.commands.recv() => {
                    let now = Instant::now();
                    match cmd {
                        Some(ConnectionCommand::Send(payload)) => {
                            if let Err(e) = self.state.enqueue(payload, now) {
                                tracing::debug!(connection = %self.state.id(), "udp: send dropped: {e}");
                            }
                        }
                        Some(ConnectionCommand::Close) | None => {
                            self.state.close(true, CloseReason::Local);
                        }
                    }
                }
                input = self.input.recv() => {
                    let now = Instant::now();
                    match input {
                        Some(ConnectionInput::Accepted) => {
                            if pending {
                                self.state.open(now);
                                tracing::debug!(connection = %self.state.id(), remote = %self.remote, "udp: connection accepted");
                                if let Some(tx) = self.opened.take() {
                                    let _ = tx.send(Ok(()));
                                }
                            }
                        }
                        Some(ConnectionInput::Message(message)) => self.state.on_message(message, now),
                        None => self.state.close(false, CloseReason::Local),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.state.on_timers(Instant::now());
                }
                _ = housekeeping.tick() => {
                    self.state.on_housekeeping(Instant::now());
                }
                _ = open_retry.tick(), if pending => {
                    let now = Instant::now();
                    if now >= connect_deadline {
                        tracing::debug!(connection = %self.state.id(), remote = %self.remote, "udp: connect timed out");
                        self.state.close(false, CloseReason::ConnectTimeout);
                        if let Some(tx) = self.opened.take() {
                            let _ = tx.send(Err(TransportError::ConnectTimeout(connect_timeout)));
                        }
                    } else {
                        let open = UdpEnvelope::Handshake(HandshakeMessage::OpenConnection {
                            connection_id: self.state.id().to_string(),
                        });
                        self.link.send_envelope(self.remote, &open).await;
                    }
                }
            }
        }

        self.flush().await;
        self.ends.finish();
        self.routes.write().await.remove(self.state.id());
        if let Some(tx) = self.opened.take() {
            let _ = tx.send(Err(TransportError::Closed));
        }
        tracing::debug!(
            connection = %self.state.id(),
            remote = %self.remote,
            reason = ?self.state.close_reason(),
            "udp: connection closed"
        );
    }

    async fn flush(&mut self) {
        for payload in self.state.drain_deliveries() {
            self.ends.deliver(payload);
        }
        for message in self.state.drain_outbox() {
            let envelope = UdpEnvelope::Connection(ConnectionEnvelope {
                connection_id: self.state.id().to_string(),
                message,
            });
            self.link.send_envelope(self.remote, &envelope).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_protocol::DEFAULT_PARAMS;

    fn open_state(now: Instant) -> ReliableState {
        ReliableState::incoming("abcdefghij".into(), DEFAULT_PARAMS, CongestionParams::default(), now)
    }

    fn sent_ids(state: &mut ReliableState) -> Vec<String> {
        state
            .drain_outbox()
            .into_iter()
            .filter_map(|m| match m {
                ConnectionMessage::Message { udp_message_id, .. } => Some(udp_message_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_pending_queues_until_open() {
        let now = Instant::now();
        let mut s = ReliableState::outgoing("abcdefghij".into(), DEFAULT_PARAMS, CongestionParams::default(), now);
        s.enqueue(Bytes::from_static(b"one"), now).unwrap();
        s.enqueue(Bytes::from_static(b"two"), now).unwrap();
        assert!(s.drain_outbox().is_empty());
        assert_eq!(s.queued_count(), 2);

        s.open(now);
        assert_eq!(s.state(), ConnectionState::Open);
        assert_eq!(sent_ids(&mut s).len(), 2);
        assert_eq!(s.unconfirmed_count(), 2);
    }

    #[test]
    fn test_duplicate_acknowledged_twice_delivered_once() {
        let now = Instant::now();
        let mut s = open_state(now);
        let msg = ConnectionMessage::Message {
            udp_message_id: "0123456789".into(),
            payload: b"hello".to_vec(),
        };
        s.on_message(msg.clone(), now);
        s.on_message(msg, now + Duration::from_millis(10));

        let confirms = s
            .drain_outbox()
            .into_iter()
            .filter(|m| matches!(m, ConnectionMessage::ConfirmUdpMessage { udp_message_id } if udp_message_id == "0123456789"))
            .count();
        assert_eq!(confirms, 2);
        assert_eq!(s.drain_deliveries(), vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn test_keepalive_confirmed_not_delivered() {
        let now = Instant::now();
        let mut s = open_state(now);
        s.on_message(
            ConnectionMessage::Message {
                udp_message_id: "0123456789".into(),
                payload: KEEPALIVE_PAYLOAD.to_vec(),
            },
            now,
        );
        assert_eq!(s.drain_outbox().len(), 1);
        assert!(s.drain_deliveries().is_empty());
    }

    #[test]
    fn test_confirm_records_rtt_and_clears_retry() {
        let now = Instant::now();
        let mut s = open_state(now);
        s.enqueue(Bytes::from_static(b"x"), now).unwrap();
        let id = sent_ids(&mut s).remove(0);
        assert!(s.next_deadline().is_some());

        s.on_message(ConnectionMessage::ConfirmUdpMessage { udp_message_id: id }, now + Duration::from_millis(40));
        assert_eq!(s.unconfirmed_count(), 0);
        assert!(s.next_deadline().is_none());
        assert_eq!(s.controller().outstanding_bytes(), 0);
    }

    #[test]
    fn test_retry_bound_closes_after_six_tries() {
        let start = Instant::now();
        let mut s = open_state(start);
        s.enqueue(Bytes::from_static(b"lost forever"), start).unwrap();

        let mut transmissions = sent_ids(&mut s).len();
        let mut now = start;
        while !s.is_closed() {
            now = s.next_deadline().expect("retry pending");
            s.on_timers(now);
            let out = s.drain_outbox();
            transmissions += out
                .iter()
                .filter(|m| matches!(m, ConnectionMessage::Message { .. }))
                .count();
            if s.is_closed() {
                assert!(matches!(out.back(), Some(ConnectionMessage::Close)));
            }
        }
        assert_eq!(transmissions, 6);
        assert_eq!(s.close_reason(), Some(CloseReason::RetriesExhausted));
        // 6 tries at 4 x 200ms apart
        assert_eq!(now - start, Duration::from_millis(6 * 800));
        assert!(s.enqueue(Bytes::from_static(b"late"), now).is_err());
        s.on_timers(now + Duration::from_secs(10));
        assert!(s.drain_outbox().is_empty());
    }

    #[test]
    fn test_retransmission_reported_lost_and_same_id_reused() {
        let now = Instant::now();
        let mut s = open_state(now);
        s.enqueue(Bytes::from_static(b"x"), now).unwrap();
        let first = sent_ids(&mut s);
        let due = s.next_deadline().unwrap();
        s.on_timers(due);
        let second = sent_ids(&mut s);
        assert_eq!(first, second);
        assert_eq!(s.unconfirmed_count(), 1);
    }

    #[test]
    fn test_pacing_holds_messages_beyond_window() {
        let now = Instant::now();
        let mut s = open_state(now);
        // Window = 3_000_000 / 1000 * 200 = 600_000 bytes
        for _ in 0..100 {
            s.enqueue(Bytes::from(vec![0u8; 10_000]), now).unwrap();
        }
        assert_eq!(sent_ids(&mut s).len(), 60);
        assert_eq!(s.queued_count(), 40);

        let pacing = s.next_deadline().unwrap();
        assert!(pacing > now && pacing < now + Duration::from_millis(20));
        // Nothing confirmed: the window is still full after the delay
        s.on_timers(pacing);
        assert!(sent_ids(&mut s).is_empty());

        let ids: Vec<String> = s.unconfirmed.keys().take(10).cloned().collect();
        for id in ids {
            s.on_message(ConnectionMessage::ConfirmUdpMessage { udp_message_id: id }, pacing);
        }
        // Pacing timer still armed; released on the next timer pass
        s.on_timers(s.next_deadline().unwrap());
        assert_eq!(sent_ids(&mut s).len(), 10);
    }

    #[test]
    fn test_idle_timeout_closes_with_notice() {
        let now = Instant::now();
        let mut s = open_state(now);
        s.on_housekeeping(now + Duration::from_secs(59));
        assert!(!s.is_closed());
        s.drain_outbox();
        s.on_housekeeping(now + Duration::from_secs(60));
        assert!(s.is_closed());
        assert_eq!(s.close_reason(), Some(CloseReason::IdleTimeout));
        assert!(matches!(s.drain_outbox().back(), Some(ConnectionMessage::Close)));
    }

    #[test]
    fn test_keepalive_after_send_idle() {
        let now = Instant::now();
        let mut s = open_state(now);
        s.on_housekeeping(now + Duration::from_secs(4));
        assert!(s.drain_outbox().is_empty());
        s.on_housekeeping(now + Duration::from_secs(5));
        let out = s.drain_outbox();
        assert!(matches!(
            out.front(),
            Some(ConnectionMessage::Message { payload, .. }) if payload == KEEPALIVE_PAYLOAD
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let now = Instant::now();
        let mut s = open_state(now);
        s.close(true, CloseReason::Local);
        s.close(true, CloseReason::Local);
        assert_eq!(s.drain_outbox().len(), 1);
        assert!(s.controller().is_halted());
        assert_eq!(s.close_reason(), Some(CloseReason::Local));
    }

    #[test]
    fn test_remote_close_sends_no_notice() {
        let now = Instant::now();
        let mut s = open_state(now);
        s.on_message(ConnectionMessage::Close, now);
        assert!(s.is_closed());
        assert!(s.drain_outbox().is_empty());
        assert_eq!(s.close_reason(), Some(CloseReason::Remote));
    }

    #[test]
    fn test_retransmissions_precede_new_messages() {
        let now = Instant::now();
        let mut s = open_state(now);
        // Fill the window so later messages wait in the normal queue
        for _ in 0..60 {
            s.enqueue(Bytes::from(vec![0u8; 10_000]), now).unwrap();
        }
        s.enqueue(Bytes::from(vec![1u8; 10_000]), now).unwrap();
        let first_batch = sent_ids(&mut s);
        assert_eq!(first_batch.len(), 60);

        // All 60 time out together: reported lost, queued with priority
        let due = now + Duration::from_millis(800);
        s.on_timers(due);
        let resent = sent_ids(&mut s);
        assert_eq!(resent.len(), 60);
        assert!(resent.iter().all(|id| first_batch.contains(id)));
        assert_eq!(s.queued_count(), 1);
    }
}
