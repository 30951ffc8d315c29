//! PeerLink -- everything we hold for one remote node.
//!
//! Up to four sessions (incoming/outgoing x UDP/WebSocket), one of which is
//! picked for every send. Messages are tracked until the remote confirms
//! them and resent on a sweep; a peer that stays silent through
//! `max_peer_tries` attempts is disconnected entirely and reported lost.
//! Outgoing sessions are redialled per transport with exponential backoff.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use tessera_protocol::{random_id, NodeId, NodeToNodeMessage, PeerMessage, TransportParams, ID_LEN};

use crate::seen_ids::SeenIds;
use crate::session::{Session, SessionSender};
use crate::transport::{Direction, TransportError, TransportKind};

/// Where a remote node can be reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    pub udp_addr: Option<SocketAddr>,
    pub websocket_url: Option<String>,
}

impl RemoteInfo {
    fn knows(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Udp => self.udp_addr.is_some(),
            TransportKind::WebSocket => self.websocket_url.is_some(),
        }
    }
}

/// Opens authenticated outgoing sessions. Implemented by the node over the
/// UDP server and the WebSocket client.
pub trait Dialer: Send + Sync {
    fn dial(
        &self,
        kind: TransportKind,
        remote: &RemoteInfo,
        node_id: &str,
    ) -> BoxFuture<'static, Result<Session, TransportError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected {
        node_id: NodeId,
        kind: TransportKind,
        direction: Direction,
    },
    Disconnected {
        node_id: NodeId,
        kind: TransportKind,
        direction: Direction,
    },
    /// The last open session to the peer closed.
    Unreachable { node_id: NodeId },
    /// Confirmations stopped; every session was dropped.
    Lost { node_id: NodeId },
}

/// A deduplicated application message from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub from: NodeId,
    pub message: NodeToNodeMessage,
}

/// Exponential dial backoff.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn fail(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct Slot {
    session: SessionSender,
    connection_id: String,
}

#[derive(Default)]
struct Slots {
    outgoing_ws: Option<Slot>,
    incoming_ws: Option<Slot>,
    outgoing_udp: Option<Slot>,
    incoming_udp: Option<Slot>,
}

impl Slots {
    fn get_mut(&mut self, direction: Direction, kind: TransportKind) -> &mut Option<Slot> {
        match (direction, kind) {
            (Direction::Outgoing, TransportKind::WebSocket) => &mut self.outgoing_ws,
            (Direction::Incoming, TransportKind::WebSocket) => &mut self.incoming_ws,
            (Direction::Outgoing, TransportKind::Udp) => &mut self.outgoing_udp,
            (Direction::Incoming, TransportKind::Udp) => &mut self.incoming_udp,
        }
    }

    fn get(&self, direction: Direction, kind: TransportKind) -> Option<&Slot> {
        match (direction, kind) {
            (Direction::Outgoing, TransportKind::WebSocket) => self.outgoing_ws.as_ref(),
            (Direction::Incoming, TransportKind::WebSocket) => self.incoming_ws.as_ref(),
            (Direction::Outgoing, TransportKind::Udp) => self.outgoing_udp.as_ref(),
            (Direction::Incoming, TransportKind::Udp) => self.incoming_udp.as_ref(),
        }
        .filter(|slot| slot.session.is_open())
    }

    fn is_open(&self, direction: Direction, kind: TransportKind) -> bool {
        self.get(direction, kind).is_some()
    }

    fn preferred(&self, udp_first: bool) -> Option<&Slot> {
        const WS_FIRST: [(Direction, TransportKind); 4] = [
            (Direction::Outgoing, TransportKind::WebSocket),
            (Direction::Incoming, TransportKind::WebSocket),
            (Direction::Outgoing, TransportKind::Udp),
            (Direction::Incoming, TransportKind::Udp),
        ];
        const UDP_FIRST: [(Direction, TransportKind); 4] = [
            (Direction::Outgoing, TransportKind::Udp),
            (Direction::Incoming, TransportKind::Udp),
            (Direction::Outgoing, TransportKind::WebSocket),
            (Direction::Incoming, TransportKind::WebSocket),
        ];
        let order = if udp_first { &UDP_FIRST } else { &WS_FIRST };
        order.iter().find_map(|&(d, k)| self.get(d, k))
    }

    fn take_all(&mut self) -> Vec<(Direction, TransportKind, Slot)> {
        let mut taken = Vec::new();
        for (d, k) in [
            (Direction::Outgoing, TransportKind::WebSocket),
            (Direction::Incoming, TransportKind::WebSocket),
            (Direction::Outgoing, TransportKind::Udp),
            (Direction::Incoming, TransportKind::Udp),
        ] {
            if let Some(slot) = self.get_mut(d, k).take() {
                taken.push((d, k, slot));
            }
        }
        taken
    }
}

struct Unconfirmed {
    message: PeerMessage,
    last_sent: Instant,
    num_tries: u32,
}

struct DialState {
    backoff: Backoff,
    last_disconnect: Option<Instant>,
}

struct LinkState {
    slots: Slots,
    unconfirmed: HashMap<String, Unconfirmed>,
    seen: SeenIds,
    remote: RemoteInfo,
    remote_updated: Instant,
    udp: DialState,
    websocket: DialState,
    udp_first: bool,
}

impl LinkState {
    fn dial_state(&mut self, kind: TransportKind) -> &mut DialState {
        match kind {
            TransportKind::Udp => &mut self.udp,
            TransportKind::WebSocket => &mut self.websocket,
        }
    }
}

/// Connectivity snapshot for status queries.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LinkStatus {
    pub node_id: NodeId,
    pub incoming_udp: bool,
    pub outgoing_udp: bool,
    pub incoming_websocket: bool,
    pub outgoing_websocket: bool,
    pub unconfirmed_messages: usize,
    pub udp_addr: Option<String>,
    pub websocket_url: Option<String>,
}

pub struct PeerLink {
    remote_node_id: NodeId,
    params: TransportParams,
    state: Mutex<LinkState>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    events: broadcast::Sender<PeerEvent>,
    dialer: Arc<dyn Dialer>,
    halt: watch::Sender<bool>,
}

impl PeerLink {
    pub fn new(
        remote_node_id: NodeId,
        params: TransportParams,
        udp_first: bool,
        dialer: Arc<dyn Dialer>,
        inbound: mpsc::UnboundedSender<InboundMessage>,
        events: broadcast::Sender<PeerEvent>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let backoff = Backoff::new(
            Duration::from_millis(params.backoff_initial_ms),
            Duration::from_millis(params.backoff_max_ms),
        );
        let (halt, _) = watch::channel(false);
        Arc::new(Self {
            remote_node_id,
            state: Mutex::new(LinkState {
                slots: Slots::default(),
                unconfirmed: HashMap::new(),
                seen: SeenIds::new(params.dedup_capacity, Duration::from_millis(params.dedup_ttl_ms)),
                remote: RemoteInfo::default(),
                remote_updated: now,
                udp: DialState {
                    backoff,
                    last_disconnect: None,
                },
                websocket: DialState {
                    backoff,
                    last_disconnect: None,
                },
                udp_first,
            }),
            params,
            inbound,
            events,
            dialer,
            halt,
        })
    }

    /// Spawn the resend sweep and one dial loop per transport.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(self.clone().run_resend_loop(self.halt.subscribe()));
        for kind in [TransportKind::Udp, TransportKind::WebSocket] {
            tokio::spawn(self.clone().run_dial_loop(kind, self.halt.subscribe()));
        }
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn remote_node_id(&self) -> &str {
        &self.remote_node_id
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Install `session` in its slot, disconnecting whatever held it.
    pub fn set_connection(self: &Arc<Self>, direction: Direction, session: Session) {
        let kind = session.sender.handle().kind();
        let connection_id = session.sender.handle().id().to_string();
        {
            let mut st = self.state();
            let slot = st.slots.get_mut(direction, kind);
            if let Some(old) = slot.take() {
                tracing::debug!(peer = %self.remote_node_id, %kind, %direction, "peer: replacing connection");
                old.session.close();
            }
            *slot = Some(Slot {
                session: session.sender.clone(),
                connection_id: connection_id.clone(),
            });
            if direction == Direction::Outgoing {
                st.dial_state(kind).backoff.reset();
            }
        }
        tracing::info!(peer = %self.remote_node_id, %kind, %direction, "peer: connected");
        let _ = self.events.send(PeerEvent::Connected {
            node_id: self.remote_node_id.clone(),
            kind,
            direction,
        });

        let link = self.clone();
        let reply = session.sender;
        let mut receiver = session.receiver;
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                link.handle_inbound(message, &reply);
            }
            link.connection_closed(direction, kind, &connection_id);
        });
    }

    fn connection_closed(&self, direction: Direction, kind: TransportKind, connection_id: &str) {
        {
            let mut st = self.state();
            let slot = st.slots.get_mut(direction, kind);
            if !slot.as_ref().is_some_and(|s| s.connection_id == connection_id) {
                // Already replaced or torn down
                return;
            }
            *slot = None;
            st.dial_state(kind).last_disconnect = Some(Instant::now());
        }
        tracing::info!(peer = %self.remote_node_id, %kind, %direction, "peer: disconnected");
        let _ = self.events.send(PeerEvent::Disconnected {
            node_id: self.remote_node_id.clone(),
            kind,
            direction,
        });
        self.report_if_unreachable();
    }

    fn report_if_unreachable(&self) {
        if self.has_connection() {
            return;
        }
        tracing::info!(peer = %self.remote_node_id, "peer: no open sessions remain");
        let _ = self.events.send(PeerEvent::Unreachable {
            node_id: self.remote_node_id.clone(),
        });
    }

    /// Close every session.
    pub fn disconnect(&self) {
        let taken = {
            let mut st = self.state();
            let now = Instant::now();
            let taken = st.slots.take_all();
            for (_, kind, _) in &taken {
                st.dial_state(*kind).last_disconnect = Some(now);
            }
            taken
        };
        let any = !taken.is_empty();
        for (direction, kind, slot) in taken {
            slot.session.close();
            let _ = self.events.send(PeerEvent::Disconnected {
                node_id: self.remote_node_id.clone(),
                kind,
                direction,
            });
        }
        if any {
            self.report_if_unreachable();
        }
    }

    /// Stop background loops and close every session.
    pub fn halt(&self) {
        self.halt.send_replace(true);
        self.disconnect();
    }

    pub fn is_halted(&self) -> bool {
        *self.halt.borrow()
    }

    pub fn has_connection(&self) -> bool {
        self.state().slots.preferred(false).is_some()
    }

    pub fn is_connected(&self, direction: Direction, kind: TransportKind) -> bool {
        self.state().slots.is_open(direction, kind)
    }

    // ------------------------------------------------------------------
    // Remote info
    // ------------------------------------------------------------------

    /// Record fresh addresses for the remote. A changed address drops the
    /// outgoing session on that transport and redials soon.
    pub fn set_remote_addresses(&self, info: RemoteInfo) {
        let mut dropped = Vec::new();
        {
            let mut st = self.state();
            if st.remote.udp_addr.is_some() && st.remote.udp_addr != info.udp_addr {
                dropped.extend(st.slots.outgoing_udp.take().map(|s| (TransportKind::Udp, s)));
                st.udp.backoff.reset();
            }
            if st.remote.websocket_url.is_some() && st.remote.websocket_url != info.websocket_url {
                dropped.extend(st.slots.outgoing_ws.take().map(|s| (TransportKind::WebSocket, s)));
                st.websocket.backoff.reset();
            }
            st.remote = info;
            st.remote_updated = Instant::now();
        }
        let any = !dropped.is_empty();
        for (kind, slot) in dropped {
            tracing::info!(peer = %self.remote_node_id, %kind, "peer: remote address changed, reconnecting");
            slot.session.close();
            let _ = self.events.send(PeerEvent::Disconnected {
                node_id: self.remote_node_id.clone(),
                kind,
                direction: Direction::Outgoing,
            });
        }
        if any {
            self.report_if_unreachable();
        }
    }

    pub fn remote_info(&self) -> RemoteInfo {
        self.state().remote.clone()
    }

    /// When remote info was last refreshed.
    pub fn remote_updated(&self) -> Instant {
        self.state().remote_updated
    }

    pub fn status(&self) -> LinkStatus {
        let st = self.state();
        LinkStatus {
            node_id: self.remote_node_id.clone(),
            incoming_udp: st.slots.is_open(Direction::Incoming, TransportKind::Udp),
            outgoing_udp: st.slots.is_open(Direction::Outgoing, TransportKind::Udp),
            incoming_websocket: st.slots.is_open(Direction::Incoming, TransportKind::WebSocket),
            outgoing_websocket: st.slots.is_open(Direction::Outgoing, TransportKind::WebSocket),
            unconfirmed_messages: st.unconfirmed.len(),
            udp_addr: st.remote.udp_addr.map(|a| a.to_string()),
            websocket_url: st.remote.websocket_url.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Send one message over the preferred open session and track it until
    /// confirmed. Fails at once when no session is open.
    pub fn send(&self, message: NodeToNodeMessage) -> Result<(), TransportError> {
        let id = random_id(ID_LEN);
        let peer_message = PeerMessage::Message { id: id.clone(), message };
        let sender = {
            let mut st = self.state();
            let sender = st
                .slots
                .preferred(st.udp_first)
                .map(|slot| slot.session.clone())
                .ok_or(TransportError::NoConnection)?;
            st.unconfirmed.insert(
                id.clone(),
                Unconfirmed {
                    message: peer_message.clone(),
                    last_sent: Instant::now(),
                    num_tries: 1,
                },
            );
            sender
        };
        if let Err(e) = sender.send(&peer_message) {
            self.state().unconfirmed.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    fn handle_inbound(&self, message: PeerMessage, reply: &SessionSender) {
        match message {
            PeerMessage::Confirm { confirm_id } => {
                self.state().unconfirmed.remove(&confirm_id);
            }
            PeerMessage::Message { id, message } => {
                // Confirm before dedup: our earlier confirm may have been lost
                if let Err(e) = reply.send(&PeerMessage::Confirm { confirm_id: id.clone() }) {
                    tracing::debug!(peer = %self.remote_node_id, "peer: confirm not sent: {e}");
                }
                if !self.state().seen.insert(&id, Instant::now()) {
                    return;
                }
                let _ = self.inbound.send(InboundMessage {
                    from: self.remote_node_id.clone(),
                    message,
                });
            }
        }
    }

    /// One pass of the unconfirmed-message sweep.
    fn resend_due(&self, now: Instant) {
        let resend_after = Duration::from_millis(self.params.resend_after_ms);
        let mut exhausted = false;
        let mut due = Vec::new();
        let sender = {
            let mut st = self.state();
            for entry in st.unconfirmed.values_mut() {
                if now.saturating_duration_since(entry.last_sent) < resend_after {
                    continue;
                }
                if entry.num_tries >= self.params.max_peer_tries {
                    exhausted = true;
                    break;
                }
                entry.num_tries += 1;
                entry.last_sent = now;
                due.push(entry.message.clone());
            }
            if exhausted {
                st.unconfirmed.clear();
                None
            } else {
                st.slots.preferred(st.udp_first).map(|s| s.session.clone())
            }
        };

        if exhausted {
            tracing::warn!(peer = %self.remote_node_id, "peer: messages never confirmed, disconnecting");
            self.disconnect();
            let _ = self.events.send(PeerEvent::Lost {
                node_id: self.remote_node_id.clone(),
            });
            return;
        }
        if let Some(sender) = sender {
            for message in &due {
                if let Err(e) = sender.send(message) {
                    tracing::debug!(peer = %self.remote_node_id, "peer: resend failed: {e}");
                    break;
                }
            }
        }
    }

    fn should_dial(&self, kind: TransportKind, now: Instant) -> bool {
        let cooldown = Duration::from_millis(self.params.reconnect_cooldown_ms);
        let mut st = self.state();
        let connected = st.slots.is_open(Direction::Outgoing, kind) || st.slots.is_open(Direction::Incoming, kind);
        let known = st.remote.knows(kind);
        let cooled = st
            .dial_state(kind)
            .last_disconnect
            .is_none_or(|t| now.saturating_duration_since(t) >= cooldown);
        !connected && known && cooled
    }

    async fn run_resend_loop(self: Arc<Self>, mut halt: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.params.resend_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => self.resend_due(Instant::now()),
                _ = halt.wait_for(|h| *h) => break,
            }
        }
    }

    async fn run_dial_loop(self: Arc<Self>, kind: TransportKind, mut halt: watch::Receiver<bool>) {
        loop {
            let wait = self.state().dial_state(kind).backoff.current();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = halt.wait_for(|h| *h) => break,
            }
            if !self.should_dial(kind, Instant::now()) {
                continue;
            }
            let remote = self.remote_info();
            let attempt = self.dialer.dial(kind, &remote, &self.remote_node_id);
            let result = tokio::select! {
                result = attempt => result,
                _ = halt.wait_for(|h| *h) => break,
            };
            match result {
                Ok(session) => self.set_connection(Direction::Outgoing, session),
                Err(e) => {
                    let mut st = self.state();
                    let dial = st.dial_state(kind);
                    dial.backoff.fail();
                    tracing::debug!(
                        peer = %self.remote_node_id,
                        %kind,
                        next_attempt_ms = dial.backoff.current().as_millis() as u64,
                        "peer: dial failed: {e}"
                    );
                }
            }
        }
    }
}
