//! Transport parameters -- the timing and sizing constants both ends of a
//! Tessera link are tuned for.
//!
//! The congestion values are empirical starting points, not derived optima.
//! Nodes may override them from config (see `tessera-node` `TransportSection`);
//! what must hold is the relationship between them, which the tests below pin.

/// A named set of framing, reliability and pacing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportParams {
    // -- Framing --
    /// Maximum payload bytes carried by one UDP fragment.
    pub max_fragment_bytes: usize,
    /// Fixed ASCII header prepended to every fragment (space padded).
    pub fragment_header_bytes: usize,
    /// Length of generated fragment, message and connection ids.
    pub id_len: usize,
    /// Shortest connection id accepted from a remote initiator.
    pub connection_id_min_len: usize,
    /// Longest connection id accepted from a remote initiator.
    pub connection_id_max_len: usize,
    /// Incomplete reassemblies older than this are discarded.
    pub partial_message_ttl_ms: u64,
    /// Incomplete reassemblies held at once, across all senders.
    pub max_partial_messages: usize,
    /// Incomplete reassemblies held at once for one sender.
    pub max_partial_messages_per_source: usize,
    /// Payload bytes buffered across all incomplete reassemblies.
    pub max_partial_bytes: usize,

    // -- Congestion control --
    /// Starting send rate for a fresh connection (bytes/sec).
    pub initial_bytes_per_sec: f64,
    /// Lower bound on the send rate while loss stays below `floor_loss_ceiling_pct`.
    pub min_bytes_per_sec: f64,
    /// The floor only applies while trial loss is under this percentage.
    pub floor_loss_ceiling_pct: f64,
    /// Starting round-trip estimate.
    pub initial_rtt_ms: f64,
    /// Clamp for the round-trip estimate.
    pub min_rtt_ms: f64,
    pub max_rtt_ms: f64,
    /// Weight given to the new median when smoothing the RTT estimate.
    pub rtt_alpha: f64,
    /// Minimum samples in a trial before the RTT estimate moves.
    pub min_rtt_samples: usize,
    /// Length of one accounting trial.
    pub trial_duration_ms: u64,
    /// Loss percentage at or above which the rate is cut.
    pub target_loss_pct: f64,
    /// Multiplicative step applied to the rate on each adjustment.
    pub rate_step: f64,
    /// Fraction of the theoretical window that peak outstanding bytes must
    /// exceed before the rate is raised.
    pub utilization_threshold: f64,
    /// Extra slack added to a pacing delay before re-checking the queue.
    pub pacing_slack_ms: u64,

    // -- Reliable UDP connection --
    /// Retransmission timer = `retry_rtt_multiplier` x estimated RTT.
    pub retry_rtt_multiplier: f64,
    /// Transmissions of one message before the connection is given up.
    pub max_udp_tries: u32,
    /// Send a keepalive once nothing has been sent for this long.
    pub keepalive_idle_ms: u64,
    /// Close once nothing has been received for this long.
    pub receive_idle_timeout_ms: u64,
    /// Handled-id retention for duplicate suppression.
    pub dedup_ttl_ms: u64,
    /// Upper bound on remembered ids per dedup table.
    pub dedup_capacity: usize,
    /// Period of the connection housekeeping tick.
    pub housekeeping_interval_ms: u64,
    /// Period between dedup table prunes.
    pub dedup_prune_interval_ms: u64,
    /// `openConnection` is re-sent at this period while pending.
    pub open_retransmit_ms: u64,
    /// Pending outgoing connections fail after this long.
    pub connect_timeout_ms: u64,

    // -- Peer link --
    /// Period of the unconfirmed-message sweep.
    pub resend_interval_ms: u64,
    /// Unconfirmed messages older than this are resent on the sweep.
    pub resend_after_ms: u64,
    /// Attempts at a peer message before the peer is disconnected.
    pub max_peer_tries: u32,
    /// Outgoing connection backoff bounds.
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Quiet period after a transport disconnect before redialling it.
    pub reconnect_cooldown_ms: u64,
    /// Remote node info older than this (with no connection) expires the link.
    pub peer_expiry_ms: u64,
    /// Period of the expiry sweep.
    pub peer_expiry_check_ms: u64,
    /// Identity handshake must complete within this.
    pub session_handshake_timeout_ms: u64,
}

impl TransportParams {
    /// Bytes of payload that fit one datagram alongside its header.
    pub const fn max_datagram_bytes(&self) -> usize {
        self.max_fragment_bytes + self.fragment_header_bytes
    }
}

/// Default parameters.
pub const DEFAULT_PARAMS: TransportParams = TransportParams {
    // Framing
    max_fragment_bytes: 10_000,
    fragment_header_bytes: 64,
    id_len: 10,
    connection_id_min_len: 10,
    connection_id_max_len: 20,
    partial_message_ttl_ms: 60_000,
    max_partial_messages: 512,
    max_partial_messages_per_source: 32,
    max_partial_bytes: 64 * 1024 * 1024,

    // Congestion control
    initial_bytes_per_sec: 3_000_000.0,
    min_bytes_per_sec: 1_000_000.0,
    floor_loss_ceiling_pct: 20.0,
    initial_rtt_ms: 200.0,
    min_rtt_ms: 20.0,
    max_rtt_ms: 1000.0,
    rtt_alpha: 0.3,
    min_rtt_samples: 5,
    trial_duration_ms: 5_000,
    target_loss_pct: 2.0,
    rate_step: 1.2,
    utilization_threshold: 0.6,
    pacing_slack_ms: 10,

    // Reliable UDP connection
    retry_rtt_multiplier: 4.0,
    max_udp_tries: 6,
    keepalive_idle_ms: 5_000,
    receive_idle_timeout_ms: 60_000,
    dedup_ttl_ms: 60_000,
    dedup_capacity: 100_000,
    housekeeping_interval_ms: 1_000,
    dedup_prune_interval_ms: 3_000,
    open_retransmit_ms: 1_000,
    connect_timeout_ms: 10_000,

    // Peer link
    resend_interval_ms: 2_000,
    resend_after_ms: 5_000,
    max_peer_tries: 4,
    backoff_initial_ms: 1_000,
    backoff_max_ms: 16_000,
    reconnect_cooldown_ms: 10_000,
    peer_expiry_ms: 60_000,
    peer_expiry_check_ms: 10_000,
    session_handshake_timeout_ms: 10_000,
};
