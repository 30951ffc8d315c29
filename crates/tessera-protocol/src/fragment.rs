//! Datagram fragmentation and reassembly.
//!
//! Every datagram is `header || part`, where the header is the ASCII string
//! `"<id>:<partIndex>:<numParts>:"` right-padded with spaces to 64 bytes.
//! Malformed datagrams never raise; they are dropped.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use lru::LruCache;

use crate::codec::MAX_ENVELOPE_SIZE;
use crate::params::{TransportParams, DEFAULT_PARAMS};
use crate::random_id;

/// Fixed header length.
pub const HEADER_BYTES: usize = DEFAULT_PARAMS.fragment_header_bytes;

/// Most parts a single message may be split into. Anything claiming more is
/// larger than the envelope of any frame we would accept.
pub const MAX_PARTS: usize = MAX_ENVELOPE_SIZE.div_ceil(DEFAULT_PARAMS.max_fragment_bytes);

/// Split `payload` into datagrams under a fresh random id.
pub fn fragment(payload: &[u8]) -> Vec<Bytes> {
    fragment_with_id(&random_id(DEFAULT_PARAMS.id_len), payload, DEFAULT_PARAMS.max_fragment_bytes)
}

/// Split `payload` into datagrams of at most `max_part` payload bytes each.
///
/// An empty payload still produces one (empty) part so the receiver sees it.
pub fn fragment_with_id(id: &str, payload: &[u8], max_part: usize) -> Vec<Bytes> {
    let num_parts = payload.len().div_ceil(max_part).max(1);
    (0..num_parts)
        .map(|i| {
            let start = i * max_part;
            let end = (start + max_part).min(payload.len());
            let part = &payload[start.min(payload.len())..end];

            let header = format!("{id}:{i}:{num_parts}:");
            let mut buf = BytesMut::with_capacity(HEADER_BYTES + part.len());
            buf.put_slice(header.as_bytes());
            buf.put_bytes(b' ', HEADER_BYTES.saturating_sub(header.len()));
            buf.put_slice(part);
            buf.freeze()
        })
        .collect()
}

/// Parsed fragment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    pub id: String,
    pub index: usize,
    pub num_parts: usize,
}

/// Parse the 64-byte header of a datagram. `None` for anything malformed.
pub fn parse_header(datagram: &[u8]) -> Option<FragmentHeader> {
    if datagram.len() < HEADER_BYTES {
        return None;
    }
    let header = std::str::from_utf8(&datagram[..HEADER_BYTES]).ok()?;
    let fields: Vec<&str> = header.trim_end_matches(' ').split(':').collect();
    if fields.len() != 4 || !fields[3].is_empty() {
        return None;
    }
    let id = fields[0];
    if id.len() != DEFAULT_PARAMS.id_len {
        return None;
    }
    let index: usize = fields[1].parse().ok()?;
    let num_parts: usize = fields[2].parse().ok()?;
    if num_parts == 0 || num_parts > MAX_PARTS || index >= num_parts {
        return None;
    }
    Some(FragmentHeader {
        id: id.to_string(),
        index,
        num_parts,
    })
}

/// Bounds on the reassembly table. When a bound is hit the least recently
/// touched partial message is dropped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    pub ttl: Duration,
    pub max_partials: usize,
    pub max_partials_per_source: usize,
    pub max_bytes: usize,
}

impl ReassemblyLimits {
    pub fn from_params(params: &TransportParams) -> Self {
        Self {
            ttl: Duration::from_millis(params.partial_message_ttl_ms),
            max_partials: params.max_partial_messages.max(1),
            max_partials_per_source: params.max_partial_messages_per_source.max(1),
            max_bytes: params.max_partial_bytes,
        }
    }
}

struct Partial {
    num_parts: usize,
    parts: Vec<Option<Bytes>>,
    received: usize,
    bytes: usize,
    started: Instant,
}

/// Collects fragments per `(source, id)` until every part has arrived.
///
/// `K` identifies the sender (a socket address on the UDP path), so two
/// senders picking the same id never mix parts.
pub struct Reassembler<K: Hash + Eq> {
    partials: LruCache<(K, String), Partial>,
    per_source: HashMap<K, usize>,
    buffered: usize,
    limits: ReassemblyLimits,
}

impl<K: Eq + Hash + Clone> Reassembler<K> {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            partials: LruCache::unbounded(),
            per_source: HashMap::new(),
            buffered: 0,
            limits,
        }
    }

    /// Feed one datagram. Returns the full message once its last part lands.
    pub fn push(&mut self, source: K, datagram: &[u8], now: Instant) -> Option<Bytes> {
        let header = parse_header(datagram)?;
        let body = Bytes::copy_from_slice(&datagram[HEADER_BYTES..]);

        if header.num_parts == 1 {
            return Some(body);
        }

        let key = (source, header.id);
        if !self.partials.contains(&key) {
            self.make_room(&key.0);
            self.partials.put(
                key.clone(),
                Partial {
                    num_parts: header.num_parts,
                    parts: vec![None; header.num_parts],
                    received: 0,
                    bytes: 0,
                    started: now,
                },
            );
            *self.per_source.entry(key.0.clone()).or_default() += 1;
        }

        let partial = self.partials.get_mut(&key)?;
        if partial.num_parts != header.num_parts {
            tracing::debug!(id = %key.1, "fragment: part count mismatch, dropped");
            return None;
        }
        let slot = &mut partial.parts[header.index];
        if slot.is_some() {
            return None;
        }
        partial.bytes += body.len();
        self.buffered += body.len();
        *slot = Some(body);
        partial.received += 1;

        if partial.received < partial.num_parts {
            self.enforce_byte_budget(&key);
            return None;
        }

        let partial = self.remove(&key)?;
        let mut out = BytesMut::with_capacity(partial.bytes);
        for part in partial.parts.into_iter().flatten() {
            out.put_slice(&part);
        }
        Some(out.freeze())
    }

    /// Free a slot for one more partial from `source`.
    fn make_room(&mut self, source: &K) {
        while self.per_source.get(source).copied().unwrap_or(0) >= self.limits.max_partials_per_source {
            let oldest = self
                .partials
                .iter()
                .rev()
                .find(|((s, _), _)| s == source)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => self.evict(&k),
                None => break,
            }
        }
        while self.partials.len() >= self.limits.max_partials {
            match self.partials.peek_lru().map(|(k, _)| k.clone()) {
                Some(k) => self.evict(&k),
                None => break,
            }
        }
    }

    /// Drop the oldest other partials until the buffered bytes fit. A lone
    /// partial over budget is dropped itself.
    fn enforce_byte_budget(&mut self, current: &(K, String)) {
        while self.buffered > self.limits.max_bytes {
            let victim = self
                .partials
                .iter()
                .rev()
                .map(|(k, _)| k)
                .find(|k| *k != current)
                .cloned()
                .unwrap_or_else(|| current.clone());
            let last = victim == *current;
            self.evict(&victim);
            if last {
                break;
            }
        }
    }

    fn evict(&mut self, key: &(K, String)) {
        if self.remove(key).is_some() {
            tracing::debug!(id = %key.1, "fragment: reassembly table full, oldest partial dropped");
        }
    }

    fn remove(&mut self, key: &(K, String)) -> Option<Partial> {
        let partial = self.partials.pop(key)?;
        self.buffered -= partial.bytes;
        if let Some(count) = self.per_source.get_mut(&key.0) {
            *count -= 1;
            if *count == 0 {
                self.per_source.remove(&key.0);
            }
        }
        Some(partial)
    }

    /// Drop reassemblies that have been incomplete for longer than the TTL.
    pub fn prune(&mut self, now: Instant) -> usize {
        let ttl = self.limits.ttl;
        let stale: Vec<(K, String)> = self
            .partials
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.started) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            self.remove(key);
        }
        stale.len()
    }

    /// Number of messages currently being reassembled.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    pub fn pending_from(&self, source: &K) -> usize {
        self.per_source.get(source).copied().unwrap_or(0)
    }

    /// Payload bytes held by incomplete messages.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }
}
