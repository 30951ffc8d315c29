//! Per-connection congestion controller.
//!
//! Windowed AIMD-like control: counters accumulate over a fixed-length trial,
//! and only when a trial closes are the rate and round-trip estimates moved.
//! The controller never touches the network; the connection asks it how long
//! to wait before the next send and reports what happened to each message.

use std::collections::HashSet;
use std::time::Duration;

use tessera_protocol::{TransportParams, DEFAULT_PARAMS};
use tokio::time::Instant;

/// Tunables for one controller. Defaults come from `DEFAULT_PARAMS`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionParams {
    pub initial_bytes_per_sec: f64,
    pub min_bytes_per_sec: f64,
    pub floor_loss_ceiling_pct: f64,
    pub initial_rtt_ms: f64,
    pub min_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub rtt_alpha: f64,
    pub min_rtt_samples: usize,
    pub trial_duration: Duration,
    pub target_loss_pct: f64,
    pub rate_step: f64,
    pub utilization_threshold: f64,
}

impl CongestionParams {
    pub fn from_transport(p: &TransportParams) -> Self {
        Self {
            initial_bytes_per_sec: p.initial_bytes_per_sec,
            min_bytes_per_sec: p.min_bytes_per_sec,
            floor_loss_ceiling_pct: p.floor_loss_ceiling_pct,
            initial_rtt_ms: p.initial_rtt_ms,
            min_rtt_ms: p.min_rtt_ms,
            max_rtt_ms: p.max_rtt_ms,
            rtt_alpha: p.rtt_alpha,
            min_rtt_samples: p.min_rtt_samples,
            trial_duration: Duration::from_millis(p.trial_duration_ms),
            target_loss_pct: p.target_loss_pct,
            rate_step: p.rate_step,
            utilization_threshold: p.utilization_threshold,
        }
    }
}

impl Default for CongestionParams {
    fn default() -> Self {
        Self::from_transport(&DEFAULT_PARAMS)
    }
}

/// Accounting for the current trial window.
#[derive(Debug)]
struct Trial {
    started: Instant,
    /// Ids sent during this trial. Reports for other ids are ignored so a
    /// loss is never blamed on a later window.
    ids: HashSet<String>,
    sent_bytes: u64,
    confirmed_bytes: u64,
    lost_bytes: u64,
    sent_count: u64,
    confirmed_count: u64,
    lost_count: u64,
    rtts_ms: Vec<f64>,
    peak_outstanding: u64,
}

impl Trial {
    fn new(started: Instant) -> Self {
        Self {
            started,
            ids: HashSet::new(),
            sent_bytes: 0,
            confirmed_bytes: 0,
            lost_bytes: 0,
            sent_count: 0,
            confirmed_count: 0,
            lost_count: 0,
            rtts_ms: Vec::new(),
            peak_outstanding: 0,
        }
    }

    fn outstanding(&self) -> u64 {
        self.sent_bytes
            .saturating_sub(self.confirmed_bytes)
            .saturating_sub(self.lost_bytes)
    }
}

/// Outcome of closing one trial, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialSummary {
    pub sent_bytes: u64,
    pub lost_bytes: u64,
    pub loss_pct: f64,
    pub bytes_per_sec: f64,
    pub rtt_ms: f64,
}

#[derive(Debug)]
pub struct CongestionController {
    params: CongestionParams,
    max_bytes_per_sec: f64,
    estimated_rtt_ms: f64,
    trial: Trial,
    halted: bool,
}

impl CongestionController {
    pub fn new(params: CongestionParams, now: Instant) -> Self {
        Self {
            max_bytes_per_sec: params.initial_bytes_per_sec,
            estimated_rtt_ms: params
                .initial_rtt_ms
                .clamp(params.min_rtt_ms, params.max_rtt_ms),
            trial: Trial::new(now),
            params,
            halted: false,
        }
    }

    pub fn max_bytes_per_sec(&self) -> f64 {
        self.max_bytes_per_sec
    }

    pub fn estimated_rtt_ms(&self) -> f64 {
        self.estimated_rtt_ms
    }

    pub fn estimated_rtt(&self) -> Duration {
        Duration::from_secs_f64(self.estimated_rtt_ms / 1000.0)
    }

    /// Bytes sent in the current trial and not yet confirmed or lost.
    pub fn outstanding_bytes(&self) -> u64 {
        self.trial.outstanding()
    }

    /// Theoretical window: what one RTT at the current rate can carry.
    pub fn max_outstanding_bytes(&self) -> f64 {
        self.max_bytes_per_sec / 1000.0 * self.estimated_rtt_ms
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn report_sent(&mut self, bytes: usize, id: &str) {
        if self.halted {
            return;
        }
        let t = &mut self.trial;
        t.ids.insert(id.to_string());
        t.sent_bytes += bytes as u64;
        t.sent_count += 1;
        t.peak_outstanding = t.peak_outstanding.max(t.outstanding());
    }

    pub fn report_lost(&mut self, bytes: usize, id: &str) {
        if self.halted || !self.trial.ids.contains(id) {
            return;
        }
        self.trial.lost_bytes += bytes as u64;
        self.trial.lost_count += 1;
    }

    pub fn report_confirmed(&mut self, bytes: usize, rtt_ms: f64, id: &str) {
        if self.halted || !self.trial.ids.contains(id) {
            return;
        }
        self.trial.confirmed_bytes += bytes as u64;
        self.trial.confirmed_count += 1;
        self.trial.rtts_ms.push(rtt_ms);
    }

    /// Milliseconds to hold a message of `next_bytes` before sending it.
    /// Zero means send now.
    pub fn estimate_delay_ms(&self, next_bytes: usize) -> f64 {
        let outstanding = self.trial.outstanding() as f64;
        let next = next_bytes as f64;
        let max_outstanding = self.max_outstanding_bytes();
        if outstanding == 0.0 || outstanding + next <= max_outstanding {
            return 0.0;
        }
        (outstanding + next - max_outstanding) / self.max_bytes_per_sec * 1000.0
    }

    /// Close the trial if its window has elapsed. Returns the summary when an
    /// adjustment pass ran.
    pub fn tick(&mut self, now: Instant) -> Option<TrialSummary> {
        if self.halted || now.saturating_duration_since(self.trial.started) < self.params.trial_duration {
            return None;
        }
        self.end_trial(now)
    }

    /// Close the current trial, adjust estimates, and start a fresh one.
    pub fn end_trial(&mut self, now: Instant) -> Option<TrialSummary> {
        let trial = std::mem::replace(&mut self.trial, Trial::new(now));
        if trial.sent_bytes == 0 {
            return None;
        }
        let p = &self.params;

        if trial.rtts_ms.len() >= p.min_rtt_samples {
            let estimate = p.rtt_alpha * median(&trial.rtts_ms) + (1.0 - p.rtt_alpha) * self.estimated_rtt_ms;
            self.estimated_rtt_ms = estimate.clamp(p.min_rtt_ms, p.max_rtt_ms);
        }

        // Utilisation is judged against the window at the refreshed RTT
        let loss_pct = trial.lost_bytes as f64 / trial.sent_bytes as f64 * 100.0;
        let window = self.max_bytes_per_sec / 1000.0 * self.estimated_rtt_ms;
        if loss_pct < p.target_loss_pct {
            if trial.peak_outstanding as f64 > p.utilization_threshold * window {
                self.max_bytes_per_sec *= p.rate_step;
            }
        } else {
            self.max_bytes_per_sec /= p.rate_step;
        }
        if loss_pct < p.floor_loss_ceiling_pct && self.max_bytes_per_sec < p.min_bytes_per_sec {
            self.max_bytes_per_sec = p.min_bytes_per_sec;
        }

        let summary = TrialSummary {
            sent_bytes: trial.sent_bytes,
            lost_bytes: trial.lost_bytes,
            loss_pct,
            bytes_per_sec: self.max_bytes_per_sec,
            rtt_ms: self.estimated_rtt_ms,
        };
        tracing::debug!(
            sent = trial.sent_count,
            confirmed = trial.confirmed_count,
            lost = trial.lost_count,
            loss_pct = summary.loss_pct,
            bytes_per_sec = summary.bytes_per_sec,
            rtt_ms = summary.rtt_ms,
            "congestion: trial closed"
        );
        Some(summary)
    }

    /// Stop accounting. The owning connection is closing.
    pub fn halt(&mut self) {
        self.halted = true;
    }
}

fn median(values: &[f64]) -> f64 {
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    let half = v.len() / 2;
    if v.len() % 2 == 1 {
        v[half]
    } else {
        (v[half - 1] + v[half]) / 2.0
    }
}
