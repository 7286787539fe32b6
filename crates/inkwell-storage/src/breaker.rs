//! Per-document circuit breaker
//!
//! Counts consecutive write failures per document. Once the count reaches the
//! threshold the breaker opens and callers fail fast without touching disk.
//! A success closes it again; so does an elapsed cool-down, which lets one
//! trial attempt through (a single further failure reopens it).

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;

/// Breaker state for one document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Writes are attempted
    Closed,
    /// Writes fail fast
    Open,
}

/// Public view of a document's breaker
#[derive(Debug, Clone)]
pub struct BreakerStatus {
    pub failure_count: u32,
    pub state: BreakerState,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerEntry {
    failure_count: u32,
    state: BreakerState,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            failure_count: 0,
            state: BreakerState::Closed,
            last_failure: None,
            opened_at: None,
        }
    }
}

/// Failure-counting guard keyed by document id
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    entries: DashMap<String, BreakerEntry>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a breaker with the given policy
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Record a failed attempt
    ///
    /// Returns `true` when this failure tripped the breaker open.
    pub fn record_failure(&self, id: &str) -> bool {
        let threshold = self.config.failure_threshold.max(1);
        let mut entry = self.entries.entry(id.to_string()).or_insert_with(BreakerEntry::new);
        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.last_failure = Some(Utc::now());

        if entry.state == BreakerState::Closed && entry.failure_count >= threshold {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
            warn!(
                document_id = id,
                failures = entry.failure_count,
                "Circuit breaker opened"
            );
            return true;
        }

        debug!(document_id = id, failures = entry.failure_count, "Recorded failure");
        false
    }

    /// Open the breaker now, for failures a retry cannot fix
    ///
    /// Returns `true` when the breaker was closed before.
    pub fn trip(&self, id: &str) -> bool {
        let mut entry = self.entries.entry(id.to_string()).or_insert_with(BreakerEntry::new);
        entry.failure_count = entry.failure_count.max(self.config.failure_threshold.max(1));
        entry.last_failure = Some(Utc::now());
        if entry.state == BreakerState::Open {
            return false;
        }
        entry.state = BreakerState::Open;
        entry.opened_at = Some(Instant::now());
        warn!(document_id = id, "Circuit breaker tripped");
        true
    }

    /// Record a successful attempt; closes the breaker and clears the count
    pub fn record_success(&self, id: &str) {
        if let Some((_, entry)) = self.entries.remove(id)
            && entry.state == BreakerState::Open
        {
            info!(document_id = id, "Circuit breaker closed after success");
        }
    }

    /// Whether writes for `id` must fail fast
    ///
    /// An open breaker whose cool-down has elapsed is half-reset: it closes
    /// with the count one below the threshold.
    pub fn is_open(&self, id: &str) -> bool {
        let Some(mut entry) = self.entries.get_mut(id) else {
            return false;
        };
        if entry.state == BreakerState::Closed {
            return false;
        }

        let cooled = match (self.config.cool_down, entry.opened_at) {
            (Some(cool_down), Some(opened_at)) => opened_at.elapsed() >= cool_down,
            _ => false,
        };
        if cooled {
            entry.state = BreakerState::Closed;
            entry.failure_count = self.config.failure_threshold.saturating_sub(1);
            entry.opened_at = None;
            info!(document_id = id, "Circuit breaker cool-down elapsed, allowing trial write");
            return false;
        }
        true
    }

    /// Forget all failures for `id`
    pub fn reset(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Drop every tracked document
    pub fn reset_all(&self) {
        self.entries.clear();
    }

    /// Current status for `id`, if any failure has been recorded
    pub fn status(&self, id: &str) -> Option<BreakerStatus> {
        self.entries.get(id).map(|e| BreakerStatus {
            failure_count: e.failure_count,
            state: e.state,
            last_failure: e.last_failure,
        })
    }

    /// Consecutive failures recorded for `id`
    pub fn failure_count(&self, id: &str) -> u32 {
        self.entries.get(id).map(|e| e.failure_count).unwrap_or(0)
    }

    /// Time left before an open breaker allows a trial write
    pub fn remaining_cool_down(&self, id: &str) -> Option<Duration> {
        let entry = self.entries.get(id)?;
        let opened_at = entry.opened_at?;
        let cool_down = self.config.cool_down?;
        Some(cool_down.saturating_sub(opened_at.elapsed()))
    }
}
