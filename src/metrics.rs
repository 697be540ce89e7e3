//! Counters for the raffle service.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated raffle metrics. Thread-safe; share via `Arc<Metrics>`.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Entries recorded.
    pub entries_accepted: AtomicU64,
    /// Entries rejected (stake too low, raffle not open).
    pub entries_rejected: AtomicU64,
    /// Rounds closed with a randomness request.
    pub upkeeps_performed: AtomicU64,
    /// Close attempts rejected because upkeep was not needed or the oracle refused.
    pub upkeeps_rejected: AtomicU64,
    /// Rounds settled with a paid winner.
    pub rounds_completed: AtomicU64,
    /// Fulfillments whose payout failed.
    pub payouts_failed: AtomicU64,
    /// Fulfillments rejected for not matching the pending request.
    pub unknown_fulfillments: AtomicU64,
    /// Total lamports paid to winners.
    pub lamports_paid: AtomicU64,
    /// Sum of request-to-payout latencies in seconds (for computing average).
    pub settlement_latency_sum_secs: AtomicU64,
    /// Number of settled rounds contributing to the latency sum.
    pub settlement_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_entry(&self, accepted: bool) {
        let counter = if accepted {
            &self.entries_accepted
        } else {
            &self.entries_rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upkeep(&self, performed: bool) {
        let counter = if performed {
            &self.upkeeps_performed
        } else {
            &self.upkeeps_rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a settled round with its payout and request-to-payout latency.
    pub fn record_settlement(&self, lamports: u64, latency_secs: u64) {
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
        self.lamports_paid.fetch_add(lamports, Ordering::Relaxed);
        self.settlement_latency_sum_secs
            .fetch_add(latency_secs, Ordering::Relaxed);
        self.settlement_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_payout_failure(&self) {
        self.payouts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_fulfillment(&self) {
        self.unknown_fulfillments.fetch_add(1, Ordering::Relaxed);
    }

    /// Average request-to-payout latency in seconds, or 0 if none.
    pub fn avg_settlement_latency_secs(&self) -> u64 {
        let count = self.settlement_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.settlement_latency_sum_secs.load(Ordering::Relaxed) / count
    }

    /// Serialize metrics as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "entries_accepted": self.entries_accepted.load(Ordering::Relaxed),
            "entries_rejected": self.entries_rejected.load(Ordering::Relaxed),
            "upkeeps_performed": self.upkeeps_performed.load(Ordering::Relaxed),
            "upkeeps_rejected": self.upkeeps_rejected.load(Ordering::Relaxed),
            "rounds_completed": self.rounds_completed.load(Ordering::Relaxed),
            "payouts_failed": self.payouts_failed.load(Ordering::Relaxed),
            "unknown_fulfillments": self.unknown_fulfillments.load(Ordering::Relaxed),
            "lamports_paid": self.lamports_paid.load(Ordering::Relaxed),
            "avg_settlement_latency_secs": self.avg_settlement_latency_secs(),
            "settlement_count": self.settlement_count.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_latency_is_zero_without_settlements() {
        assert_eq!(Metrics::new().avg_settlement_latency_secs(), 0);
    }

    #[test]
    fn settlements_accumulate() {
        let metrics = Metrics::new();
        metrics.record_settlement(40, 2);
        metrics.record_settlement(20, 4);
        metrics.record_entry(true);
        metrics.record_entry(false);

        let json = metrics.to_json();
        assert_eq!(json["rounds_completed"], 2);
        assert_eq!(json["lamports_paid"], 60);
        assert_eq!(json["avg_settlement_latency_secs"], 3);
        assert_eq!(json["entries_accepted"], 1);
        assert_eq!(json["entries_rejected"], 1);
    }
}
