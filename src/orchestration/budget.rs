//! Run-wide cost and time ledger.
//!
//! The `BudgetTracker` is shared (behind an `Arc`) between the admission loop
//! and every in-flight job. All counters are atomics so concurrent jobs can
//! charge without a lock. Amounts are stored in micro-dollars and
//! milliseconds; a charge can only ever increase them.
//!
//! Admission uses reservations: before a job starts, its estimated cost is
//! reserved so that several jobs admitted back-to-back cannot jointly
//! overshoot the ceiling. When the job finishes, the reservation is settled
//! against the real cost.

use crate::config::BudgetConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn to_micros(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * 1_000_000.0).round() as u64
    } else {
        0
    }
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

/// Estimated cost held for an admitted job until it is settled.
#[derive(Debug)]
#[must_use = "a reservation must be settled or released"]
pub struct Reservation {
    micros: u64,
}

impl Reservation {
    pub fn amount_usd(&self) -> f64 {
        from_micros(self.micros)
    }
}

/// Serializable state of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Total cost charged so far.
    pub spent_usd: f64,
    /// Total invocation time charged so far.
    pub elapsed_ms: u64,
    /// Number of settled invocations.
    pub invocations: u64,
    pub max_cost_usd: f64,
    pub max_time_ms: u64,
}

/// Process-wide cost/time ledger for one run.
#[derive(Debug)]
pub struct BudgetTracker {
    max_cost_micros: u64,
    max_time_ms: u64,
    estimate_micros: u64,
    spent_micros: AtomicU64,
    elapsed_ms: AtomicU64,
    reserved_micros: AtomicU64,
    invocations: AtomicU64,
}

impl BudgetTracker {
    /// Create an empty ledger with the given ceilings.
    pub fn new(max_cost_usd: f64, max_time: Duration, estimated_cost_per_invocation: f64) -> Self {
        Self {
            max_cost_micros: to_micros(max_cost_usd),
            max_time_ms: max_time.as_millis().min(u64::MAX as u128) as u64,
            estimate_micros: to_micros(estimated_cost_per_invocation),
            spent_micros: AtomicU64::new(0),
            elapsed_ms: AtomicU64::new(0),
            reserved_micros: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &BudgetConfig) -> Self {
        Self::new(
            config.max_cost_usd,
            config.max_time(),
            config.estimated_cost_per_invocation,
        )
    }

    /// Rebuild a ledger from a persisted snapshot, keeping the snapshot's ceilings.
    pub fn restore(snapshot: &LedgerSnapshot, estimated_cost_per_invocation: f64) -> Self {
        let tracker = Self::new(
            snapshot.max_cost_usd,
            Duration::from_millis(snapshot.max_time_ms),
            estimated_cost_per_invocation,
        );
        tracker
            .spent_micros
            .store(to_micros(snapshot.spent_usd), Ordering::SeqCst);
        tracker
            .elapsed_ms
            .store(snapshot.elapsed_ms, Ordering::SeqCst);
        tracker
            .invocations
            .store(snapshot.invocations, Ordering::SeqCst);
        tracker
    }

    /// Record the cost and time of one invocation. Negative or NaN costs count as zero.
    pub fn charge(&self, cost_usd: f64, elapsed: Duration) {
        self.spent_micros
            .fetch_add(to_micros(cost_usd), Ordering::SeqCst);
        self.elapsed_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::SeqCst);
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }

    /// True once either ceiling has been reached.
    pub fn exceeded(&self) -> bool {
        self.spent_micros.load(Ordering::SeqCst) >= self.max_cost_micros
            || self.elapsed_ms.load(Ordering::SeqCst) >= self.max_time_ms
    }

    /// Reserve the per-invocation estimate if the projected spend
    /// (charged + reserved + estimate) stays within the cost ceiling.
    pub fn try_reserve(&self) -> Option<Reservation> {
        if self.exceeded() {
            return None;
        }
        let estimate = self.estimate_micros;
        let spent = self.spent_micros.load(Ordering::SeqCst);
        self.reserved_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |reserved| {
                let projected = spent.saturating_add(reserved).saturating_add(estimate);
                (projected <= self.max_cost_micros).then_some(reserved + estimate)
            })
            .ok()
            .map(|_| Reservation { micros: estimate })
    }

    /// Replace a reservation with the real cost of the invocation.
    pub fn settle(&self, reservation: Reservation, cost_usd: f64, elapsed: Duration) {
        self.reserved_micros
            .fetch_sub(reservation.micros, Ordering::SeqCst);
        self.charge(cost_usd, elapsed);
    }

    /// Drop a reservation for a job that never ran.
    pub fn release(&self, reservation: Reservation) {
        self.reserved_micros
            .fetch_sub(reservation.micros, Ordering::SeqCst);
    }

    pub fn spent_usd(&self) -> f64 {
        from_micros(self.spent_micros.load(Ordering::SeqCst))
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
    }

    pub fn reserved_usd(&self) -> f64 {
        from_micros(self.reserved_micros.load(Ordering::SeqCst))
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            spent_usd: self.spent_usd(),
            elapsed_ms: self.elapsed_ms.load(Ordering::SeqCst),
            invocations: self.invocations(),
            max_cost_usd: from_micros(self.max_cost_micros),
            max_time_ms: self.max_time_ms,
        }
    }
}
