//! Cumulative spend against a hard ceiling.

use tracing::warn;

/// Tracks cumulative spend in USD.
///
/// Spend is recorded after the fact, never reserved, and never decreases.
/// The meter is exceeded once `spent >= ceiling`.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetMeter {
    ceiling: f64,
    spent: f64,
}

impl BudgetMeter {
    pub fn new(ceiling: f64) -> Self {
        Self { ceiling, spent: 0.0 }
    }

    /// A meter that is never exceeded.
    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY)
    }

    /// Add `amount` to the running total.
    ///
    /// Negative and non-finite amounts are ignored.
    pub fn record_spend(&mut self, amount: f64) {
        if !amount.is_finite() || amount < 0.0 {
            warn!(amount, "ignoring invalid spend amount");
            return;
        }
        self.spent += amount;
    }

    pub fn remaining(&self) -> f64 {
        (self.ceiling - self.spent).max(0.0)
    }

    pub fn is_exceeded(&self) -> bool {
        self.spent >= self.ceiling
    }

    pub fn spent(&self) -> f64 {
        self.spent
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }
}
