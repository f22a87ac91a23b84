use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// VRAM accounting for everything resident on the GPU.
///
/// `reserved_bytes` starts at the safety margin and never exceeds
/// `budget_bytes`. Reservations are a single compare-and-swap, so concurrent
/// callers cannot jointly overshoot the budget.
#[derive(Debug)]
pub struct ResourceLedger {
    budget_bytes: u64,
    safety_margin_bytes: u64,
    reserved_bytes: AtomicU64,
}

/// Ledger totals for the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub budget_bytes: u64,
    pub safety_margin_bytes: u64,
    pub reserved_bytes: u64,
    pub available_bytes: u64,
}

impl ResourceLedger {
    pub fn new(budget_bytes: u64, safety_margin_bytes: u64) -> Result<Self, LedgerError> {
        if safety_margin_bytes > budget_bytes {
            return Err(LedgerError::MarginExceedsBudget {
                margin: safety_margin_bytes,
                budget: budget_bytes,
            });
        }

        Ok(Self {
            budget_bytes,
            safety_margin_bytes,
            reserved_bytes: AtomicU64::new(safety_margin_bytes),
        })
    }

    /// Try to set aside `amount` bytes. Returns `false` when the budget would
    /// be exceeded; the caller decides whether to evict or wait.
    #[must_use]
    pub fn reserve(&self, amount: u64) -> bool {
        let budget = self.budget_bytes;
        let granted = self
            .reserved_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(amount).filter(|next| *next <= budget)
            })
            .is_ok();

        if granted {
            self.publish();
        }
        granted
    }

    /// Return `amount` bytes to the pool. Never dips into the safety margin.
    pub fn release(&self, amount: u64) {
        let margin = self.safety_margin_bytes;
        let previous = self
            .reserved_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(amount).max(margin))
            })
            .unwrap_or_else(|current| current);

        if previous.saturating_sub(margin) < amount {
            tracing::warn!(
                released = amount,
                reserved = previous,
                "Released more VRAM than was reserved"
            );
        }
        self.publish();
    }

    pub fn budget(&self) -> u64 {
        self.budget_bytes
    }

    pub fn reserved(&self) -> u64 {
        self.reserved_bytes.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u64 {
        self.budget_bytes.saturating_sub(self.reserved())
    }

    /// Largest single reservation the ledger could ever grant.
    pub fn capacity(&self) -> u64 {
        self.budget_bytes - self.safety_margin_bytes
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let reserved = self.reserved();
        LedgerSnapshot {
            budget_bytes: self.budget_bytes,
            safety_margin_bytes: self.safety_margin_bytes,
            reserved_bytes: reserved,
            available_bytes: self.budget_bytes.saturating_sub(reserved),
        }
    }

    fn publish(&self) {
        metrics::gauge!("vram_reserved_bytes").set(self.reserved() as f64);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("VRAM safety margin ({margin} bytes) exceeds the budget ({budget} bytes)")]
    MarginExceedsBudget { margin: u64, budget: u64 },
}
