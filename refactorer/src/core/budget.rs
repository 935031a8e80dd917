//! Monetary budget shared by every model call in a run.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;

const MICROS_PER_USD: f64 = 1_000_000.0;

/// Raised instead of issuing a model call once the budget is spent.
///
/// This is a soft stop: callers convert it into normal loop termination.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetExhaustedError {
    pub spent_usd: f64,
    pub limit_usd: f64,
}

impl fmt::Display for BudgetExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "budget exhausted: spent ${:.4} of ${:.4}",
            self.spent_usd, self.limit_usd
        )
    }
}

impl std::error::Error for BudgetExhaustedError {}

/// Tracks spend in micro-dollars so it can be shared without a lock.
#[derive(Debug)]
pub struct CostBudget {
    limit_micros: Option<u64>,
    spent_micros: AtomicU64,
}

impl CostBudget {
    /// `None` means unlimited.
    pub fn new(limit_usd: Option<f64>) -> Self {
        Self {
            limit_micros: limit_usd.map(to_micros),
            spent_micros: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn charge(&self, usd: f64) {
        self.spent_micros.fetch_add(to_micros(usd), Ordering::SeqCst);
    }

    pub fn spent_usd(&self) -> f64 {
        self.spent_micros.load(Ordering::SeqCst) as f64 / MICROS_PER_USD
    }

    pub fn is_exhausted(&self) -> bool {
        match self.limit_micros {
            Some(limit) => self.spent_micros.load(Ordering::SeqCst) >= limit,
            None => false,
        }
    }

    /// Fail with [`BudgetExhaustedError`] if no further model call may be issued.
    pub fn ensure_available(&self) -> Result<()> {
        if let Some(limit) = self.limit_micros
            && self.is_exhausted()
        {
            return Err(BudgetExhaustedError {
                spent_usd: self.spent_usd(),
                limit_usd: limit as f64 / MICROS_PER_USD,
            }
            .into());
        }
        Ok(())
    }
}

fn to_micros(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * MICROS_PER_USD).round() as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_exhausts() {
        let budget = CostBudget::unlimited();
        budget.charge(1_000.0);
        assert!(!budget.is_exhausted());
        budget.ensure_available().expect("available");
    }

    #[test]
    fn exhausts_once_limit_reached() {
        let budget = CostBudget::new(Some(0.10));
        budget.charge(0.04);
        budget.ensure_available().expect("still available");
        budget.charge(0.06);
        assert!(budget.is_exhausted());

        let err = budget.ensure_available().unwrap_err();
        let exhausted = err
            .downcast_ref::<BudgetExhaustedError>()
            .expect("budget error");
        assert!((exhausted.spent_usd - 0.10).abs() < 1e-9);
    }

    #[test]
    fn negative_charges_are_ignored() {
        let budget = CostBudget::new(Some(1.0));
        budget.charge(-5.0);
        assert_eq!(budget.spent_usd(), 0.0);
    }
}
