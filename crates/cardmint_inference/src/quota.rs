//! Daily external quota ledger for the primary path.

use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaState {
    Available,
    /// Remaining calls dropped under the warning threshold.
    Warning(u64),
    Exhausted,
}

struct Ledger {
    day: chrono::NaiveDate,
    used: u64,
}

/// Tracks primary-path usage against an optional daily quota. Resets at the
/// UTC day boundary.
pub struct QuotaLedger {
    daily_quota: Option<u64>,
    warning_threshold: u64,
    ledger: Mutex<Ledger>,
}

impl QuotaLedger {
    pub fn new(daily_quota: Option<u64>, warning_threshold: u64) -> Self {
        Self {
            daily_quota,
            warning_threshold,
            ledger: Mutex::new(Ledger {
                day: chrono::Utc::now().date_naive(),
                used: 0,
            }),
        }
    }

    /// Consume one call if available. Exhausted quota routes callers to the
    /// fallback preemptively.
    pub fn try_consume(&self) -> QuotaState {
        self.try_consume_at(chrono::Utc::now().date_naive())
    }

    fn try_consume_at(&self, today: chrono::NaiveDate) -> QuotaState {
        let Some(quota) = self.daily_quota else {
            return QuotaState::Available;
        };

        let mut ledger = self
            .ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if ledger.day != today {
            ledger.day = today;
            ledger.used = 0;
        }
        if ledger.used >= quota {
            return QuotaState::Exhausted;
        }
        ledger.used += 1;
        let remaining = quota - ledger.used;
        if remaining < self.warning_threshold {
            warn!(remaining, quota, "Primary inference quota running low");
            QuotaState::Warning(remaining)
        } else {
            QuotaState::Available
        }
    }
}
