//! Per-run token accounting with a budget ceiling.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::UsageRecord;

pub const DEFAULT_WARN_THRESHOLD_PERCENT: u8 = 80;

/// Parse a token count from external input, rejecting negatives and junk.
pub fn parse_tokens(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    if trimmed.starts_with('-') {
        return Err(anyhow!("token count must not be negative (got '{trimmed}')"));
    }
    trimmed
        .replace('_', "")
        .parse::<u64>()
        .map_err(|_| anyhow!("token count must be a non-negative integer (got '{trimmed}')"))
}

/// Usage query result for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: Option<f64>,
    pub estimated: bool,
    pub used: u64,
    pub limit: Option<u64>,
}

/// Cumulative usage for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageLedger {
    limit: Option<u64>,
    used: u64,
    warned: bool,
    totals: UsageRecord,
}

impl UsageLedger {
    /// Fresh ledger with a token ceiling.
    pub fn new(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            used: 0,
            warned: false,
            totals: UsageRecord::default(),
        }
    }

    /// Fresh ledger that only counts.
    pub fn unbounded() -> Self {
        Self {
            limit: None,
            used: 0,
            warned: false,
            totals: UsageRecord::default(),
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn record(&mut self, tokens: u64) {
        self.used = self.used.saturating_add(tokens);
    }

    /// Fold one invocation's usage into the totals and charge its tokens.
    pub fn record_usage(&mut self, usage: &UsageRecord) {
        self.totals.accumulate(usage);
        self.record(usage.total_tokens());
    }

    /// `limit - used`; negative once over budget. `None` when unbounded.
    pub fn remaining(&self) -> Option<i128> {
        self.limit.map(|limit| i128::from(limit) - i128::from(self.used))
    }

    /// True only when usage is strictly above the limit.
    pub fn check_over_budget(&self) -> bool {
        self.limit.is_some_and(|limit| self.used > limit)
    }

    /// True the first time usage reaches `threshold_percent` of the limit.
    pub fn check_warning(&mut self, threshold_percent: u8) -> bool {
        if self.warned {
            return false;
        }
        let Some(limit) = self.limit.filter(|l| *l > 0) else {
            return false;
        };
        let reached = u128::from(self.used) * 100 >= u128::from(limit) * u128::from(threshold_percent);
        if reached {
            self.warned = true;
        }
        reached
    }

    pub fn warned(&self) -> bool {
        self.warned
    }

    /// Percentage of the limit consumed, if bounded and non-zero.
    pub fn percent_used(&self) -> Option<u64> {
        self.limit
            .filter(|l| *l > 0)
            .map(|l| ((u128::from(self.used) * 100) / u128::from(l)) as u64)
    }

    pub fn summary(&self) -> UsageSummary {
        UsageSummary {
            input_tokens: self.totals.input_tokens,
            output_tokens: self.totals.output_tokens,
            cache_read_tokens: self.totals.cache_read_tokens,
            cache_creation_tokens: self.totals.cache_creation_tokens,
            cost_usd: self.totals.cost_usd,
            estimated: self.totals.estimated,
            used: self.used,
            limit: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_at_limit_is_within_budget() {
        let mut ledger = UsageLedger::new(1000);
        ledger.record(1000);
        assert!(!ledger.check_over_budget());
        assert_eq!(ledger.remaining(), Some(0));
        ledger.record(1);
        assert!(ledger.check_over_budget());
        assert_eq!(ledger.remaining(), Some(-1));
    }

    #[test]
    fn warning_fires_once() {
        let mut ledger = UsageLedger::new(1000);
        ledger.record(799);
        assert!(!ledger.check_warning(DEFAULT_WARN_THRESHOLD_PERCENT));
        ledger.record(1);
        assert!(ledger.check_warning(DEFAULT_WARN_THRESHOLD_PERCENT));
        ledger.record(150);
        assert!(!ledger.check_warning(DEFAULT_WARN_THRESHOLD_PERCENT));
        ledger.record(500);
        assert!(!ledger.check_warning(DEFAULT_WARN_THRESHOLD_PERCENT));
        assert!(ledger.warned());
    }

    #[test]
    fn zero_limit_never_warns() {
        let mut ledger = UsageLedger::new(0);
        ledger.record(10);
        assert!(!ledger.check_warning(80));
        assert!(ledger.check_over_budget());
        assert_eq!(ledger.percent_used(), None);
    }

    #[test]
    fn unbounded_counts_but_never_stops() {
        let mut ledger = UsageLedger::unbounded();
        ledger.record(u64::MAX);
        ledger.record(5);
        assert_eq!(ledger.used(), u64::MAX);
        assert!(!ledger.check_over_budget());
        assert!(!ledger.check_warning(1));
        assert_eq!(ledger.remaining(), None);
    }

    #[test]
    fn record_usage_accumulates_totals() {
        let mut ledger = UsageLedger::new(10_000);
        ledger.record_usage(&UsageRecord {
            input_tokens: 100,
            output_tokens: 50,
            cache_read_tokens: 400,
            cost_usd: Some(0.01),
            ..UsageRecord::default()
        });
        ledger.record_usage(&UsageRecord {
            input_tokens: 200,
            output_tokens: 75,
            ..UsageRecord::default()
        });
        let summary = ledger.summary();
        assert_eq!(summary.input_tokens, 300);
        assert_eq!(summary.output_tokens, 125);
        assert_eq!(summary.cache_read_tokens, 400);
        assert_eq!(summary.cost_usd, Some(0.01));
        assert_eq!(summary.used, 425);
        assert_eq!(ledger.percent_used(), Some(4));
    }

    #[test]
    fn parse_tokens_rejects_negative_and_non_numeric() {
        assert_eq!(parse_tokens("1000").expect("parse"), 1000);
        assert_eq!(parse_tokens(" 2_000_000 ").expect("parse"), 2_000_000);
        assert!(parse_tokens("-5").is_err());
        assert!(parse_tokens("lots").is_err());
        assert!(parse_tokens("").is_err());
    }
}
