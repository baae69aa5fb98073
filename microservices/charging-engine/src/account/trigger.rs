//! Action triggers
//!
//! Threshold observers on balances and unit counters. When the observed
//! value crosses the threshold the trigger enqueues its action list; a
//! non-recurrent trigger fires once until reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{BalanceType, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdKind {
    #[serde(rename = "*max_balance")]
    MaxBalance,
    #[serde(rename = "*min_balance")]
    MinBalance,
    #[serde(rename = "*max_counter")]
    MaxCounter,
    #[serde(rename = "*min_counter")]
    MinCounter,
}

impl ThresholdKind {
    pub fn observes_counter(&self) -> bool {
        matches!(self, Self::MaxCounter | Self::MinCounter)
    }

    pub fn crossed(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::MaxBalance | Self::MaxCounter => value >= threshold,
            Self::MinBalance | Self::MinCounter => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTrigger {
    #[serde(default)]
    pub id: String,
    pub balance_type: BalanceType,
    #[serde(default)]
    pub direction: Option<Direction>,
    pub threshold_type: ThresholdKind,
    pub threshold_value: f64,
    /// Balance filter: an explicit balance id short-circuits the field
    /// filters below.
    #[serde(default)]
    pub balance_id: String,
    #[serde(default)]
    pub balance_destination_ids: Vec<String>,
    #[serde(default)]
    pub balance_expiration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub balance_weight: f64,
    #[serde(default)]
    pub balance_rating_subject: String,
    #[serde(default)]
    pub balance_shared_group: String,
    #[serde(default)]
    pub balance_category: String,
    #[serde(default)]
    pub recurrent: bool,
    #[serde(default)]
    pub min_sleep: Duration,
    #[serde(default)]
    pub min_queued_items: i64,
    pub actions_id: String,
    #[serde(default)]
    pub executed: bool,
    #[serde(default)]
    pub last_executed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub weight: f64,
}

impl ActionTrigger {
    /// Whether this trigger may fire now, given its execution history.
    pub fn armed(&self, now: DateTime<Utc>) -> bool {
        if !self.executed {
            return true;
        }
        if !self.recurrent {
            return false;
        }
        match self.last_executed {
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.min_sleep
            }
            None => true,
        }
    }

    pub fn mark_executed(&mut self, now: DateTime<Utc>) {
        self.executed = true;
        self.last_executed = Some(now);
    }

    pub fn reset(&mut self) {
        self.executed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger() -> ActionTrigger {
        ActionTrigger {
            id: "t1".into(),
            balance_type: BalanceType::Monetary,
            direction: Some(Direction::Out),
            threshold_type: ThresholdKind::MaxCounter,
            threshold_value: 2.0,
            balance_id: String::new(),
            balance_destination_ids: Vec::new(),
            balance_expiration_date: None,
            balance_weight: 0.0,
            balance_rating_subject: String::new(),
            balance_shared_group: String::new(),
            balance_category: String::new(),
            recurrent: false,
            min_sleep: Duration::ZERO,
            min_queued_items: 0,
            actions_id: "TOPUP_10".into(),
            executed: false,
            last_executed: None,
            weight: 10.0,
        }
    }

    #[test]
    fn threshold_predicates() {
        assert!(ThresholdKind::MaxCounter.crossed(2.0, 2.0));
        assert!(!ThresholdKind::MaxCounter.crossed(1.9, 2.0));
        assert!(ThresholdKind::MinBalance.crossed(1.0, 2.0));
        assert!(!ThresholdKind::MinBalance.crossed(3.0, 2.0));
    }

    #[test]
    fn non_recurrent_fires_once() {
        let mut t = trigger();
        let now = Utc::now();
        assert!(t.armed(now));
        t.mark_executed(now);
        assert!(!t.armed(now));
        t.reset();
        assert!(t.armed(now));
    }

    #[test]
    fn recurrent_respects_min_sleep() {
        let mut t = trigger();
        t.recurrent = true;
        t.min_sleep = Duration::from_secs(60);
        let now = Utc::now();
        t.mark_executed(now);
        assert!(!t.armed(now + chrono::Duration::seconds(30)));
        assert!(t.armed(now + chrono::Duration::seconds(61)));
    }
}
