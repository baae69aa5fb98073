//! Shared groups
//!
//! Cross-account credit pools. A balance tagged with a shared group exposes
//! the peer balances of the other member accounts; the group's sharing
//! strategy decides consumption order. Groups form a star: membership is
//! never followed transitively.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::ANY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharingStrategy {
    #[serde(rename = "*mine_lowest")]
    MineLowest,
    #[serde(rename = "*mine_highest")]
    MineHighest,
    #[serde(rename = "*mine_random")]
    MineRandom,
    #[serde(rename = "*lowest")]
    Lowest,
    #[serde(rename = "*highest")]
    Highest,
    #[serde(rename = "*random")]
    Random,
}

impl SharingStrategy {
    pub fn mine_first(&self) -> bool {
        matches!(self, Self::MineLowest | Self::MineHighest | Self::MineRandom)
    }
}

impl Default for SharingStrategy {
    fn default() -> Self {
        Self::MineRandom
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharingParameters {
    #[serde(default)]
    pub strategy: SharingStrategy,
    /// Overrides the rating subject used when peers consume this account's
    /// balances.
    #[serde(default)]
    pub rating_subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedGroup {
    pub id: String,
    pub members: Vec<String>,
    /// Keyed by member account id, with `*any` as the fallback entry.
    #[serde(default)]
    pub account_parameters: HashMap<String, SharingParameters>,
}

impl SharedGroup {
    pub fn members_except(&self, account_id: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.as_str() != account_id)
            .cloned()
            .collect()
    }

    pub fn parameters_for(&self, account_id: &str) -> Option<&SharingParameters> {
        self.account_parameters
            .get(account_id)
            .or_else(|| self.account_parameters.get(ANY))
    }

    pub fn strategy_for(&self, account_id: &str) -> SharingStrategy {
        self.parameters_for(account_id)
            .map(|p| p.strategy)
            .unwrap_or_default()
    }

    pub fn rating_subject_for(&self, account_id: &str) -> Option<&str> {
        self.parameters_for(account_id)
            .map(|p| p.rating_subject.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Order shared candidates per strategy. `value` reads the candidate's
/// current balance value; `is_mine` identifies the local balance, moved to
/// the head afterwards by the `mine*` variants.
pub fn order_by_strategy<T>(
    strategy: SharingStrategy,
    items: &mut Vec<T>,
    value: impl Fn(&T) -> f64,
    is_mine: impl Fn(&T) -> bool,
) {
    match strategy {
        SharingStrategy::Lowest | SharingStrategy::MineLowest => {
            items.sort_by(|a, b| {
                value(a)
                    .partial_cmp(&value(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        SharingStrategy::Highest | SharingStrategy::MineHighest => {
            items.sort_by(|a, b| {
                value(b)
                    .partial_cmp(&value(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        SharingStrategy::Random | SharingStrategy::MineRandom => {
            items.shuffle(&mut rand::thread_rng());
        }
    }
    if strategy.mine_first() {
        if let Some(index) = items.iter().position(&is_mine) {
            items.swap(0, index);
        }
    }
}
