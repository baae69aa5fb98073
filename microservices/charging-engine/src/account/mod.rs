//! Accounts
//!
//! The account aggregate: balance chains keyed by (type, direction), unit
//! counters and action triggers. All mutation goes through the account
//! engine under the serialization guardian.

pub mod balance;
pub mod counter;
pub mod engine;
pub mod trigger;

pub use balance::{Balance, BalanceChain};
pub use counter::{CounterEvent, UnitCounter};
pub use engine::AccountEngine;
pub use trigger::{ActionTrigger, ThresholdKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{BalanceKey, BalanceType, Direction};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub allow_negative: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub balances: HashMap<BalanceKey, BalanceChain>,
    #[serde(default)]
    pub unit_counters: Vec<UnitCounter>,
    #[serde(default)]
    pub action_triggers: Vec<ActionTrigger>,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn chain(&self, key: BalanceKey) -> Option<&BalanceChain> {
        self.balances.get(&key)
    }

    pub fn chain_mut(&mut self, key: BalanceKey) -> &mut BalanceChain {
        self.balances.entry(key).or_default()
    }

    /// Locate a balance by uuid across every chain.
    pub fn find_balance_mut(&mut self, uuid: &str) -> Option<&mut Balance> {
        self.balances
            .values_mut()
            .find_map(|chain| chain.find_uuid_mut(uuid))
    }

    /// The default monetary balance for a direction, created when missing.
    pub fn default_money_balance_mut(&mut self, direction: Direction) -> &mut Balance {
        let chain = self.chain_mut(BalanceKey::new(BalanceType::Monetary, direction));
        if let Some(position) = chain.iter().position(|b| b.is_default()) {
            return &mut chain[position];
        }
        chain.push(Balance {
            uuid: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        });
        chain.last_mut().expect("balance just pushed")
    }

    /// Expired balances are purged lazily; they never participate in
    /// debiting regardless.
    pub fn clean_expired(&mut self, now: DateTime<Utc>) {
        for chain in self.balances.values_mut() {
            chain.retain(|b| !b.is_expired_at(now));
        }
        self.balances.retain(|_, chain| !chain.is_empty());
    }

    /// Accumulate a consumption observation into the matching unit counter,
    /// creating the counter when none exists for the (type, direction) pair.
    pub fn count_units(&mut self, event: &CounterEvent) {
        if let Some(counter) = self
            .unit_counters
            .iter_mut()
            .find(|c| c.matches(event.balance_type, event.direction))
        {
            counter.accumulate(event);
            return;
        }
        let mut counter = UnitCounter::new(event.balance_type, event.direction);
        counter.accumulate(event);
        self.unit_counters.push(counter);
    }

    /// Zero counters, all of them or only those of one balance type.
    pub fn reset_counters(&mut self, balance_type: Option<BalanceType>) {
        for counter in self
            .unit_counters
            .iter_mut()
            .filter(|c| balance_type.map_or(true, |t| c.balance_type == t))
        {
            counter.reset();
        }
    }

    pub fn reset_triggers(&mut self) {
        for trigger in &mut self.action_triggers {
            trigger.reset();
        }
    }

    /// Sum of active, unexpired balance values under a key.
    pub fn total_value(&self, key: BalanceKey, now: DateTime<Utc>) -> f64 {
        self.chain(key).map(|c| c.total_value(now)).unwrap_or(0.0)
    }

    /// Observed value for a trigger: counter accumulation for counter
    /// thresholds, matching balance values for balance thresholds.
    pub fn trigger_value(&self, trigger: &ActionTrigger, now: DateTime<Utc>) -> f64 {
        if trigger.threshold_type.observes_counter() {
            self.unit_counters
                .iter()
                .filter(|c| c.matches(trigger.balance_type, trigger.direction))
                .map(|c| c.value_for_trigger(trigger))
                .sum()
        } else {
            let direction = trigger.direction.unwrap_or(Direction::Out);
            self.chain(BalanceKey::new(trigger.balance_type, direction))
                .map(|chain| {
                    chain
                        .iter()
                        .filter(|b| !b.is_expired_at(now) && b.match_action_trigger(trigger))
                        .map(|b| b.value)
                        .sum()
                })
                .unwrap_or(0.0)
        }
    }

    pub fn has_dirty_balances(&self) -> bool {
        self.balances
            .values()
            .any(|chain| chain.iter().any(|b| b.dirty))
    }

    pub fn clear_dirty(&mut self) {
        for chain in self.balances.values_mut() {
            for balance in chain.iter_mut() {
                balance.dirty = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_units_creates_counter_then_accumulates() {
        let mut acc = Account::new("dan");
        let event = CounterEvent {
            balance_type: BalanceType::Voice,
            direction: Some(Direction::Out),
            amount: 10.0,
            destination_ids: vec!["NAT".into()],
        };
        acc.count_units(&event);
        acc.count_units(&event);
        assert_eq!(acc.unit_counters.len(), 1);
        assert_eq!(acc.unit_counters[0].balances[0].value, 20.0);
    }

    #[test]
    fn out_and_unset_directions_counted_separately() {
        let mut acc = Account::new("dan");
        let out = CounterEvent {
            balance_type: BalanceType::Voice,
            direction: Some(Direction::Out),
            amount: 10.0,
            destination_ids: vec![],
        };
        let unset = CounterEvent {
            direction: None,
            ..out.clone()
        };
        acc.count_units(&out);
        acc.count_units(&unset);
        assert_eq!(acc.unit_counters.len(), 2);
    }

    #[test]
    fn clean_expired_purges_dead_balances() {
        let mut acc = Account::new("dan");
        let chain = acc.chain_mut(BalanceKey::out(BalanceType::Voice));
        chain.push(Balance {
            uuid: "old".into(),
            value: 10.0,
            expiration_date: Some(Utc::now() - chrono::Duration::hours(1)),
            ..Default::default()
        });
        chain.push(Balance {
            uuid: "live".into(),
            value: 10.0,
            ..Default::default()
        });
        acc.clean_expired(Utc::now());
        let chain = acc.chain(BalanceKey::out(BalanceType::Voice)).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].uuid, "live");
    }

    #[test]
    fn default_money_balance_created_once() {
        let mut acc = Account::new("dan");
        acc.default_money_balance_mut(Direction::Out).set_value(5.0);
        acc.default_money_balance_mut(Direction::Out).add_value(5.0);
        let chain = acc.chain(BalanceKey::out(BalanceType::Monetary)).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].value, 10.0);
    }
}
