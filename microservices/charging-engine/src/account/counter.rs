//! Unit counters
//!
//! Parallel chains of counter balances accumulating consumption for trigger
//! evaluation. Counters for the OUT direction and the unset direction are
//! kept separate.

use serde::{Deserialize, Serialize};

use crate::account::balance::{Balance, BalanceChain};
use crate::account::trigger::ActionTrigger;
use crate::types::{BalanceType, Direction};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitCounter {
    pub balance_type: BalanceType,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub balances: BalanceChain,
}

/// A single consumption observation to accumulate.
#[derive(Debug, Clone)]
pub struct CounterEvent {
    pub balance_type: BalanceType,
    pub direction: Option<Direction>,
    pub amount: f64,
    pub destination_ids: Vec<String>,
}

impl UnitCounter {
    pub fn new(balance_type: BalanceType, direction: Option<Direction>) -> Self {
        Self {
            balance_type,
            direction,
            balances: BalanceChain::default(),
        }
    }

    pub fn matches(&self, balance_type: BalanceType, direction: Option<Direction>) -> bool {
        self.balance_type == balance_type && self.direction == direction
    }

    /// Accumulate into the counter balance matching the event's destination
    /// filter, creating one when none exists yet.
    pub fn accumulate(&mut self, event: &CounterEvent) {
        let filter = Balance {
            destination_ids: event.destination_ids.clone(),
            ..Default::default()
        };
        if let Some(existing) = self
            .balances
            .iter_mut()
            .find(|b| b.match_filter(&filter))
        {
            existing.add_value(event.amount);
            return;
        }
        let mut created = Balance {
            destination_ids: event.destination_ids.clone(),
            ..Default::default()
        };
        created.set_value(event.amount);
        self.balances.push(created);
    }

    /// Total accumulated value over balances matching the trigger's filter.
    pub fn value_for_trigger(&self, trigger: &ActionTrigger) -> f64 {
        self.balances
            .iter()
            .filter(|b| b.match_action_trigger(trigger))
            .map(|b| b.value)
            .sum()
    }

    pub fn reset(&mut self) {
        for balance in self.balances.iter_mut() {
            balance.set_value(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(amount: f64) -> CounterEvent {
        CounterEvent {
            balance_type: BalanceType::Voice,
            direction: Some(Direction::Out),
            amount,
            destination_ids: vec!["NAT".into()],
        }
    }

    #[test]
    fn accumulates_into_matching_balance() {
        let mut counter = UnitCounter::new(BalanceType::Voice, Some(Direction::Out));
        counter.accumulate(&event(10.0));
        counter.accumulate(&event(5.0));
        assert_eq!(counter.balances.len(), 1);
        assert_eq!(counter.balances[0].value, 15.0);
    }

    #[test]
    fn separate_balances_per_destination_filter() {
        let mut counter = UnitCounter::new(BalanceType::Voice, Some(Direction::Out));
        counter.accumulate(&event(10.0));
        counter.accumulate(&CounterEvent {
            destination_ids: vec!["RET".into()],
            ..event(3.0)
        });
        assert_eq!(counter.balances.len(), 2);
    }

    #[test]
    fn reset_zeroes_all_balances() {
        let mut counter = UnitCounter::new(BalanceType::Voice, Some(Direction::Out));
        counter.accumulate(&event(10.0));
        counter.reset();
        assert_eq!(counter.balances[0].value, 0.0);
    }
}
