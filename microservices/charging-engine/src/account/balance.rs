//! Balances
//!
//! A balance is a quantified, filtered credit unit: monetary value, voice
//! seconds, SMS, data or generic units, scoped by destination, category,
//! shared group, validity and weight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

use crate::account::trigger::ActionTrigger;
use crate::rating::destination::PrefixIndex;
use crate::rating::interval::RateTiming;
use crate::types::{parse_zero_rating_subject, round_balance_value, ANY};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
    /// System-wide unique.
    pub uuid: String,
    /// Unique within the owning account.
    #[serde(default)]
    pub id: String,
    pub value: f64,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub destination_ids: Vec<String>,
    #[serde(default)]
    pub rating_subject: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub shared_group: String,
    #[serde(default)]
    pub timings: Vec<RateTiming>,
    /// Destination-match precision, set while assembling debit candidates.
    #[serde(skip)]
    pub precision: usize,
    /// Set on every value mutation; cleared when the account persists.
    #[serde(skip)]
    pub dirty: bool,
}

impl Balance {
    pub fn monetary(uuid: impl Into<String>, value: f64) -> Self {
        Self {
            uuid: uuid.into(),
            value,
            ..Default::default()
        }
    }

    /// A default balance carries no filter at all.
    pub fn is_default(&self) -> bool {
        (self.destination_ids.is_empty()
            || self.destination_ids.iter().all(|d| d == ANY))
            && self.rating_subject.is_empty()
            && self.category.is_empty()
            && self.expiration_date.is_none()
            && self.shared_group.is_empty()
            && self.weight == 0.0
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration_date, Some(exp) if exp < now)
    }

    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        self.timings.is_empty() || self.timings.iter().any(|tim| tim.is_active_at(t))
    }

    pub fn has_destination(&self) -> bool {
        !self.destination_ids.is_empty() && self.destination_ids.iter().any(|d| d != ANY)
    }

    pub fn match_destination_id(&self, destination_id: &str) -> bool {
        !self.has_destination() || self.destination_ids.iter().any(|d| d == destination_id)
    }

    pub fn match_category(&self, category: &str) -> bool {
        self.category.is_empty() || self.category == category
    }

    /// Free-of-charge unit balances bill at zero cost per a fixed duration.
    pub fn zero_billing_unit(&self) -> Option<std::time::Duration> {
        parse_zero_rating_subject(&self.rating_subject)
    }

    /// Longest prefix of `number` owned by this balance's destinations.
    pub fn matching_prefix(
        &self,
        index: &PrefixIndex,
        number: &str,
    ) -> Option<(String, String)> {
        if !self.has_destination() {
            return None;
        }
        index.matching_prefix_for(&self.destination_ids, number)
    }

    fn sorted_destinations(&self) -> Vec<String> {
        let mut ids: Vec<String> = if self.destination_ids.is_empty() {
            vec![ANY.to_string()]
        } else {
            self.destination_ids.clone()
        };
        ids.sort();
        ids
    }

    /// Match against an action's balance filter: an explicit id wins, else
    /// every zero-valued filter field is a wildcard.
    pub fn match_filter(&self, filter: &Balance) -> bool {
        if !filter.id.is_empty() {
            return self.id == filter.id;
        }
        (filter.expiration_date.is_none() || filter.expiration_date == self.expiration_date)
            && (filter.weight == 0.0 || filter.weight == self.weight)
            && (filter.destination_ids.is_empty()
                || self.sorted_destinations() == filter.sorted_destinations())
            && (filter.rating_subject.is_empty() || filter.rating_subject == self.rating_subject)
            && (filter.category.is_empty() || filter.category == self.category)
            && (filter.shared_group.is_empty() || filter.shared_group == self.shared_group)
    }

    /// Match against a trigger's balance filter.
    pub fn match_action_trigger(&self, trigger: &ActionTrigger) -> bool {
        if !trigger.balance_id.is_empty() {
            return self.id == trigger.balance_id;
        }
        let destinations_match = trigger.balance_destination_ids.is_empty() || {
            let mut filter = trigger.balance_destination_ids.clone();
            filter.sort();
            self.sorted_destinations() == filter
        };
        destinations_match
            && (trigger.balance_expiration_date.is_none()
                || trigger.balance_expiration_date == self.expiration_date)
            && (trigger.balance_weight == 0.0 || trigger.balance_weight == self.weight)
            && (trigger.balance_rating_subject.is_empty()
                || trigger.balance_rating_subject == self.rating_subject)
            && (trigger.balance_shared_group.is_empty()
                || trigger.balance_shared_group == self.shared_group)
            && (trigger.balance_category.is_empty()
                || trigger.balance_category == self.category)
    }

    pub fn set_value(&mut self, amount: f64) {
        self.value = round_balance_value(amount);
        self.dirty = true;
    }

    pub fn add_value(&mut self, amount: f64) {
        self.set_value(self.value + amount);
    }

    pub fn sub_value(&mut self, amount: f64) {
        self.set_value(self.value - amount);
    }
}

/// Balances sharing a (type, direction) key inside an account, ordered for
/// consumption by destination precision, then weight, both descending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceChain(pub Vec<Balance>);

impl BalanceChain {
    pub fn new(balances: Vec<Balance>) -> Self {
        Self(balances)
    }

    /// Stable: equal precision and weight keep their relative order.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| {
            b.precision
                .cmp(&a.precision)
                .then_with(|| {
                    b.weight
                        .partial_cmp(&a.weight)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
    }

    pub fn total_value(&self, now: DateTime<Utc>) -> f64 {
        self.0
            .iter()
            .filter(|b| !b.is_expired_at(now) && b.is_active_at(now))
            .map(|b| b.value)
            .sum()
    }

    pub fn find_uuid(&self, uuid: &str) -> Option<&Balance> {
        self.0.iter().find(|b| b.uuid == uuid)
    }

    pub fn find_uuid_mut(&mut self, uuid: &str) -> Option<&mut Balance> {
        self.0.iter_mut().find(|b| b.uuid == uuid)
    }
}

impl Deref for BalanceChain {
    type Target = Vec<Balance>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BalanceChain {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl IntoIterator for BalanceChain {
    type Item = Balance;
    type IntoIter = std::vec::IntoIter<Balance>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(uuid: &str, precision: usize, weight: f64) -> Balance {
        Balance {
            uuid: uuid.into(),
            precision,
            weight,
            ..Default::default()
        }
    }

    #[test]
    fn chain_orders_by_precision_then_weight() {
        let mut chain = BalanceChain::new(vec![
            balance("w5", 0, 5.0),
            balance("p4", 4, 0.0),
            balance("w10", 0, 10.0),
            balance("p3", 3, 20.0),
        ]);
        chain.sort();
        let order: Vec<&str> = chain.iter().map(|b| b.uuid.as_str()).collect();
        assert_eq!(order, vec!["p4", "p3", "w10", "w5"]);
    }

    #[test]
    fn chain_sort_is_stable_under_ties() {
        let mut chain = BalanceChain::new(vec![
            balance("first", 2, 7.0),
            balance("second", 2, 7.0),
            balance("third", 2, 7.0),
        ]);
        chain.sort();
        let order: Vec<&str> = chain.iter().map(|b| b.uuid.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn default_balance_has_no_filters() {
        let mut b = Balance::monetary("b1", 10.0);
        assert!(b.is_default());
        b.weight = 10.0;
        assert!(!b.is_default());
    }

    #[test]
    fn filter_matching_treats_zero_fields_as_wildcards() {
        let b = Balance {
            uuid: "b1".into(),
            id: "pkg".into(),
            weight: 10.0,
            destination_ids: vec!["NAT".into()],
            ..Default::default()
        };
        let by_id = Balance {
            id: "pkg".into(),
            ..Default::default()
        };
        assert!(b.match_filter(&by_id));

        let by_weight = Balance {
            weight: 10.0,
            ..Default::default()
        };
        assert!(b.match_filter(&by_weight));

        let wrong_weight = Balance {
            weight: 5.0,
            ..Default::default()
        };
        assert!(!b.match_filter(&wrong_weight));
    }

    #[test]
    fn expiration_and_timings() {
        let mut b = Balance::monetary("b1", 10.0);
        assert!(!b.is_expired_at(Utc::now()));
        b.expiration_date = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(b.is_expired_at(Utc::now()));

        let mut evenings = Balance::monetary("b2", 10.0);
        evenings.timings.push(RateTiming {
            start_time: "18:00:00".into(),
            end_time: "22:00:00".into(),
            ..Default::default()
        });
        use chrono::TimeZone;
        let morning = Utc.with_ymd_and_hms(2013, 9, 24, 10, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2013, 9, 24, 19, 0, 0).unwrap();
        assert!(!evenings.is_active_at(morning));
        assert!(evenings.is_active_at(evening));
    }

    #[test]
    fn value_mutations_round_and_mark_dirty() {
        let mut b = Balance::monetary("b1", 10.0);
        b.sub_value(0.1 + 0.2);
        assert!(b.dirty);
        assert_eq!(b.value, 9.7);
    }
}
