//! Event bus
//!
//! Best-effort pub/sub for balance mutations. Every value change publishes
//! an `account_balance_modified` event after the guarded section releases;
//! subscribers match events with exact-field filter expressions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::account::{Account, Balance};

pub const EVT_ACCOUNT_BALANCE_MODIFIED: &str = "account_balance_modified";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceEvent {
    pub event_name: String,
    pub uuid: String,
    pub id: String,
    pub value: f64,
    pub expiration_date: Option<chrono::DateTime<chrono::Utc>>,
    pub weight: f64,
    pub destination_ids: Vec<String>,
    pub rating_subject: String,
    pub category: String,
    pub shared_group: String,
    pub account_id: String,
    pub account_allow_negative: bool,
    pub account_disabled: bool,
}

impl BalanceEvent {
    pub fn from_balance(balance: &Balance, account: &Account) -> Self {
        Self {
            event_name: EVT_ACCOUNT_BALANCE_MODIFIED.to_string(),
            uuid: balance.uuid.clone(),
            id: balance.id.clone(),
            value: balance.value,
            expiration_date: balance.expiration_date,
            weight: balance.weight,
            destination_ids: balance.destination_ids.clone(),
            rating_subject: balance.rating_subject.clone(),
            category: balance.category.clone(),
            shared_group: balance.shared_group.clone(),
            account_id: account.id.clone(),
            account_allow_negative: account.allow_negative,
            account_disabled: account.disabled,
        }
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "event_name" => Some(self.event_name.clone()),
            "uuid" => Some(self.uuid.clone()),
            "id" => Some(self.id.clone()),
            "rating_subject" => Some(self.rating_subject.clone()),
            "category" => Some(self.category.clone()),
            "shared_group" => Some(self.shared_group.clone()),
            "account_id" => Some(self.account_id.clone()),
            "account_allow_negative" => Some(self.account_allow_negative.to_string()),
            "account_disabled" => Some(self.account_disabled.to_string()),
            _ => None,
        }
    }

    /// Exact-match filter expression: every entry must equal the event field.
    pub fn matches(&self, filter: &HashMap<String, String>) -> bool {
        filter
            .iter()
            .all(|(name, expected)| self.field(name).as_deref() == Some(expected.as_str()))
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BalanceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Best-effort: events are dropped when nobody listens or a subscriber
    /// lags behind.
    pub fn publish(&self, event: BalanceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_all(&self, events: Vec<BalanceEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BalanceEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: HashMap<String, String>) -> FilteredSubscriber {
        FilteredSubscriber {
            rx: self.tx.subscribe(),
            filter,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct FilteredSubscriber {
    rx: broadcast::Receiver<BalanceEvent>,
    filter: HashMap<String, String>,
}

impl FilteredSubscriber {
    /// Next event passing the filter; None once the bus closes.
    pub async fn recv(&mut self) -> Option<BalanceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.matches(&self.filter) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
