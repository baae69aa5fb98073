//! CDR collector
//!
//! Buffers rated call detail records produced by debits and by the cdrlog
//! action until they are flushed downstream.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::types::{BalanceType, CallCost, Direction};

pub const CDR_SOURCE_ENGINE: &str = "charging-engine";
pub const CDR_SOURCE_CDRLOG: &str = "cdrlog";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargingCdr {
    pub id: Uuid,
    pub source: String,
    pub direction: Direction,
    pub tenant: String,
    pub category: String,
    pub subject: String,
    pub account: String,
    pub destination: String,
    pub tor: BalanceType,
    pub setup_time: DateTime<Utc>,
    pub usage: Duration,
    pub cost: f64,
}

#[derive(Clone)]
pub struct CdrCollector {
    buffer: Arc<DashMap<Uuid, ChargingCdr>>,
    batch_size: usize,
}

impl CdrCollector {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(DashMap::new()),
            batch_size: 1000,
        }
    }

    pub fn record(&self, cdr: ChargingCdr) -> Uuid {
        let id = cdr.id;
        self.buffer.insert(id, cdr);
        if self.buffer.len() >= self.batch_size {
            self.flush();
        }
        id
    }

    /// Synthesize a CDR from a realized call cost.
    pub fn record_call_cost(&self, cc: &CallCost) -> Uuid {
        self.record(ChargingCdr {
            id: Uuid::new_v4(),
            source: CDR_SOURCE_ENGINE.to_string(),
            direction: cc.direction,
            tenant: cc.tenant.clone(),
            category: cc.category.clone(),
            subject: cc.subject.clone(),
            account: cc.account.clone(),
            destination: cc.destination.clone(),
            tor: cc.tor,
            setup_time: cc
                .timespans
                .first()
                .map(|ts| ts.time_start)
                .unwrap_or_else(Utc::now),
            usage: cc.total_duration(),
            cost: cc.cost,
        })
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Hand the buffered batch downstream. Delivery is the mediator's
    /// concern; the engine only drains its buffer.
    pub fn flush(&self) -> usize {
        let count = self.buffer.len();
        self.buffer.clear();
        tracing::info!(count, "Flushed CDR buffer");
        count
    }
}

impl Default for CdrCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_flushes() {
        let collector = CdrCollector::new();
        collector.record(ChargingCdr {
            id: Uuid::new_v4(),
            source: CDR_SOURCE_CDRLOG.to_string(),
            direction: Direction::Out,
            tenant: "vdf".into(),
            category: "call".into(),
            subject: "dan".into(),
            account: "dan".into(),
            destination: "0723045326".into(),
            tor: BalanceType::Monetary,
            setup_time: Utc::now(),
            usage: Duration::from_secs(60),
            cost: 1.2,
        });
        assert_eq!(collector.len(), 1);
        assert_eq!(collector.flush(), 1);
        assert!(collector.is_empty());
    }
}
