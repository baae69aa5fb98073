//! Charging Engine
//!
//! Real-time charging for voice/SMS/data traffic:
//! - Rating pipeline: destinations, rate intervals, timespans, increments
//! - Account engine: prioritized balance chains, debit/refund, counters,
//!   triggers
//! - Shared groups: cross-account credit pools with sharing strategies
//! - Serialization guardian: per-account mutual exclusion
//! - Storage backends: in-memory, sled, PostgreSQL

pub mod account;
pub mod actions;
pub mod api;
pub mod cdr;
pub mod events;
pub mod guardian;
pub mod mail;
pub mod rating;
pub mod sharing;
pub mod storage;
pub mod types;

pub use account::{Account, AccountEngine, ActionTrigger, Balance, BalanceChain, CounterEvent, ThresholdKind, UnitCounter};
pub use actions::{Action, ActionKind, ActionPlan};
pub use cdr::{CdrCollector, ChargingCdr};
pub use events::{BalanceEvent, EventBus};
pub use guardian::Guardian;
pub use mail::{Mailer, OutboundMail};
pub use rating::{Destination, Rate, RateInterval, RatingPlan, RatingProfile, RatingStore};
pub use sharing::{SharedGroup, SharingParameters, SharingStrategy};
pub use storage::{AccountingStorage, MemoryStorage, PostgresStorage, RatingStorage, SledStorage};
pub use types::{BalanceKey, BalanceType, CallCost, CallDescriptor, Direction, Increment, TimeSpan};
