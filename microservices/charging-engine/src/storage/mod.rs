//! Storage contract
//!
//! Abstract key-value mapping with prefix scans, consumed by the rating
//! store and the account engine. Three realizations: in-memory, embedded
//! key-value (sled) and SQL (PostgreSQL).

pub mod kv;
pub mod memory;
pub mod sql;

pub use kv::SledStorage;
pub use memory::MemoryStorage;
pub use sql::PostgresStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use ocs_core::Result;

use crate::account::Account;
use crate::actions::{Action, ActionPlan};
use crate::rating::destination::Destination;
use crate::rating::plan::{RatingPlan, RatingProfile};
use crate::sharing::SharedGroup;

pub const DESTINATION_PREFIX: &str = "dst_";
pub const RATING_PLAN_PREFIX: &str = "rpl_";
pub const RATING_PROFILE_PREFIX: &str = "rpf_";
pub const SHARED_GROUP_PREFIX: &str = "shg_";
pub const ACTIONS_PREFIX: &str = "act_";
pub const ACTION_PLANS_PREFIX: &str = "apl_";
pub const DERIVED_CHARGERS_PREFIX: &str = "dcs_";
pub const ACCOUNT_PREFIX: &str = "acc_";

/// A derived charging run: a run id plus field overrides applied to the
/// original request by the mediation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedCharger {
    pub run_id: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

pub type DerivedChargers = Vec<DerivedCharger>;

/// Immutable tariff data: destinations, plans, profiles, groups, actions.
#[async_trait]
pub trait RatingStorage: Send + Sync {
    async fn get_destination(&self, id: &str) -> Result<Option<Destination>>;
    async fn set_destination(&self, destination: &Destination) -> Result<()>;

    async fn get_rating_plan(&self, id: &str) -> Result<Option<RatingPlan>>;
    async fn set_rating_plan(&self, plan: &RatingPlan) -> Result<()>;

    async fn get_rating_profile(&self, id: &str) -> Result<Option<RatingProfile>>;
    async fn set_rating_profile(&self, profile: &RatingProfile) -> Result<()>;

    async fn get_shared_group(&self, id: &str) -> Result<Option<SharedGroup>>;
    async fn set_shared_group(&self, group: &SharedGroup) -> Result<()>;

    async fn get_actions(&self, id: &str) -> Result<Option<Vec<Action>>>;
    async fn set_actions(&self, id: &str, actions: &[Action]) -> Result<()>;

    async fn get_action_plans(&self, id: &str) -> Result<Option<Vec<ActionPlan>>>;
    async fn set_action_plans(&self, id: &str, plans: &[ActionPlan]) -> Result<()>;

    async fn get_derived_chargers(&self, key: &str) -> Result<Option<DerivedChargers>>;
    async fn set_derived_chargers(&self, key: &str, chargers: &DerivedChargers) -> Result<()>;

    async fn has_data(&self, prefix: &str, id: &str) -> Result<bool>;
    async fn get_keys_for_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Drop cached entries under a key prefix; called on tariff reload.
    async fn invalidate_prefix(&self, _prefix: &str) {}
}

/// Mutable subscriber state: accounts and their balances.
#[async_trait]
pub trait AccountingStorage: Send + Sync {
    async fn get_account(&self, id: &str) -> Result<Option<Account>>;
    async fn set_account(&self, account: &Account) -> Result<()>;
    async fn remove_account(&self, id: &str) -> Result<()>;
    async fn get_account_keys(&self) -> Result<Vec<String>>;
}
