//! In-memory storage
//!
//! Backing store for tests and single-node deployments.

use async_trait::async_trait;
use dashmap::DashMap;

use ocs_core::Result;

use super::{
    DerivedChargers, ACCOUNT_PREFIX, ACTIONS_PREFIX, ACTION_PLANS_PREFIX,
    DERIVED_CHARGERS_PREFIX, DESTINATION_PREFIX, RATING_PLAN_PREFIX, RATING_PROFILE_PREFIX,
    SHARED_GROUP_PREFIX,
};
use crate::account::Account;
use crate::actions::{Action, ActionPlan};
use crate::rating::destination::Destination;
use crate::rating::plan::{RatingPlan, RatingProfile};
use crate::sharing::SharedGroup;
use crate::storage::{AccountingStorage, RatingStorage};

#[derive(Default)]
pub struct MemoryStorage {
    destinations: DashMap<String, Destination>,
    rating_plans: DashMap<String, RatingPlan>,
    rating_profiles: DashMap<String, RatingProfile>,
    shared_groups: DashMap<String, SharedGroup>,
    actions: DashMap<String, Vec<Action>>,
    action_plans: DashMap<String, Vec<ActionPlan>>,
    derived_chargers: DashMap<String, DerivedChargers>,
    accounts: DashMap<String, Account>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RatingStorage for MemoryStorage {
    async fn get_destination(&self, id: &str) -> Result<Option<Destination>> {
        Ok(self.destinations.get(id).map(|v| v.clone()))
    }

    async fn set_destination(&self, destination: &Destination) -> Result<()> {
        self.destinations
            .insert(destination.id.clone(), destination.clone());
        Ok(())
    }

    async fn get_rating_plan(&self, id: &str) -> Result<Option<RatingPlan>> {
        Ok(self.rating_plans.get(id).map(|v| v.clone()))
    }

    async fn set_rating_plan(&self, plan: &RatingPlan) -> Result<()> {
        self.rating_plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn get_rating_profile(&self, id: &str) -> Result<Option<RatingProfile>> {
        Ok(self.rating_profiles.get(id).map(|v| v.clone()))
    }

    async fn set_rating_profile(&self, profile: &RatingProfile) -> Result<()> {
        self.rating_profiles
            .insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn get_shared_group(&self, id: &str) -> Result<Option<SharedGroup>> {
        Ok(self.shared_groups.get(id).map(|v| v.clone()))
    }

    async fn set_shared_group(&self, group: &SharedGroup) -> Result<()> {
        self.shared_groups.insert(group.id.clone(), group.clone());
        Ok(())
    }

    async fn get_actions(&self, id: &str) -> Result<Option<Vec<Action>>> {
        Ok(self.actions.get(id).map(|v| v.clone()))
    }

    async fn set_actions(&self, id: &str, actions: &[Action]) -> Result<()> {
        self.actions.insert(id.to_string(), actions.to_vec());
        Ok(())
    }

    async fn get_action_plans(&self, id: &str) -> Result<Option<Vec<ActionPlan>>> {
        Ok(self.action_plans.get(id).map(|v| v.clone()))
    }

    async fn set_action_plans(&self, id: &str, plans: &[ActionPlan]) -> Result<()> {
        self.action_plans.insert(id.to_string(), plans.to_vec());
        Ok(())
    }

    async fn get_derived_chargers(&self, key: &str) -> Result<Option<DerivedChargers>> {
        Ok(self.derived_chargers.get(key).map(|v| v.clone()))
    }

    async fn set_derived_chargers(&self, key: &str, chargers: &DerivedChargers) -> Result<()> {
        self.derived_chargers
            .insert(key.to_string(), chargers.clone());
        Ok(())
    }

    async fn has_data(&self, prefix: &str, id: &str) -> Result<bool> {
        Ok(match prefix {
            DESTINATION_PREFIX => self.destinations.contains_key(id),
            RATING_PLAN_PREFIX => self.rating_plans.contains_key(id),
            RATING_PROFILE_PREFIX => self.rating_profiles.contains_key(id),
            SHARED_GROUP_PREFIX => self.shared_groups.contains_key(id),
            ACTIONS_PREFIX => self.actions.contains_key(id),
            ACTION_PLANS_PREFIX => self.action_plans.contains_key(id),
            DERIVED_CHARGERS_PREFIX => self.derived_chargers.contains_key(id),
            ACCOUNT_PREFIX => self.accounts.contains_key(id),
            _ => false,
        })
    }

    async fn get_keys_for_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = match prefix {
            DESTINATION_PREFIX => self
                .destinations
                .iter()
                .map(|e| format!("{}{}", prefix, e.key()))
                .collect(),
            RATING_PLAN_PREFIX => self
                .rating_plans
                .iter()
                .map(|e| format!("{}{}", prefix, e.key()))
                .collect(),
            RATING_PROFILE_PREFIX => self
                .rating_profiles
                .iter()
                .map(|e| format!("{}{}", prefix, e.key()))
                .collect(),
            SHARED_GROUP_PREFIX => self
                .shared_groups
                .iter()
                .map(|e| format!("{}{}", prefix, e.key()))
                .collect(),
            ACTIONS_PREFIX => self
                .actions
                .iter()
                .map(|e| format!("{}{}", prefix, e.key()))
                .collect(),
            ACTION_PLANS_PREFIX => self
                .action_plans
                .iter()
                .map(|e| format!("{}{}", prefix, e.key()))
                .collect(),
            DERIVED_CHARGERS_PREFIX => self
                .derived_chargers
                .iter()
                .map(|e| format!("{}{}", prefix, e.key()))
                .collect(),
            ACCOUNT_PREFIX => self
                .accounts
                .iter()
                .map(|e| format!("{}{}", prefix, e.key()))
                .collect(),
            _ => Vec::new(),
        };
        Ok(keys)
    }
}

#[async_trait]
impl AccountingStorage for MemoryStorage {
    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.get(id).map(|v| v.clone()))
    }

    async fn set_account(&self, account: &Account) -> Result<()> {
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn remove_account(&self, id: &str) -> Result<()> {
        self.accounts.remove(id);
        Ok(())
    }

    async fn get_account_keys(&self) -> Result<Vec<String>> {
        Ok(self.accounts.iter().map(|e| e.key().clone()).collect())
    }
}
