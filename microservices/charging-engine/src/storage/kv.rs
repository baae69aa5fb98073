//! Embedded key-value storage
//!
//! sled-backed realization of the storage contract. Values are compact
//! binary (bincode); rating plans are additionally deflate-compressed at
//! rest. Reads go through a per-prefix cache invalidated on tariff reload.

use async_trait::async_trait;
use dashmap::DashMap;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::path::Path;

use ocs_core::{OcsError, Result};

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

pub struct SledStorage {
    db: sled::Db,
    /// Raw-bytes read cache keyed by the full prefixed key.
    cache: DashMap<String, Vec<u8>>,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| OcsError::Storage(e.to_string()))?;
        Ok(Self {
            db,
            cache: DashMap::new(),
        })
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| OcsError::Storage(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| OcsError::Storage(e.to_string()))
    }

    fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(bytes)
            .and_then(|_| encoder.finish())
            .map_err(|e| OcsError::Storage(e.to_string()))
    }

    fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| OcsError::Storage(e.to_string()))?;
        Ok(out)
    }

    fn put(&self, key: String, bytes: Vec<u8>) -> Result<()> {
        self.db
            .insert(key.as_bytes(), bytes.clone())
            .map_err(|e| OcsError::Storage(e.to_string()))?;
        self.cache.insert(key, bytes);
        Ok(())
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(Some(hit.clone()));
        }
        let found = self
            .db
            .get(key.as_bytes())
            .map_err(|e| OcsError::Storage(e.to_string()))?
            .map(|ivec| ivec.to_vec());
        if let Some(bytes) = &found {
            self.cache.insert(key.to_string(), bytes.clone());
        }
        Ok(found)
    }

    fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| OcsError::Storage(e.to_string()))?;
        self.cache.remove(key);
        Ok(())
    }

    fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry.map_err(|e| OcsError::Storage(e.to_string()))?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}

#[async_trait]
impl RatingStorage for SledStorage {
    async fn get_destination(&self, id: &str) -> Result<Option<Destination>> {
        self.get_value(&format!("{}{}", DESTINATION_PREFIX, id))
    }

    async fn set_destination(&self, destination: &Destination) -> Result<()> {
        let key = format!("{}{}", DESTINATION_PREFIX, destination.id);
        self.put(key, Self::encode(destination)?)
    }

    async fn get_rating_plan(&self, id: &str) -> Result<Option<RatingPlan>> {
        let key = format!("{}{}", RATING_PLAN_PREFIX, id);
        match self.get_raw(&key)? {
            Some(bytes) => Ok(Some(Self::decode(&Self::decompress(&bytes)?)?)),
            None => Ok(None),
        }
    }

    async fn set_rating_plan(&self, plan: &RatingPlan) -> Result<()> {
        let key = format!("{}{}", RATING_PLAN_PREFIX, plan.id);
        self.put(key, Self::compress(&Self::encode(plan)?)?)
    }

    async fn get_rating_profile(&self, id: &str) -> Result<Option<RatingProfile>> {
        self.get_value(&format!("{}{}", RATING_PROFILE_PREFIX, id))
    }

    async fn set_rating_profile(&self, profile: &RatingProfile) -> Result<()> {
        let key = format!("{}{}", RATING_PROFILE_PREFIX, profile.id);
        self.put(key, Self::encode(profile)?)
    }

    async fn get_shared_group(&self, id: &str) -> Result<Option<SharedGroup>> {
        self.get_value(&format!("{}{}", SHARED_GROUP_PREFIX, id))
    }

    async fn set_shared_group(&self, group: &SharedGroup) -> Result<()> {
        let key = format!("{}{}", SHARED_GROUP_PREFIX, group.id);
        self.put(key, Self::encode(group)?)
    }

    async fn get_actions(&self, id: &str) -> Result<Option<Vec<Action>>> {
        self.get_value(&format!("{}{}", ACTIONS_PREFIX, id))
    }

    async fn set_actions(&self, id: &str, actions: &[Action]) -> Result<()> {
        let key = format!("{}{}", ACTIONS_PREFIX, id);
        self.put(key, Self::encode(&actions.to_vec())?)
    }

    async fn get_action_plans(&self, id: &str) -> Result<Option<Vec<ActionPlan>>> {
        self.get_value(&format!("{}{}", ACTION_PLANS_PREFIX, id))
    }

    async fn set_action_plans(&self, id: &str, plans: &[ActionPlan]) -> Result<()> {
        let key = format!("{}{}", ACTION_PLANS_PREFIX, id);
        self.put(key, Self::encode(&plans.to_vec())?)
    }

    async fn get_derived_chargers(&self, key: &str) -> Result<Option<DerivedChargers>> {
        self.get_value(&format!("{}{}", DERIVED_CHARGERS_PREFIX, key))
    }

    async fn set_derived_chargers(&self, key: &str, chargers: &DerivedChargers) -> Result<()> {
        let key = format!("{}{}", DERIVED_CHARGERS_PREFIX, key);
        self.put(key, Self::encode(chargers)?)
    }

    async fn has_data(&self, prefix: &str, id: &str) -> Result<bool> {
        let key = format!("{}{}", prefix, id);
        Ok(self.get_raw(&key)?.is_some())
    }

    async fn get_keys_for_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.scan_keys(prefix)
    }

    async fn invalidate_prefix(&self, prefix: &str) {
        self.cache.retain(|key, _| !key.starts_with(prefix));
    }
}

#[async_trait]
impl AccountingStorage for SledStorage {
    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        // accounts bypass the cache: they mutate on the hot path
        let key = format!("{}{}", ACCOUNT_PREFIX, id);
        let found = self
            .db
            .get(key.as_bytes())
            .map_err(|e| OcsError::Storage(e.to_string()))?;
        match found {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_account(&self, account: &Account) -> Result<()> {
        let key = format!("{}{}", ACCOUNT_PREFIX, account.id);
        self.db
            .insert(key.as_bytes(), Self::encode(account)?)
            .map_err(|e| OcsError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn remove_account(&self, id: &str) -> Result<()> {
        self.remove(&format!("{}{}", ACCOUNT_PREFIX, id))
    }

    async fn get_account_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .scan_keys(ACCOUNT_PREFIX)?
            .into_iter()
            .map(|k| k.trim_start_matches(ACCOUNT_PREFIX).to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rating::interval::{Rate, RateGroups, RateInterval, RateRating, RateTiming};
    use std::time::Duration;

    fn temp_storage() -> SledStorage {
        let dir = std::env::temp_dir().join(format!("ocs-sled-{}", uuid::Uuid::new_v4()));
        SledStorage::open(dir).unwrap()
    }

    #[tokio::test]
    async fn rating_plan_roundtrips_through_compression() {
        let storage = temp_storage();
        let mut plan = RatingPlan::new("RP_STANDARD");
        plan.add_intervals(
            "NAT",
            vec![RateInterval {
                timing: RateTiming::default(),
                rating: RateRating {
                    rates: RateGroups::new(vec![Rate::new(
                        Duration::ZERO,
                        1.0,
                        Duration::from_secs(60),
                        Duration::from_secs(60),
                    )]),
                    ..Default::default()
                },
                weight: 10.0,
            }],
        );
        storage.set_rating_plan(&plan).await.unwrap();
        let loaded = storage.get_rating_plan("RP_STANDARD").await.unwrap().unwrap();
        assert_eq!(loaded.id, "RP_STANDARD");
        assert!(loaded.dest_intervals.contains_key("NAT"));
    }

    #[tokio::test]
    async fn cache_invalidation_by_prefix() {
        let storage = temp_storage();
        let dest = Destination::new("NAT", vec!["0723".into()]);
        storage.set_destination(&dest).await.unwrap();
        assert!(storage.get_destination("NAT").await.unwrap().is_some());
        storage.invalidate_prefix(DESTINATION_PREFIX).await;
        // still readable from disk after the cache drop
        assert!(storage.get_destination("NAT").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn account_binary_roundtrip() {
        let storage = temp_storage();
        let mut account = Account::new("dan");
        account
            .default_money_balance_mut(crate::types::Direction::Out)
            .set_value(42.5);
        storage.set_account(&account).await.unwrap();
        let loaded = storage.get_account("dan").await.unwrap().unwrap();
        assert_eq!(
            loaded.total_value(
                crate::types::BalanceKey::out(crate::types::BalanceType::Monetary),
                chrono::Utc::now()
            ),
            42.5
        );
    }
}
