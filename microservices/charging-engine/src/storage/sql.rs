//! SQL storage
//!
//! PostgreSQL realization of the storage contract. The logical key-value
//! mapping lands in two tables, one per trait, with LIKE-based prefix
//! scans. Values use the same binary encoding as the embedded backend.

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use tokio_postgres::NoTls;

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

const RATING_TABLE: &str = "ocs_rating";
const ACCOUNTING_TABLE: &str = "ocs_accounting";

pub struct PostgresStorage {
    pool: Pool,
    /// Read cache for immutable rating data.
    cache: DashMap<String, Vec<u8>>,
}

impl PostgresStorage {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let config: tokio_postgres::Config = db_url
            .parse()
            .map_err(|e: tokio_postgres::Error| OcsError::Config(e.to_string()))?;
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(16)
            .build()
            .map_err(|e| OcsError::Storage(e.to_string()))?;

        let storage = Self {
            pool,
            cache: DashMap::new(),
        };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let client = self.client().await?;
        for table in [RATING_TABLE, ACCOUNTING_TABLE] {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value BYTEA NOT NULL)",
                table
            );
            client
                .execute(sql.as_str(), &[])
                .await
                .map_err(|e| OcsError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| OcsError::Storage(e.to_string()))
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

    async fn put(&self, table: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        let client = self.client().await?;
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            table
        );
        client
            .execute(sql.as_str(), &[&key, &bytes])
            .await
            .map_err(|e| OcsError::Storage(e.to_string()))?;
        if table == RATING_TABLE {
            self.cache.insert(key.to_string(), bytes);
        }
        Ok(())
    }

    async fn get_raw(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
        if table == RATING_TABLE {
            if let Some(hit) = self.cache.get(key) {
                return Ok(Some(hit.clone()));
            }
        }
        let client = self.client().await?;
        let sql = format!("SELECT value FROM {} WHERE key = $1", table);
        let row = client
            .query_opt(sql.as_str(), &[&key])
            .await
            .map_err(|e| OcsError::Storage(e.to_string()))?;
        let found = row.map(|r| r.get::<_, Vec<u8>>(0));
        if table == RATING_TABLE {
            if let Some(bytes) = &found {
                self.cache.insert(key.to_string(), bytes.clone());
            }
        }
        Ok(found)
    }

    async fn get_value<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>> {
        match self.get_raw(table, key).await? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        let client = self.client().await?;
        let sql = format!("DELETE FROM {} WHERE key = $1", table);
        client
            .execute(sql.as_str(), &[&key])
            .await
            .map_err(|e| OcsError::Storage(e.to_string()))?;
        self.cache.remove(key);
        Ok(())
    }

    async fn scan_keys(&self, table: &str, prefix: &str) -> Result<Vec<String>> {
        let client = self.client().await?;
        let pattern = format!("{}%", prefix);
        let sql = format!("SELECT key FROM {} WHERE key LIKE $1 ORDER BY key", table);
        let rows = client
            .query(sql.as_str(), &[&pattern])
            .await
            .map_err(|e| OcsError::Storage(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }
}

#[async_trait]
impl RatingStorage for PostgresStorage {
    async fn get_destination(&self, id: &str) -> Result<Option<Destination>> {
        self.get_value(RATING_TABLE, &format!("{}{}", DESTINATION_PREFIX, id))
            .await
    }

    async fn set_destination(&self, destination: &Destination) -> Result<()> {
        let key = format!("{}{}", DESTINATION_PREFIX, destination.id);
        self.put(RATING_TABLE, &key, Self::encode(destination)?).await
    }

    async fn get_rating_plan(&self, id: &str) -> Result<Option<RatingPlan>> {
        let key = format!("{}{}", RATING_PLAN_PREFIX, id);
        match self.get_raw(RATING_TABLE, &key).await? {
            Some(bytes) => Ok(Some(Self::decode(&Self::decompress(&bytes)?)?)),
            None => Ok(None),
        }
    }

    async fn set_rating_plan(&self, plan: &RatingPlan) -> Result<()> {
        let key = format!("{}{}", RATING_PLAN_PREFIX, plan.id);
        self.put(RATING_TABLE, &key, Self::compress(&Self::encode(plan)?)?)
            .await
    }

    async fn get_rating_profile(&self, id: &str) -> Result<Option<RatingProfile>> {
        self.get_value(RATING_TABLE, &format!("{}{}", RATING_PROFILE_PREFIX, id))
            .await
    }

    async fn set_rating_profile(&self, profile: &RatingProfile) -> Result<()> {
        let key = format!("{}{}", RATING_PROFILE_PREFIX, profile.id);
        self.put(RATING_TABLE, &key, Self::encode(profile)?).await
    }

    async fn get_shared_group(&self, id: &str) -> Result<Option<SharedGroup>> {
        self.get_value(RATING_TABLE, &format!("{}{}", SHARED_GROUP_PREFIX, id))
            .await
    }

    async fn set_shared_group(&self, group: &SharedGroup) -> Result<()> {
        let key = format!("{}{}", SHARED_GROUP_PREFIX, group.id);
        self.put(RATING_TABLE, &key, Self::encode(group)?).await
    }

    async fn get_actions(&self, id: &str) -> Result<Option<Vec<Action>>> {
        self.get_value(RATING_TABLE, &format!("{}{}", ACTIONS_PREFIX, id))
            .await
    }

    async fn set_actions(&self, id: &str, actions: &[Action]) -> Result<()> {
        let key = format!("{}{}", ACTIONS_PREFIX, id);
        self.put(RATING_TABLE, &key, Self::encode(&actions.to_vec())?)
            .await
    }

    async fn get_action_plans(&self, id: &str) -> Result<Option<Vec<ActionPlan>>> {
        self.get_value(RATING_TABLE, &format!("{}{}", ACTION_PLANS_PREFIX, id))
            .await
    }

    async fn set_action_plans(&self, id: &str, plans: &[ActionPlan]) -> Result<()> {
        let key = format!("{}{}", ACTION_PLANS_PREFIX, id);
        self.put(RATING_TABLE, &key, Self::encode(&plans.to_vec())?)
            .await
    }

    async fn get_derived_chargers(&self, key: &str) -> Result<Option<DerivedChargers>> {
        self.get_value(RATING_TABLE, &format!("{}{}", DERIVED_CHARGERS_PREFIX, key))
            .await
    }

    async fn set_derived_chargers(&self, key: &str, chargers: &DerivedChargers) -> Result<()> {
        let key = format!("{}{}", DERIVED_CHARGERS_PREFIX, key);
        self.put(RATING_TABLE, &key, Self::encode(chargers)?).await
    }

    async fn has_data(&self, prefix: &str, id: &str) -> Result<bool> {
        let table = if prefix == ACCOUNT_PREFIX {
            ACCOUNTING_TABLE
        } else {
            RATING_TABLE
        };
        Ok(self
            .get_raw(table, &format!("{}{}", prefix, id))
            .await?
            .is_some())
    }

    async fn get_keys_for_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let table = if prefix == ACCOUNT_PREFIX {
            ACCOUNTING_TABLE
        } else {
            RATING_TABLE
        };
        self.scan_keys(table, prefix).await
    }

    async fn invalidate_prefix(&self, prefix: &str) {
        self.cache.retain(|key, _| !key.starts_with(prefix));
    }
}

#[async_trait]
impl AccountingStorage for PostgresStorage {
    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        self.get_value(ACCOUNTING_TABLE, &format!("{}{}", ACCOUNT_PREFIX, id))
            .await
    }

    async fn set_account(&self, account: &Account) -> Result<()> {
        let key = format!("{}{}", ACCOUNT_PREFIX, account.id);
        self.put(ACCOUNTING_TABLE, &key, Self::encode(account)?).await
    }

    async fn remove_account(&self, id: &str) -> Result<()> {
        self.delete(ACCOUNTING_TABLE, &format!("{}{}", ACCOUNT_PREFIX, id))
            .await
    }

    async fn get_account_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .scan_keys(ACCOUNTING_TABLE, ACCOUNT_PREFIX)
            .await?
            .into_iter()
            .map(|k| k.trim_start_matches(ACCOUNT_PREFIX).to_string())
            .collect())
    }
}
