//! Account engine
//!
//! The debit-credit algorithm: walks the increments of a rated call against
//! the account's prioritized balance chains, honors shared groups and
//! max-cost policies, maintains counters and triggers, and persists the
//! account once per guarded section.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use ocs_core::{OcsError, Result};

use crate::account::{Account, ActionTrigger, Balance, CounterEvent};
use crate::actions::{execute_actions_on, Action, ActionKind, ActionPlan, ActionSideEffect};
use crate::cdr::CdrCollector;
use crate::events::{BalanceEvent, EventBus};
use crate::guardian::Guardian;
use crate::mail::Mailer;
use crate::rating::plan::{RatingQuery, RatingStore};
use crate::rating::timespan::{apply_max_cost, create_increments, split};
use crate::rating::interval::{Rate, RateGroups, RateInterval, RateRating, RateTiming};
use crate::sharing::order_by_strategy;
use crate::storage::AccountingStorage;
use crate::types::{
    account_lock_key, seconds_f64, BalanceKey, BalanceType, CallCost, CallDescriptor, Direction,
    Increment, MaxCostStrategy, TimeSpan, UnitInfo, ANY, META_NONE,
};

/// Hard cap on a single request window.
pub const DEFAULT_MAX_CALL_DURATION: Duration = Duration::from_secs(3 * 3600);

/// Reference to a debit candidate inside the working set.
#[derive(Debug, Clone)]
struct BalanceRef {
    account_id: String,
    key: BalanceKey,
    uuid: String,
    precision: usize,
    weight: f64,
    /// Sharing parameters may force a rating subject on peer balances.
    rating_subject_override: Option<String>,
}

/// Every account touched by one guarded operation, keyed by id. Mutations
/// flow through this map and persist together at the end.
#[derive(Debug, Clone)]
struct WorkingSet {
    accounts: HashMap<String, Account>,
    primary: String,
}

impl WorkingSet {
    fn primary(&self) -> &Account {
        &self.accounts[&self.primary]
    }

    fn primary_mut(&mut self) -> &mut Account {
        self.accounts
            .get_mut(&self.primary)
            .expect("primary account loaded")
    }

    fn account_mut(&mut self, id: &str) -> Option<&mut Account> {
        self.accounts.get_mut(id)
    }

    fn balance(&self, balance_ref: &BalanceRef) -> Option<&Balance> {
        self.accounts
            .get(&balance_ref.account_id)?
            .chain(balance_ref.key)?
            .find_uuid(&balance_ref.uuid)
    }

    fn balance_mut(&mut self, balance_ref: &BalanceRef) -> Option<&mut Balance> {
        self.accounts
            .get_mut(&balance_ref.account_id)?
            .chain_mut(balance_ref.key)
            .find_uuid_mut(&balance_ref.uuid)
    }

    fn balance_value(&self, balance_ref: &BalanceRef) -> f64 {
        self.balance(balance_ref).map(|b| b.value).unwrap_or(0.0)
    }

    fn collect_events(&self) -> Vec<BalanceEvent> {
        let mut events = Vec::new();
        for account in self.accounts.values() {
            for chain in account.balances.values() {
                for balance in chain.iter().filter(|b| b.dirty) {
                    events.push(BalanceEvent::from_balance(balance, account));
                }
            }
        }
        events
    }
}

pub struct AccountEngine {
    accounting: Arc<dyn AccountingStorage>,
    rating: Arc<RatingStore>,
    guardian: Arc<Guardian>,
    events: EventBus,
    cdrs: CdrCollector,
    mailer: Option<Mailer>,
    http: reqwest::Client,
    max_call_duration: Duration,
}

impl AccountEngine {
    pub fn new(accounting: Arc<dyn AccountingStorage>, rating: Arc<RatingStore>) -> Self {
        Self {
            accounting,
            rating,
            guardian: Arc::new(Guardian::new()),
            events: EventBus::default(),
            cdrs: CdrCollector::new(),
            mailer: None,
            http: reqwest::Client::new(),
            max_call_duration: DEFAULT_MAX_CALL_DURATION,
        }
    }

    pub fn with_mailer(mut self, mailer: Mailer) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn with_max_call_duration(mut self, cap: Duration) -> Self {
        self.max_call_duration = cap;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cdrs(&self) -> &CdrCollector {
        &self.cdrs
    }

    pub fn rating(&self) -> &Arc<RatingStore> {
        &self.rating
    }

    fn normalize(&self, cd: &CallDescriptor) -> Result<CallDescriptor> {
        let mut cd = cd.clone();
        cd.validate().map_err(OcsError::Validation)?;
        if cd.subject.is_empty() {
            cd.subject = cd.account.clone();
        }
        if cd.duration() > self.max_call_duration {
            cd.time_end = cd.time_start
                + chrono::Duration::from_std(self.max_call_duration).unwrap_or_else(|_| chrono::Duration::zero());
        }
        Ok(cd)
    }

    /// Dry rating: the full pipeline with max-cost policy applied, no
    /// account involvement.
    pub async fn get_cost(&self, cd: &CallDescriptor) -> Result<CallCost> {
        let cd = self.normalize(cd)?;
        let mut cc = self.standard_cost(&cd).await?;
        apply_max_cost(&mut cc, cd.max_cost_so_far);
        if cc.deduct_connect_fee && cc.connect_fee > 0.0 {
            if let Some(first) = cc.timespans.first_mut() {
                first
                    .increments
                    .insert(0, Increment::new(Duration::ZERO, cc.connect_fee));
            }
        }
        cc.update_cost();
        Ok(cc)
    }

    /// Full debit per the charging algorithm. A partial shortfall truncates
    /// the call cost; a total shortfall fails with `InsufficientCredit`.
    pub async fn debit(&self, cd: &CallDescriptor) -> Result<CallCost> {
        let cd = self.normalize(cd)?;
        let keys = self.lock_keys(&cd).await?;
        let (cc, events, effects) = self
            .guardian
            .guard(&keys, async {
                let mut ws = self.load_working_set(&cd).await?;
                let mut run = cd.clone();
                let cc = self.debit_credit(&mut ws, &mut run, true, false).await?;
                let effects = self.evaluate_all_triggers(&mut ws).await?;
                let events = ws.collect_events();
                self.persist(&mut ws).await?;
                Ok::<_, OcsError>((cc, events, effects))
            })
            .await?;
        self.events.publish_all(events);
        self.apply_side_effects(&cd.account, effects).await;
        self.cdrs.record_call_cost(&cc);
        Ok(cc)
    }

    /// Like debit, but truncates the request at the available credit
    /// instead of failing.
    pub async fn max_debit(&self, cd: &CallDescriptor) -> Result<CallCost> {
        let cd = self.normalize(cd)?;
        let keys = self.lock_keys(&cd).await?;
        let (cc, events, effects) = self
            .guardian
            .guard(&keys, async {
                let ws = self.load_working_set(&cd).await?;

                // probe on a copy of the working set
                let mut probe_ws = ws.clone();
                let mut probe_cd = cd.clone();
                let allowed = match self
                    .debit_credit(&mut probe_ws, &mut probe_cd, false, true)
                    .await
                {
                    Ok(probe_cc) => probe_cc.total_duration().min(cd.duration()),
                    Err(e) if e.is_credit_error() => Duration::ZERO,
                    Err(e) => return Err(e),
                };
                if allowed.is_zero() {
                    return Ok((cd.create_call_cost(), Vec::new(), Vec::new()));
                }

                let mut ws = ws;
                let mut run = cd.clone();
                run.time_end =
                    run.time_start + chrono::Duration::from_std(allowed).unwrap_or_else(|_| chrono::Duration::zero());
                let cc = self.debit_credit(&mut ws, &mut run, true, false).await?;
                let effects = self.evaluate_all_triggers(&mut ws).await?;
                let events = ws.collect_events();
                self.persist(&mut ws).await?;
                Ok::<_, OcsError>((cc, events, effects))
            })
            .await?;
        self.events.publish_all(events);
        self.apply_side_effects(&cd.account, effects).await;
        if !cc.timespans.is_empty() {
            self.cdrs.record_call_cost(&cc);
        }
        Ok(cc)
    }

    /// Largest duration for which every increment can be paid from the
    /// available balances. `None` means unlimited.
    pub async fn get_max_session_duration(&self, cd: &CallDescriptor) -> Result<Option<Duration>> {
        let cd = self.normalize(cd)?;
        let keys = self.lock_keys(&cd).await?;
        self.guardian
            .guard(&keys, async {
                let mut ws = self.load_working_set(&cd).await?;
                if ws.primary().allow_negative {
                    return Ok(None);
                }
                let mut run = cd.clone();
                match self.debit_credit(&mut ws, &mut run, false, true).await {
                    Ok(cc) => Ok(Some(cc.total_duration().min(cd.duration()))),
                    Err(e) if e.is_credit_error() => Ok(Some(Duration::ZERO)),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Inverse of debit: restore the units and money each increment
    /// recorded. Counters are deliberately left untouched. Returns the
    /// account's remaining monetary total.
    pub async fn refund_increments(&self, cc: &CallCost) -> Result<f64> {
        let mut keys: Vec<String> = cc
            .timespans
            .iter()
            .flat_map(|ts| ts.increments.iter())
            .map(|inc| self.refund_account_id(cc, inc))
            .collect();
        keys.push(cc.account.clone());
        let lock_keys: Vec<String> = keys
            .iter()
            .map(|id| account_lock_key(cc.direction, &cc.tenant, id))
            .collect();

        let (total, events) = self
            .guardian
            .guard(&lock_keys, async {
                let mut ws = WorkingSet {
                    accounts: HashMap::new(),
                    primary: cc.account.clone(),
                };
                for id in &keys {
                    if !ws.accounts.contains_key(id) {
                        let account = self
                            .accounting
                            .get_account(id)
                            .await?
                            .ok_or_else(|| OcsError::AccountNotFound(id.clone()))?;
                        ws.accounts.insert(id.clone(), account);
                    }
                }

                for ts in &cc.timespans {
                    for inc in &ts.increments {
                        let owner_id = self.refund_account_id(cc, inc);
                        let Some(account) = ws.account_mut(&owner_id) else {
                            continue;
                        };
                        if let Some(unit_uuid) = &inc.balance_info.unit_balance_uuid {
                            let key = BalanceKey::new(cc.tor, cc.direction);
                            refund_into(account, key, unit_uuid, seconds_f64(inc.duration));
                        }
                        if let Some(money_uuid) = &inc.balance_info.money_balance_uuid {
                            let key = BalanceKey::new(BalanceType::Monetary, cc.direction);
                            refund_into(account, key, money_uuid, inc.cost);
                        }
                    }
                }

                let events = ws.collect_events();
                self.persist(&mut ws).await?;
                let total = ws
                    .primary()
                    .total_value(BalanceKey::new(BalanceType::Monetary, cc.direction), Utc::now());
                Ok::<_, OcsError>((total, events))
            })
            .await?;
        self.events.publish_all(events);
        Ok(total)
    }

    fn refund_account_id(&self, cc: &CallCost, inc: &crate::types::Increment) -> String {
        if inc.balance_info.account_id.is_empty() {
            cc.account.clone()
        } else {
            inc.balance_info.account_id.clone()
        }
    }

    /// Accumulate a consumption observation and evaluate triggers, the same
    /// path debits use internally.
    pub async fn count_units(
        &self,
        direction: Direction,
        tenant: &str,
        account_id: &str,
        event: CounterEvent,
    ) -> Result<()> {
        let key = account_lock_key(direction, tenant, account_id);
        let (events, effects) = self
            .guardian
            .guard(&[key], async {
                let mut ws = self.load_account_set(account_id).await?;
                ws.primary_mut().count_units(&event);
                let effects = self.evaluate_all_triggers(&mut ws).await?;
                let events = ws.collect_events();
                self.persist(&mut ws).await?;
                Ok::<_, OcsError>((events, effects))
            })
            .await?;
        self.events.publish_all(events);
        self.apply_side_effects(account_id, effects).await;
        Ok(())
    }

    /// Run a stored action list against an account.
    pub async fn execute_actions(
        &self,
        direction: Direction,
        tenant: &str,
        account_id: &str,
        actions_id: &str,
    ) -> Result<()> {
        let actions = self
            .rating
            .storage()
            .get_actions(actions_id)
            .await?
            .ok_or_else(|| OcsError::ActionsNotFound(actions_id.to_string()))?;
        self.execute_action_list(direction, tenant, account_id, &actions)
            .await
    }

    /// Run an explicit action list against an account.
    pub async fn execute_action_list(
        &self,
        direction: Direction,
        tenant: &str,
        account_id: &str,
        actions: &[Action],
    ) -> Result<()> {
        let key = account_lock_key(direction, tenant, account_id);
        let (events, effects) = self
            .guardian
            .guard(&[key], async {
                let mut ws = self.load_account_set(account_id).await?;
                let now = Utc::now();
                let mut effects = execute_actions_on(ws.primary_mut(), actions, now)?;
                effects.extend(self.evaluate_all_triggers(&mut ws).await?);
                let events = ws.collect_events();
                self.persist(&mut ws).await?;
                Ok::<_, OcsError>((events, effects))
            })
            .await?;
        self.events.publish_all(events);
        self.apply_side_effects(account_id, effects).await;
        Ok(())
    }

    /// Scheduled entry point: apply a plan's action list to every target
    /// account, one guarded section per account.
    pub async fn execute_action_plan(&self, plan: &ActionPlan) -> Result<()> {
        for account_id in &plan.account_ids {
            self.execute_actions(Direction::Out, &plan.tenant, account_id, &plan.actions_id)
                .await?;
        }
        Ok(())
    }

    /// Top-up primitive used by the action surface.
    pub async fn add_balance(
        &self,
        direction: Direction,
        tenant: &str,
        account_id: &str,
        balance_type: BalanceType,
        balance: Balance,
    ) -> Result<()> {
        self.single_balance_action(direction, tenant, account_id, balance_type, balance, ActionKind::Topup)
            .await
    }

    /// Debit primitive used by the action surface.
    pub async fn debit_balance(
        &self,
        direction: Direction,
        tenant: &str,
        account_id: &str,
        balance_type: BalanceType,
        balance: Balance,
    ) -> Result<()> {
        self.single_balance_action(direction, tenant, account_id, balance_type, balance, ActionKind::Debit)
            .await
    }

    /// Reset primitive used by the action surface.
    pub async fn reset_balance(
        &self,
        direction: Direction,
        tenant: &str,
        account_id: &str,
        balance_type: BalanceType,
        balance: Balance,
    ) -> Result<()> {
        self.single_balance_action(
            direction,
            tenant,
            account_id,
            balance_type,
            balance,
            ActionKind::TopupReset,
        )
        .await
    }

    async fn single_balance_action(
        &self,
        direction: Direction,
        tenant: &str,
        account_id: &str,
        balance_type: BalanceType,
        balance: Balance,
        kind: ActionKind,
    ) -> Result<()> {
        let action = Action {
            id: String::new(),
            kind,
            balance_type: Some(balance_type),
            direction: Some(direction),
            extra_parameters: String::new(),
            balance: Some(balance),
            weight: 0.0,
        };
        self.execute_action_list(direction, tenant, account_id, &[action])
            .await
    }

    // ---- internals -------------------------------------------------------

    async fn load_account_set(&self, account_id: &str) -> Result<WorkingSet> {
        let account = self
            .accounting
            .get_account(account_id)
            .await?
            .ok_or_else(|| OcsError::AccountNotFound(account_id.to_string()))?;
        let mut accounts = HashMap::new();
        accounts.insert(account_id.to_string(), account);
        Ok(WorkingSet {
            accounts,
            primary: account_id.to_string(),
        })
    }

    async fn load_working_set(&self, cd: &CallDescriptor) -> Result<WorkingSet> {
        let mut ws = self.load_account_set(&cd.account).await?;
        ws.primary_mut().clean_expired(Utc::now());
        Ok(ws)
    }

    /// Guardian keys for a debit: the account itself plus every member of
    /// any shared group its balances carry, computed before acquisition.
    async fn lock_keys(&self, cd: &CallDescriptor) -> Result<Vec<String>> {
        let mut keys = vec![cd.account_key()];
        if let Some(account) = self.accounting.get_account(&cd.account).await? {
            let mut groups: Vec<String> = account
                .balances
                .values()
                .flat_map(|chain| chain.iter())
                .filter(|b| !b.shared_group.is_empty())
                .map(|b| b.shared_group.clone())
                .collect();
            groups.sort();
            groups.dedup();
            for group_id in groups {
                if let Some(group) = self.rating.storage().get_shared_group(&group_id).await? {
                    for member in group.members_except(&cd.account) {
                        keys.push(account_lock_key(cd.direction, &cd.tenant, &member));
                    }
                }
            }
        }
        Ok(keys)
    }

    async fn persist(&self, ws: &mut WorkingSet) -> Result<()> {
        for account in ws.accounts.values_mut() {
            if account.has_dirty_balances() || account.id == ws.primary {
                account.clear_dirty();
                self.accounting.set_account(account).await?;
            }
        }
        Ok(())
    }

    async fn apply_side_effects(&self, account_id: &str, effects: Vec<ActionSideEffect>) {
        for effect in effects {
            match effect {
                ActionSideEffect::RemoveAccount => {
                    if let Err(e) = self.accounting.remove_account(account_id).await {
                        warn!(account = account_id, error = %e, "account removal failed");
                    }
                }
                ActionSideEffect::HttpPost {
                    url,
                    payload,
                    asynchronous,
                } => {
                    let client = self.http.clone();
                    let post = async move {
                        if let Err(e) = client.post(&url).json(&payload).send().await {
                            warn!(url = %url, error = %e, "action webhook failed");
                        }
                    };
                    if asynchronous {
                        tokio::spawn(post);
                    } else {
                        post.await;
                    }
                }
                ActionSideEffect::Mail(mail) => match &self.mailer {
                    Some(mailer) => mailer.queue(mail),
                    None => debug!(to = %mail.to, "mail action dropped, no mailer configured"),
                },
                ActionSideEffect::Cdr(cdr) => {
                    self.cdrs.record(cdr);
                }
            }
        }
    }

    /// Standard rating pipeline: intervals, split, increments.
    async fn standard_cost(&self, cd: &CallDescriptor) -> Result<CallCost> {
        let query = RatingQuery::from_descriptor(cd);
        let segments = self.rating.get_intervals(&query).await?;
        let mut cc = cd.create_call_cost();
        cc.timespans = split(cd, &segments);
        for ts in &mut cc.timespans {
            create_increments(ts)?;
        }
        if let Some(first) = cc.timespans.first() {
            if let Some(interval) = &first.rate_interval {
                cc.connect_fee = interval.rating.connect_fee;
                cc.rounding_method = interval.rating.rounding_method;
                cc.rounding_decimals = interval.rating.rounding_decimals;
            }
        }
        cc.update_cost();
        Ok(cc)
    }

    /// Rating under a balance's subject: the monetary cost of consuming this
    /// particular balance.
    async fn balance_cost(
        &self,
        cd: &CallDescriptor,
        subject_override: Option<&str>,
    ) -> Result<CallCost> {
        match subject_override {
            Some(subject) => {
                let mut sub = cd.clone();
                sub.subject = subject.to_string();
                sub.account = subject.to_string();
                self.standard_cost(&sub).await
            }
            None => self.standard_cost(cd).await,
        }
    }

    /// Candidate balances for a (type, direction) chain: the account's own
    /// matching balances, expanded through shared groups, ordered by
    /// precision then weight with sharing strategy applied inside groups.
    async fn useful_balances(
        &self,
        ws: &mut WorkingSet,
        cd: &CallDescriptor,
        balance_type: BalanceType,
    ) -> Result<Vec<BalanceRef>> {
        let key = BalanceKey::new(balance_type, cd.direction);
        let index = self.rating.prefix_index();
        let now = Utc::now();

        let own: Vec<Balance> = ws
            .primary()
            .chain(key)
            .map(|chain| chain.0.clone())
            .unwrap_or_default();

        let mut refs: Vec<BalanceRef> = Vec::new();
        let mut seen: Vec<(String, String)> = Vec::new();

        for balance in &own {
            if !self.balance_usable(balance, cd, now, &index) {
                continue;
            }
            let precision = balance
                .matching_prefix(&index, &cd.destination)
                .map(|(_, prefix)| prefix.len())
                .unwrap_or(0);
            let own_ref = BalanceRef {
                account_id: ws.primary.clone(),
                key,
                uuid: balance.uuid.clone(),
                precision,
                weight: balance.weight,
                rating_subject_override: None,
            };

            if balance.shared_group.is_empty() {
                if !seen.contains(&(own_ref.account_id.clone(), own_ref.uuid.clone())) {
                    seen.push((own_ref.account_id.clone(), own_ref.uuid.clone()));
                    refs.push(own_ref);
                }
                continue;
            }

            // shared balance: pull in every peer carrying the same group
            let group = self
                .rating
                .storage()
                .get_shared_group(&balance.shared_group)
                .await?
                .ok_or_else(|| OcsError::SharedGroupNotFound(balance.shared_group.clone()))?;

            let mut pool = vec![own_ref];
            for member in group.members_except(&ws.primary.clone()) {
                if !ws.accounts.contains_key(&member) {
                    match self.accounting.get_account(&member).await? {
                        Some(peer) => {
                            ws.accounts.insert(member.clone(), peer);
                        }
                        None => continue,
                    }
                }
                let peer = &ws.accounts[&member];
                let Some(chain) = peer.chain(key) else {
                    continue;
                };
                for peer_balance in chain.iter() {
                    if peer_balance.shared_group != group.id
                        || !self.balance_usable(peer_balance, cd, now, &index)
                    {
                        continue;
                    }
                    let precision = peer_balance
                        .matching_prefix(&index, &cd.destination)
                        .map(|(_, prefix)| prefix.len())
                        .unwrap_or(0);
                    pool.push(BalanceRef {
                        account_id: member.clone(),
                        key,
                        uuid: peer_balance.uuid.clone(),
                        precision,
                        weight: peer_balance.weight,
                        rating_subject_override: group
                            .rating_subject_for(&member)
                            .map(|s| s.to_string()),
                    });
                }
            }

            let strategy = group.strategy_for(&ws.primary.clone());
            let my_uuid = balance.uuid.clone();
            let snapshot = ws.clone();
            order_by_strategy(
                strategy,
                &mut pool,
                |r| snapshot.balance_value(r),
                |r| r.uuid == my_uuid,
            );
            for r in pool {
                if !seen.contains(&(r.account_id.clone(), r.uuid.clone())) {
                    seen.push((r.account_id.clone(), r.uuid.clone()));
                    refs.push(r);
                }
            }
        }

        // precision desc, weight desc; stable so strategy order survives ties
        refs.sort_by(|a, b| {
            b.precision.cmp(&a.precision).then_with(|| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });
        Ok(refs)
    }

    fn balance_usable(
        &self,
        balance: &Balance,
        cd: &CallDescriptor,
        now: DateTime<Utc>,
        index: &crate::rating::destination::PrefixIndex,
    ) -> bool {
        if balance.is_expired_at(now) || !balance.is_active_at(cd.time_start) {
            return false;
        }
        if !balance.match_category(&cd.category) {
            return false;
        }
        if balance.has_destination()
            && balance.matching_prefix(index, &cd.destination).is_none()
        {
            return false;
        }
        true
    }

    /// The debit-credit loop: unit balances first, then money, each pass
    /// paying as much of the remaining window as one balance covers.
    async fn debit_credit(
        &self,
        ws: &mut WorkingSet,
        cd: &mut CallDescriptor,
        count: bool,
        dry_run: bool,
    ) -> Result<CallCost> {
        let mut cc = cd.create_call_cost();

        let mut fee_increment = None;
        if cd.deduct_connect_fee {
            fee_increment = self.deduct_connect_fee(ws, cd, &mut cc, count).await?;
        }

        let mut remaining = cd.clone();
        remaining.deduct_connect_fee = false;
        loop {
            if remaining.time_start >= remaining.time_end || cc.max_cost_disconnect {
                break;
            }
            let mut progressed = false;

            if remaining.tor != BalanceType::Monetary {
                let unit_refs = self.useful_balances(ws, &remaining, remaining.tor).await?;
                let money_refs = self
                    .useful_balances(ws, &remaining, BalanceType::Monetary)
                    .await?;
                for unit_ref in &unit_refs {
                    if let Some(part) = self
                        .debit_balance_units(ws, unit_ref, &mut remaining, &money_refs, count)
                        .await?
                    {
                        advance(&mut remaining, &mut cc, part);
                        progressed = true;
                        break;
                    }
                }
                if progressed {
                    continue;
                }
            }

            let money_refs = self
                .useful_balances(ws, &remaining, BalanceType::Monetary)
                .await?;
            for money_ref in &money_refs {
                if let Some(part) = self
                    .debit_balance_money(ws, money_ref, &mut remaining, count)
                    .await?
                {
                    advance(&mut remaining, &mut cc, part);
                    progressed = true;
                    break;
                }
            }
            if progressed {
                continue;
            }

            if ws.primary().allow_negative {
                let part = self.debit_negative(ws, &mut remaining, count).await?;
                advance(&mut remaining, &mut cc, part);
            }
            break;
        }

        if cc.timespans.is_empty() && !cc.max_cost_disconnect {
            return Err(OcsError::InsufficientCredit);
        }
        // the paid fee rides on the call cost as a zero-duration prefix
        // increment so refund_increments can reverse it
        if let Some(fee_increment) = fee_increment {
            if cc.timespans.is_empty() {
                cc.timespans.push(TimeSpan {
                    time_start: cd.time_start,
                    time_end: cd.time_start,
                    duration_index: cd.duration_index,
                    rate_interval: None,
                    matched_subject: cd.subject.clone(),
                    matched_prefix: cd.destination.clone(),
                    matched_dest_id: ANY.to_string(),
                    rating_plan_id: META_NONE.to_string(),
                    increments: Vec::new(),
                });
            }
            cc.timespans[0].increments.insert(0, fee_increment);
        }
        if dry_run {
            debug!(account = %cd.account, "dry-run debit complete");
        }
        cd.max_cost_so_far = remaining.max_cost_so_far;
        cc.update_cost();
        Ok(cc)
    }

    /// The connect fee is reserved from the money chain before any
    /// increment; failing to cover it aborts the debit. The paying balance
    /// is stamped on the returned zero-duration increment.
    async fn deduct_connect_fee(
        &self,
        ws: &mut WorkingSet,
        cd: &CallDescriptor,
        cc: &mut CallCost,
        count: bool,
    ) -> Result<Option<Increment>> {
        let rated = self.standard_cost(cd).await?;
        let fee = rated.connect_fee;
        cc.connect_fee = fee;
        if fee <= 0.0 {
            return Ok(None);
        }

        let money_refs = self
            .useful_balances(ws, cd, BalanceType::Monetary)
            .await?;
        let payer = money_refs
            .iter()
            .find(|r| ws.balance_value(r) >= fee)
            .cloned();
        let (money_uuid, owner_id) = match payer {
            Some(payer_ref) => {
                if let Some(balance) = ws.balance_mut(&payer_ref) {
                    balance.sub_value(fee);
                }
                if count {
                    if let Some(owner) = ws.account_mut(&payer_ref.account_id) {
                        owner.count_units(&CounterEvent {
                            balance_type: BalanceType::Monetary,
                            direction: Some(cd.direction),
                            amount: fee,
                            destination_ids: vec![cd.destination.clone()],
                        });
                    }
                }
                (payer_ref.uuid, payer_ref.account_id)
            }
            None if ws.primary().allow_negative => {
                let primary = ws.primary_mut();
                let owner_id = primary.id.clone();
                let balance = primary.default_money_balance_mut(cd.direction);
                balance.sub_value(fee);
                (balance.uuid.clone(), owner_id)
            }
            None => return Err(OcsError::ConnectFeeNotCovered),
        };

        let mut fee_increment = Increment::new(Duration::ZERO, fee);
        fee_increment.paid = true;
        fee_increment.balance_info.money_balance_uuid = Some(money_uuid);
        fee_increment.balance_info.account_id = owner_id;
        Ok(Some(fee_increment))
    }

    /// Pay what this unit balance covers of the remaining window. Returns
    /// None when the balance contributes nothing.
    async fn debit_balance_units(
        &self,
        ws: &mut WorkingSet,
        unit_ref: &BalanceRef,
        cd: &mut CallDescriptor,
        money_refs: &[BalanceRef],
        count: bool,
    ) -> Result<Option<CallCost>> {
        let (zero_unit, subject) = {
            let Some(balance) = ws.balance(unit_ref) else {
                return Ok(None);
            };
            if !balance.is_active_at(cd.time_start) || balance.value <= 0.0 {
                return Ok(None);
            }
            (balance.zero_billing_unit(), balance.rating_subject.clone())
        };

        if let Some(unit) = zero_unit {
            return self.debit_zero_units(ws, unit_ref, cd, unit, count);
        }

        // cost-bearing unit balance: re-rate under its subject to learn the
        // monetary side of consuming it
        let has_subject =
            !subject.is_empty() && !subject.starts_with(crate::types::ZERO_RATING_SUBJECT_PREFIX);
        let subject_override = unit_ref
            .rating_subject_override
            .as_deref()
            .or(has_subject.then_some(subject.as_str()));
        let mut part = self.balance_cost(cd, subject_override).await?;

        let mut paid_any = false;
        let mut cut: Option<(usize, usize)> = None;
        'spans: for (ts_index, ts) in part.timespans.iter_mut().enumerate() {
            let interval = ts
                .rate_interval
                .clone()
                .ok_or_else(|| OcsError::Internal("timespan with no rate interval assigned".into()))?;
            let policy = interval.max_cost();
            for (inc_index, inc) in ts.increments.iter_mut().enumerate() {
                if let Some((max_cost, strategy)) = policy {
                    if cd.max_cost_so_far >= max_cost {
                        match strategy {
                            MaxCostStrategy::Disconnect => {
                                part.max_cost_disconnect = true;
                                cut = Some((ts_index, inc_index));
                                break 'spans;
                            }
                            MaxCostStrategy::Free => inc.cost = 0.0,
                        }
                    }
                }
                let seconds = seconds_f64(inc.duration);
                let cost = inc.cost;
                let money_ref = if cost > 0.0 {
                    money_refs.iter().find(|r| ws.balance_value(r) >= cost)
                } else {
                    None
                };
                let unit_covers = ws.balance_value(unit_ref) >= seconds;
                if unit_covers && (cost <= 0.0 || money_ref.is_some()) {
                    if let Some(balance) = ws.balance_mut(unit_ref) {
                        balance.sub_value(seconds);
                    }
                    inc.balance_info.unit_balance_uuid = Some(unit_ref.uuid.clone());
                    inc.balance_info.account_id = unit_ref.account_id.clone();
                    inc.unit_info = Some(UnitInfo {
                        destination: cd.destination.clone(),
                        quantity: seconds,
                        tor: cd.tor,
                    });
                    if let Some(money_ref) = money_ref {
                        let money_ref = money_ref.clone();
                        if let Some(balance) = ws.balance_mut(&money_ref) {
                            balance.sub_value(cost);
                        }
                        inc.balance_info.money_balance_uuid = Some(money_ref.uuid.clone());
                        cd.max_cost_so_far += cost;
                    }
                    inc.paid = true;
                    paid_any = true;
                    if count {
                        if let Some(owner) = ws.account_mut(&unit_ref.account_id) {
                            owner.count_units(&CounterEvent {
                                balance_type: cd.tor,
                                direction: Some(cd.direction),
                                amount: seconds,
                                destination_ids: vec![cd.destination.clone()],
                            });
                            if cost > 0.0 {
                                owner.count_units(&CounterEvent {
                                    balance_type: BalanceType::Monetary,
                                    direction: Some(cd.direction),
                                    amount: cost,
                                    destination_ids: vec![cd.destination.clone()],
                                });
                            }
                        }
                    }
                } else {
                    inc.paid = false;
                    cut = Some((ts_index, inc_index));
                    break 'spans;
                }
            }
        }

        truncate_part(&mut part, cut);
        if !paid_any && !part.max_cost_disconnect {
            return Ok(None);
        }
        Ok(Some(part))
    }

    /// Free-of-charge unit balance: covers duration at its own billing
    /// granularity regardless of money.
    fn debit_zero_units(
        &self,
        ws: &mut WorkingSet,
        unit_ref: &BalanceRef,
        cd: &mut CallDescriptor,
        unit: Duration,
        count: bool,
    ) -> Result<Option<CallCost>> {
        let index = self.rating.prefix_index();
        let (matched_prefix, matched_dest_id) = ws
            .balance(unit_ref)
            .and_then(|b| b.matching_prefix(&index, &cd.destination))
            .map(|(dest_id, prefix)| (prefix, dest_id))
            .unwrap_or_else(|| (cd.destination.clone(), ANY.to_string()));

        let mut ts = TimeSpan {
            time_start: cd.time_start,
            time_end: cd.time_end,
            duration_index: cd.duration_index,
            rate_interval: Some(RateInterval {
                timing: RateTiming::default(),
                rating: RateRating {
                    rates: RateGroups::new(vec![Rate::new(Duration::ZERO, 0.0, unit, unit)]),
                    ..Default::default()
                },
                weight: 0.0,
            }),
            matched_subject: unit_ref.uuid.clone(),
            matched_prefix,
            matched_dest_id,
            rating_plan_id: META_NONE.to_string(),
            increments: Vec::new(),
        };
        ts.round_to_duration(unit);
        create_increments(&mut ts)?;

        let mut paid = 0;
        for inc in ts.increments.iter_mut() {
            let amount = seconds_f64(inc.duration);
            if ws.balance_value(unit_ref) < amount {
                break;
            }
            if let Some(balance) = ws.balance_mut(unit_ref) {
                balance.sub_value(amount);
            }
            inc.balance_info.unit_balance_uuid = Some(unit_ref.uuid.clone());
            inc.balance_info.account_id = unit_ref.account_id.clone();
            inc.unit_info = Some(UnitInfo {
                destination: cd.destination.clone(),
                quantity: amount,
                tor: cd.tor,
            });
            inc.cost = 0.0;
            inc.paid = true;
            paid += 1;
            if count {
                if let Some(owner) = ws.account_mut(&unit_ref.account_id) {
                    owner.count_units(&CounterEvent {
                        balance_type: cd.tor,
                        direction: Some(cd.direction),
                        amount,
                        destination_ids: vec![cd.destination.clone()],
                    });
                }
            }
        }

        if paid == 0 {
            return Ok(None);
        }
        if paid < ts.increments.len() {
            ts.truncate_at_increment(paid);
        }
        let mut part = cd.create_call_cost();
        part.timespans = vec![ts];
        Ok(Some(part))
    }

    /// Pay what this money balance covers of the remaining window.
    async fn debit_balance_money(
        &self,
        ws: &mut WorkingSet,
        money_ref: &BalanceRef,
        cd: &mut CallDescriptor,
        count: bool,
    ) -> Result<Option<CallCost>> {
        let subject = {
            let Some(balance) = ws.balance(money_ref) else {
                return Ok(None);
            };
            if !balance.is_active_at(cd.time_start) || balance.value <= 0.0 {
                return Ok(None);
            }
            balance.rating_subject.clone()
        };
        let has_subject =
            !subject.is_empty() && !subject.starts_with(crate::types::ZERO_RATING_SUBJECT_PREFIX);
        let subject_override = money_ref
            .rating_subject_override
            .as_deref()
            .or(has_subject.then_some(subject.as_str()));
        let mut part = self.balance_cost(cd, subject_override).await?;

        let mut paid_any = false;
        let mut cut: Option<(usize, usize)> = None;
        'spans: for (ts_index, ts) in part.timespans.iter_mut().enumerate() {
            let interval = ts
                .rate_interval
                .clone()
                .ok_or_else(|| OcsError::Internal("timespan with no rate interval assigned".into()))?;
            let policy = interval.max_cost();
            for (inc_index, inc) in ts.increments.iter_mut().enumerate() {
                if let Some((max_cost, strategy)) = policy {
                    if cd.max_cost_so_far >= max_cost {
                        match strategy {
                            MaxCostStrategy::Disconnect => {
                                part.max_cost_disconnect = true;
                                cut = Some((ts_index, inc_index));
                                break 'spans;
                            }
                            MaxCostStrategy::Free => inc.cost = 0.0,
                        }
                    }
                }
                let amount = inc.cost;
                if amount > 0.0 && ws.balance_value(money_ref) < amount {
                    inc.paid = false;
                    cut = Some((ts_index, inc_index));
                    break 'spans;
                }
                if amount > 0.0 {
                    if let Some(balance) = ws.balance_mut(money_ref) {
                        balance.sub_value(amount);
                    }
                    cd.max_cost_so_far += amount;
                }
                inc.balance_info.money_balance_uuid = Some(money_ref.uuid.clone());
                inc.balance_info.account_id = money_ref.account_id.clone();
                inc.paid = true;
                paid_any = true;
                if count && amount > 0.0 {
                    if let Some(owner) = ws.account_mut(&money_ref.account_id) {
                        owner.count_units(&CounterEvent {
                            balance_type: BalanceType::Monetary,
                            direction: Some(cd.direction),
                            amount,
                            destination_ids: vec![cd.destination.clone()],
                        });
                    }
                }
            }
        }

        truncate_part(&mut part, cut);
        if !paid_any && !part.max_cost_disconnect {
            return Ok(None);
        }
        Ok(Some(part))
    }

    /// allowNegative final leg: the remaining window debits the default
    /// money balance, forcing it negative.
    async fn debit_negative(
        &self,
        ws: &mut WorkingSet,
        cd: &mut CallDescriptor,
        count: bool,
    ) -> Result<CallCost> {
        let mut part = self.standard_cost(cd).await?;
        let direction = cd.direction;
        let total: f64 = part
            .timespans
            .iter()
            .flat_map(|ts| ts.increments.iter())
            .map(|inc| inc.cost)
            .sum();

        let (uuid, account_id) = {
            let primary = ws.primary_mut();
            let account_id = primary.id.clone();
            let balance = primary.default_money_balance_mut(direction);
            balance.sub_value(total);
            (balance.uuid.clone(), account_id)
        };
        for ts in &mut part.timespans {
            for inc in &mut ts.increments {
                inc.balance_info.money_balance_uuid = Some(uuid.clone());
                inc.balance_info.account_id = account_id.clone();
                inc.paid = true;
            }
        }
        cd.max_cost_so_far += total;
        if count && total > 0.0 {
            ws.primary_mut().count_units(&CounterEvent {
                balance_type: BalanceType::Monetary,
                direction: Some(direction),
                amount: total,
                destination_ids: vec![cd.destination.clone()],
            });
        }
        Ok(part)
    }

    /// Threshold pass over every account in the working set. Triggers fire
    /// at most once per pass; the executed flag blocks refiring.
    async fn evaluate_all_triggers(&self, ws: &mut WorkingSet) -> Result<Vec<ActionSideEffect>> {
        let now = Utc::now();
        let mut effects = Vec::new();
        let ids: Vec<String> = ws.accounts.keys().cloned().collect();
        for id in ids {
            let fired = {
                let Some(account) = ws.account_mut(&id) else {
                    continue;
                };
                armed_crossed_triggers(account, now)
            };
            for trigger in fired {
                let actions = self
                    .rating
                    .storage()
                    .get_actions(&trigger.actions_id)
                    .await?
                    .ok_or_else(|| OcsError::ActionsNotFound(trigger.actions_id.clone()))?;
                if let Some(account) = ws.account_mut(&id) {
                    if let Some(stored) = account
                        .action_triggers
                        .iter_mut()
                        .find(|t| t.id == trigger.id)
                    {
                        stored.mark_executed(now);
                    }
                    effects.extend(execute_actions_on(account, &actions, now)?);
                }
            }
        }
        Ok(effects)
    }
}

/// Triggers armed and past their threshold, ordered by weight desc.
fn armed_crossed_triggers(account: &Account, now: DateTime<Utc>) -> Vec<ActionTrigger> {
    let mut fired: Vec<ActionTrigger> = account
        .action_triggers
        .iter()
        .filter(|t| t.armed(now))
        .filter(|t| {
            t.threshold_type
                .crossed(account.trigger_value(t, now), t.threshold_value)
        })
        .cloned()
        .collect();
    fired.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    fired
}

/// Append a partial result and move the remaining window past it.
fn advance(remaining: &mut CallDescriptor, cc: &mut CallCost, part: CallCost) {
    cc.max_cost_disconnect |= part.max_cost_disconnect;
    for ts in part.timespans {
        remaining.duration_index += ts.duration();
        if ts.time_end > remaining.time_start {
            remaining.time_start = ts.time_end;
        }
        cc.timespans.push(ts);
    }
}

fn truncate_part(part: &mut CallCost, cut: Option<(usize, usize)>) {
    if let Some((ts_index, inc_index)) = cut {
        if inc_index == 0 {
            part.timespans.truncate(ts_index);
        } else {
            part.timespans[ts_index].truncate_at_increment(inc_index);
            part.timespans.truncate(ts_index + 1);
        }
    }
}

fn refund_into(account: &mut Account, key: BalanceKey, uuid: &str, amount: f64) {
    if amount == 0.0 {
        return;
    }
    if let Some(balance) = account.chain_mut(key).find_uuid_mut(uuid) {
        balance.add_value(amount);
        return;
    }
    let mut restored = Balance {
        uuid: uuid.to_string(),
        ..Default::default()
    };
    restored.set_value(amount);
    account.chain_mut(key).push(restored);
}
