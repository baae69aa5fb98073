//! End-to-end charging scenarios
//!
//! Exercises the full pipeline against the in-memory backend: zero-rated
//! units, connect fees, unit/money splits, shared groups, counters and
//! triggers, refunds.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use charging_engine::account::{
    Account, AccountEngine, ActionTrigger, Balance, ThresholdKind, UnitCounter,
};
use charging_engine::actions::{Action, ActionKind};
use charging_engine::rating::interval::{Rate, RateGroups, RateInterval, RateRating, RateTiming};
use charging_engine::rating::{Destination, RatingActivation, RatingPlan, RatingProfile, RatingStore};
use charging_engine::sharing::{SharedGroup, SharingParameters, SharingStrategy};
use charging_engine::storage::{AccountingStorage, MemoryStorage, RatingStorage};
use charging_engine::types::{BalanceKey, BalanceType, CallDescriptor, Direction};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2013, 9, 24, 10, 48, 0).unwrap()
}

struct Harness {
    storage: Arc<MemoryStorage>,
    engine: AccountEngine,
}

async fn harness() -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let rating: Arc<dyn RatingStorage> = storage.clone();
    let store = Arc::new(RatingStore::new(rating));
    let engine = AccountEngine::new(storage.clone(), store);
    Harness { storage, engine }
}

impl Harness {
    /// Install the NAT destination and a flat tariff for `subject`.
    async fn tariff(&self, subject: &str, price: f64, increment_secs: u64, connect_fee: f64) {
        self.storage
            .set_destination(&Destination::new("NAT", vec!["0723".into()]))
            .await
            .unwrap();

        let plan_id = format!("RP_{}", subject.to_uppercase());
        let mut plan = RatingPlan::new(plan_id.clone());
        plan.add_intervals(
            "NAT",
            vec![RateInterval {
                timing: RateTiming::default(),
                rating: RateRating {
                    connect_fee,
                    rates: RateGroups::new(vec![Rate::new(
                        Duration::ZERO,
                        price,
                        Duration::from_secs(increment_secs),
                        Duration::from_secs(1),
                    )]),
                    ..Default::default()
                },
                weight: 10.0,
            }],
        );
        self.storage.set_rating_plan(&plan).await.unwrap();

        let profile_key = format!("*out:vdf:call:{}", subject);
        self.storage
            .set_rating_profile(&RatingProfile::new(
                profile_key,
                vec![RatingActivation {
                    activation_time: Utc.with_ymd_and_hms(2013, 1, 1, 0, 0, 0).unwrap(),
                    rating_plan_id: plan_id,
                    fallback_subjects: vec![],
                }],
            ))
            .await
            .unwrap();

        self.engine.rating().reload().await.unwrap();
    }

    async fn account(&self, account: Account) {
        self.storage.set_account(&account).await.unwrap();
    }

    async fn money_of(&self, id: &str) -> f64 {
        self.storage
            .get_account(id)
            .await
            .unwrap()
            .unwrap()
            .total_value(BalanceKey::out(BalanceType::Monetary), Utc::now())
    }

    async fn units_of(&self, id: &str, tor: BalanceType) -> f64 {
        self.storage
            .get_account(id)
            .await
            .unwrap()
            .unwrap()
            .total_value(BalanceKey::out(tor), Utc::now())
    }
}

fn call(account: &str, seconds: i64, tor: BalanceType) -> CallDescriptor {
    CallDescriptor {
        direction: Direction::Out,
        tenant: "vdf".into(),
        category: "call".into(),
        subject: account.into(),
        account: account.into(),
        destination: "0723045326".into(),
        time_start: t0(),
        time_end: t0() + chrono::Duration::seconds(seconds),
        tor,
        duration_index: Duration::ZERO,
        max_rate: 0.0,
        max_rate_unit: Duration::ZERO,
        max_cost_so_far: 0.0,
        deduct_connect_fee: false,
    }
}

fn voice_balance(uuid: &str, value: f64, subject: &str) -> Balance {
    Balance {
        uuid: uuid.into(),
        value,
        weight: 10.0,
        destination_ids: vec!["NAT".into()],
        rating_subject: subject.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn s1_zero_rated_voice() {
    let h = harness().await;
    h.tariff("other", 100.0, 10, 0.0).await;

    let mut acc = Account::new("other");
    acc.chain_mut(BalanceKey::out(BalanceType::Voice))
        .push(voice_balance("testb", 10.0, "*zero1s"));
    acc.chain_mut(BalanceKey::out(BalanceType::Monetary))
        .push(Balance::monetary("money21", 21.0));
    h.account(acc).await;

    let cc = h.engine.debit(&call("other", 10, BalanceType::Voice)).await.unwrap();

    assert_eq!(cc.timespans.len(), 1);
    assert_eq!(cc.timespans[0].increments.len(), 10);
    for inc in &cc.timespans[0].increments {
        assert_eq!(inc.duration, Duration::from_secs(1));
        assert!(inc.paid);
        assert_eq!(inc.balance_info.unit_balance_uuid.as_deref(), Some("testb"));
        assert_eq!(inc.balance_info.account_id, "other");
    }
    assert_eq!(cc.cost, 0.0);
    assert_eq!(h.units_of("other", BalanceType::Voice).await, 0.0);
    assert_eq!(h.money_of("other").await, 21.0);
}

#[tokio::test]
async fn s2_connect_fee_shortfall() {
    let h = harness().await;
    h.tariff("nofee", 1.0, 10, 10.0).await;

    let mut acc = Account::new("nofee");
    acc.chain_mut(BalanceKey::out(BalanceType::Voice))
        .push(voice_balance("zb", 70.0, "*zero1m"));
    h.account(acc).await;

    let mut cd = call("nofee", 10, BalanceType::Voice);
    cd.deduct_connect_fee = true;

    // the dry rating still resolves one timespan
    let rated = h.engine.get_cost(&cd).await.unwrap();
    assert_eq!(rated.timespans.len(), 1);
    assert!(rated.timespans[0].increments.iter().all(|i| !i.paid));

    let err = h.engine.debit(&cd).await.unwrap_err();
    assert!(matches!(err, ocs_core::OcsError::ConnectFeeNotCovered));

    // nothing was debited and no money chain appeared
    let stored = h.storage.get_account("nofee").await.unwrap().unwrap();
    assert_eq!(h.units_of("nofee", BalanceType::Voice).await, 70.0);
    assert!(stored
        .chain(BalanceKey::out(BalanceType::Monetary))
        .map(|c| c.is_empty())
        .unwrap_or(true));
}

#[tokio::test]
async fn s3_split_units_then_money() {
    let h = harness().await;
    h.tariff("split", 1.0, 10, 0.0).await;

    let mut acc = Account::new("split");
    acc.chain_mut(BalanceKey::out(BalanceType::Voice))
        .push(voice_balance("testb", 10.0, "*zero1s"));
    acc.chain_mut(BalanceKey::out(BalanceType::Monetary))
        .push(Balance::monetary("moneya", 50.0));
    h.account(acc).await;

    let cc = h.engine.debit(&call("split", 20, BalanceType::Voice)).await.unwrap();

    // first span paid from the zero-rated unit balance, second from money
    assert_eq!(cc.timespans.len(), 2);
    assert_eq!(cc.timespans[0].duration(), Duration::from_secs(10));
    assert!(cc.timespans[0]
        .increments
        .iter()
        .all(|i| i.balance_info.unit_balance_uuid.as_deref() == Some("testb")));
    assert!(cc.timespans[1]
        .increments
        .iter()
        .all(|i| i.balance_info.money_balance_uuid.as_deref() == Some("moneya")));

    assert_eq!(h.units_of("split", BalanceType::Voice).await, 0.0);
    let money_after = h.money_of("split").await;
    assert_eq!(money_after, 50.0 - cc.cost);
    assert!(cc.cost > 0.0);

    // refunding the same call cost restores the pre-debit values exactly
    let residual = h.engine.refund_increments(&cc).await.unwrap();
    assert_eq!(residual, 50.0);
    assert_eq!(h.units_of("split", BalanceType::Voice).await, 10.0);
    assert_eq!(h.money_of("split").await, 50.0);
}

#[tokio::test]
async fn s4_shared_group_random() {
    let h = harness().await;
    h.tariff("rif", 2.0, 10, 0.0).await;

    let mut rif = Account::new("rif");
    rif.chain_mut(BalanceKey::out(BalanceType::Monetary)).push(Balance {
        uuid: "moneya".into(),
        value: 0.0,
        shared_group: "SG_TEST".into(),
        ..Default::default()
    });
    h.account(rif).await;

    let mut groupie = Account::new("groupie");
    groupie
        .chain_mut(BalanceKey::out(BalanceType::Monetary))
        .push(Balance {
            uuid: "moneyc".into(),
            value: 130.0,
            shared_group: "SG_TEST".into(),
            ..Default::default()
        });
    h.account(groupie).await;

    h.storage
        .set_shared_group(&SharedGroup {
            id: "SG_TEST".into(),
            members: vec!["rif".into(), "groupie".into()],
            account_parameters: std::collections::HashMap::from([(
                "*any".to_string(),
                SharingParameters {
                    strategy: SharingStrategy::MineRandom,
                    rating_subject: String::new(),
                },
            )]),
        })
        .await
        .unwrap();

    let cc = h
        .engine
        .debit(&call("rif", 60, BalanceType::Monetary))
        .await
        .unwrap();

    assert_eq!(cc.timespans.len(), 1);
    assert_eq!(cc.timespans[0].increments.len(), 6);
    for inc in &cc.timespans[0].increments {
        assert_eq!(inc.balance_info.account_id, "groupie");
        assert_eq!(inc.balance_info.money_balance_uuid.as_deref(), Some("moneyc"));
    }
    assert_eq!(h.money_of("rif").await, 0.0);
    assert_eq!(h.money_of("groupie").await, 10.0);
}

#[tokio::test]
async fn s5_shared_group_max_session() {
    let h = harness().await;
    h.tariff("rif", 2.0, 10, 0.0).await;

    let mut rif = Account::new("rif");
    rif.chain_mut(BalanceKey::out(BalanceType::Monetary)).push(Balance {
        uuid: "moneya".into(),
        value: 0.0,
        shared_group: "SG_TEST".into(),
        ..Default::default()
    });
    h.account(rif).await;

    let mut groupie = Account::new("groupie");
    groupie
        .chain_mut(BalanceKey::out(BalanceType::Monetary))
        .push(Balance {
            uuid: "moneyc".into(),
            value: 130.0,
            shared_group: "SG_TEST".into(),
            ..Default::default()
        });
    h.account(groupie).await;

    h.storage
        .set_shared_group(&SharedGroup {
            id: "SG_TEST".into(),
            members: vec!["rif".into(), "groupie".into()],
            account_parameters: std::collections::HashMap::from([(
                "*any".to_string(),
                SharingParameters {
                    strategy: SharingStrategy::MineRandom,
                    rating_subject: String::new(),
                },
            )]),
        })
        .await
        .unwrap();

    let allowed = h
        .engine
        .get_max_session_duration(&call("rif", 60, BalanceType::Monetary))
        .await
        .unwrap();
    assert_eq!(allowed, Some(Duration::from_secs(60)));

    // the dry run left both accounts untouched
    assert_eq!(h.money_of("rif").await, 0.0);
    assert_eq!(h.money_of("groupie").await, 130.0);
}

#[tokio::test]
async fn s6_trigger_max_counter() {
    let h = harness().await;
    h.tariff("trig", 1.0, 10, 0.0).await;

    let mut acc = Account::new("trig");
    acc.chain_mut(BalanceKey::out(BalanceType::Monetary))
        .push(Balance::monetary("money100", 100.0));
    let mut counter = UnitCounter::new(BalanceType::Monetary, Some(Direction::Out));
    counter.balances.push(Balance {
        value: 1.0,
        ..Default::default()
    });
    acc.unit_counters.push(counter);
    acc.action_triggers.push(ActionTrigger {
        id: "t1".into(),
        balance_type: BalanceType::Monetary,
        direction: Some(Direction::Out),
        threshold_type: ThresholdKind::MaxCounter,
        threshold_value: 2.0,
        balance_id: String::new(),
        balance_destination_ids: vec![],
        balance_expiration_date: None,
        balance_weight: 0.0,
        balance_rating_subject: String::new(),
        balance_shared_group: String::new(),
        balance_category: String::new(),
        recurrent: false,
        min_sleep: Duration::ZERO,
        min_queued_items: 0,
        actions_id: "TOPUP_SET".into(),
        executed: false,
        last_executed: None,
        weight: 10.0,
    });
    h.account(acc).await;

    let topup = |balance_type: BalanceType| Action {
        id: "TOPUP".into(),
        kind: ActionKind::Topup,
        balance_type: Some(balance_type),
        direction: Some(Direction::Out),
        extra_parameters: String::new(),
        balance: Some(Balance {
            value: 10.0,
            ..Default::default()
        }),
        weight: 10.0,
    };
    h.storage
        .set_actions(
            "TOPUP_SET",
            &[topup(BalanceType::Monetary), topup(BalanceType::Voice)],
        )
        .await
        .unwrap();

    let emit = |amount: f64| charging_engine::account::CounterEvent {
        balance_type: BalanceType::Monetary,
        direction: Some(Direction::Out),
        amount,
        destination_ids: vec![],
    };

    h.engine
        .count_units(Direction::Out, "vdf", "trig", emit(1.0))
        .await
        .unwrap();
    h.engine
        .count_units(Direction::Out, "vdf", "trig", emit(1.0))
        .await
        .unwrap();

    // the threshold fired exactly once
    assert_eq!(h.money_of("trig").await, 110.0);
    assert_eq!(h.units_of("trig", BalanceType::Voice).await, 10.0);

    // a further unit does not refire the non-recurrent trigger
    h.engine
        .count_units(Direction::Out, "vdf", "trig", emit(1.0))
        .await
        .unwrap();
    assert_eq!(h.money_of("trig").await, 110.0);
    assert_eq!(h.units_of("trig", BalanceType::Voice).await, 10.0);

    let stored = h.storage.get_account("trig").await.unwrap().unwrap();
    assert!(stored.action_triggers[0].executed);
}

#[tokio::test]
async fn debit_truncates_when_credit_runs_out() {
    let h = harness().await;
    h.tariff("short", 1.0, 10, 0.0).await;

    let mut acc = Account::new("short");
    acc.chain_mut(BalanceKey::out(BalanceType::Monetary))
        .push(Balance::monetary("m25", 25.0));
    h.account(acc).await;

    let cc = h
        .engine
        .debit(&call("short", 60, BalanceType::Monetary))
        .await
        .unwrap();

    // two 10s increments payable, the third is not
    assert_eq!(cc.total_duration(), Duration::from_secs(20));
    assert_eq!(cc.cost, 20.0);
    assert_eq!(h.money_of("short").await, 5.0);
}

#[tokio::test]
async fn max_debit_truncates_at_available_credit() {
    let h = harness().await;
    h.tariff("cap", 1.0, 10, 0.0).await;

    let mut acc = Account::new("cap");
    acc.chain_mut(BalanceKey::out(BalanceType::Monetary))
        .push(Balance::monetary("m25", 25.0));
    h.account(acc).await;

    let cc = h
        .engine
        .max_debit(&call("cap", 60, BalanceType::Monetary))
        .await
        .unwrap();
    assert_eq!(cc.total_duration(), Duration::from_secs(20));
    assert_eq!(h.money_of("cap").await, 5.0);
}

#[tokio::test]
async fn get_cost_has_no_side_effects() {
    let h = harness().await;
    h.tariff("dry", 1.0, 10, 0.0).await;

    let mut acc = Account::new("dry");
    acc.chain_mut(BalanceKey::out(BalanceType::Monetary))
        .push(Balance::monetary("m100", 100.0));
    h.account(acc).await;

    let cc = h
        .engine
        .get_cost(&call("dry", 30, BalanceType::Monetary))
        .await
        .unwrap();
    assert_eq!(cc.cost, 30.0);
    assert_eq!(h.money_of("dry").await, 100.0);
}

#[tokio::test]
async fn insufficient_credit_without_allow_negative() {
    let h = harness().await;
    h.tariff("broke", 1.0, 10, 0.0).await;

    h.account(Account::new("broke")).await;

    let err = h
        .engine
        .debit(&call("broke", 30, BalanceType::Monetary))
        .await
        .unwrap_err();
    assert!(matches!(err, ocs_core::OcsError::InsufficientCredit));
}

#[tokio::test]
async fn allow_negative_forces_money_below_zero() {
    let h = harness().await;
    h.tariff("neg", 1.0, 10, 0.0).await;

    let mut acc = Account::new("neg");
    acc.allow_negative = true;
    h.account(acc).await;

    let cc = h
        .engine
        .debit(&call("neg", 30, BalanceType::Monetary))
        .await
        .unwrap();
    assert_eq!(cc.total_duration(), Duration::from_secs(30));
    assert_eq!(h.money_of("neg").await, -30.0);

    let unlimited = h
        .engine
        .get_max_session_duration(&call("neg", 30, BalanceType::Monetary))
        .await
        .unwrap();
    assert_eq!(unlimited, None);
}

#[tokio::test]
async fn action_plan_applies_to_every_target_account() {
    let h = harness().await;

    h.account(Account::new("plan-a")).await;
    h.account(Account::new("plan-b")).await;
    h.storage
        .set_actions(
            "MONTHLY_TOPUP",
            &[Action {
                id: "TOPUP".into(),
                kind: ActionKind::Topup,
                balance_type: Some(BalanceType::Monetary),
                direction: Some(Direction::Out),
                extra_parameters: String::new(),
                balance: Some(Balance {
                    value: 25.0,
                    ..Default::default()
                }),
                weight: 10.0,
            }],
        )
        .await
        .unwrap();

    let plan = charging_engine::actions::ActionPlan {
        id: "AP_MONTHLY".into(),
        schedule: "*monthly".into(),
        actions_id: "MONTHLY_TOPUP".into(),
        tenant: "vdf".into(),
        account_ids: vec!["plan-a".into(), "plan-b".into()],
    };
    h.engine.execute_action_plan(&plan).await.unwrap();

    assert_eq!(h.money_of("plan-a").await, 25.0);
    assert_eq!(h.money_of("plan-b").await, 25.0);
}

#[tokio::test]
async fn debit_publishes_balance_events() {
    let h = harness().await;
    h.tariff("evt", 1.0, 10, 0.0).await;

    let mut acc = Account::new("evt");
    acc.chain_mut(BalanceKey::out(BalanceType::Monetary))
        .push(Balance::monetary("m100", 100.0));
    h.account(acc).await;

    let mut rx = h.engine.events().subscribe();
    h.engine
        .debit(&call("evt", 10, BalanceType::Monetary))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no event published")
        .unwrap();
    assert_eq!(event.event_name, "account_balance_modified");
    assert_eq!(event.account_id, "evt");
    assert_eq!(event.uuid, "m100");
    assert_eq!(event.value, 90.0);
}

#[tokio::test]
async fn conservation_across_debit_and_refund() {
    let h = harness().await;
    h.tariff("conserve", 2.0, 10, 5.0).await;

    let mut acc = Account::new("conserve");
    acc.chain_mut(BalanceKey::out(BalanceType::Monetary))
        .push(Balance::monetary("ma", 40.0));
    acc.chain_mut(BalanceKey::out(BalanceType::Monetary))
        .push(Balance::monetary("mb", 100.0));
    h.account(acc).await;

    let before = h.money_of("conserve").await;
    let mut cd = call("conserve", 30, BalanceType::Monetary);
    cd.deduct_connect_fee = true;
    let cc = h.engine.debit(&cd).await.unwrap();
    let after = h.money_of("conserve").await;
    assert_eq!(before - after, cc.cost);

    // the connect fee rides the call cost as a zero-duration prefix
    // increment stamped with the balance that paid it
    let fee_inc = &cc.timespans[0].increments[0];
    assert_eq!(fee_inc.duration, Duration::ZERO);
    assert_eq!(fee_inc.cost, 5.0);
    assert_eq!(fee_inc.balance_info.money_balance_uuid.as_deref(), Some("ma"));

    // refunding inverts the debit exactly, connect fee included
    h.engine.refund_increments(&cc).await.unwrap();
    assert_eq!(h.money_of("conserve").await, before);
}
