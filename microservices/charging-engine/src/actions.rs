//! Actions
//!
//! Ordered action lists executed transactionally against an account:
//! top-ups, debits, resets, trigger maintenance and outbound notifications.
//! Account mutation happens inside the guarded section; outbound side
//! effects (HTTP, mail, CDRs) are collected and performed after release.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use ocs_core::Result;

use crate::account::{Account, Balance};
use crate::cdr::{ChargingCdr, CDR_SOURCE_CDRLOG};
use crate::mail::OutboundMail;
use crate::types::{BalanceKey, BalanceType, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "*topup")]
    Topup,
    #[serde(rename = "*topup_reset")]
    TopupReset,
    #[serde(rename = "*debit")]
    Debit,
    #[serde(rename = "*debit_reset")]
    DebitReset,
    #[serde(rename = "*reset_counter")]
    ResetCounter,
    #[serde(rename = "*reset_counters")]
    ResetCounters,
    #[serde(rename = "*reset_triggers")]
    ResetTriggers,
    #[serde(rename = "*allow_negative")]
    AllowNegative,
    #[serde(rename = "*deny_negative")]
    DenyNegative,
    #[serde(rename = "*reset_account")]
    ResetAccount,
    #[serde(rename = "*remove_account")]
    RemoveAccount,
    #[serde(rename = "*log")]
    Log,
    #[serde(rename = "*cdrlog")]
    CdrLog,
    #[serde(rename = "*call_url")]
    CallUrl,
    #[serde(rename = "*call_url_async")]
    CallUrlAsync,
    #[serde(rename = "*mail_async")]
    MailAsync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub id: String,
    pub kind: ActionKind,
    #[serde(default)]
    pub balance_type: Option<BalanceType>,
    #[serde(default)]
    pub direction: Option<Direction>,
    /// Action-specific payload: URL, mail address, cdrlog template.
    #[serde(default)]
    pub extra_parameters: String,
    /// Balance filter and value payload; zero-valued fields are wildcards.
    #[serde(default)]
    pub balance: Option<Balance>,
    #[serde(default)]
    pub weight: f64,
}

/// Scheduled action-list binding, emitted by the cron scheduler outside the
/// core and handed to the same executor entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPlan {
    pub id: String,
    /// Schedule tag, e.g. "*monthly" or a cron expression.
    pub schedule: String,
    pub actions_id: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub account_ids: Vec<String>,
}

/// Side effects gathered during execution and performed after the guardian
/// releases: nothing here may block the guarded section.
#[derive(Debug, Clone)]
pub enum ActionSideEffect {
    RemoveAccount,
    HttpPost {
        url: String,
        payload: serde_json::Value,
        asynchronous: bool,
    },
    Mail(OutboundMail),
    Cdr(ChargingCdr),
}

/// Apply an ordered action list to an account. Returns the deferred side
/// effects. Ordering is by weight, higher first, matching trigger lists.
pub fn execute_actions_on(
    account: &mut Account,
    actions: &[Action],
    now: DateTime<Utc>,
) -> Result<Vec<ActionSideEffect>> {
    let mut ordered: Vec<&Action> = actions.iter().collect();
    ordered.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut effects = Vec::new();
    let mut wants_cdrlog = false;

    for action in &ordered {
        match action.kind {
            ActionKind::Topup => apply_topup(account, action, false),
            ActionKind::TopupReset => apply_topup(account, action, true),
            ActionKind::Debit => apply_debit(account, action),
            ActionKind::DebitReset => {
                apply_debit(account, action);
                account.reset_counters(action.balance_type);
            }
            ActionKind::ResetCounter => account.reset_counters(action.balance_type),
            ActionKind::ResetCounters => account.reset_counters(None),
            ActionKind::ResetTriggers => account.reset_triggers(),
            ActionKind::AllowNegative => account.allow_negative = true,
            ActionKind::DenyNegative => account.allow_negative = false,
            ActionKind::ResetAccount => {
                for chain in account.balances.values_mut() {
                    for balance in chain.iter_mut() {
                        balance.set_value(0.0);
                    }
                }
                account.reset_counters(None);
                account.reset_triggers();
            }
            ActionKind::RemoveAccount => effects.push(ActionSideEffect::RemoveAccount),
            ActionKind::Log => {
                info!(account = %account.id, action = %action.id, "action log");
            }
            ActionKind::CdrLog => wants_cdrlog = true,
            ActionKind::CallUrl | ActionKind::CallUrlAsync => {
                effects.push(ActionSideEffect::HttpPost {
                    url: action.extra_parameters.clone(),
                    payload: serde_json::json!({
                        "account_id": account.id,
                        "action_id": action.id,
                        "balance": action.balance,
                    }),
                    asynchronous: action.kind == ActionKind::CallUrlAsync,
                });
            }
            ActionKind::MailAsync => {
                effects.push(ActionSideEffect::Mail(OutboundMail {
                    to: action.extra_parameters.clone(),
                    subject: format!("Account {} action {}", account.id, action.id),
                    body: serde_json::to_string(&action.balance).unwrap_or_default(),
                }));
            }
        }
    }

    // cdrlog synthesizes one CDR per debit in the same list
    if wants_cdrlog {
        let template = ordered
            .iter()
            .find(|a| a.kind == ActionKind::CdrLog)
            .map(|a| parse_cdrlog_template(&a.extra_parameters))
            .unwrap_or_default();
        for action in ordered
            .iter()
            .filter(|a| matches!(a.kind, ActionKind::Debit | ActionKind::DebitReset))
        {
            effects.push(ActionSideEffect::Cdr(synthesize_cdr(
                account, action, &template, now,
            )));
        }
    }

    Ok(effects)
}

#[derive(Debug, Clone, Default)]
struct CdrLogTemplate {
    tenant: Option<String>,
    category: Option<String>,
    source: Option<String>,
}

fn parse_cdrlog_template(raw: &str) -> CdrLogTemplate {
    let Ok(map) = serde_json::from_str::<serde_json::Value>(raw) else {
        return CdrLogTemplate::default();
    };
    let pick = |field: &str| {
        map.get(field)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };
    CdrLogTemplate {
        tenant: pick("tenant"),
        category: pick("category"),
        source: pick("source"),
    }
}

fn synthesize_cdr(
    account: &Account,
    action: &Action,
    template: &CdrLogTemplate,
    now: DateTime<Utc>,
) -> ChargingCdr {
    let amount = action.balance.as_ref().map(|b| b.value).unwrap_or(0.0);
    ChargingCdr {
        id: Uuid::new_v4(),
        source: template
            .source
            .clone()
            .unwrap_or_else(|| CDR_SOURCE_CDRLOG.to_string()),
        direction: action.direction.unwrap_or(Direction::Out),
        tenant: template.tenant.clone().unwrap_or_default(),
        category: template.category.clone().unwrap_or_default(),
        subject: account.id.clone(),
        account: account.id.clone(),
        destination: action
            .balance
            .as_ref()
            .and_then(|b| b.destination_ids.first().cloned())
            .unwrap_or_default(),
        tor: action.balance_type.unwrap_or(BalanceType::Monetary),
        setup_time: now,
        usage: Duration::ZERO,
        cost: amount,
    }
}

fn balance_key_of(action: &Action) -> BalanceKey {
    BalanceKey::new(
        action.balance_type.unwrap_or(BalanceType::Monetary),
        action.direction.unwrap_or(Direction::Out),
    )
}

fn apply_topup(account: &mut Account, action: &Action, reset: bool) {
    let Some(filter) = action.balance.as_ref() else {
        return;
    };
    let chain = account.chain_mut(balance_key_of(action));
    if let Some(existing) = chain.iter_mut().find(|b| b.match_filter(filter)) {
        if reset {
            existing.set_value(filter.value);
        } else {
            existing.add_value(filter.value);
        }
        return;
    }
    let mut created = filter.clone();
    if created.uuid.is_empty() {
        created.uuid = Uuid::new_v4().to_string();
    }
    created.set_value(filter.value);
    chain.push(created);
}

fn apply_debit(account: &mut Account, action: &Action) {
    let Some(filter) = action.balance.as_ref() else {
        return;
    };
    let allow_negative = account.allow_negative;
    let chain = account.chain_mut(balance_key_of(action));
    let index = match chain.iter().position(|b| b.match_filter(filter)) {
        Some(i) => i,
        None => {
            let mut created = filter.clone();
            if created.uuid.is_empty() {
                created.uuid = Uuid::new_v4().to_string();
            }
            created.set_value(0.0);
            chain.push(created);
            chain.len() - 1
        }
    };
    let target = &mut chain[index];
    let next = target.value - filter.value;
    if next < 0.0 && !allow_negative {
        target.set_value(0.0);
    } else {
        target.set_value(next);
    }
}
