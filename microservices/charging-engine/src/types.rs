//! Charging vocabulary
//!
//! Wire-facing request/response types shared by the rating pipeline, the
//! account engine and the REST surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::rating::interval::RateInterval;

/// Wildcard marker accepted wherever a filter field may match anything.
pub const ANY: &str = "*any";

/// Rating-subject prefix denoting a free-of-charge unit balance.
pub const ZERO_RATING_SUBJECT_PREFIX: &str = "*zero";

/// Rating-plan id stamped on synthetic timespans that bypassed plan lookup.
pub const META_NONE: &str = "*none";

/// Balance values are normalized to this many decimals after every mutation.
pub const DEFAULT_ROUNDING_DECIMALS: u32 = 5;

/// Traffic direction of a chargeable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "*out")]
    Out,
    #[serde(rename = "*in")]
    In,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Out
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Out => write!(f, "*out"),
            Self::In => write!(f, "*in"),
        }
    }
}

/// Kind of credit a balance holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BalanceType {
    #[serde(rename = "*monetary")]
    Monetary,
    #[serde(rename = "*voice")]
    Voice,
    #[serde(rename = "*sms")]
    Sms,
    #[serde(rename = "*data")]
    Data,
    #[serde(rename = "*generic")]
    Generic,
}

impl fmt::Display for BalanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Monetary => "*monetary",
            Self::Voice => "*voice",
            Self::Sms => "*sms",
            Self::Data => "*data",
            Self::Generic => "*generic",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for BalanceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*monetary" => Ok(Self::Monetary),
            "*voice" => Ok(Self::Voice),
            "*sms" => Ok(Self::Sms),
            "*data" => Ok(Self::Data),
            "*generic" => Ok(Self::Generic),
            other => Err(format!("unknown balance type: {}", other)),
        }
    }
}

/// Key of a balance chain inside an account: balance type plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BalanceKey {
    pub balance_type: BalanceType,
    pub direction: Direction,
}

impl BalanceKey {
    pub fn new(balance_type: BalanceType, direction: Direction) -> Self {
        Self {
            balance_type,
            direction,
        }
    }

    pub fn out(balance_type: BalanceType) -> Self {
        Self::new(balance_type, Direction::Out)
    }
}

impl fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.balance_type, self.direction)
    }
}

// Serialized as "<type><direction>" so the balance map keys survive JSON.
impl Serialize for BalanceKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BalanceKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let (type_part, dir_part) = s
            .rfind("*")
            .map(|i| s.split_at(i))
            .ok_or_else(|| serde::de::Error::custom("malformed balance key"))?;
        let balance_type: BalanceType = type_part
            .parse()
            .map_err(serde::de::Error::custom)?;
        let direction = match dir_part {
            "*out" => Direction::Out,
            "*in" => Direction::In,
            other => return Err(serde::de::Error::custom(format!("unknown direction: {}", other))),
        };
        Ok(Self {
            balance_type,
            direction,
        })
    }
}

/// Rounding applied to increment costs and balance values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundingMethod {
    #[serde(rename = "*up")]
    Up,
    #[serde(rename = "*down")]
    Down,
    #[serde(rename = "*middle")]
    Middle,
}

impl Default for RoundingMethod {
    fn default() -> Self {
        Self::Middle
    }
}

/// Behavior once the accumulated call cost reaches the interval max cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxCostStrategy {
    #[serde(rename = "*free")]
    Free,
    #[serde(rename = "*disconnect")]
    Disconnect,
}

/// Round a monetary value to the given number of decimals.
pub fn round_value(value: f64, decimals: u32, method: RoundingMethod) -> f64 {
    use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
    use rust_decimal::{Decimal, RoundingStrategy};

    let strategy = match method {
        RoundingMethod::Up => RoundingStrategy::ToPositiveInfinity,
        RoundingMethod::Down => RoundingStrategy::ToZero,
        RoundingMethod::Middle => RoundingStrategy::MidpointAwayFromZero,
    };
    Decimal::from_f64(value)
        .map(|d| d.round_dp_with_strategy(decimals, strategy))
        .and_then(|d| d.to_f64())
        .unwrap_or(value)
}

/// Balance-value normalization applied after every mutation.
pub fn round_balance_value(value: f64) -> f64 {
    round_value(value, DEFAULT_ROUNDING_DECIMALS, RoundingMethod::Middle)
}

/// Parse a `*zero1s` / `*zero1m` style rating subject into its billing unit.
pub fn parse_zero_rating_subject(subject: &str) -> Option<Duration> {
    let tail = subject.strip_prefix(ZERO_RATING_SUBJECT_PREFIX)?;
    if tail.is_empty() {
        return None;
    }
    let (digits, unit) = match tail.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => tail.split_at(i),
        None => (tail, "s"),
    };
    let quantity: u64 = digits.parse().ok()?;
    if quantity == 0 {
        return None;
    }
    match unit {
        "s" => Some(Duration::from_secs(quantity)),
        "m" => Some(Duration::from_secs(quantity * 60)),
        "h" => Some(Duration::from_secs(quantity * 3600)),
        "ms" => Some(Duration::from_millis(quantity)),
        _ => None,
    }
}

/// Duration between two instants, saturating at zero on inversion.
pub fn span_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start).to_std().unwrap_or(Duration::ZERO)
}

pub fn seconds_f64(d: Duration) -> f64 {
    d.as_secs_f64()
}

/// The chargeable request: who calls whom, when, against which tariff party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDescriptor {
    #[serde(default)]
    pub direction: Direction,
    pub tenant: String,
    pub category: String,
    pub subject: String,
    pub account: String,
    pub destination: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub tor: BalanceType,
    /// Cumulative session duration including earlier debit cycles.
    #[serde(default)]
    pub duration_index: Duration,
    #[serde(default)]
    pub max_rate: f64,
    #[serde(default)]
    pub max_rate_unit: Duration,
    #[serde(default)]
    pub max_cost_so_far: f64,
    #[serde(default)]
    pub deduct_connect_fee: bool,
}

impl CallDescriptor {
    pub fn duration(&self) -> Duration {
        span_between(self.time_start, self.time_end)
    }

    /// Guardian key serializing every mutation of this account.
    pub fn account_key(&self) -> String {
        account_lock_key(self.direction, &self.tenant, &self.account)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.time_end <= self.time_start {
            return Err("time_end must be after time_start".to_string());
        }
        Ok(())
    }

    /// Empty call cost shell carrying this descriptor's identity fields.
    pub fn create_call_cost(&self) -> CallCost {
        CallCost {
            direction: self.direction,
            tenant: self.tenant.clone(),
            category: self.category.clone(),
            subject: self.subject.clone(),
            account: self.account.clone(),
            destination: self.destination.clone(),
            tor: self.tor,
            timespans: Vec::new(),
            cost: 0.0,
            connect_fee: 0.0,
            rounding_method: RoundingMethod::default(),
            rounding_decimals: DEFAULT_ROUNDING_DECIMALS,
            max_cost_disconnect: false,
            deduct_connect_fee: self.deduct_connect_fee,
        }
    }
}

pub fn account_lock_key(direction: Direction, tenant: &str, account: &str) -> String {
    format!("{}:{}:{}", direction, tenant, account)
}

/// What was rated or debited, at increment granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallCost {
    pub direction: Direction,
    pub tenant: String,
    pub category: String,
    pub subject: String,
    pub account: String,
    pub destination: String,
    pub tor: BalanceType,
    pub timespans: Vec<TimeSpan>,
    pub cost: f64,
    pub connect_fee: f64,
    pub rounding_method: RoundingMethod,
    pub rounding_decimals: u32,
    pub max_cost_disconnect: bool,
    #[serde(default)]
    pub deduct_connect_fee: bool,
}

impl CallCost {
    pub fn total_duration(&self) -> Duration {
        self.timespans.iter().map(|ts| ts.duration()).sum()
    }

    /// Recompute the aggregate cost from the increments. A deducted connect
    /// fee is one of them: a zero-duration prefix increment on the first
    /// timespan, so refunds can reverse it like any other increment.
    pub fn update_cost(&mut self) {
        let incremental: f64 = self
            .timespans
            .iter()
            .flat_map(|ts| ts.increments.iter())
            .map(|inc| inc.cost)
            .sum();
        self.cost = round_value(incremental, self.rounding_decimals, self.rounding_method);
    }
}

/// A maximal sub-interval of the call governed by exactly one rate interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSpan {
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    /// Cumulative session duration before this span started.
    pub duration_index: Duration,
    pub rate_interval: Option<RateInterval>,
    pub matched_subject: String,
    pub matched_prefix: String,
    pub matched_dest_id: String,
    pub rating_plan_id: String,
    #[serde(default)]
    pub increments: Vec<Increment>,
}

impl TimeSpan {
    pub fn duration(&self) -> Duration {
        span_between(self.time_start, self.time_end)
    }

    /// Offset inside the rate group after `elapsed` of this span played out.
    pub fn offset_in_group(&self, elapsed: Duration) -> Duration {
        self.duration_index + elapsed
    }

    /// Extend the span end so its duration is a whole multiple of `unit`.
    pub fn round_to_duration(&mut self, unit: Duration) {
        if unit.is_zero() {
            return;
        }
        let dur = self.duration();
        let units = dur.as_nanos().div_ceil(unit.as_nanos()).max(1);
        let rounded = unit * units as u32;
        if rounded > dur {
            self.time_end = self.time_start
                + chrono::Duration::from_std(rounded).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }

    /// Drop increments from `index` on, pulling the span end back to match.
    pub fn truncate_at_increment(&mut self, index: usize) {
        self.increments.truncate(index);
        let kept: Duration = self.increments.iter().map(|inc| inc.duration).sum();
        self.time_end = self.time_start + chrono::Duration::from_std(kept).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

/// The minimal billable sub-duration of a timespan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Increment {
    pub duration: Duration,
    pub cost: f64,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub balance_info: BalanceInfo,
    #[serde(default)]
    pub unit_info: Option<UnitInfo>,
}

impl Increment {
    pub fn new(duration: Duration, cost: f64) -> Self {
        Self {
            duration,
            cost,
            paid: false,
            balance_info: BalanceInfo::default(),
            unit_info: None,
        }
    }
}

/// Which balances paid for an increment; drives refunds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub unit_balance_uuid: Option<String>,
    pub money_balance_uuid: Option<String>,
    pub account_id: String,
}

/// Unit consumption detail stamped on increments paid from unit balances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitInfo {
    pub destination: String,
    pub quantity: f64,
    pub tor: BalanceType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_subject_parsing() {
        assert_eq!(
            parse_zero_rating_subject("*zero1s"),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            parse_zero_rating_subject("*zero1m"),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            parse_zero_rating_subject("*zero10s"),
            Some(Duration::from_secs(10))
        );
        assert_eq!(parse_zero_rating_subject("*zero"), None);
        assert_eq!(parse_zero_rating_subject("special"), None);
    }

    #[test]
    fn rounding_methods() {
        assert_eq!(round_value(1.234567, 4, RoundingMethod::Up), 1.2346);
        assert_eq!(round_value(1.234567, 4, RoundingMethod::Down), 1.2345);
        assert_eq!(round_value(0.125, 2, RoundingMethod::Middle), 0.13);
        assert_eq!(round_value(2.0, 2, RoundingMethod::Middle), 2.0);
    }

    #[test]
    fn balance_key_roundtrip() {
        let key = BalanceKey::out(BalanceType::Voice);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"*voice*out\"");
        let back: BalanceKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn round_to_duration_extends_span() {
        let start = Utc::now();
        let mut ts = TimeSpan {
            time_start: start,
            time_end: start + chrono::Duration::seconds(10),
            duration_index: Duration::ZERO,
            rate_interval: None,
            matched_subject: String::new(),
            matched_prefix: String::new(),
            matched_dest_id: String::new(),
            rating_plan_id: String::new(),
            increments: Vec::new(),
        };
        ts.round_to_duration(Duration::from_secs(60));
        assert_eq!(ts.duration(), Duration::from_secs(60));
    }
}
