//! Rate intervals
//!
//! Calendar-qualified rate schedules: a timing predicate plus a weighted
//! group of prices. Intervals covering the same instant are ordered by
//! weight, higher first.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{MaxCostStrategy, RoundingMethod};

/// One price step inside a rate group. From `group_interval_start` seconds
/// into a timespan, each `rate_increment` of call time costs
/// `unit_price * (rate_increment / rate_unit)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub group_interval_start: Duration,
    pub unit_price: f64,
    pub rate_increment: Duration,
    pub rate_unit: Duration,
}

impl Rate {
    pub fn new(
        group_interval_start: Duration,
        unit_price: f64,
        rate_increment: Duration,
        rate_unit: Duration,
    ) -> Self {
        Self {
            group_interval_start,
            unit_price,
            rate_increment,
            rate_unit,
        }
    }
}

/// Rates sorted by group interval start; rate i applies until rate i+1 starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateGroups(pub Vec<Rate>);

impl RateGroups {
    pub fn new(mut rates: Vec<Rate>) -> Self {
        rates.sort_by_key(|r| r.group_interval_start);
        Self(rates)
    }

    /// First group start, used as tie-breaker between equal-weight intervals.
    pub fn first_start(&self) -> Duration {
        self.0
            .first()
            .map(|r| r.group_interval_start)
            .unwrap_or(Duration::ZERO)
    }
}

/// Calendar predicate: empty fields match any value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateTiming {
    #[serde(default)]
    pub years: Vec<i32>,
    #[serde(default)]
    pub months: Vec<u32>,
    #[serde(default)]
    pub month_days: Vec<u32>,
    #[serde(default)]
    pub week_days: Vec<Weekday>,
    /// "HH:MM:SS" or empty for start of day.
    #[serde(default)]
    pub start_time: String,
    /// "HH:MM:SS" or empty for end of day.
    #[serde(default)]
    pub end_time: String,
}

fn parse_hms(s: &str) -> Option<(u32, u32, u32)> {
    let mut parts = s.split(':');
    let h = parts.next()?.parse().ok()?;
    let m = parts.next()?.parse().ok()?;
    let sec = parts.next()?.parse().ok()?;
    Some((h, m, sec))
}

impl RateTiming {
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        if !self.years.is_empty() && !self.years.contains(&t.year()) {
            return false;
        }
        if !self.months.is_empty() && !self.months.contains(&t.month()) {
            return false;
        }
        if !self.month_days.is_empty() && !self.month_days.contains(&t.day()) {
            return false;
        }
        if !self.week_days.is_empty() && !self.week_days.contains(&t.weekday()) {
            return false;
        }
        if !self.start_time.is_empty() {
            if let Some((h, m, s)) = parse_hms(&self.start_time) {
                let after = t.hour() > h
                    || (t.hour() == h && t.minute() > m)
                    || (t.hour() == h && t.minute() == m && t.second() >= s);
                if !after {
                    return false;
                }
            }
        }
        if !self.end_time.is_empty() {
            if let Some((h, m, s)) = parse_hms(&self.end_time) {
                // end of the daily window is exclusive
                let before = t.hour() < h
                    || (t.hour() == h && t.minute() < m)
                    || (t.hour() == h && t.minute() == m && t.second() < s);
                if !before {
                    return false;
                }
            }
        }
        true
    }
}

/// Pricing half of an interval: connect fee, rate group, max-cost policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRating {
    #[serde(default)]
    pub connect_fee: f64,
    #[serde(default)]
    pub rates: RateGroups,
    #[serde(default)]
    pub max_cost: f64,
    #[serde(default)]
    pub max_cost_strategy: Option<MaxCostStrategy>,
    #[serde(default = "default_rounding_method")]
    pub rounding_method: RoundingMethod,
    #[serde(default = "default_rounding_decimals")]
    pub rounding_decimals: u32,
}

fn default_rounding_method() -> RoundingMethod {
    RoundingMethod::Middle
}

fn default_rounding_decimals() -> u32 {
    4
}

impl Default for RateRating {
    fn default() -> Self {
        Self {
            connect_fee: 0.0,
            rates: RateGroups::default(),
            max_cost: 0.0,
            max_cost_strategy: None,
            rounding_method: default_rounding_method(),
            rounding_decimals: default_rounding_decimals(),
        }
    }
}

/// A calendar-qualified rate schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateInterval {
    #[serde(default)]
    pub timing: RateTiming,
    pub rating: RateRating,
    #[serde(default)]
    pub weight: f64,
}

impl RateInterval {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.timing.is_active_at(t)
    }

    /// Price parameters applying at the given offset into the rate group.
    /// Zero increments and units default to one second.
    pub fn rate_parameters(&self, offset: Duration) -> Option<(f64, Duration, Duration)> {
        let rates = &self.rating.rates.0;
        for (index, rate) in rates.iter().enumerate() {
            let next_starts_later = rates
                .get(index + 1)
                .map(|next| next.group_interval_start > offset)
                .unwrap_or(true);
            if rate.group_interval_start <= offset && next_starts_later {
                let increment = if rate.rate_increment.is_zero() {
                    Duration::from_secs(1)
                } else {
                    rate.rate_increment
                };
                let unit = if rate.rate_unit.is_zero() {
                    Duration::from_secs(1)
                } else {
                    rate.rate_unit
                };
                return Some((rate.unit_price, increment, unit));
            }
        }
        None
    }

    pub fn max_cost(&self) -> Option<(f64, MaxCostStrategy)> {
        match self.rating.max_cost_strategy {
            Some(strategy) if self.rating.max_cost > 0.0 => {
                Some((self.rating.max_cost, strategy))
            }
            _ => None,
        }
    }

    /// End of this interval on the day containing `t`: the daily end time,
    /// or start of the next day when the timing has no daily window.
    pub fn right_margin(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        if let Some((h, m, s)) = parse_hms(&self.timing.end_time) {
            if let Some(margin) = Utc
                .with_ymd_and_hms(t.year(), t.month(), t.day(), h, m, s)
                .single()
            {
                return margin;
            }
        }
        let midnight = Utc
            .with_ymd_and_hms(t.year(), t.month(), t.day(), 23, 59, 59)
            .single()
            .unwrap_or(t);
        midnight + ChronoDuration::seconds(1)
    }
}
