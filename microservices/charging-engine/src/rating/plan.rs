//! Rating-plan store
//!
//! Time-indexed lookup of a party's rate intervals: profile resolution,
//! activation windows, destination matching with fallback subjects, and
//! calendar intersection of the matched intervals over the request window.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

use ocs_core::{OcsError, Result};

use crate::rating::destination::PrefixIndex;
use crate::rating::interval::RateInterval;
use crate::storage::RatingStorage;
use crate::types::{CallDescriptor, Direction};

/// Fallback subjects may chain at most this deep.
pub const MAX_FALLBACK_DEPTH: usize = 16;

/// Destination-keyed map of rate intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingPlan {
    pub id: String,
    pub dest_intervals: HashMap<String, Vec<RateInterval>>,
}

impl RatingPlan {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dest_intervals: HashMap::new(),
        }
    }

    pub fn add_intervals(&mut self, destination_id: impl Into<String>, intervals: Vec<RateInterval>) {
        self.dest_intervals
            .entry(destination_id.into())
            .or_default()
            .extend(intervals);
    }
}

/// One tariff activation inside a rating profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingActivation {
    pub activation_time: DateTime<Utc>,
    pub rating_plan_id: String,
    #[serde(default)]
    pub fallback_subjects: Vec<String>,
}

/// History of rating-plan activations keyed by
/// `direction:tenant:category:subject`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingProfile {
    pub id: String,
    pub activations: Vec<RatingActivation>,
}

impl RatingProfile {
    pub fn new(id: impl Into<String>, mut activations: Vec<RatingActivation>) -> Self {
        activations.sort_by_key(|a| a.activation_time);
        Self {
            id: id.into(),
            activations,
        }
    }
}

/// Rating query: the identity fields of a call descriptor plus the window.
#[derive(Debug, Clone)]
pub struct RatingQuery {
    pub direction: Direction,
    pub tenant: String,
    pub category: String,
    pub subject: String,
    pub destination: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
}

impl RatingQuery {
    pub fn from_descriptor(cd: &CallDescriptor) -> Self {
        Self {
            direction: cd.direction,
            tenant: cd.tenant.clone(),
            category: cd.category.clone(),
            subject: cd.subject.clone(),
            destination: cd.destination.clone(),
            time_start: cd.time_start,
            time_end: cd.time_end,
        }
    }

    fn profile_key(&self, subject: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            self.direction, self.tenant, self.category, subject
        )
    }
}

/// A sub-window of the request bound to a single rate interval.
#[derive(Debug, Clone)]
pub struct RatingSegment {
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub interval: RateInterval,
    pub matched_subject: String,
    pub matched_prefix: String,
    pub matched_dest_id: String,
    pub rating_plan_id: String,
}

/// Process-wide immutable rating snapshot with a prefix index, refreshed by
/// explicit reload.
pub struct RatingStore {
    storage: Arc<dyn RatingStorage>,
    prefix_index: RwLock<Arc<PrefixIndex>>,
}

impl RatingStore {
    pub fn new(storage: Arc<dyn RatingStorage>) -> Self {
        Self {
            storage,
            prefix_index: RwLock::new(Arc::new(PrefixIndex::new())),
        }
    }

    pub fn storage(&self) -> &Arc<dyn RatingStorage> {
        &self.storage
    }

    pub fn prefix_index(&self) -> Arc<PrefixIndex> {
        self.prefix_index.read().clone()
    }

    /// Rebuild the prefix index from stored destinations and swap it in
    /// atomically. Backend caches are invalidated by prefix first.
    pub async fn reload(&self) -> Result<()> {
        self.storage.invalidate_prefix(crate::storage::DESTINATION_PREFIX).await;
        self.storage.invalidate_prefix(crate::storage::RATING_PLAN_PREFIX).await;
        self.storage.invalidate_prefix(crate::storage::RATING_PROFILE_PREFIX).await;

        let mut index = PrefixIndex::new();
        let keys = self
            .storage
            .get_keys_for_prefix(crate::storage::DESTINATION_PREFIX)
            .await?;
        for key in &keys {
            let id = key.trim_start_matches(crate::storage::DESTINATION_PREFIX);
            if let Some(dest) = self.storage.get_destination(id).await? {
                index.add(&dest);
            }
        }
        debug!(destinations = keys.len(), "rating snapshot reloaded");
        *self.prefix_index.write() = Arc::new(index);
        Ok(())
    }

    /// Resolve the rate intervals applying to the query window, ordered by
    /// time. Fails with `ProfileNotFound`, `DestinationNotFound`,
    /// `FallbackCycle`, `RatingPlanNotFound` or `NoRateInterval`.
    pub async fn get_intervals(&self, query: &RatingQuery) -> Result<Vec<RatingSegment>> {
        let mut path = Vec::new();
        let mut segments = self
            .resolve_subject(
                query,
                query.subject.clone(),
                query.time_start,
                query.time_end,
                &mut path,
            )
            .await?;
        segments.sort_by_key(|s| s.time_start);
        Ok(segments)
    }

    fn resolve_subject<'a>(
        &'a self,
        query: &'a RatingQuery,
        subject: String,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        path: &'a mut Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RatingSegment>>> + Send + 'a>> {
        Box::pin(async move {
            if path.contains(&subject) || path.len() >= MAX_FALLBACK_DEPTH {
                return Err(OcsError::FallbackCycle(subject));
            }
            path.push(subject.clone());
            let result = self
                .resolve_profile(query, &subject, window_start, window_end, path)
                .await;
            path.pop();
            result
        })
    }

    async fn resolve_profile(
        &self,
        query: &RatingQuery,
        subject: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        path: &mut Vec<String>,
    ) -> Result<Vec<RatingSegment>> {
        let key = query.profile_key(subject);
        let profile = self
            .storage
            .get_rating_profile(&key)
            .await?
            .ok_or_else(|| OcsError::ProfileNotFound(key.clone()))?;

        let windows = activation_windows(&profile, window_start, window_end);
        if windows.is_empty() {
            return Err(OcsError::RatingPlanNotFound(key));
        }

        let index = self.prefix_index();
        let mut segments = Vec::new();
        for (activation, sub_start, sub_end) in windows {
            let plan = self
                .storage
                .get_rating_plan(&activation.rating_plan_id)
                .await?
                .ok_or_else(|| {
                    OcsError::RatingPlanNotFound(activation.rating_plan_id.clone())
                })?;

            let matched = index.match_where(&query.destination, |id| {
                plan.dest_intervals.contains_key(id)
            });
            match matched {
                Some((dest_id, prefix)) => {
                    let intervals = &plan.dest_intervals[&dest_id];
                    for (frag_start, frag_end, interval) in
                        fragment_window(intervals, sub_start, sub_end)?
                    {
                        segments.push(RatingSegment {
                            time_start: frag_start,
                            time_end: frag_end,
                            interval,
                            matched_subject: subject.to_string(),
                            matched_prefix: prefix.clone(),
                            matched_dest_id: dest_id.clone(),
                            rating_plan_id: plan.id.clone(),
                        });
                    }
                }
                None => {
                    let mut covered = false;
                    for fallback in &activation.fallback_subjects {
                        match self
                            .resolve_subject(query, fallback.clone(), sub_start, sub_end, path)
                            .await
                        {
                            Ok(mut fb_segments) => {
                                segments.append(&mut fb_segments);
                                covered = true;
                                break;
                            }
                            Err(
                                OcsError::ProfileNotFound(_)
                                | OcsError::DestinationNotFound(_)
                                | OcsError::RatingPlanNotFound(_),
                            ) => continue,
                            Err(other) => return Err(other),
                        }
                    }
                    if !covered {
                        return Err(OcsError::DestinationNotFound(query.destination.clone()));
                    }
                }
            }
        }
        Ok(segments)
    }
}

/// Slice the request window by the profile's activation history: each window
/// is governed by the latest activation at or before its start.
fn activation_windows(
    profile: &RatingProfile,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<(RatingActivation, DateTime<Utc>, DateTime<Utc>)> {
    let mut acts: Vec<&RatingActivation> = profile
        .activations
        .iter()
        .filter(|a| a.activation_time < window_end)
        .collect();
    acts.sort_by_key(|a| a.activation_time);

    let mut windows = Vec::new();
    for (i, act) in acts.iter().enumerate() {
        let sub_start = act.activation_time.max(window_start);
        let sub_end = acts
            .get(i + 1)
            .map(|next| next.activation_time)
            .unwrap_or(window_end)
            .min(window_end);
        if sub_start < sub_end {
            windows.push(((*act).clone(), sub_start, sub_end));
        }
    }
    windows
}

/// Intersect the interval list with the window, emitting one fragment per
/// calendar transition. At every boundary the highest-weight active interval
/// wins; adjacent fragments under the same interval merge.
fn fragment_window(
    intervals: &[RateInterval],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>, RateInterval)>> {
    let mut fragments: Vec<(DateTime<Utc>, DateTime<Utc>, RateInterval)> = Vec::new();
    let mut cursor = window_start;
    while cursor < window_end {
        let best = select_interval(intervals, cursor)
            .ok_or_else(|| OcsError::NoRateInterval(cursor.to_rfc3339()))?;

        let mut end = window_end.min(best.right_margin(cursor)).min(next_day(cursor));
        if end <= cursor {
            end = window_end;
        }

        match fragments.last_mut() {
            Some((_, last_end, last_interval))
                if *last_end == cursor && *last_interval == *best =>
            {
                *last_end = end;
            }
            _ => fragments.push((cursor, end, best.clone())),
        }
        cursor = end;
    }
    Ok(fragments)
}

/// Highest weight wins; equal weights break by earliest group start, then by
/// insertion order.
fn select_interval(intervals: &[RateInterval], at: DateTime<Utc>) -> Option<&RateInterval> {
    let mut best: Option<&RateInterval> = None;
    for interval in intervals.iter().filter(|i| i.contains(at)) {
        best = match best {
            None => Some(interval),
            Some(current) => {
                let better = interval.weight > current.weight
                    || (interval.weight == current.weight
                        && interval.rating.rates.first_start()
                            < current.rating.rates.first_start());
                if better {
                    Some(interval)
                } else {
                    Some(current)
                }
            }
        };
    }
    best
}

fn next_day(t: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = Utc
        .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .unwrap_or(t);
    midnight + ChronoDuration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rating::interval::{Rate, RateGroups, RateRating, RateTiming};
    use std::time::Duration;

    fn flat_interval(price: f64, weight: f64) -> RateInterval {
        RateInterval {
            timing: RateTiming::default(),
            rating: RateRating {
                rates: RateGroups::new(vec![Rate::new(
                    Duration::ZERO,
                    price,
                    Duration::from_secs(60),
                    Duration::from_secs(60),
                )]),
                ..Default::default()
            },
            weight,
        }
    }

    fn daytime_interval(price: f64, weight: f64) -> RateInterval {
        RateInterval {
            timing: RateTiming {
                start_time: "08:00:00".to_string(),
                end_time: "20:00:00".to_string(),
                ..Default::default()
            },
            ..flat_interval(price, weight)
        }
    }

    #[test]
    fn activation_windows_select_latest_active() {
        let t0 = Utc.with_ymd_and_hms(2013, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2013, 6, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2013, 12, 1, 0, 0, 0).unwrap();
        let profile = RatingProfile::new(
            "*out:test:call:dan",
            vec![
                RatingActivation {
                    activation_time: t0,
                    rating_plan_id: "P0".into(),
                    fallback_subjects: vec![],
                },
                RatingActivation {
                    activation_time: t1,
                    rating_plan_id: "P1".into(),
                    fallback_subjects: vec![],
                },
                RatingActivation {
                    activation_time: t2,
                    rating_plan_id: "P2".into(),
                    fallback_subjects: vec![],
                },
            ],
        );

        let start = Utc.with_ymd_and_hms(2013, 7, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2013, 7, 1, 11, 0, 0).unwrap();
        let windows = activation_windows(&profile, start, end);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].0.rating_plan_id, "P1");

        // A request straddling the t2 activation involves both plans.
        let end = Utc.with_ymd_and_hms(2013, 12, 1, 11, 0, 0).unwrap();
        let windows = activation_windows(&profile, start, end);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].0.rating_plan_id, "P1");
        assert_eq!(windows[1].0.rating_plan_id, "P2");
        assert_eq!(windows[1].1, t2);
    }

    #[test]
    fn fragment_prefers_heavier_interval() {
        let intervals = vec![flat_interval(1.0, 10.0), daytime_interval(0.5, 20.0)];
        let start = Utc.with_ymd_and_hms(2013, 9, 24, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2013, 9, 24, 10, 30, 0).unwrap();
        let frags = fragment_window(&intervals, start, end).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].2.weight, 20.0);
    }

    #[test]
    fn fragment_splits_at_daily_boundary() {
        let intervals = vec![flat_interval(1.0, 10.0), daytime_interval(0.5, 20.0)];
        // 19:30 to 20:30 crosses the 20:00:00 end of the daytime window.
        let start = Utc.with_ymd_and_hms(2013, 9, 24, 19, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2013, 9, 24, 20, 30, 0).unwrap();
        let frags = fragment_window(&intervals, start, end).unwrap();
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].2.weight, 20.0);
        assert_eq!(frags[1].2.weight, 10.0);
        assert!(frags[0].1 <= frags[1].0);
        assert_eq!(frags[1].1, end);
    }

    #[test]
    fn fragment_merges_across_midnight_for_flat_rates() {
        let intervals = vec![flat_interval(1.0, 10.0)];
        let start = Utc.with_ymd_and_hms(2013, 9, 24, 23, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2013, 9, 25, 0, 30, 0).unwrap();
        let frags = fragment_window(&intervals, start, end).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].0, start);
        assert_eq!(frags[0].1, end);
    }

    #[test]
    fn fragment_errors_when_nothing_covers() {
        let intervals = vec![daytime_interval(0.5, 20.0)];
        let start = Utc.with_ymd_and_hms(2013, 9, 24, 22, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2013, 9, 24, 23, 0, 0).unwrap();
        assert!(fragment_window(&intervals, start, end).is_err());
    }
}
