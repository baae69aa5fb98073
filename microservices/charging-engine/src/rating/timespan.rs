//! Timespan splitting and increment generation
//!
//! Turns the rating segments resolved for a call window into a contiguous
//! sequence of timespans, then enumerates the billable increments of each
//! span under its rate interval.

use std::time::Duration;

use ocs_core::{OcsError, Result};

use crate::rating::plan::RatingSegment;
use crate::types::{
    round_value, CallCost, CallDescriptor, Increment, MaxCostStrategy, TimeSpan,
};

/// Split the call window into timespans, one per rating segment, carrying the
/// cumulative duration index forward. The first span inherits the
/// descriptor's index; later spans accumulate the durations before them.
pub fn split(cd: &CallDescriptor, segments: &[RatingSegment]) -> Vec<TimeSpan> {
    let mut spans = Vec::with_capacity(segments.len());
    let mut duration_index = cd.duration_index;
    for segment in segments {
        let start = segment.time_start.max(cd.time_start);
        let end = segment.time_end.min(cd.time_end);
        if start >= end {
            continue;
        }
        let span = TimeSpan {
            time_start: start,
            time_end: end,
            duration_index,
            rate_interval: Some(segment.interval.clone()),
            matched_subject: segment.matched_subject.clone(),
            matched_prefix: segment.matched_prefix.clone(),
            matched_dest_id: segment.matched_dest_id.clone(),
            rating_plan_id: segment.rating_plan_id.clone(),
            increments: Vec::new(),
        };
        duration_index += span.duration();
        spans.push(span);
    }
    spans
}

/// Enumerate the increments of a span. The applicable rate is chosen by the
/// offset inside the rate group, `duration_index + elapsed`, so long calls
/// migrate to later rate steps as they progress.
pub fn create_increments(ts: &mut TimeSpan) -> Result<()> {
    let interval = ts
        .rate_interval
        .clone()
        .ok_or_else(|| OcsError::Internal("timespan with no rate interval assigned".into()))?;

    let total = ts.duration();
    let mut increments = Vec::new();
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        let (price, rate_increment, rate_unit) = interval
            .rate_parameters(ts.offset_in_group(elapsed))
            .unwrap_or((0.0, Duration::from_secs(1), Duration::from_secs(1)));
        if rate_increment.is_zero() || rate_unit.is_zero() {
            return Err(OcsError::InvalidIncrement(format!(
                "increment {:?} unit {:?}",
                rate_increment, rate_unit
            )));
        }
        let duration = rate_increment.min(total - elapsed);
        let cost = round_value(
            price * (duration.as_secs_f64() / rate_unit.as_secs_f64()),
            interval.rating.rounding_decimals,
            interval.rating.rounding_method,
        );
        increments.push(Increment::new(duration, cost));
        elapsed += duration;
    }
    ts.increments = increments;
    Ok(())
}

/// Apply the max-cost policy across the whole call: once the accumulated
/// cost reaches an interval's ceiling, `free` zeroes subsequent increment
/// costs while `disconnect` truncates the call and flags it.
pub fn apply_max_cost(cc: &mut CallCost, initial_cost_so_far: f64) {
    let mut so_far = initial_cost_so_far;
    let mut cut: Option<(usize, usize)> = None;

    'spans: for (ts_index, ts) in cc.timespans.iter_mut().enumerate() {
        let policy = ts.rate_interval.as_ref().and_then(|i| i.max_cost());
        let Some((max_cost, strategy)) = policy else {
            so_far += ts.increments.iter().map(|i| i.cost).sum::<f64>();
            continue;
        };
        for (inc_index, inc) in ts.increments.iter_mut().enumerate() {
            if so_far >= max_cost {
                match strategy {
                    MaxCostStrategy::Free => inc.cost = 0.0,
                    MaxCostStrategy::Disconnect => {
                        cut = Some((ts_index, inc_index));
                        break 'spans;
                    }
                }
            }
            so_far += inc.cost;
        }
    }

    if let Some((ts_index, inc_index)) = cut {
        cc.max_cost_disconnect = true;
        if inc_index == 0 {
            cc.timespans.truncate(ts_index);
        } else {
            cc.timespans[ts_index].truncate_at_increment(inc_index);
            cc.timespans.truncate(ts_index + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rating::interval::{Rate, RateGroups, RateInterval, RateRating, RateTiming};
    use crate::types::{BalanceType, Direction};
    use chrono::{TimeZone, Utc};

    fn descriptor(seconds: i64) -> CallDescriptor {
        let start = Utc.with_ymd_and_hms(2013, 9, 24, 10, 48, 0).unwrap();
        CallDescriptor {
            direction: Direction::Out,
            tenant: "vdf".into(),
            category: "call".into(),
            subject: "dan".into(),
            account: "dan".into(),
            destination: "0723045326".into(),
            time_start: start,
            time_end: start + chrono::Duration::seconds(seconds),
            tor: BalanceType::Voice,
            duration_index: Duration::ZERO,
            max_rate: 0.0,
            max_rate_unit: Duration::ZERO,
            max_cost_so_far: 0.0,
            deduct_connect_fee: false,
        }
    }

    fn interval(price: f64, increment_secs: u64) -> RateInterval {
        RateInterval {
            timing: RateTiming::default(),
            rating: RateRating {
                rates: RateGroups::new(vec![Rate::new(
                    Duration::ZERO,
                    price,
                    Duration::from_secs(increment_secs),
                    Duration::from_secs(1),
                )]),
                ..Default::default()
            },
            weight: 10.0,
        }
    }

    fn segment(cd: &CallDescriptor, interval: RateInterval) -> RatingSegment {
        RatingSegment {
            time_start: cd.time_start,
            time_end: cd.time_end,
            interval,
            matched_subject: cd.subject.clone(),
            matched_prefix: "0723".into(),
            matched_dest_id: "NAT".into(),
            rating_plan_id: "RP_STANDARD".into(),
        }
    }

    #[test]
    fn split_carries_duration_index() {
        let cd = descriptor(70);
        let mid = cd.time_start + chrono::Duration::seconds(10);
        let segments = vec![
            RatingSegment {
                time_end: mid,
                ..segment(&cd, interval(1.0, 10))
            },
            RatingSegment {
                time_start: mid,
                ..segment(&cd, interval(2.0, 10))
            },
        ];
        let spans = split(&cd, &segments);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].duration_index, Duration::ZERO);
        assert_eq!(spans[1].duration_index, Duration::from_secs(10));
        assert_eq!(spans[0].time_end, spans[1].time_start);
    }

    #[test]
    fn increments_cover_span_with_short_tail() {
        let cd = descriptor(25);
        let mut spans = split(&cd, &[segment(&cd, interval(1.0, 10))]);
        create_increments(&mut spans[0]).unwrap();
        let durations: Vec<u64> = spans[0]
            .increments
            .iter()
            .map(|i| i.duration.as_secs())
            .collect();
        assert_eq!(durations, vec![10, 10, 5]);
        assert_eq!(spans[0].increments[0].cost, 10.0);
        assert_eq!(spans[0].increments[2].cost, 5.0);
    }

    #[test]
    fn rate_step_changes_mid_span() {
        let cd = descriptor(120);
        let stepped = RateInterval {
            timing: RateTiming::default(),
            rating: RateRating {
                rates: RateGroups::new(vec![
                    Rate::new(
                        Duration::ZERO,
                        1.0,
                        Duration::from_secs(60),
                        Duration::from_secs(60),
                    ),
                    Rate::new(
                        Duration::from_secs(60),
                        0.5,
                        Duration::from_secs(1),
                        Duration::from_secs(60),
                    ),
                ]),
                ..Default::default()
            },
            weight: 10.0,
        };
        let mut spans = split(&cd, &[segment(&cd, stepped)]);
        create_increments(&mut spans[0]).unwrap();
        assert_eq!(spans[0].increments[0].duration, Duration::from_secs(60));
        // after the first minute the per-second step takes over
        assert_eq!(spans[0].increments[1].duration, Duration::from_secs(1));
        assert_eq!(spans[0].increments.len(), 61);
    }

    #[test]
    fn max_cost_free_zeroes_tail() {
        let cd = descriptor(30);
        let mut iv = interval(1.0, 10);
        iv.rating.max_cost = 15.0;
        iv.rating.max_cost_strategy = Some(MaxCostStrategy::Free);
        let mut cc = cd.create_call_cost();
        cc.timespans = split(&cd, &[segment(&cd, iv)]);
        create_increments(&mut cc.timespans[0]).unwrap();
        apply_max_cost(&mut cc, 0.0);
        let costs: Vec<f64> = cc.timespans[0].increments.iter().map(|i| i.cost).collect();
        assert_eq!(costs, vec![10.0, 10.0, 0.0]);
        assert!(!cc.max_cost_disconnect);
    }

    #[test]
    fn max_cost_disconnect_truncates() {
        let cd = descriptor(30);
        let mut iv = interval(1.0, 10);
        iv.rating.max_cost = 15.0;
        iv.rating.max_cost_strategy = Some(MaxCostStrategy::Disconnect);
        let mut cc = cd.create_call_cost();
        cc.timespans = split(&cd, &[segment(&cd, iv)]);
        create_increments(&mut cc.timespans[0]).unwrap();
        apply_max_cost(&mut cc, 0.0);
        assert!(cc.max_cost_disconnect);
        assert_eq!(cc.timespans[0].increments.len(), 2);
        assert_eq!(cc.timespans[0].duration(), Duration::from_secs(20));
    }
}
