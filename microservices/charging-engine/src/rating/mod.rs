//! Rating pipeline
//!
//! Destination matching, rate-interval resolution, timespan splitting and
//! increment generation.

pub mod destination;
pub mod interval;
pub mod plan;
pub mod timespan;

pub use destination::{Destination, PrefixIndex};
pub use interval::{Rate, RateGroups, RateInterval, RateRating, RateTiming};
pub use plan::{RatingActivation, RatingPlan, RatingProfile, RatingQuery, RatingSegment, RatingStore};
