//! Destinations
//!
//! A destination is a named set of dial prefixes. The prefix index is the
//! union of all loaded destinations and answers longest-prefix queries for
//! the rating pipeline and balance destination filters.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Prefixes shorter than this never match.
pub const MIN_PREFIX_MATCH: usize = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    pub prefixes: Vec<String>,
}

impl Destination {
    pub fn new(id: impl Into<String>, prefixes: Vec<String>) -> Self {
        Self {
            id: id.into(),
            prefixes,
        }
    }

    /// Length of the longest owned prefix matching `number`, 0 when none.
    pub fn contains(&self, number: &str) -> usize {
        self.prefixes
            .iter()
            .filter(|p| number.starts_with(p.as_str()))
            .map(|p| p.len())
            .max()
            .unwrap_or(0)
    }
}

/// Union index: prefix -> ids of the destinations owning it.
#[derive(Debug, Clone, Default)]
pub struct PrefixIndex {
    index: HashMap<String, BTreeSet<String>>,
}

impl PrefixIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, destination: &Destination) {
        for prefix in &destination.prefixes {
            self.index
                .entry(prefix.clone())
                .or_default()
                .insert(destination.id.clone());
        }
    }

    /// Longest prefix of `number` present in the index, together with the
    /// lexically smallest owning destination id.
    pub fn longest_prefix_match(&self, number: &str) -> Option<(String, String)> {
        self.match_where(number, |_| true)
    }

    /// Longest-prefix match restricted to destinations accepted by `keep`.
    /// Ties on prefix length break by lexical destination id.
    pub fn match_where<F>(&self, number: &str, keep: F) -> Option<(String, String)>
    where
        F: Fn(&str) -> bool,
    {
        for len in (MIN_PREFIX_MATCH..=number.len()).rev() {
            let candidate = &number[..len];
            if let Some(ids) = self.index.get(candidate) {
                if let Some(id) = ids.iter().find(|id| keep(id)) {
                    return Some((id.clone(), candidate.to_string()));
                }
            }
        }
        None
    }

    /// Longest prefix of `number` owned by any of the given destinations.
    /// Used by balance destination filters to compute precision.
    pub fn matching_prefix_for(
        &self,
        destination_ids: &[String],
        number: &str,
    ) -> Option<(String, String)> {
        self.match_where(number, |id| destination_ids.iter().any(|d| d == id))
    }
}
