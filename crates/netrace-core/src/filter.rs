//! Filters decide whether a hook runs for a given probe invocation.
//!
//! A [`FilterSet`] combines up to [`FILTERS_MAX`] filters with a single
//! [`Combinator`]. Each filter returns a tri-state [`FilterResult`]: an
//! inconclusive result fails an `and` and is ignored by an `or`.

use std::{fmt, sync::Arc};

use probe_common::{ProbeContext, schema::FILTERS_MAX};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Match,
    NoMatch,
    /// The filter could not be evaluated at this probe.
    Inconclusive,
}

/// A filter evaluated against a probe context. Implementations must not have
/// side effects.
pub trait Filter: Send + Sync + fmt::Debug {
    /// Identifier of the filter type in the configuration language.
    fn tag(&self) -> u32;

    fn evaluate_one(&self, ctx: &ProbeContext) -> FilterResult;
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    #[default]
    And,
    Or,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterSetError {
    #[error("too many filters ({0}, max {FILTERS_MAX})")]
    TooMany(usize),
}

/// Evaluate `filters` combined with `combinator`.
///
/// `and` over no filter is true, `or` over no filter is false.
pub fn evaluate(combinator: Combinator, filters: &[Arc<dyn Filter>], ctx: &ProbeContext) -> bool {
    match combinator {
        Combinator::And => filters
            .iter()
            .all(|filter| filter.evaluate_one(ctx) == FilterResult::Match),
        Combinator::Or => filters
            .iter()
            .any(|filter| filter.evaluate_one(ctx) == FilterResult::Match),
    }
}

/// Filters attached to a hook.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    combinator: Combinator,
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterSet {
    pub fn new(
        combinator: Combinator,
        filters: Vec<Arc<dyn Filter>>,
    ) -> Result<Self, FilterSetError> {
        if filters.len() > FILTERS_MAX {
            return Err(FilterSetError::TooMany(filters.len()));
        }
        Ok(Self {
            combinator,
            filters,
        })
    }

    /// A set admitting everything.
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn combinator(&self) -> Combinator {
        self.combinator
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Tags of the filters, in evaluation order.
    pub fn tags(&self) -> Vec<u32> {
        self.filters.iter().map(|filter| filter.tag()).collect()
    }

    pub fn evaluate(&self, ctx: &ProbeContext) -> bool {
        evaluate(self.combinator, &self.filters, ctx)
    }
}
