//! Error taxonomy of the core passes and the best-effort diagnostic buckets.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::registry::Universe;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    #[error("unsupported type kind `{0}`")]
    UnsupportedTypeKind(String),
    #[error("unsupported declaration kind `{0}`")]
    UnsupportedDeclKind(String),
    #[error("unsupported expression kind `{0}`")]
    UnsupportedExpressionKind(String),
    #[error("{universe:?} entry was never registered: {what}")]
    NotRegistered { universe: Universe, what: String },
    #[error("function reference could not be resolved: {0}")]
    MissingFunctionInMap(String),
    #[error("invalid offsetof chain: {0}")]
    InvalidOffsetOfChain(String),
    #[error("callee has no extractable name: {0}")]
    FatalResolution(String),
    #[error("malformed translation unit: {0}")]
    MalformedUnit(String),
}

impl DbError {
    pub fn kind(&self) -> DiagKind {
        match self {
            DbError::UnsupportedTypeKind(_) => DiagKind::UnsupportedTypeKind,
            DbError::UnsupportedDeclKind(_) => DiagKind::UnsupportedDeclKind,
            DbError::UnsupportedExpressionKind(_) => DiagKind::UnsupportedExpressionKind,
            DbError::NotRegistered { .. } => DiagKind::NotRegistered,
            DbError::MissingFunctionInMap(_) => DiagKind::MissingFunctionInMap,
            DbError::InvalidOffsetOfChain(_) => DiagKind::InvalidOffsetOfChain,
            DbError::FatalResolution(_) => DiagKind::FatalResolution,
            DbError::MalformedUnit(_) => DiagKind::MalformedUnit,
        }
    }

    /// Fatal errors abandon the unit whatever the policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::FatalResolution(_) | DbError::MalformedUnit(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagKind {
    UnsupportedTypeKind,
    UnsupportedDeclKind,
    UnsupportedExpressionKind,
    NotRegistered,
    MissingFunctionInMap,
    InvalidOffsetOfChain,
    FatalResolution,
    MalformedUnit,
}

/// What to do with a recoverable error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Record the error in its bucket and keep going.
    #[default]
    BestEffort,
    /// Abort the unit on the first error.
    Strict,
}

/// Diagnostic buckets keyed by error kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diagnostics {
    buckets: BTreeMap<DiagKind, BTreeSet<String>>,
}

impl Diagnostics {
    /// Records `err` under best-effort policy, hands it back under strict policy.
    pub fn report(&mut self, policy: Policy, err: DbError) -> Result<(), DbError> {
        if policy == Policy::Strict || err.is_fatal() {
            return Err(err);
        }
        warn!(kind = ?err.kind(), err = %err, "recorded diagnostic");
        self.buckets
            .entry(err.kind())
            .or_default()
            .insert(err.to_string());
        Ok(())
    }

    pub fn count(&self, kind: DiagKind) -> usize {
        self.buckets.get(&kind).map_or(0, BTreeSet::len)
    }

    pub fn entries(&self, kind: DiagKind) -> impl Iterator<Item = &str> {
        self.buckets
            .get(&kind)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(BTreeSet::is_empty)
    }

    pub fn merge(&mut self, other: &Diagnostics) {
        for (kind, set) in &other.buckets {
            self.buckets
                .entry(*kind)
                .or_default()
                .extend(set.iter().cloned());
        }
    }
}
