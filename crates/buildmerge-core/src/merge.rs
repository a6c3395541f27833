//! Merge policies and custom merge predicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::{BuildRequestId, BuildsetId, Priority, Properties, SourceStamp};

/// Full representation of a build request handed to custom merge predicates.
///
/// The incoming request has not been written yet, so it carries no ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestView {
    pub brid: Option<BuildRequestId>,
    pub buildset_id: Option<BuildsetId>,
    pub builder_name: String,
    pub priority: Priority,
    pub reason: String,
    pub properties: Properties,
    pub sources: Vec<SourceStamp>,
    pub claimed: bool,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Builder-supplied decision whether `incoming` may merge into `candidate`.
pub trait MergePredicate: Send + Sync {
    /// Name the predicate is registered under.
    fn name(&self) -> &str;

    fn can_merge(&self, builder_name: &str, incoming: &RequestView, candidate: &RequestView) -> bool;
}

/// Adapts a closure into a [`MergePredicate`].
pub struct FnPredicate<F> {
    name: String,
    f: F,
}

impl<F> FnPredicate<F>
where
    F: Fn(&str, &RequestView, &RequestView) -> bool + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> MergePredicate for FnPredicate<F>
where
    F: Fn(&str, &RequestView, &RequestView) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn can_merge(&self, builder_name: &str, incoming: &RequestView, candidate: &RequestView) -> bool {
        (self.f)(builder_name, incoming, candidate)
    }
}

/// Merges requests building exactly the same sourcestamps.
pub struct SameSources;

impl MergePredicate for SameSources {
    fn name(&self) -> &str {
        "same-sources"
    }

    fn can_merge(&self, _builder_name: &str, incoming: &RequestView, candidate: &RequestView) -> bool {
        let mut ours: Vec<_> = incoming.sources.iter().map(SourceStamp::key).collect();
        let mut theirs: Vec<_> = candidate.sources.iter().map(SourceStamp::key).collect();
        ours.sort();
        theirs.sort();
        ours == theirs
    }
}

/// Merges requests submitted for the same reason.
pub struct SameReason;

impl MergePredicate for SameReason {
    fn name(&self) -> &str {
        "same-reason"
    }

    fn can_merge(&self, _builder_name: &str, incoming: &RequestView, candidate: &RequestView) -> bool {
        incoming.reason == candidate.reason
    }
}

/// How a builder decides whether a new request may merge.
#[derive(Clone, Default)]
pub enum MergePolicy {
    /// Never merge.
    Disabled,
    /// Merge when the baseline and configured properties are equal.
    #[default]
    Default,
    /// Merge when the predicate accepts the candidate.
    Custom(Arc<dyn MergePredicate>),
}

impl MergePolicy {
    pub fn name(&self) -> &str {
        match self {
            MergePolicy::Disabled => "disabled",
            MergePolicy::Default => "default",
            MergePolicy::Custom(predicate) => predicate.name(),
        }
    }
}

impl fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::Disabled => f.write_str("Disabled"),
            MergePolicy::Default => f.write_str("Default"),
            MergePolicy::Custom(predicate) => f.debug_tuple("Custom").field(&predicate.name()).finish(),
        }
    }
}

/// Per-builder merge configuration.
#[derive(Debug, Clone, Default)]
pub struct BuilderMergeConfig {
    pub policy: MergePolicy,
    /// Properties that must match in addition to the baseline set.
    pub merge_properties: Vec<String>,
}

impl BuilderMergeConfig {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            merge_properties: Vec::new(),
        }
    }

    pub fn with_merge_properties<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.merge_properties = names.into_iter().map(Into::into).collect();
        self
    }
}
