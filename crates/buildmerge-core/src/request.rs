//! Build request, buildset and sourcestamp records.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{BuildRequestId, BuildsetId, Properties, SourceStampSetId};

/// Scheduling priority of a build request. Higher runs first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct Priority(pub i32);

/// One request to run a builder for a buildset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildRequestId,
    pub buildset_id: BuildsetId,
    pub builder_name: String,
    pub priority: Priority,
    /// Finished, with or without a result.
    pub complete: bool,
    /// Picked up by a worker and actively running.
    pub claimed: bool,
    /// Request this one was merged into. Written once, at creation.
    pub merge_target: Option<BuildRequestId>,
    /// Request whose build triggered this one.
    pub triggered_by: Option<BuildRequestId>,
    /// Top-level request of the chain this request belongs to.
    pub start_brid: Option<BuildRequestId>,
    pub submitted_at: DateTime<Utc>,
}

impl BuildRequest {
    /// Whether another request may be merged into this one.
    pub fn accepts_merges(&self) -> bool {
        !self.complete && self.merge_target.is_none()
    }
}

/// A batch of build requests created from one trigger event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buildset {
    pub id: BuildsetId,
    pub sourcestampset_id: SourceStampSetId,
    pub reason: String,
    pub external_idstring: Option<String>,
    pub properties: Properties,
    pub submitted_at: DateTime<Utc>,
}

/// What to build for one codebase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceStamp {
    pub codebase: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub repository: String,
}

impl SourceStamp {
    pub fn key(&self) -> SourceStampKey {
        SourceStampKey {
            codebase: self.codebase.clone(),
            branch: self.branch.clone(),
            revision: self.revision.clone(),
        }
    }
}

/// The (codebase, branch, revision) tuple sourcestamp-scoped merging matches on.
///
/// A branch-only stamp (no revision) compares unequal to the same branch
/// once its tip has been resolved to a concrete revision, so such requests
/// always get a fresh build.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceStampKey {
    pub codebase: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
}

/// A request that is structurally eligible to receive a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub buildset_id: BuildsetId,
    pub brid: BuildRequestId,
    /// Number of the build running the request, when it is claimed.
    pub build_number: Option<i64>,
}

/// Everything needed to create a buildset and its build requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBuildset {
    pub sourcestampset_id: SourceStampSetId,
    pub reason: String,
    pub properties: Properties,
    pub triggered_by: Option<BuildRequestId>,
    pub builder_names: Vec<String>,
    pub external_idstring: Option<String>,
    pub priority: Priority,
}

impl NewBuildset {
    pub fn new(sourcestampset_id: SourceStampSetId, reason: impl Into<String>) -> Self {
        Self {
            sourcestampset_id,
            reason: reason.into(),
            properties: Properties::new(),
            triggered_by: None,
            builder_names: Vec::new(),
            external_idstring: None,
            priority: Priority::default(),
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn triggered_by(mut self, brid: BuildRequestId) -> Self {
        self.triggered_by = Some(brid);
        self
    }

    pub fn with_builders<I, S>(mut self, builders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.builder_names = builders.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_external_idstring(mut self, external_idstring: impl Into<String>) -> Self {
        self.external_idstring = Some(external_idstring.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}
