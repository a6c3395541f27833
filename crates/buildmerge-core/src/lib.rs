//! Core domain types and traits for BuildMerge.
//!
//! This crate contains:
//! - Build request, buildset and sourcestamp identifiers
//! - Build request and buildset records
//! - Property bags with provenance
//! - Merge policies and the custom merge predicate trait
//! - Partition functions for fanning out triggers

pub mod error;
pub mod id;
pub mod merge;
pub mod partition;
pub mod properties;
pub mod request;

pub use error::{Error, Result};
pub use id::{BuildRequestId, BuildsetId, SourceStampSetId};
pub use merge::{
    BuilderMergeConfig, FnPredicate, MergePolicy, MergePredicate, RequestView, SameReason,
    SameSources,
};
pub use partition::{FnPartition, PartitionFunction};
pub use properties::{Properties, PropertyValue};
pub use request::{
    BuildRequest, Buildset, MergeCandidate, NewBuildset, Priority, SourceStamp, SourceStampKey,
};
