//! Build request merging for BuildMerge.
//!
//! Decides, for each builder of a new buildset, whether its request can be
//! merged into an equivalent existing request, and commits the buildset with
//! those merges under per-request locks.

pub mod cache;
pub mod coordinator;
pub mod finder;
pub mod locks;
pub mod matcher;
pub mod merger;
pub mod partition;
pub mod resolver;

#[cfg(test)]
mod testing;

pub use cache::{CacheStats, LruCache};
pub use coordinator::{CommitCoordinator, Committed};
pub use finder::{CandidateFinder, CandidateScope};
pub use locks::{RequestLockGuard, RequestLocks};
pub use matcher::{BASE_MERGE_PROPERTIES, properties_match};
pub use merger::{BuildRequestMerger, DECISION_LOG_TARGET, SubmittedBuildset};
pub use partition::{PARTITION_SOURCE, PartitionTrigger};
pub use resolver::{MergeResolver, MergeTarget, Resolution, ResolverCacheStats};
