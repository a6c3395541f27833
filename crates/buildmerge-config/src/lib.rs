//! KDL configuration parsing for BuildMerge.
//!
//! This crate handles parsing of:
//! - Merger settings (candidate scope, cache capacities)
//! - Per-builder merge policies and required-matching properties
//! - The registry of named merge predicates and partition functions

pub mod error;
pub mod merger;
mod nodes;
pub mod registry;

pub use error::{ConfigError, ConfigResult};
pub use merger::{
    CacheSizes, DEFAULT_CACHE_SIZE, MergeScope, MergerConfig, MergerSettings, load_merger_config,
    parse_merger_config,
};
pub use registry::Registry;
