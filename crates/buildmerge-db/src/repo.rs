//! Repository traits and implementations.

pub mod buildrequest;
pub mod memory;

pub use buildrequest::{BuildRequestRepo, InsertedBuildset, PgBuildRequestRepo, source_keys};
pub use memory::MemoryBuildRequestRepo;
