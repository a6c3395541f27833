//! Named merge predicates and partition functions.
//!
//! Functions cannot be written in KDL, so configuration refers to them by
//! name and the registry resolves the names at parse time.

use buildmerge_core::{MergePredicate, PartitionFunction, SameReason, SameSources};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{ConfigError, ConfigResult};

#[derive(Clone, Default)]
pub struct Registry {
    predicates: HashMap<String, Arc<dyn MergePredicate>>,
    partitions: HashMap<String, Arc<dyn PartitionFunction>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in predicates.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_predicate(Arc::new(SameSources));
        registry.register_predicate(Arc::new(SameReason));
        registry
    }

    /// Register a predicate under its own name, replacing any previous one.
    pub fn register_predicate(&mut self, predicate: Arc<dyn MergePredicate>) -> &mut Self {
        self.predicates.insert(predicate.name().to_string(), predicate);
        self
    }

    pub fn register_partition(&mut self, partition: Arc<dyn PartitionFunction>) -> &mut Self {
        self.partitions.insert(partition.name().to_string(), partition);
        self
    }

    pub fn predicate(&self, name: &str) -> ConfigResult<Arc<dyn MergePredicate>> {
        self.predicates
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPredicate(name.to_string()))
    }

    pub fn partition(&self, name: &str) -> ConfigResult<Arc<dyn PartitionFunction>> {
        self.partitions
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPartition(name.to_string()))
    }

    pub fn predicate_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.predicates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut partitions: Vec<_> = self.partitions.keys().collect();
        partitions.sort_unstable();
        f.debug_struct("Registry")
            .field("predicates", &self.predicate_names())
            .field("partitions", &partitions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildmerge_core::{FnPartition, Properties};

    #[test]
    fn test_builtins_registered() {
        let registry = Registry::with_builtins();
        assert_eq!(registry.predicate_names(), vec!["same-reason", "same-sources"]);
        assert!(registry.predicate("same-sources").is_ok());
    }

    #[test]
    fn test_unknown_names_are_errors() {
        let registry = Registry::new();
        assert!(matches!(
            registry.predicate("nope"),
            Err(ConfigError::UnknownPredicate(_))
        ));
        assert!(matches!(
            registry.partition("nope"),
            Err(ConfigError::UnknownPartition(_))
        ));
    }

    #[test]
    fn test_register_partition() {
        let mut registry = Registry::new();
        registry.register_partition(Arc::new(FnPartition::new(
            "none",
            |_: &[String], _: &Properties| Vec::new(),
        )));
        assert_eq!(registry.partition("none").unwrap().name(), "none");
    }
}
