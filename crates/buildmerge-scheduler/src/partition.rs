//! Fan-out of one trigger into several buildsets.

use buildmerge_config::Registry;
use buildmerge_core::{NewBuildset, PartitionFunction, Properties, Result};
use std::sync::Arc;
use tracing::debug;

use crate::merger::{BuildRequestMerger, SubmittedBuildset};

/// Source label of properties set by a partition.
pub const PARTITION_SOURCE: &str = "PartitionTrigger";

/// Submits one buildset per partition returned by a partition function.
#[derive(Clone)]
pub struct PartitionTrigger {
    function: Arc<dyn PartitionFunction>,
}

impl PartitionTrigger {
    pub fn new(function: Arc<dyn PartitionFunction>) -> Self {
        Self { function }
    }

    /// Trigger using the partition function registered as `name`.
    pub fn from_registry(registry: &Registry, name: &str) -> Result<Self> {
        Ok(Self::new(registry.partition(name)?))
    }

    pub fn function_name(&self) -> &str {
        self.function.name()
    }

    /// Submit `buildset` once per partition, in partition order.
    ///
    /// Each submission commits on its own; the first failure stops the
    /// fan-out and is returned, leaving earlier partitions committed.
    pub async fn trigger(
        &self,
        merger: &BuildRequestMerger,
        buildset: NewBuildset,
    ) -> Result<Vec<SubmittedBuildset>> {
        let partitions = self
            .function
            .partitions(&buildset.builder_names, &buildset.properties);

        if partitions.is_empty() {
            return Ok(vec![merger.submit_buildset(buildset).await?]);
        }

        debug!(
            function = %self.function.name(),
            partitions = partitions.len(),
            "Partitioning trigger"
        );
        let mut submitted = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let properties = overlay(&buildset.properties, &partition);
            let partitioned = buildset.clone().with_properties(properties);
            submitted.push(merger.submit_buildset(partitioned).await?);
        }
        Ok(submitted)
    }
}

fn overlay(base: &Properties, partition: &Properties) -> Properties {
    let mut properties = base.clone();
    for (name, value) in partition.iter() {
        properties.set(name.clone(), value.value.clone(), PARTITION_SOURCE);
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stamp;
    use buildmerge_config::MergerConfig;
    use buildmerge_core::{BuilderMergeConfig, Error, FnPartition};
    use buildmerge_db::{BuildRequestRepo, MemoryBuildRequestRepo};
    use serde_json::json;

    fn merger(repo: Arc<MemoryBuildRequestRepo>) -> BuildRequestMerger {
        let config = MergerConfig::default().with_builder("test", BuilderMergeConfig::default());
        BuildRequestMerger::new(repo, config)
    }

    fn by_platform() -> Arc<dyn PartitionFunction> {
        Arc::new(FnPartition::new(
            "by-platform",
            |_: &[String], _: &Properties| {
                ["linux", "macos"]
                    .into_iter()
                    .map(|platform| Properties::new().with("platform", platform, "partition"))
                    .collect()
            },
        ))
    }

    #[tokio::test]
    async fn test_one_buildset_per_partition() {
        let repo = Arc::new(MemoryBuildRequestRepo::new());
        let merger = merger(repo.clone());
        let ssid = repo.add_sourcestamps(vec![stamp(Some("abc"))]);
        let trigger = PartitionTrigger::new(by_platform());

        let buildset = NewBuildset::new(ssid, "trigger")
            .with_properties(Properties::new().with("platform", "any", "Trigger").with("owner", "ci", "Trigger"))
            .with_builders(["test"]);
        let submitted = trigger.trigger(&merger, buildset).await.unwrap();

        assert_eq!(submitted.len(), 2);
        let platforms: Vec<_> = repo
            .buildsets(&[submitted[0].buildset_id, submitted[1].buildset_id])
            .await
            .unwrap()
            .into_iter()
            .map(|bs| {
                let platform = bs.properties.get_with_source("platform").cloned().unwrap();
                assert_eq!(platform.source, PARTITION_SOURCE);
                assert_eq!(bs.properties.get("owner"), Some(&json!("ci")));
                platform.value
            })
            .collect();
        assert_eq!(platforms, vec![json!("linux"), json!("macos")]);
    }

    #[tokio::test]
    async fn test_no_partitions_submits_once() {
        let repo = Arc::new(MemoryBuildRequestRepo::new());
        let merger = merger(repo.clone());
        let ssid = repo.add_sourcestamps(vec![stamp(Some("abc"))]);
        let trigger = PartitionTrigger::new(Arc::new(FnPartition::new(
            "none",
            |_: &[String], _: &Properties| Vec::new(),
        )));

        let submitted = trigger
            .trigger(&merger, NewBuildset::new(ssid, "trigger").with_builders(["test"]))
            .await
            .unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(repo.buildset_count(), 1);
    }

    #[test]
    fn test_missing_partition_function_is_configuration_error() {
        let result = PartitionTrigger::from_registry(&Registry::with_builtins(), "by-platform");
        assert!(matches!(result, Err(ref e) if e.is_configuration()));

        let mut registry = Registry::with_builtins();
        registry.register_partition(by_platform());
        let trigger = PartitionTrigger::from_registry(&registry, "by-platform").unwrap();
        assert_eq!(trigger.function_name(), "by-platform");
    }

    #[tokio::test]
    async fn test_unknown_builder_stops_fan_out() {
        let repo = Arc::new(MemoryBuildRequestRepo::new());
        let merger = merger(repo.clone());
        let ssid = repo.add_sourcestamps(vec![stamp(Some("abc"))]);
        let trigger = PartitionTrigger::new(by_platform());

        let result = trigger
            .trigger(&merger, NewBuildset::new(ssid, "trigger").with_builders(["deploy"]))
            .await;
        assert_eq!(result, Err(Error::UnknownBuilder("deploy".to_string())));
        assert_eq!(repo.buildset_count(), 0);
    }
}
