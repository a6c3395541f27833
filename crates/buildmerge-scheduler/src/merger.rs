//! The build request merger service.

use buildmerge_config::{MergeScope, MergerConfig};
use buildmerge_core::{BuildRequestId, BuildsetId, NewBuildset, Result};
use buildmerge_db::BuildRequestRepo;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::info;

use crate::coordinator::{CommitCoordinator, Committed};
use crate::locks::RequestLockGuard;
use crate::resolver::{MergeResolver, Resolution, ResolverCacheStats, builder_configs};

/// Target that receives the per-submission decision record.
pub const DECISION_LOG_TARGET: &str = "buildmerge::merge";

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmittedBuildset {
    pub buildset_id: BuildsetId,
    /// Request created for each builder, merged or not.
    pub brids: BTreeMap<String, BuildRequestId>,
    /// Request each builder was merged into; `None` for a fresh build.
    pub merges: BTreeMap<String, Option<BuildRequestId>>,
}

impl SubmittedBuildset {
    pub fn merged_into(&self, builder_name: &str) -> Option<BuildRequestId> {
        self.merges.get(builder_name).copied().flatten()
    }
}

impl From<Committed> for SubmittedBuildset {
    fn from(committed: Committed) -> Self {
        Self {
            buildset_id: committed.buildset_id,
            brids: committed.brids,
            merges: committed.merges,
        }
    }
}

#[derive(Serialize)]
struct BuilderDecision {
    elapsed_secs: f64,
    merge_brid: Option<BuildRequestId>,
}

/// Per-submission timing and decision record.
#[derive(Serialize)]
struct MergeDecisionLog<'a> {
    reason: &'a str,
    sourcestampset_id: i64,
    triggered_by: Option<BuildRequestId>,
    buildset_id: BuildsetId,
    builders: BTreeMap<&'a str, BuilderDecision>,
    fallbacks: &'a [String],
    elapsed_secs: f64,
}

/// Creates buildsets, merging their requests into equivalent existing ones.
pub struct BuildRequestMerger {
    config: RwLock<Arc<MergerConfig>>,
    resolver: MergeResolver,
    coordinator: CommitCoordinator,
}

impl BuildRequestMerger {
    pub fn new(repo: Arc<dyn BuildRequestRepo>, config: MergerConfig) -> Self {
        Self {
            resolver: MergeResolver::new(repo.clone(), config.settings.cache),
            coordinator: CommitCoordinator::new(repo),
            config: RwLock::new(Arc::new(config)),
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<MergerConfig> {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the configuration. Submissions already running keep the
    /// snapshot they started with.
    pub fn reconfigure(&self, config: MergerConfig) {
        self.resolver.resize_caches(config.settings.cache);
        info!(
            builders = config.builders.len(),
            scope = ?config.settings.scope,
            always_check = config.settings.always_check,
            "Reconfigured build request merger"
        );
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(config);
    }

    pub fn cache_stats(&self) -> ResolverCacheStats {
        self.resolver.cache_stats()
    }

    /// Decide merges for `buildset` without writing anything.
    pub async fn resolve(&self, buildset: &NewBuildset) -> Result<Resolution> {
        let config = self.config();
        self.resolver.resolve(&config, buildset).await
    }

    /// Create `buildset`, merging each builder's request where possible.
    ///
    /// Either every request of the buildset is written or none is.
    pub async fn submit_buildset(&self, buildset: NewBuildset) -> Result<SubmittedBuildset> {
        let started = Instant::now();
        let config = self.config();
        builder_configs(&config, &buildset.builder_names)?;

        let anchor = self.scope_anchor(&config, &buildset).await?;
        let resolution = self.resolver.resolve(&config, &buildset).await?;
        let committed = self
            .coordinator
            .commit(&buildset, &resolution, anchor.as_ref())
            .await?;
        drop(anchor);

        log_decision(&buildset, &resolution, &committed, started);
        Ok(committed.into())
    }

    /// In chain scope, serialize submissions of the same chain on the
    /// chain-start request, so that two of them cannot both miss each other.
    async fn scope_anchor(
        &self,
        config: &MergerConfig,
        buildset: &NewBuildset,
    ) -> Result<Option<RequestLockGuard>> {
        let Some(triggered_by) = buildset.triggered_by else {
            return Ok(None);
        };
        if config.settings.scope != MergeScope::Chain || buildset.properties.has_selected_slave() {
            return Ok(None);
        }

        let start_brid = self.resolver.chain_start(triggered_by).await?;
        Ok(Some(self.coordinator.locks().lock(start_brid).await))
    }
}

fn log_decision(buildset: &NewBuildset, resolution: &Resolution, committed: &Committed, started: Instant) {
    let builders = committed
        .merges
        .iter()
        .map(|(name, merge_brid)| {
            let elapsed = resolution.elapsed.get(name).copied().unwrap_or_default();
            (
                name.as_str(),
                BuilderDecision {
                    elapsed_secs: elapsed.as_secs_f64(),
                    merge_brid: *merge_brid,
                },
            )
        })
        .collect();

    let record = MergeDecisionLog {
        reason: &buildset.reason,
        sourcestampset_id: buildset.sourcestampset_id.get(),
        triggered_by: buildset.triggered_by,
        buildset_id: committed.buildset_id,
        builders,
        fallbacks: &committed.fallbacks,
        elapsed_secs: started.elapsed().as_secs_f64(),
    };
    if let Ok(record) = serde_json::to_string(&record) {
        info!(target: DECISION_LOG_TARGET, decision = %record, "Merge decision");
    }
}
