//! Merge resolution: which existing request, if any, each builder of a new
//! buildset merges into.

use buildmerge_config::{CacheSizes, MergeScope, MergerConfig};
use buildmerge_core::{
    BuildRequestId, BuilderMergeConfig, BuildsetId, Error, MergeCandidate, MergePolicy,
    MergePredicate, NewBuildset, Properties, RequestView, Result, SourceStamp,
};
use buildmerge_db::{BuildRequestRepo, source_keys};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::cache::{CacheStats, LruCache};
use crate::finder::{CandidateFinder, CandidateScope};
use crate::matcher::properties_match;

/// Existing request a new request merges into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeTarget {
    pub brid: BuildRequestId,
    pub buildset_id: BuildsetId,
    /// Build already running the target, if any.
    pub build_number: Option<i64>,
}

impl From<MergeCandidate> for MergeTarget {
    fn from(candidate: MergeCandidate) -> Self {
        Self {
            brid: candidate.brid,
            buildset_id: candidate.buildset_id,
            build_number: candidate.build_number,
        }
    }
}

/// Merge decision for every builder of one buildset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// `None` schedules a fresh build.
    pub targets: BTreeMap<String, Option<MergeTarget>>,
    /// Time spent deciding each builder.
    pub elapsed: BTreeMap<String, Duration>,
}

impl Resolution {
    /// Builders that merge, with their target request.
    pub fn merges(&self) -> BTreeMap<String, BuildRequestId> {
        self.targets
            .iter()
            .filter_map(|(name, target)| target.map(|t| (name.clone(), t.brid)))
            .collect()
    }

    pub fn target(&self, builder_name: &str) -> Option<BuildRequestId> {
        self.targets.get(builder_name).copied().flatten().map(|t| t.brid)
    }
}

/// Hit/miss counters of the resolver's caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolverCacheStats {
    pub chain_start: CacheStats,
    pub properties: CacheStats,
}

/// Policy after applying the always-check override.
enum EffectivePolicy<'a> {
    Never,
    PropertyEquality,
    Predicate(&'a Arc<dyn MergePredicate>),
}

/// Lookups shared by every builder of one submission.
struct SubmissionContext<'a> {
    buildset: &'a NewBuildset,
    scope: Option<CandidateScope>,
    sources: Option<Vec<SourceStamp>>,
}

pub struct MergeResolver {
    repo: Arc<dyn BuildRequestRepo>,
    finder: CandidateFinder,
    start_brids: LruCache<BuildRequestId, BuildRequestId>,
    properties: LruCache<BuildsetId, Properties>,
}

impl MergeResolver {
    pub fn new(repo: Arc<dyn BuildRequestRepo>, cache: CacheSizes) -> Self {
        let loader_repo = repo.clone();
        let start_brids = LruCache::with_loader(cache.chain_start, move |brid: BuildRequestId| {
            let repo = loader_repo.clone();
            async move { repo.top_level_chain_id(brid).await.map_err(Error::from) }
        });

        Self {
            finder: CandidateFinder::new(repo.clone()),
            repo,
            start_brids,
            // Filled in batches by buildsets_properties.
            properties: LruCache::new(cache.properties),
        }
    }

    pub fn resize_caches(&self, cache: CacheSizes) {
        self.start_brids.set_max_size(cache.chain_start);
        self.properties.set_max_size(cache.properties);
    }

    pub fn cache_stats(&self) -> ResolverCacheStats {
        ResolverCacheStats {
            chain_start: self.start_brids.stats(),
            properties: self.properties.stats(),
        }
    }

    /// Top-level request of the chain `brid` belongs to.
    pub async fn chain_start(&self, brid: BuildRequestId) -> Result<BuildRequestId> {
        self.start_brids.get(brid).await
    }

    /// Decide a merge target for every builder of `buildset`.
    ///
    /// Builders are decided independently, in name order. An unknown builder
    /// fails the whole resolution before any lookup; so does any store error.
    pub async fn resolve(&self, config: &MergerConfig, buildset: &NewBuildset) -> Result<Resolution> {
        let builders = builder_configs(config, &buildset.builder_names)?;

        let mut ctx = SubmissionContext {
            buildset,
            scope: None,
            sources: None,
        };
        let mut resolution = Resolution::default();
        for (name, builder) in builders {
            let started = Instant::now();
            let target = self.resolve_builder(config, &mut ctx, name, builder).await?;
            debug!(
                builder = %name,
                merge_brid = ?target.map(|t| t.brid.get()),
                "Resolved merge target"
            );
            resolution.targets.insert(name.to_string(), target);
            resolution.elapsed.insert(name.to_string(), started.elapsed());
        }
        Ok(resolution)
    }

    async fn resolve_builder(
        &self,
        config: &MergerConfig,
        ctx: &mut SubmissionContext<'_>,
        builder_name: &str,
        builder: &BuilderMergeConfig,
    ) -> Result<Option<MergeTarget>> {
        let buildset = ctx.buildset;

        // Pinned to a worker: the user wants this exact build to run.
        if buildset.properties.has_selected_slave() {
            return Ok(None);
        }

        // Top-level builds are always fresh.
        let Some(triggered_by) = buildset.triggered_by else {
            return Ok(None);
        };

        let policy = match &builder.policy {
            MergePolicy::Disabled if config.settings.always_check => EffectivePolicy::PropertyEquality,
            MergePolicy::Disabled => EffectivePolicy::Never,
            MergePolicy::Default => EffectivePolicy::PropertyEquality,
            MergePolicy::Custom(predicate) => EffectivePolicy::Predicate(predicate),
        };
        if matches!(policy, EffectivePolicy::Never) {
            return Ok(None);
        }

        let scope = match &ctx.scope {
            Some(scope) => scope.clone(),
            None => {
                let scope = self.candidate_scope(config, ctx, triggered_by).await?;
                ctx.scope = Some(scope.clone());
                scope
            }
        };

        let candidates = self.finder.find(builder_name, &scope).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        match policy {
            EffectivePolicy::Never => Ok(None),
            EffectivePolicy::PropertyEquality => {
                self.first_with_matching_properties(buildset, builder, candidates)
                    .await
            }
            EffectivePolicy::Predicate(predicate) => {
                let sources = self.sources(ctx).await?;
                let incoming = RequestView {
                    brid: None,
                    buildset_id: None,
                    builder_name: builder_name.to_string(),
                    priority: buildset.priority,
                    reason: buildset.reason.clone(),
                    properties: buildset.properties.clone(),
                    sources,
                    claimed: false,
                    submitted_at: None,
                };
                self.first_accepted(predicate.as_ref(), builder_name, &incoming, candidates)
                    .await
            }
        }
    }

    async fn candidate_scope(
        &self,
        config: &MergerConfig,
        ctx: &mut SubmissionContext<'_>,
        triggered_by: BuildRequestId,
    ) -> Result<CandidateScope> {
        match config.settings.scope {
            MergeScope::Chain => Ok(CandidateScope::Chain {
                start_brid: self.chain_start(triggered_by).await?,
            }),
            MergeScope::SourceStamp { claimed_only } => {
                let sources = self.sources(ctx).await?;
                Ok(CandidateScope::SourceStamps {
                    sources: source_keys(&sources),
                    priority: ctx.buildset.priority,
                    claimed_only,
                })
            }
        }
    }

    /// Sourcestamps of the submission, fetched at most once.
    async fn sources(&self, ctx: &mut SubmissionContext<'_>) -> Result<Vec<SourceStamp>> {
        if let Some(sources) = &ctx.sources {
            return Ok(sources.clone());
        }
        let sources = self.repo.sourcestamps(ctx.buildset.sourcestampset_id).await?;
        ctx.sources = Some(sources.clone());
        Ok(sources)
    }

    async fn first_with_matching_properties(
        &self,
        buildset: &NewBuildset,
        builder: &BuilderMergeConfig,
        candidates: Vec<MergeCandidate>,
    ) -> Result<Option<MergeTarget>> {
        let buildset_ids: Vec<BuildsetId> = candidates.iter().map(|c| c.buildset_id).collect();
        let other_properties = self.buildsets_properties(&buildset_ids).await?;

        Ok(candidates
            .into_iter()
            .find(|candidate| {
                other_properties
                    .get(&candidate.buildset_id)
                    .is_some_and(|other| {
                        properties_match(&buildset.properties, other, &builder.merge_properties)
                    })
            })
            .map(MergeTarget::from))
    }

    async fn first_accepted(
        &self,
        predicate: &dyn MergePredicate,
        builder_name: &str,
        incoming: &RequestView,
        candidates: Vec<MergeCandidate>,
    ) -> Result<Option<MergeTarget>> {
        let brids: Vec<BuildRequestId> = candidates.iter().map(|c| c.brid).collect();
        let views: HashMap<BuildRequestId, RequestView> = self
            .repo
            .request_views(&brids)
            .await?
            .into_iter()
            .filter_map(|view| view.brid.map(|brid| (brid, view)))
            .collect();

        Ok(candidates
            .into_iter()
            .find(|candidate| {
                views.get(&candidate.brid).is_some_and(|view| {
                    !view.properties.has_selected_slave()
                        && predicate.can_merge(builder_name, incoming, view)
                })
            })
            .map(MergeTarget::from))
    }

    /// Properties of several buildsets: resident ones from the cache, the
    /// rest in one store query whose results are cached.
    async fn buildsets_properties(
        &self,
        buildset_ids: &[BuildsetId],
    ) -> Result<HashMap<BuildsetId, Properties>> {
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for id in buildset_ids {
            match self.properties.get_if_present(id) {
                Some(properties) => {
                    found.insert(*id, properties);
                }
                None => missing.push(*id),
            }
        }
        missing.sort();
        missing.dedup();

        if !missing.is_empty() {
            let mut loaded = self.repo.buildsets_properties(&missing).await?;
            for id in missing {
                let properties = loaded.remove(&id).unwrap_or_default();
                self.properties.put_new(id, properties.clone());
                found.insert(id, properties);
            }
        }
        Ok(found)
    }
}

/// Merge configuration of every named builder, sorted and deduplicated.
pub(crate) fn builder_configs<'a>(
    config: &'a MergerConfig,
    builder_names: &'a [String],
) -> Result<BTreeMap<&'a str, &'a BuilderMergeConfig>> {
    builder_names
        .iter()
        .map(|name| {
            config
                .builder(name)
                .map(|builder| (name.as_str(), builder))
                .ok_or_else(|| Error::UnknownBuilder(name.clone()))
        })
        .collect()
}
