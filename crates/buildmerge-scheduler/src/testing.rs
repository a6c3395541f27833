//! Repositories and fixtures shared by the scheduler tests.

use async_trait::async_trait;
use buildmerge_core::{
    BuildRequest, BuildRequestId, Buildset, BuildsetId, MergeCandidate, NewBuildset, Priority,
    Properties, SourceStamp, SourceStampKey, SourceStampSetId,
};
use buildmerge_db::{BuildRequestRepo, DbError, DbResult, InsertedBuildset, MemoryBuildRequestRepo};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub fn stamp(revision: Option<&str>) -> SourceStamp {
    SourceStamp {
        codebase: "app".to_string(),
        branch: Some("main".to_string()),
        revision: revision.map(String::from),
        repository: "git@example.com:app.git".to_string(),
    }
}

/// Returns fixed candidates for every scope and answers request lookups
/// from a fixed list.
pub struct ScriptedRepo {
    candidates: Vec<MergeCandidate>,
    requests: Vec<BuildRequest>,
}

impl ScriptedRepo {
    pub fn new(candidates: Vec<MergeCandidate>, requests: Vec<BuildRequest>) -> Self {
        Self {
            candidates,
            requests,
        }
    }
}

#[async_trait]
impl BuildRequestRepo for ScriptedRepo {
    async fn top_level_chain_id(&self, brid: BuildRequestId) -> DbResult<BuildRequestId> {
        Ok(brid)
    }

    async fn merge_targets_in_chain(
        &self,
        _start_brid: BuildRequestId,
        _builder_name: &str,
    ) -> DbResult<Vec<MergeCandidate>> {
        Ok(self.candidates.clone())
    }

    async fn merge_targets_for_sources(
        &self,
        _builder_name: &str,
        _sources: &[SourceStampKey],
        _priority: Priority,
        _claimed_only: bool,
    ) -> DbResult<Vec<MergeCandidate>> {
        Ok(self.candidates.clone())
    }

    async fn buildsets_properties(
        &self,
        buildset_ids: &[BuildsetId],
    ) -> DbResult<HashMap<BuildsetId, Properties>> {
        Ok(buildset_ids.iter().map(|id| (*id, Properties::new())).collect())
    }

    async fn sourcestamps(&self, _sourcestampset_id: SourceStampSetId) -> DbResult<Vec<SourceStamp>> {
        Ok(Vec::new())
    }

    async fn buildsets(&self, _buildset_ids: &[BuildsetId]) -> DbResult<Vec<Buildset>> {
        Ok(Vec::new())
    }

    async fn build_requests(&self, brids: &[BuildRequestId]) -> DbResult<Vec<BuildRequest>> {
        let mut found: Vec<_> = self
            .requests
            .iter()
            .filter(|r| brids.contains(&r.id))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.id);
        Ok(found)
    }

    async fn insert_buildset(
        &self,
        _buildset: &NewBuildset,
        _merges: &BTreeMap<String, BuildRequestId>,
    ) -> DbResult<InsertedBuildset> {
        Err(DbError::NotFound("scripted repository is read-only".to_string()))
    }
}

/// In-memory repository with switchable failures and call counters.
#[derive(Default)]
pub struct FlakyRepo {
    pub inner: Arc<MemoryBuildRequestRepo>,
    pub fail_reads: AtomicBool,
    pub fail_inserts: AtomicBool,
    pub property_queries: AtomicUsize,
    pub chain_queries: AtomicUsize,
}

impl FlakyRepo {
    pub fn new(inner: Arc<MemoryBuildRequestRepo>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    fn check_read(&self) -> DbResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(pool_timeout());
        }
        Ok(())
    }
}

fn pool_timeout() -> DbError {
    DbError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl BuildRequestRepo for FlakyRepo {
    async fn top_level_chain_id(&self, brid: BuildRequestId) -> DbResult<BuildRequestId> {
        self.check_read()?;
        self.chain_queries.fetch_add(1, Ordering::SeqCst);
        self.inner.top_level_chain_id(brid).await
    }

    async fn merge_targets_in_chain(
        &self,
        start_brid: BuildRequestId,
        builder_name: &str,
    ) -> DbResult<Vec<MergeCandidate>> {
        self.check_read()?;
        self.inner.merge_targets_in_chain(start_brid, builder_name).await
    }

    async fn merge_targets_for_sources(
        &self,
        builder_name: &str,
        sources: &[SourceStampKey],
        priority: Priority,
        claimed_only: bool,
    ) -> DbResult<Vec<MergeCandidate>> {
        self.check_read()?;
        self.inner
            .merge_targets_for_sources(builder_name, sources, priority, claimed_only)
            .await
    }

    async fn buildsets_properties(
        &self,
        buildset_ids: &[BuildsetId],
    ) -> DbResult<HashMap<BuildsetId, Properties>> {
        self.check_read()?;
        self.property_queries.fetch_add(1, Ordering::SeqCst);
        self.inner.buildsets_properties(buildset_ids).await
    }

    async fn sourcestamps(&self, sourcestampset_id: SourceStampSetId) -> DbResult<Vec<SourceStamp>> {
        self.check_read()?;
        self.inner.sourcestamps(sourcestampset_id).await
    }

    async fn buildsets(&self, buildset_ids: &[BuildsetId]) -> DbResult<Vec<Buildset>> {
        self.check_read()?;
        self.inner.buildsets(buildset_ids).await
    }

    async fn build_requests(&self, brids: &[BuildRequestId]) -> DbResult<Vec<BuildRequest>> {
        self.check_read()?;
        self.inner.build_requests(brids).await
    }

    async fn insert_buildset(
        &self,
        buildset: &NewBuildset,
        merges: &BTreeMap<String, BuildRequestId>,
    ) -> DbResult<InsertedBuildset> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(pool_timeout());
        }
        self.inner.insert_buildset(buildset, merges).await
    }
}
