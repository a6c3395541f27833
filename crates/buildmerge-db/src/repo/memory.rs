//! In-memory build request repository for tests and dry runs.

use async_trait::async_trait;
use buildmerge_core::{
    BuildRequest, BuildRequestId, Buildset, BuildsetId, MergeCandidate, NewBuildset, Priority,
    Properties, SourceStamp, SourceStampKey, SourceStampSetId,
};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::buildrequest::{BuildRequestRepo, InsertedBuildset, source_keys};
use crate::{DbError, DbResult};

#[derive(Debug, Default)]
struct MemoryState {
    next_brid: i64,
    next_bsid: i64,
    next_ssid: i64,
    requests: BTreeMap<BuildRequestId, BuildRequest>,
    buildsets: BTreeMap<BuildsetId, Buildset>,
    sourcestamps: BTreeMap<SourceStampSetId, Vec<SourceStamp>>,
    build_numbers: HashMap<BuildRequestId, i64>,
}

/// Repository keeping everything in process memory.
///
/// Inserts are atomic with respect to every other call: all state lives
/// behind one mutex that is never held across an await.
#[derive(Debug, Default)]
pub struct MemoryBuildRequestRepo {
    state: Mutex<MemoryState>,
}

impl MemoryBuildRequestRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave partial rows behind:
        // every mutation is applied after all validation.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a sourcestamp set and return its id.
    pub fn add_sourcestamps(&self, stamps: Vec<SourceStamp>) -> SourceStampSetId {
        let mut state = self.state();
        state.next_ssid += 1;
        let id = SourceStampSetId::new(state.next_ssid);
        state.sourcestamps.insert(id, stamps);
        id
    }

    /// Mark a request as picked up by a worker running build `build_number`.
    pub fn claim(&self, brid: BuildRequestId, build_number: i64) -> DbResult<()> {
        let mut state = self.state();
        let request = state
            .requests
            .get_mut(&brid)
            .ok_or_else(|| DbError::NotFound(format!("build request {}", brid)))?;
        request.claimed = true;
        state.build_numbers.insert(brid, build_number);
        Ok(())
    }

    /// Mark a request as finished.
    pub fn complete(&self, brid: BuildRequestId) -> DbResult<()> {
        let mut state = self.state();
        let request = state
            .requests
            .get_mut(&brid)
            .ok_or_else(|| DbError::NotFound(format!("build request {}", brid)))?;
        request.complete = true;
        Ok(())
    }

    pub fn build_request(&self, brid: BuildRequestId) -> Option<BuildRequest> {
        self.state().requests.get(&brid).cloned()
    }

    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }

    pub fn buildset_count(&self) -> usize {
        self.state().buildsets.len()
    }

    fn candidate(state: &MemoryState, request: &BuildRequest) -> MergeCandidate {
        MergeCandidate {
            buildset_id: request.buildset_id,
            brid: request.id,
            build_number: state.build_numbers.get(&request.id).copied(),
        }
    }
}

#[async_trait]
impl BuildRequestRepo for MemoryBuildRequestRepo {
    async fn top_level_chain_id(&self, brid: BuildRequestId) -> DbResult<BuildRequestId> {
        let state = self.state();
        let mut current = state
            .requests
            .get(&brid)
            .ok_or_else(|| DbError::NotFound(format!("build request {}", brid)))?;
        while let Some(parent) = current.triggered_by {
            current = state
                .requests
                .get(&parent)
                .ok_or_else(|| DbError::NotFound(format!("build request {}", parent)))?;
        }
        Ok(current.id)
    }

    async fn merge_targets_in_chain(
        &self,
        start_brid: BuildRequestId,
        builder_name: &str,
    ) -> DbResult<Vec<MergeCandidate>> {
        let state = self.state();
        Ok(state
            .requests
            .values()
            .filter(|r| r.start_brid == Some(start_brid) || r.id == start_brid)
            .filter(|r| r.builder_name == builder_name && r.accepts_merges())
            .map(|r| Self::candidate(&state, r))
            .collect())
    }

    async fn merge_targets_for_sources(
        &self,
        builder_name: &str,
        sources: &[SourceStampKey],
        priority: Priority,
        claimed_only: bool,
    ) -> DbResult<Vec<MergeCandidate>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state();
        let mut wanted = sources.to_vec();
        wanted.sort();

        Ok(state
            .requests
            .values()
            .filter(|r| r.builder_name == builder_name && r.priority == priority)
            .filter(|r| r.accepts_merges() && (!claimed_only || r.claimed))
            .filter(|r| {
                state
                    .buildsets
                    .get(&r.buildset_id)
                    .and_then(|bs| state.sourcestamps.get(&bs.sourcestampset_id))
                    .map(|stamps| source_keys(stamps) == wanted)
                    .unwrap_or(false)
            })
            .map(|r| Self::candidate(&state, r))
            .collect())
    }

    async fn buildsets_properties(
        &self,
        buildset_ids: &[BuildsetId],
    ) -> DbResult<HashMap<BuildsetId, Properties>> {
        let state = self.state();
        Ok(buildset_ids
            .iter()
            .map(|id| {
                let properties = state
                    .buildsets
                    .get(id)
                    .map(|bs| bs.properties.clone())
                    .unwrap_or_default();
                (*id, properties)
            })
            .collect())
    }

    async fn sourcestamps(&self, sourcestampset_id: SourceStampSetId) -> DbResult<Vec<SourceStamp>> {
        Ok(self
            .state()
            .sourcestamps
            .get(&sourcestampset_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn buildsets(&self, buildset_ids: &[BuildsetId]) -> DbResult<Vec<Buildset>> {
        let state = self.state();
        let wanted: BTreeSet<_> = buildset_ids.iter().collect();
        Ok(wanted
            .into_iter()
            .filter_map(|id| state.buildsets.get(id).cloned())
            .collect())
    }

    async fn build_requests(&self, brids: &[BuildRequestId]) -> DbResult<Vec<BuildRequest>> {
        let state = self.state();
        let wanted: BTreeSet<_> = brids.iter().collect();
        Ok(wanted
            .into_iter()
            .filter_map(|id| state.requests.get(id).cloned())
            .collect())
    }

    async fn insert_buildset(
        &self,
        buildset: &NewBuildset,
        merges: &BTreeMap<String, BuildRequestId>,
    ) -> DbResult<InsertedBuildset> {
        let mut state = self.state();

        let unique: BTreeSet<&String> = buildset.builder_names.iter().collect();
        if unique.len() != buildset.builder_names.len() {
            return Err(DbError::Duplicate("builder name in buildset".to_string()));
        }

        let start_brid = match buildset.triggered_by {
            Some(parent) => {
                let parent = state
                    .requests
                    .get(&parent)
                    .ok_or_else(|| DbError::NotFound(format!("build request {}", parent)))?;
                Some(parent.start_brid.unwrap_or(parent.id))
            }
            None => None,
        };

        let eligible: BTreeSet<BuildRequestId> = merges
            .values()
            .filter(|target| {
                state
                    .requests
                    .get(*target)
                    .map(BuildRequest::accepts_merges)
                    .unwrap_or(false)
            })
            .copied()
            .collect();

        let now = Utc::now();
        state.next_bsid += 1;
        let buildset_id = BuildsetId::new(state.next_bsid);
        state.buildsets.insert(
            buildset_id,
            Buildset {
                id: buildset_id,
                sourcestampset_id: buildset.sourcestampset_id,
                reason: buildset.reason.clone(),
                external_idstring: buildset.external_idstring.clone(),
                properties: buildset.properties.clone(),
                submitted_at: now,
            },
        );

        let mut brids = BTreeMap::new();
        let mut merged = BTreeMap::new();
        for builder_name in &buildset.builder_names {
            let merge_target = merges
                .get(builder_name)
                .filter(|target| eligible.contains(*target))
                .copied();

            state.next_brid += 1;
            let brid = BuildRequestId::new(state.next_brid);
            state.requests.insert(
                brid,
                BuildRequest {
                    id: brid,
                    buildset_id,
                    builder_name: builder_name.clone(),
                    priority: buildset.priority,
                    complete: false,
                    claimed: false,
                    merge_target,
                    triggered_by: buildset.triggered_by,
                    start_brid,
                    submitted_at: now,
                },
            );

            brids.insert(builder_name.clone(), brid);
            if let Some(target) = merge_target {
                merged.insert(builder_name.clone(), target);
            }
        }

        Ok(InsertedBuildset {
            buildset_id,
            brids,
            merged,
        })
    }
}
