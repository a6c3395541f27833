//! Commit coordinator - writes a resolved buildset under per-target locks.

use buildmerge_core::{BuildRequest, BuildRequestId, BuildsetId, NewBuildset, Result};
use buildmerge_db::BuildRequestRepo;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::locks::{RequestLockGuard, RequestLocks};
use crate::resolver::Resolution;

/// What the store ended up with for one buildset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub buildset_id: BuildsetId,
    /// Request created for each builder.
    pub brids: BTreeMap<String, BuildRequestId>,
    /// Effective merge target for each builder.
    pub merges: BTreeMap<String, Option<BuildRequestId>>,
    /// Builders whose resolved target became ineligible before the write.
    pub fallbacks: Vec<String>,
}

/// Inserts buildsets while holding an exclusive lock on every merge target.
pub struct CommitCoordinator {
    repo: Arc<dyn BuildRequestRepo>,
    locks: RequestLocks,
}

impl CommitCoordinator {
    pub fn new(repo: Arc<dyn BuildRequestRepo>) -> Self {
        Self {
            repo,
            locks: RequestLocks::new(),
        }
    }

    pub fn locks(&self) -> &RequestLocks {
        &self.locks
    }

    /// Insert `buildset` with the merges in `resolution`.
    ///
    /// `held` is a lock the caller already owns from this coordinator's table;
    /// it is not taken again. All locks taken here are released when this
    /// returns or is dropped.
    pub async fn commit(
        &self,
        buildset: &NewBuildset,
        resolution: &Resolution,
        held: Option<&RequestLockGuard>,
    ) -> Result<Committed> {
        let wanted = resolution.merges();
        let held_brid = held.map(RequestLockGuard::brid);

        let _guards = self
            .locks
            .lock_all(wanted.values().copied().filter(|brid| Some(*brid) != held_brid))
            .await;

        let merges = self.revalidate(&wanted).await?;
        let inserted = self.repo.insert_buildset(buildset, &merges).await?;

        let mut fallbacks = Vec::new();
        for (builder_name, target) in &wanted {
            if inserted.merged.get(builder_name) != Some(target) {
                warn!(
                    builder = %builder_name,
                    target = %target,
                    "Merge target no longer accepts merges, scheduling a fresh build"
                );
                fallbacks.push(builder_name.clone());
            }
        }

        let merges = inserted
            .brids
            .keys()
            .map(|name| (name.clone(), inserted.merged.get(name).copied()))
            .collect();

        debug!(buildset_id = %inserted.buildset_id, "Committed buildset");
        Ok(Committed {
            buildset_id: inserted.buildset_id,
            brids: inserted.brids,
            merges,
            fallbacks,
        })
    }

    /// Drop targets that were completed or merged while we waited for their lock.
    async fn revalidate(
        &self,
        wanted: &BTreeMap<String, BuildRequestId>,
    ) -> Result<BTreeMap<String, BuildRequestId>> {
        if wanted.is_empty() {
            return Ok(BTreeMap::new());
        }

        let targets: Vec<BuildRequestId> = wanted
            .values()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let eligible: BTreeSet<BuildRequestId> = self
            .repo
            .build_requests(&targets)
            .await?
            .into_iter()
            .filter(BuildRequest::accepts_merges)
            .map(|request| request.id)
            .collect();

        Ok(wanted
            .iter()
            .filter(|(_, target)| eligible.contains(*target))
            .map(|(name, target)| (name.clone(), *target))
            .collect())
    }
}
