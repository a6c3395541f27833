//! Candidate lookup for merges.

use buildmerge_core::{BuildRequestId, MergeCandidate, Priority, Result, SourceStampKey};
use buildmerge_db::BuildRequestRepo;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Which existing requests are searched for merge candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateScope {
    /// Requests in the chain started by `start_brid`.
    Chain { start_brid: BuildRequestId },
    /// Requests building exactly `sources` at `priority`.
    ///
    /// Matching is exact on (codebase, branch, revision): a request that only
    /// named a branch will not match one whose branch tip was resolved to a
    /// revision, and gets a fresh build.
    SourceStamps {
        sources: Vec<SourceStampKey>,
        priority: Priority,
        /// Only requests already running are candidates.
        claimed_only: bool,
    },
}

/// Finds requests that are structurally able to receive a merge.
#[derive(Clone)]
pub struct CandidateFinder {
    repo: Arc<dyn BuildRequestRepo>,
}

impl CandidateFinder {
    pub fn new(repo: Arc<dyn BuildRequestRepo>) -> Self {
        Self { repo }
    }

    /// Candidates for `builder_name` within `scope`, ascending by request id.
    ///
    /// Whatever the store returns, requests for other builders, completed
    /// requests and requests that were themselves merged are dropped.
    pub async fn find(&self, builder_name: &str, scope: &CandidateScope) -> Result<Vec<MergeCandidate>> {
        let found = match scope {
            CandidateScope::Chain { start_brid } => {
                self.repo.merge_targets_in_chain(*start_brid, builder_name).await?
            }
            CandidateScope::SourceStamps {
                sources,
                priority,
                claimed_only,
            } => {
                self.repo
                    .merge_targets_for_sources(builder_name, sources, *priority, *claimed_only)
                    .await?
            }
        };

        if found.is_empty() {
            return Ok(found);
        }

        let by_id: BTreeMap<BuildRequestId, MergeCandidate> =
            found.into_iter().map(|c| (c.brid, c)).collect();
        let ids: Vec<BuildRequestId> = by_id.keys().copied().collect();
        let requests: HashMap<_, _> = self
            .repo
            .build_requests(&ids)
            .await?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let claimed_only = matches!(
            scope,
            CandidateScope::SourceStamps {
                claimed_only: true,
                ..
            }
        );
        let candidates: Vec<MergeCandidate> = by_id
            .into_values()
            .filter(|c| {
                requests.get(&c.brid).is_some_and(|r| {
                    r.builder_name == builder_name
                        && r.accepts_merges()
                        && (!claimed_only || r.claimed)
                })
            })
            .collect();

        debug!(
            builder = %builder_name,
            candidates = candidates.len(),
            "Found merge candidates"
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedRepo, stamp};
    use buildmerge_core::{BuildRequest, BuildsetId, NewBuildset};
    use buildmerge_db::MemoryBuildRequestRepo;
    use chrono::Utc;
    use std::collections::BTreeMap as Map;

    fn request(id: i64, builder: &str, complete: bool, merge_target: Option<i64>) -> BuildRequest {
        BuildRequest {
            id: BuildRequestId::new(id),
            buildset_id: BuildsetId::new(id),
            builder_name: builder.to_string(),
            priority: Priority::default(),
            complete,
            claimed: false,
            merge_target: merge_target.map(BuildRequestId::new),
            triggered_by: None,
            start_brid: None,
            submitted_at: Utc::now(),
        }
    }

    fn candidate(id: i64) -> MergeCandidate {
        MergeCandidate {
            buildset_id: BuildsetId::new(id),
            brid: BuildRequestId::new(id),
            build_number: None,
        }
    }

    #[tokio::test]
    async fn test_filters_and_orders_whatever_the_store_returns() {
        let repo = ScriptedRepo::new(
            vec![candidate(15), candidate(11), candidate(13), candidate(12), candidate(11)],
            vec![
                request(11, "build-a", false, None),
                request(12, "build-b", false, None),
                request(13, "build-a", false, Some(11)),
                request(15, "build-a", false, None),
            ],
        );
        let finder = CandidateFinder::new(Arc::new(repo));

        let found = finder
            .find(
                "build-a",
                &CandidateScope::Chain {
                    start_brid: BuildRequestId::new(10),
                },
            )
            .await
            .unwrap();
        let ids: Vec<i64> = found.iter().map(|c| c.brid.get()).collect();
        assert_eq!(ids, vec![11, 15]);
    }

    #[tokio::test]
    async fn test_completed_requests_are_not_candidates() {
        let repo = ScriptedRepo::new(
            vec![candidate(11), candidate(12)],
            vec![request(11, "build-a", true, None), request(12, "build-a", false, None)],
        );
        let finder = CandidateFinder::new(Arc::new(repo));
        let found = finder
            .find(
                "build-a",
                &CandidateScope::Chain {
                    start_brid: BuildRequestId::new(10),
                },
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].brid, BuildRequestId::new(12));
    }

    #[tokio::test]
    async fn test_sourcestamp_scope_claimed_only() {
        let repo = Arc::new(MemoryBuildRequestRepo::new());
        let ssid = repo.add_sourcestamps(vec![stamp(Some("abc"))]);
        let pending = repo
            .insert_buildset(&NewBuildset::new(ssid, "x").with_builders(["build-a"]), &Map::new())
            .await
            .unwrap()
            .brids["build-a"];
        let running = repo
            .insert_buildset(&NewBuildset::new(ssid, "x").with_builders(["build-a"]), &Map::new())
            .await
            .unwrap()
            .brids["build-a"];
        repo.claim(running, 3).unwrap();

        let finder = CandidateFinder::new(repo.clone());
        let scope = |claimed_only| CandidateScope::SourceStamps {
            sources: vec![stamp(Some("abc")).key()],
            priority: Priority::default(),
            claimed_only,
        };

        let claimed = finder.find("build-a", &scope(true)).await.unwrap();
        assert_eq!(claimed.iter().map(|c| c.brid).collect::<Vec<_>>(), vec![running]);
        assert_eq!(claimed[0].build_number, Some(3));

        let all = finder.find("build-a", &scope(false)).await.unwrap();
        assert_eq!(all.iter().map(|c| c.brid).collect::<Vec<_>>(), vec![pending, running]);

        let other_priority = CandidateScope::SourceStamps {
            sources: vec![stamp(Some("abc")).key()],
            priority: Priority(5),
            claimed_only: false,
        };
        assert!(finder.find("build-a", &other_priority).await.unwrap().is_empty());
    }
}
