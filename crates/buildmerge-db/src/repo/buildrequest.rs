//! Build request repository.

use async_trait::async_trait;
use buildmerge_core::{
    BuildRequest, BuildRequestId, Buildset, BuildsetId, MergeCandidate, NewBuildset, Priority,
    Properties, PropertyValue, RequestView, SourceStamp, SourceStampKey, SourceStampSetId,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

use crate::{DbError, DbResult};

/// Result of inserting a buildset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedBuildset {
    pub buildset_id: BuildsetId,
    /// Request created for each builder, merged or not.
    pub brids: BTreeMap<String, BuildRequestId>,
    /// Merges actually written. Targets found ineligible inside the
    /// transaction are missing here and their requests were written unmerged.
    pub merged: BTreeMap<String, BuildRequestId>,
}

#[async_trait]
pub trait BuildRequestRepo: Send + Sync {
    /// Walk the triggered-by relation up to the request that started the chain.
    async fn top_level_chain_id(&self, brid: BuildRequestId) -> DbResult<BuildRequestId>;

    /// Incomplete, unmerged requests for `builder_name` in the chain started by
    /// `start_brid`, ascending by id.
    async fn merge_targets_in_chain(
        &self,
        start_brid: BuildRequestId,
        builder_name: &str,
    ) -> DbResult<Vec<MergeCandidate>>;

    /// Incomplete, unmerged requests for `builder_name` at `priority` whose
    /// sourcestamps are exactly `sources`, ascending by id.
    async fn merge_targets_for_sources(
        &self,
        builder_name: &str,
        sources: &[SourceStampKey],
        priority: Priority,
        claimed_only: bool,
    ) -> DbResult<Vec<MergeCandidate>>;

    /// Properties of each buildset. Buildsets without properties map to an
    /// empty set.
    async fn buildsets_properties(
        &self,
        buildset_ids: &[BuildsetId],
    ) -> DbResult<HashMap<BuildsetId, Properties>>;

    async fn sourcestamps(&self, sourcestampset_id: SourceStampSetId) -> DbResult<Vec<SourceStamp>>;

    async fn buildsets(&self, buildset_ids: &[BuildsetId]) -> DbResult<Vec<Buildset>>;

    /// Requests by id, ascending. Unknown ids are skipped.
    async fn build_requests(&self, brids: &[BuildRequestId]) -> DbResult<Vec<BuildRequest>>;

    /// Atomically create a buildset and one request per builder, writing the
    /// merge target of each merged request as part of the insert.
    async fn insert_buildset(
        &self,
        buildset: &NewBuildset,
        merges: &BTreeMap<String, BuildRequestId>,
    ) -> DbResult<InsertedBuildset>;

    /// Full views of requests, ascending by id.
    async fn request_views(&self, brids: &[BuildRequestId]) -> DbResult<Vec<RequestView>> {
        let requests = self.build_requests(brids).await?;
        let buildset_ids: Vec<BuildsetId> = requests
            .iter()
            .map(|r| r.buildset_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let buildsets: HashMap<BuildsetId, Buildset> = self
            .buildsets(&buildset_ids)
            .await?
            .into_iter()
            .map(|bs| (bs.id, bs))
            .collect();

        let mut sources: HashMap<SourceStampSetId, Vec<SourceStamp>> = HashMap::new();
        for buildset in buildsets.values() {
            if !sources.contains_key(&buildset.sourcestampset_id) {
                let stamps = self.sourcestamps(buildset.sourcestampset_id).await?;
                sources.insert(buildset.sourcestampset_id, stamps);
            }
        }

        requests
            .into_iter()
            .map(|request| {
                let buildset = buildsets.get(&request.buildset_id).ok_or_else(|| {
                    DbError::NotFound(format!("buildset {}", request.buildset_id))
                })?;
                Ok(RequestView {
                    brid: Some(request.id),
                    buildset_id: Some(request.buildset_id),
                    builder_name: request.builder_name,
                    priority: request.priority,
                    reason: buildset.reason.clone(),
                    properties: buildset.properties.clone(),
                    sources: sources
                        .get(&buildset.sourcestampset_id)
                        .cloned()
                        .unwrap_or_default(),
                    claimed: request.claimed,
                    submitted_at: Some(request.submitted_at),
                })
            })
            .collect()
    }
}

/// Sorted keys of a sourcestamp set, the form sourcestamp scoping compares.
pub fn source_keys<'a>(stamps: impl IntoIterator<Item = &'a SourceStamp>) -> Vec<SourceStampKey> {
    let mut keys: Vec<_> = stamps.into_iter().map(SourceStamp::key).collect();
    keys.sort();
    keys
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRequestRow {
    id: i64,
    buildsetid: i64,
    buildername: String,
    priority: i32,
    complete: bool,
    claimed: bool,
    mergebrid: Option<i64>,
    triggeredbybrid: Option<i64>,
    startbrid: Option<i64>,
    submitted_at: DateTime<Utc>,
}

impl From<BuildRequestRow> for BuildRequest {
    fn from(row: BuildRequestRow) -> Self {
        BuildRequest {
            id: BuildRequestId::new(row.id),
            buildset_id: BuildsetId::new(row.buildsetid),
            builder_name: row.buildername,
            priority: Priority(row.priority),
            complete: row.complete,
            claimed: row.claimed,
            merge_target: row.mergebrid.map(BuildRequestId::new),
            triggered_by: row.triggeredbybrid.map(BuildRequestId::new),
            start_brid: row.startbrid.map(BuildRequestId::new),
            submitted_at: row.submitted_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CandidateRow {
    buildsetid: i64,
    id: i64,
    number: Option<i64>,
}

impl CandidateRow {
    fn candidate(&self) -> MergeCandidate {
        MergeCandidate {
            buildset_id: BuildsetId::new(self.buildsetid),
            brid: BuildRequestId::new(self.id),
            build_number: self.number,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SourceStampRow {
    sourcestampsetid: i64,
    codebase: String,
    branch: Option<String>,
    revision: Option<String>,
    repository: String,
}

impl From<SourceStampRow> for SourceStamp {
    fn from(row: SourceStampRow) -> Self {
        SourceStamp {
            codebase: row.codebase,
            branch: row.branch,
            revision: row.revision,
            repository: row.repository,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PropertyRow {
    buildsetid: i64,
    property_name: String,
    property_value: serde_json::Value,
}

#[derive(Debug, sqlx::FromRow)]
struct BuildsetRow {
    id: i64,
    sourcestampsetid: i64,
    reason: String,
    external_idstring: Option<String>,
    submitted_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct TargetStateRow {
    complete: bool,
    mergebrid: Option<i64>,
}

const BUILD_REQUEST_COLUMNS: &str = r#"
    br.id, br.buildsetid, br.buildername, br.priority, br.complete,
    (c.brid IS NOT NULL) AS claimed,
    br.mergebrid, br.triggeredbybrid, br.startbrid, br.submitted_at
"#;

/// Latest build number of each request, when one has started.
const LATEST_BUILD_JOIN: &str = r#"
    LEFT JOIN LATERAL (
        SELECT b.number FROM builds b WHERE b.brid = br.id ORDER BY b.number DESC LIMIT 1
    ) latest ON TRUE
"#;

/// PostgreSQL implementation of BuildRequestRepo.
pub struct PgBuildRequestRepo {
    pool: PgPool,
}

impl PgBuildRequestRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn properties_by_buildset(
        &self,
        buildset_ids: &[BuildsetId],
    ) -> DbResult<HashMap<BuildsetId, Properties>> {
        let ids: Vec<i64> = buildset_ids.iter().map(BuildsetId::get).collect();
        let rows = sqlx::query_as::<_, PropertyRow>(
            r#"
            SELECT buildsetid, property_name, property_value
            FROM buildset_properties
            WHERE buildsetid = ANY($1)
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<BuildsetId, Vec<(String, PropertyValue)>> = buildset_ids
            .iter()
            .map(|id| (*id, Vec::new()))
            .collect();
        for row in rows {
            let value: PropertyValue = serde_json::from_value(row.property_value).map_err(|e| {
                DbError::Decode(format!(
                    "property '{}' of buildset {}: {}",
                    row.property_name, row.buildsetid, e
                ))
            })?;
            grouped
                .entry(BuildsetId::new(row.buildsetid))
                .or_default()
                .push((row.property_name, value));
        }

        Ok(grouped
            .into_iter()
            .map(|(id, props)| (id, props.into_iter().collect()))
            .collect())
    }
}

#[async_trait]
impl BuildRequestRepo for PgBuildRequestRepo {
    async fn top_level_chain_id(&self, brid: BuildRequestId) -> DbResult<BuildRequestId> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE chain (id, triggeredbybrid) AS (
                SELECT id, triggeredbybrid FROM buildrequests WHERE id = $1
                UNION ALL
                SELECT br.id, br.triggeredbybrid
                FROM buildrequests br
                JOIN chain ON br.id = chain.triggeredbybrid
            )
            SELECT id FROM chain WHERE triggeredbybrid IS NULL
            "#,
        )
        .bind(brid.get())
        .fetch_optional(&self.pool)
        .await?;
        id.map(BuildRequestId::new)
            .ok_or_else(|| DbError::NotFound(format!("build request {}", brid)))
    }

    async fn merge_targets_in_chain(
        &self,
        start_brid: BuildRequestId,
        builder_name: &str,
    ) -> DbResult<Vec<MergeCandidate>> {
        let rows = sqlx::query_as::<_, CandidateRow>(&format!(
            r#"
            SELECT br.buildsetid, br.id, latest.number
            FROM buildrequests br
            {LATEST_BUILD_JOIN}
            WHERE (br.startbrid = $1 OR br.id = $1)
              AND br.buildername = $2
              AND br.complete = FALSE
              AND br.mergebrid IS NULL
            ORDER BY br.id ASC
            "#
        ))
        .bind(start_brid.get())
        .bind(builder_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(CandidateRow::candidate).collect())
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
        let codebases: Vec<&str> = sources.iter().map(|k| k.codebase.as_str()).collect();
        let branches: Vec<Option<&str>> = sources.iter().map(|k| k.branch.as_deref()).collect();
        let revisions: Vec<Option<&str>> = sources.iter().map(|k| k.revision.as_deref()).collect();

        // Same number of stamps, and every stamp of the candidate's set occurs
        // as often in the set as in the wanted tuples.
        let rows = sqlx::query_as::<_, CandidateRow>(&format!(
            r#"
            WITH wanted (codebase, branch, revision) AS (
                SELECT * FROM UNNEST($4::text[], $5::text[], $6::text[])
            )
            SELECT br.buildsetid, br.id, latest.number
            FROM buildrequests br
            JOIN buildsets bs ON bs.id = br.buildsetid
            LEFT JOIN buildrequest_claims c ON c.brid = br.id
            {LATEST_BUILD_JOIN}
            WHERE br.buildername = $1
              AND br.priority = $2
              AND br.complete = FALSE
              AND br.mergebrid IS NULL
              AND ($3 = FALSE OR c.brid IS NOT NULL)
              AND (
                  SELECT COUNT(*) FROM sourcestamps ss
                  WHERE ss.sourcestampsetid = bs.sourcestampsetid
              ) = cardinality($4::text[])
              AND NOT EXISTS (
                  SELECT 1 FROM sourcestamps ss
                  WHERE ss.sourcestampsetid = bs.sourcestampsetid
                    AND (
                        SELECT COUNT(*) FROM wanted w
                        WHERE w.codebase = ss.codebase
                          AND w.branch IS NOT DISTINCT FROM ss.branch
                          AND w.revision IS NOT DISTINCT FROM ss.revision
                    ) <> (
                        SELECT COUNT(*) FROM sourcestamps same
                        WHERE same.sourcestampsetid = ss.sourcestampsetid
                          AND same.codebase = ss.codebase
                          AND same.branch IS NOT DISTINCT FROM ss.branch
                          AND same.revision IS NOT DISTINCT FROM ss.revision
                    )
              )
            ORDER BY br.id ASC
            "#
        ))
        .bind(builder_name)
        .bind(priority.0)
        .bind(claimed_only)
        .bind(&codebases)
        .bind(&branches)
        .bind(&revisions)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(CandidateRow::candidate).collect())
    }

    async fn buildsets_properties(
        &self,
        buildset_ids: &[BuildsetId],
    ) -> DbResult<HashMap<BuildsetId, Properties>> {
        self.properties_by_buildset(buildset_ids).await
    }

    async fn sourcestamps(&self, sourcestampset_id: SourceStampSetId) -> DbResult<Vec<SourceStamp>> {
        let rows = sqlx::query_as::<_, SourceStampRow>(
            r#"
            SELECT sourcestampsetid, codebase, branch, revision, repository
            FROM sourcestamps
            WHERE sourcestampsetid = $1
            ORDER BY codebase, id
            "#,
        )
        .bind(sourcestampset_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SourceStamp::from).collect())
    }

    async fn buildsets(&self, buildset_ids: &[BuildsetId]) -> DbResult<Vec<Buildset>> {
        let ids: Vec<i64> = buildset_ids.iter().map(BuildsetId::get).collect();
        let rows = sqlx::query_as::<_, BuildsetRow>(
            r#"
            SELECT id, sourcestampsetid, reason, external_idstring, submitted_at
            FROM buildsets
            WHERE id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let found: Vec<BuildsetId> = rows.iter().map(|r| BuildsetId::new(r.id)).collect();
        let mut properties = self.properties_by_buildset(&found).await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id = BuildsetId::new(row.id);
                Buildset {
                    id,
                    sourcestampset_id: SourceStampSetId::new(row.sourcestampsetid),
                    reason: row.reason,
                    external_idstring: row.external_idstring,
                    properties: properties.remove(&id).unwrap_or_default(),
                    submitted_at: row.submitted_at,
                }
            })
            .collect())
    }

    async fn build_requests(&self, brids: &[BuildRequestId]) -> DbResult<Vec<BuildRequest>> {
        let ids: Vec<i64> = brids.iter().map(BuildRequestId::get).collect();
        let rows = sqlx::query_as::<_, BuildRequestRow>(&format!(
            r#"
            SELECT {BUILD_REQUEST_COLUMNS}
            FROM buildrequests br
            LEFT JOIN buildrequest_claims c ON c.brid = br.id
            WHERE br.id = ANY($1)
            ORDER BY br.id ASC
            "#
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BuildRequest::from).collect())
    }

    async fn insert_buildset(
        &self,
        buildset: &NewBuildset,
        merges: &BTreeMap<String, BuildRequestId>,
    ) -> DbResult<InsertedBuildset> {
        let mut tx = self.pool.begin().await?;

        // Lock merge targets in ascending id order and keep only those that
        // can still receive merges.
        let targets: BTreeSet<BuildRequestId> = merges.values().copied().collect();
        let mut eligible = BTreeSet::new();
        for target in &targets {
            let state = sqlx::query_as::<_, TargetStateRow>(
                "SELECT complete, mergebrid FROM buildrequests WHERE id = $1 FOR UPDATE",
            )
            .bind(target.get())
            .fetch_optional(&mut *tx)
            .await?;
            match state {
                Some(TargetStateRow {
                    complete: false,
                    mergebrid: None,
                }) => {
                    eligible.insert(*target);
                }
                _ => warn!(target_brid = %target, "Merge target no longer eligible"),
            }
        }

        let start_brid: Option<i64> = match buildset.triggered_by {
            Some(parent) => {
                let start: Option<i64> = sqlx::query_scalar(
                    "SELECT COALESCE(startbrid, id) FROM buildrequests WHERE id = $1",
                )
                .bind(parent.get())
                .fetch_optional(&mut *tx)
                .await?;
                Some(start.ok_or_else(|| DbError::NotFound(format!("build request {}", parent)))?)
            }
            None => None,
        };

        let buildset_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO buildsets (sourcestampsetid, reason, external_idstring, submitted_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id
            "#,
        )
        .bind(buildset.sourcestampset_id.get())
        .bind(&buildset.reason)
        .bind(&buildset.external_idstring)
        .fetch_one(&mut *tx)
        .await?;

        for (name, value) in buildset.properties.iter() {
            let encoded = serde_json::to_value(value)
                .map_err(|e| DbError::Decode(format!("property '{}': {}", name, e)))?;
            sqlx::query(
                r#"
                INSERT INTO buildset_properties (buildsetid, property_name, property_value)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(buildset_id)
            .bind(name)
            .bind(encoded)
            .execute(&mut *tx)
            .await?;
        }

        let mut brids = BTreeMap::new();
        let mut merged = BTreeMap::new();
        for builder_name in &buildset.builder_names {
            if brids.contains_key(builder_name) {
                return Err(DbError::Duplicate(format!("builder '{}'", builder_name)));
            }
            let merge_target = merges
                .get(builder_name)
                .filter(|target| eligible.contains(*target))
                .copied();

            let brid: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO buildrequests
                    (buildsetid, buildername, priority, submitted_at, triggeredbybrid, startbrid, mergebrid)
                VALUES ($1, $2, $3, NOW(), $4, $5, $6)
                RETURNING id
                "#,
            )
            .bind(buildset_id)
            .bind(builder_name)
            .bind(buildset.priority.0)
            .bind(buildset.triggered_by.map(|b| b.get()))
            .bind(start_brid)
            .bind(merge_target.map(|b| b.get()))
            .fetch_one(&mut *tx)
            .await?;

            brids.insert(builder_name.clone(), BuildRequestId::new(brid));
            if let Some(target) = merge_target {
                merged.insert(builder_name.clone(), target);
            }
        }

        tx.commit().await?;

        Ok(InsertedBuildset {
            buildset_id: BuildsetId::new(buildset_id),
            brids,
            merged,
        })
    }
}
