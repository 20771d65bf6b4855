use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventPayload};
use crate::ids::*;
use crate::store::*;
use crate::types::*;
use crate::workqueue::{WorkItem, WorkItemState};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// PostgreSQL-backed implementation of [`Store`]. Row locks are real
/// `SELECT … FOR UPDATE` locks; optimistic concurrency is enforced with
/// `WHERE etag = $old` guards on every update.
pub struct PostgresStore {
    pool: PgPool,
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

enum Conn<'a> {
    Tx(&'a mut PgConnection),
    Pool(sqlx::pool::PoolConnection<Postgres>),
}

impl Conn<'_> {
    fn as_exec(&mut self) -> &mut PgConnection {
        match self {
            Conn::Tx(c) => &mut **c,
            Conn::Pool(c) => &mut **c,
        }
    }
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::internal(format!("migrations: {e}")))?;
        Ok(())
    }

    async fn conn<'a>(&self, tx: Option<&'a mut Tx>) -> Result<Conn<'a>> {
        match tx {
            Some(t) => {
                let pg: &'a mut PgTx = t.downcast_mut()?;
                Ok(Conn::Tx(&mut *pg.tx))
            }
            None => Ok(Conn::Pool(self.pool.acquire().await.map_err(Error::from)?)),
        }
    }
}

// ─── Column codecs ────────────────────────────────────────────

fn enum_str<T: Serialize>(v: &T) -> Result<String> {
    match serde_json::to_value(v)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(Error::internal(format!(
            "enum did not serialize to a string: {other}"
        ))),
    }
}

fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| Error::internal(format!("bad enum value {s:?}: {e}")))
}

fn json<T: Serialize>(v: &T) -> Result<serde_json::Value> {
    serde_json::to_value(v).map_err(Error::from)
}

fn from_json<T: DeserializeOwned>(v: serde_json::Value) -> Result<T> {
    serde_json::from_value(v).map_err(Error::from)
}

fn opt_enum_str<T: Serialize>(v: &Option<T>) -> Result<Option<String>> {
    v.as_ref().map(enum_str).transpose()
}

fn opt_enum_from_str<T: DeserializeOwned>(s: Option<String>) -> Result<Option<T>> {
    s.as_deref().map(enum_from_str).transpose()
}

// ─── Row decoders ─────────────────────────────────────────────

fn build_from_row(row: &PgRow) -> Result<Build> {
    Ok(Build {
        id: BuildId(row.try_get("id")?),
        repo_id: RepoId(row.try_get("repo_id")?),
        commit_id: CommitId(row.try_get("commit_id")?),
        git_ref: row.try_get("git_ref")?,
        build_number: row.try_get::<i64, _>("build_number")? as u64,
        status: enum_from_str(row.try_get::<String, _>("status")?.as_str())?,
        timings: from_json(row.try_get("timings")?)?,
        error: row.try_get("error")?,
        opts: from_json(row.try_get("opts")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
        etag: Etag::from_str_unchecked(row.try_get::<String, _>("etag")?),
    })
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    Ok(Job {
        id: JobId(row.try_get("id")?),
        build_id: BuildId(row.try_get("build_id")?),
        repo_id: RepoId(row.try_get("repo_id")?),
        commit_id: CommitId(row.try_get("commit_id")?),
        git_ref: row.try_get("git_ref")?,
        workflow: row.try_get("workflow")?,
        name: ResourceName::new(row.try_get::<String, _>("name")?)?,
        job_type: enum_from_str(row.try_get::<String, _>("job_type")?.as_str())?,
        docker: row
            .try_get::<Option<serde_json::Value>, _>("docker")?
            .map(from_json)
            .transpose()?,
        runs_on: from_json(row.try_get("job_runs_on")?)?,
        depends: from_json(row.try_get("job_depends")?)?,
        services: from_json(row.try_get("job_services")?)?,
        environment: from_json(row.try_get("job_environment")?)?,
        step_execution: enum_from_str(row.try_get::<String, _>("step_execution")?.as_str())?,
        artifact_definitions: from_json(row.try_get("artifact_definitions")?)?,
        fingerprint_commands: from_json(row.try_get("fingerprint_commands")?)?,
        fingerprint: row.try_get("fingerprint")?,
        fingerprint_hash_type: opt_enum_from_str(row.try_get("fingerprint_hash_type")?)?,
        indirect_to_job_id: row
            .try_get::<Option<Uuid>, _>("indirect_to_job_id")?
            .map(JobId),
        definition_hash: row.try_get("definition_hash")?,
        runner_id: row.try_get::<Option<Uuid>, _>("runner_id")?.map(RunnerId),
        status: enum_from_str(row.try_get::<String, _>("status")?.as_str())?,
        timings: from_json(row.try_get("timings")?)?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
        etag: Etag::from_str_unchecked(row.try_get::<String, _>("etag")?),
    })
}

fn step_from_row(row: &PgRow) -> Result<Step> {
    Ok(Step {
        id: StepId(row.try_get("id")?),
        job_id: JobId(row.try_get("job_id")?),
        repo_id: RepoId(row.try_get("repo_id")?),
        name: ResourceName::new(row.try_get::<String, _>("name")?)?,
        log_descriptor_id: LogDescriptorId(row.try_get("log_descriptor_id")?),
        commands: from_json(row.try_get("step_commands")?)?,
        depends: from_json(row.try_get("step_depends")?)?,
        status: enum_from_str(row.try_get::<String, _>("status")?.as_str())?,
        timings: from_json(row.try_get("timings")?)?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        etag: Etag::from_str_unchecked(row.try_get::<String, _>("etag")?),
    })
}

fn artifact_from_row(row: &PgRow) -> Result<Artifact> {
    Ok(Artifact {
        id: ArtifactId(row.try_get("id")?),
        job_id: JobId(row.try_get("job_id")?),
        group_name: ResourceName::new(row.try_get::<String, _>("group_name")?)?,
        relative_path: row.try_get("relative_path")?,
        hash: row.try_get("hash")?,
        hash_type: opt_enum_from_str(row.try_get("hash_type")?)?,
        size: row.try_get::<Option<i64>, _>("size")?.map(|s| s as u64),
        mime: row.try_get("mime")?,
        sealed: row.try_get("sealed")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        etag: Etag::from_str_unchecked(row.try_get::<String, _>("etag")?),
    })
}

fn commit_from_row(row: &PgRow) -> Result<Commit> {
    Ok(Commit {
        id: CommitId(row.try_get("id")?),
        repo_id: RepoId(row.try_get("repo_id")?),
        sha: row.try_get("sha")?,
        message: row.try_get("message")?,
        author_id: row
            .try_get::<Option<Uuid>, _>("author_id")?
            .map(LegalEntityId),
        author_name: row.try_get("author_name")?,
        author_email: row.try_get("author_email")?,
        committer_id: row
            .try_get::<Option<Uuid>, _>("committer_id")?
            .map(LegalEntityId),
        committer_name: row.try_get("committer_name")?,
        committer_email: row.try_get("committer_email")?,
        config: row.try_get("config")?,
        config_type: enum_from_str(row.try_get::<String, _>("config_type")?.as_str())?,
        link: row.try_get("link")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        etag: Etag::from_str_unchecked(row.try_get::<String, _>("etag")?),
    })
}

fn legal_entity_from_row(row: &PgRow) -> Result<LegalEntity> {
    Ok(LegalEntity {
        id: LegalEntityId(row.try_get("id")?),
        name: ResourceName::new(row.try_get::<String, _>("name")?)?,
        kind: enum_from_str(row.try_get::<String, _>("kind")?.as_str())?,
        external_id: ExternalResourceId::new(
            row.try_get::<String, _>("external_system")?,
            row.try_get::<String, _>("external_id")?,
        ),
        email: row.try_get("email")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        etag: Etag::from_str_unchecked(row.try_get::<String, _>("etag")?),
    })
}

fn repo_from_row(row: &PgRow) -> Result<Repo> {
    Ok(Repo {
        id: RepoId(row.try_get("id")?),
        legal_entity_id: LegalEntityId(row.try_get("legal_entity_id")?),
        name: ResourceName::new(row.try_get::<String, _>("name")?)?,
        external_id: ExternalResourceId::new(
            row.try_get::<String, _>("external_system")?,
            row.try_get::<String, _>("external_id")?,
        ),
        default_branch: row.try_get("default_branch")?,
        link: row.try_get("link")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
        etag: Etag::from_str_unchecked(row.try_get::<String, _>("etag")?),
    })
}

fn group_from_row(row: &PgRow) -> Result<Group> {
    let system: Option<String> = row.try_get("external_system")?;
    let id: Option<String> = row.try_get("external_id")?;
    Ok(Group {
        id: GroupId(row.try_get("id")?),
        legal_entity_id: LegalEntityId(row.try_get("legal_entity_id")?),
        name: ResourceName::new(row.try_get::<String, _>("name")?)?,
        external_id: match (system, id) {
            (Some(s), Some(i)) => Some(ExternalResourceId::new(s, i)),
            _ => None,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        etag: Etag::from_str_unchecked(row.try_get::<String, _>("etag")?),
    })
}

fn runner_from_row(row: &PgRow) -> Result<Runner> {
    Ok(Runner {
        id: RunnerId(row.try_get("id")?),
        legal_entity_id: LegalEntityId(row.try_get("legal_entity_id")?),
        name: ResourceName::new(row.try_get::<String, _>("name")?)?,
        labels: from_json(row.try_get("labels")?)?,
        job_types: from_json(row.try_get("job_types")?)?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
        etag: Etag::from_str_unchecked(row.try_get::<String, _>("etag")?),
    })
}

fn work_item_from_row(row: &PgRow) -> Result<WorkItem> {
    Ok(WorkItem {
        id: WorkItemId(row.try_get("id")?),
        item_type: row.try_get("item_type")?,
        data: row.try_get("data")?,
        concurrency_key: row.try_get("concurrency_key")?,
        state_id: WorkItemStateId(row.try_get("state_id")?),
        status: row.try_get("status")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        etag: Etag::from_str_unchecked(row.try_get::<String, _>("etag")?),
    })
}

fn work_item_state_from_row(row: &PgRow) -> Result<WorkItemState> {
    Ok(WorkItemState {
        id: WorkItemStateId(row.try_get("id")?),
        concurrency_key: row.try_get("concurrency_key")?,
        attempts_so_far: row.try_get::<i32, _>("attempts_so_far")? as u32,
        not_before: row.try_get("not_before")?,
        allocated_to: row.try_get("allocated_to")?,
        allocated_at: row.try_get("allocated_at")?,
        allocated_until: row.try_get("allocated_until")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        etag: Etag::from_str_unchecked(row.try_get::<String, _>("etag")?),
    })
}

fn event_from_row(row: &PgRow) -> Result<Event> {
    let kind: EventKind = enum_from_str(row.try_get::<String, _>("kind")?.as_str())?;
    let payload: EventPayload = from_json(row.try_get("payload")?)?;
    Ok(Event {
        build_id: BuildId(row.try_get("build_id")?),
        seq: row.try_get::<i64, _>("seq")? as u64,
        kind,
        resource_id: row.try_get("resource_id")?,
        workflow: row.try_get("workflow")?,
        job_name: row.try_get("job_name")?,
        resource_name: row.try_get("resource_name")?,
        payload,
        created_at: row.try_get("created_at")?,
    })
}

fn dependency_from_row(row: &PgRow) -> Result<JobDependencyRow> {
    Ok(JobDependencyRow {
        build_id: BuildId(row.try_get("build_id")?),
        source_job_id: JobId(row.try_get("source_job_id")?),
        workflow: row.try_get("workflow")?,
        job_name: ResourceName::new(row.try_get::<String, _>("job_name")?)?,
        target_job_id: row
            .try_get::<Option<Uuid>, _>("target_job_id")?
            .map(JobId),
        created_at: row.try_get("created_at")?,
    })
}

const JOB_COLUMNS: &str = "id, build_id, repo_id, commit_id, git_ref, workflow, name, job_type, \
     docker, job_runs_on, job_depends, job_services, job_environment, step_execution, \
     artifact_definitions, fingerprint_commands, fingerprint, fingerprint_hash_type, \
     indirect_to_job_id, definition_hash, runner_id, status, timings, error, \
     created_at, updated_at, deleted_at, etag";

#[async_trait]
impl Store for PostgresStore {
    // ── Transactions ──

    async fn begin(&self) -> Result<Tx> {
        let tx = self.pool.begin().await.map_err(Error::from)?;
        Ok(Tx::new(Box::new(PgTx { tx })))
    }

    async fn commit(&self, tx: Tx) -> Result<()> {
        let pg = tx
            .into_inner()
            .downcast::<PgTx>()
            .map_err(|_| Error::internal("transaction belongs to a different store backend"))?;
        pg.tx.commit().await.map_err(Error::from)
    }

    async fn rollback(&self, tx: Tx) -> Result<()> {
        let pg = tx
            .into_inner()
            .downcast::<PgTx>()
            .map_err(|_| Error::internal("transaction belongs to a different store backend"))?;
        pg.tx.rollback().await.map_err(Error::from)
    }

    async fn lock_row_for_update(&self, tx: &mut Tx, resource_id: &str) -> Result<()> {
        let (kind, raw) = resource_id
            .split_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("malformed id: {resource_id:?}")))?;
        let table = match kind {
            "build" => "builds",
            "commit" => "commits",
            "runner" => "runners",
            "work-item-state" => "work_item_states",
            other => {
                return Err(Error::InvalidArgument(format!(
                    "row locks are not supported for {other} resources"
                )))
            }
        };
        let uuid = Uuid::parse_str(raw)
            .map_err(|e| Error::InvalidArgument(format!("malformed id {resource_id:?}: {e}")))?;
        let mut conn = self.conn(Some(tx)).await?;
        sqlx::query(&format!("SELECT id FROM {table} WHERE id = $1 FOR UPDATE"))
            .bind(uuid)
            .fetch_optional(conn.as_exec())
            .await?
            .ok_or_else(|| Error::not_found(resource_id.to_string()))?;
        Ok(())
    }

    // ── Builds ──

    async fn create_build(&self, tx: Option<&mut Tx>, build: &Build) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        sqlx::query(
            "INSERT INTO builds (id, repo_id, commit_id, git_ref, build_number, status, timings, \
             error, opts, created_at, updated_at, deleted_at, etag) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(build.id.0)
        .bind(build.repo_id.0)
        .bind(build.commit_id.0)
        .bind(&build.git_ref)
        .bind(build.build_number as i64)
        .bind(enum_str(&build.status)?)
        .bind(json(&build.timings)?)
        .bind(&build.error)
        .bind(json(&build.opts)?)
        .bind(build.created_at)
        .bind(build.updated_at)
        .bind(build.deleted_at)
        .bind(build.etag.as_str())
        .execute(conn.as_exec())
        .await?;
        Ok(())
    }

    async fn build(&self, tx: Option<&mut Tx>, id: BuildId) -> Result<Build> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query("SELECT * FROM builds WHERE id = $1 AND deleted_at IS NULL")
            .bind(id.0)
            .fetch_optional(conn.as_exec())
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        build_from_row(&row)
    }

    async fn update_build(&self, tx: Option<&mut Tx>, build: &Build) -> Result<Build> {
        let mut conn = self.conn(tx).await?;
        let new_etag = Etag::mint();
        let row = sqlx::query(
            "UPDATE builds SET status = $3, timings = $4, error = $5, opts = $6, \
             updated_at = $7, etag = $8 \
             WHERE id = $1 AND etag = $2 AND deleted_at IS NULL RETURNING *",
        )
        .bind(build.id.0)
        .bind(build.etag.as_str())
        .bind(enum_str(&build.status)?)
        .bind(json(&build.timings)?)
        .bind(&build.error)
        .bind(json(&build.opts)?)
        .bind(now())
        .bind(new_etag.as_str())
        .fetch_optional(conn.as_exec())
        .await?;
        match row {
            Some(row) => build_from_row(&row),
            None => Err(stale_or_missing(conn, "builds", build.id.0, "build").await),
        }
    }

    async fn soft_delete_build(&self, tx: Option<&mut Tx>, id: BuildId) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        let result = sqlx::query(
            "UPDATE builds SET deleted_at = $2, updated_at = $2, etag = $3 \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.0)
        .bind(now())
        .bind(Etag::mint().as_str())
        .execute(conn.as_exec())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(id.to_string()));
        }
        Ok(())
    }

    async fn hard_delete_build(&self, tx: Option<&mut Tx>, id: BuildId) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        sqlx::query("DELETE FROM events WHERE build_id = $1")
            .bind(id.0)
            .execute(conn.as_exec())
            .await?;
        sqlx::query("DELETE FROM event_counters WHERE build_id = $1")
            .bind(id.0)
            .execute(conn.as_exec())
            .await?;
        sqlx::query("DELETE FROM builds WHERE id = $1")
            .bind(id.0)
            .execute(conn.as_exec())
            .await?;
        Ok(())
    }

    async fn next_build_number(&self, tx: &mut Tx, repo_id: RepoId) -> Result<u64> {
        let mut conn = self.conn(Some(tx)).await?;
        let row = sqlx::query(
            "INSERT INTO build_numbers (repo_id, n) VALUES ($1, 1) \
             ON CONFLICT (repo_id) DO UPDATE SET n = build_numbers.n + 1 RETURNING n",
        )
        .bind(repo_id.0)
        .fetch_one(conn.as_exec())
        .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn builds_for_commit(
        &self,
        tx: Option<&mut Tx>,
        commit_id: CommitId,
        git_ref: &str,
        exclude_statuses: &[WorkflowStatus],
    ) -> Result<Vec<Build>> {
        let excluded: Vec<String> = exclude_statuses
            .iter()
            .map(enum_str)
            .collect::<Result<_>>()?;
        let mut conn = self.conn(tx).await?;
        let rows = sqlx::query(
            "SELECT * FROM builds WHERE deleted_at IS NULL AND commit_id = $1 \
             AND git_ref = $2 AND status <> ALL($3) ORDER BY created_at, id",
        )
        .bind(commit_id.0)
        .bind(git_ref)
        .bind(&excluded)
        .fetch_all(conn.as_exec())
        .await?;
        rows.iter().map(build_from_row).collect()
    }

    async fn search_builds(
        &self,
        tx: Option<&mut Tx>,
        search: &BuildSearch,
    ) -> Result<Page<Build>> {
        let excluded: Vec<String> = search
            .exclude_statuses
            .iter()
            .map(enum_str)
            .collect::<Result<_>>()?;
        let limit = search.limit.clamp(1, 500) as i64;
        let (marker, forward) = match &search.cursor {
            None => (None, true),
            Some(cursor) => (
                Some(BuildId::parse(&cursor.marker)?.0),
                cursor.direction == CursorDirection::Next,
            ),
        };

        let sql = if forward {
            "SELECT * FROM builds WHERE deleted_at IS NULL \
             AND ($1::uuid IS NULL OR repo_id = $1) \
             AND ($2::uuid IS NULL OR commit_id = $2) \
             AND ($3::text IS NULL OR git_ref = $3) \
             AND status <> ALL($4) \
             AND ($5::uuid IS NULL OR id > $5) \
             ORDER BY id LIMIT $6"
        } else {
            "SELECT * FROM builds WHERE deleted_at IS NULL \
             AND ($1::uuid IS NULL OR repo_id = $1) \
             AND ($2::uuid IS NULL OR commit_id = $2) \
             AND ($3::text IS NULL OR git_ref = $3) \
             AND status <> ALL($4) \
             AND ($5::uuid IS NULL OR id < $5) \
             ORDER BY id DESC LIMIT $6"
        };
        let mut conn = self.conn(tx).await?;
        let rows = sqlx::query(sql)
            .bind(search.repo_id.map(|r| r.0))
            .bind(search.commit_id.map(|c| c.0))
            .bind(search.git_ref.as_deref())
            .bind(&excluded)
            .bind(marker)
            .bind(limit + 1)
            .fetch_all(conn.as_exec())
            .await?;

        let mut items: Vec<Build> = rows.iter().map(build_from_row).collect::<Result<_>>()?;
        let overflow = items.len() > limit as usize;
        items.truncate(limit as usize);
        if !forward {
            items.reverse();
        }

        let (more_before, more_after) = match (&search.cursor, forward) {
            (None, _) => (false, overflow),
            (Some(_), true) => (true, overflow),
            (Some(_), false) => (overflow, true),
        };
        let prev = match (more_before, items.first()) {
            (true, Some(first)) => Some(Cursor::prev(first.id.to_string())),
            _ => None,
        };
        let next = match (more_after, items.last()) {
            (true, Some(last)) => Some(Cursor::next(last.id.to_string())),
            _ => None,
        };
        Ok(Page { items, next, prev })
    }

    // ── Jobs ──

    async fn create_job(&self, tx: Option<&mut Tx>, job: &Job) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        sqlx::query(
            "INSERT INTO jobs (id, build_id, repo_id, commit_id, git_ref, workflow, name, \
             job_type, docker, job_runs_on, job_depends, job_services, job_environment, \
             step_execution, artifact_definitions, fingerprint_commands, fingerprint, \
             fingerprint_hash_type, indirect_to_job_id, definition_hash, runner_id, status, \
             timings, error, created_at, updated_at, deleted_at, etag) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)",
        )
        .bind(job.id.0)
        .bind(job.build_id.0)
        .bind(job.repo_id.0)
        .bind(job.commit_id.0)
        .bind(&job.git_ref)
        .bind(&job.workflow)
        .bind(job.name.as_str())
        .bind(enum_str(&job.job_type)?)
        .bind(job.docker.as_ref().map(json).transpose()?)
        .bind(json(&job.runs_on)?)
        .bind(json(&job.depends)?)
        .bind(json(&job.services)?)
        .bind(json(&job.environment)?)
        .bind(enum_str(&job.step_execution)?)
        .bind(json(&job.artifact_definitions)?)
        .bind(json(&job.fingerprint_commands)?)
        .bind(&job.fingerprint)
        .bind(opt_enum_str(&job.fingerprint_hash_type)?)
        .bind(job.indirect_to_job_id.map(|j| j.0))
        .bind(&job.definition_hash)
        .bind(job.runner_id.map(|r| r.0))
        .bind(enum_str(&job.status)?)
        .bind(json(&job.timings)?)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.deleted_at)
        .bind(job.etag.as_str())
        .execute(conn.as_exec())
        .await?;
        Ok(())
    }

    async fn job(&self, tx: Option<&mut Tx>, id: JobId) -> Result<Job> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id.0)
        .fetch_optional(conn.as_exec())
        .await?
        .ok_or_else(|| Error::not_found(id.to_string()))?;
        job_from_row(&row)
    }

    async fn update_job(&self, tx: Option<&mut Tx>, job: &Job) -> Result<Job> {
        let mut conn = self.conn(tx).await?;
        let new_etag = Etag::mint();
        let row = sqlx::query(&format!(
            "UPDATE jobs SET fingerprint = $3, fingerprint_hash_type = $4, \
             indirect_to_job_id = $5, runner_id = $6, status = $7, timings = $8, error = $9, \
             updated_at = $10, etag = $11 \
             WHERE id = $1 AND etag = $2 AND deleted_at IS NULL RETURNING {JOB_COLUMNS}"
        ))
        .bind(job.id.0)
        .bind(job.etag.as_str())
        .bind(&job.fingerprint)
        .bind(opt_enum_str(&job.fingerprint_hash_type)?)
        .bind(job.indirect_to_job_id.map(|j| j.0))
        .bind(job.runner_id.map(|r| r.0))
        .bind(enum_str(&job.status)?)
        .bind(json(&job.timings)?)
        .bind(&job.error)
        .bind(now())
        .bind(new_etag.as_str())
        .fetch_optional(conn.as_exec())
        .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(stale_or_missing(conn, "jobs", job.id.0, "job").await),
        }
    }

    async fn jobs_for_build(&self, tx: Option<&mut Tx>, build_id: BuildId) -> Result<Vec<Job>> {
        let mut conn = self.conn(tx).await?;
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE build_id = $1 AND deleted_at IS NULL \
             ORDER BY created_at, id"
        ))
        .bind(build_id.0)
        .fetch_all(conn.as_exec())
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_queued_jobs(&self, tx: Option<&mut Tx>, limit: usize) -> Result<Vec<Job>> {
        let mut conn = self.conn(tx).await?;
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'queued' AND deleted_at IS NULL \
             ORDER BY created_at, id LIMIT $1"
        ))
        .bind(limit.min(1_000) as i64)
        .fetch_all(conn.as_exec())
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn find_fingerprint_match(
        &self,
        tx: Option<&mut Tx>,
        repo_id: RepoId,
        workflow: &str,
        job_name: &ResourceName,
        fingerprint: &str,
        hash_type: HashType,
    ) -> Result<Option<Job>> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE deleted_at IS NULL AND repo_id = $1 \
             AND workflow = $2 AND name = $3 AND status = 'succeeded' \
             AND indirect_to_job_id IS NULL AND fingerprint = $4 \
             AND fingerprint_hash_type = $5 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(repo_id.0)
        .bind(workflow)
        .bind(job_name.as_str())
        .bind(fingerprint)
        .bind(enum_str(&hash_type)?)
        .fetch_optional(conn.as_exec())
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    // ── Job dependencies ──

    async fn create_job_dependency(
        &self,
        tx: Option<&mut Tx>,
        dep: &JobDependencyRow,
    ) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        sqlx::query(
            "INSERT INTO job_dependencies (build_id, source_job_id, workflow, job_name, \
             target_job_id, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(dep.build_id.0)
        .bind(dep.source_job_id.0)
        .bind(&dep.workflow)
        .bind(dep.job_name.as_str())
        .bind(dep.target_job_id.map(|j| j.0))
        .bind(dep.created_at)
        .execute(conn.as_exec())
        .await?;
        Ok(())
    }

    async fn dependencies_for_job(
        &self,
        tx: Option<&mut Tx>,
        job_id: JobId,
    ) -> Result<Vec<JobDependencyRow>> {
        let mut conn = self.conn(tx).await?;
        let rows = sqlx::query(
            "SELECT * FROM job_dependencies WHERE source_job_id = $1 ORDER BY workflow, job_name",
        )
        .bind(job_id.0)
        .fetch_all(conn.as_exec())
        .await?;
        rows.iter().map(dependency_from_row).collect()
    }

    async fn fulfil_deferred_dependencies(
        &self,
        tx: &mut Tx,
        build_id: BuildId,
        workflow: &str,
        job_name: &ResourceName,
        target: JobId,
    ) -> Result<u64> {
        let mut conn = self.conn(Some(tx)).await?;
        let result = sqlx::query(
            "UPDATE job_dependencies SET target_job_id = $4 \
             WHERE build_id = $1 AND workflow = $2 AND job_name = $3 AND target_job_id IS NULL",
        )
        .bind(build_id.0)
        .bind(workflow)
        .bind(job_name.as_str())
        .bind(target.0)
        .execute(conn.as_exec())
        .await?;
        Ok(result.rows_affected())
    }

    // ── Steps ──

    async fn create_step(&self, tx: Option<&mut Tx>, step: &Step) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        sqlx::query(
            "INSERT INTO steps (id, job_id, repo_id, name, log_descriptor_id, step_commands, \
             step_depends, status, timings, error, created_at, updated_at, etag) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(step.id.0)
        .bind(step.job_id.0)
        .bind(step.repo_id.0)
        .bind(step.name.as_str())
        .bind(step.log_descriptor_id.0)
        .bind(json(&step.commands)?)
        .bind(json(&step.depends)?)
        .bind(enum_str(&step.status)?)
        .bind(json(&step.timings)?)
        .bind(&step.error)
        .bind(step.created_at)
        .bind(step.updated_at)
        .bind(step.etag.as_str())
        .execute(conn.as_exec())
        .await?;
        Ok(())
    }

    async fn step(&self, tx: Option<&mut Tx>, id: StepId) -> Result<Step> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query("SELECT * FROM steps WHERE id = $1")
            .bind(id.0)
            .fetch_optional(conn.as_exec())
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        step_from_row(&row)
    }

    async fn update_step(&self, tx: Option<&mut Tx>, step: &Step) -> Result<Step> {
        let mut conn = self.conn(tx).await?;
        let new_etag = Etag::mint();
        let row = sqlx::query(
            "UPDATE steps SET status = $3, timings = $4, error = $5, updated_at = $6, etag = $7 \
             WHERE id = $1 AND etag = $2 RETURNING *",
        )
        .bind(step.id.0)
        .bind(step.etag.as_str())
        .bind(enum_str(&step.status)?)
        .bind(json(&step.timings)?)
        .bind(&step.error)
        .bind(now())
        .bind(new_etag.as_str())
        .fetch_optional(conn.as_exec())
        .await?;
        match row {
            Some(row) => step_from_row(&row),
            None => Err(stale_or_missing(conn, "steps", step.id.0, "step").await),
        }
    }

    async fn steps_for_job(&self, tx: Option<&mut Tx>, job_id: JobId) -> Result<Vec<Step>> {
        let mut conn = self.conn(tx).await?;
        let rows =
            sqlx::query("SELECT * FROM steps WHERE job_id = $1 ORDER BY created_at, id")
                .bind(job_id.0)
                .fetch_all(conn.as_exec())
                .await?;
        rows.iter().map(step_from_row).collect()
    }

    // ── Artifacts ──

    async fn create_artifact(&self, tx: Option<&mut Tx>, artifact: &Artifact) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        sqlx::query(
            "INSERT INTO artifacts (id, job_id, group_name, relative_path, hash, hash_type, \
             size, mime, sealed, created_at, updated_at, etag) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(artifact.id.0)
        .bind(artifact.job_id.0)
        .bind(artifact.group_name.as_str())
        .bind(&artifact.relative_path)
        .bind(&artifact.hash)
        .bind(opt_enum_str(&artifact.hash_type)?)
        .bind(artifact.size.map(|s| s as i64))
        .bind(&artifact.mime)
        .bind(artifact.sealed)
        .bind(artifact.created_at)
        .bind(artifact.updated_at)
        .bind(artifact.etag.as_str())
        .execute(conn.as_exec())
        .await?;
        Ok(())
    }

    async fn artifact(&self, tx: Option<&mut Tx>, id: ArtifactId) -> Result<Artifact> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query("SELECT * FROM artifacts WHERE id = $1")
            .bind(id.0)
            .fetch_optional(conn.as_exec())
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        artifact_from_row(&row)
    }

    async fn update_artifact(&self, tx: Option<&mut Tx>, artifact: &Artifact) -> Result<Artifact> {
        let mut conn = self.conn(tx).await?;
        let new_etag = Etag::mint();
        let row = sqlx::query(
            "UPDATE artifacts SET hash = $3, hash_type = $4, size = $5, mime = $6, sealed = $7, \
             updated_at = $8, etag = $9 WHERE id = $1 AND etag = $2 RETURNING *",
        )
        .bind(artifact.id.0)
        .bind(artifact.etag.as_str())
        .bind(&artifact.hash)
        .bind(opt_enum_str(&artifact.hash_type)?)
        .bind(artifact.size.map(|s| s as i64))
        .bind(&artifact.mime)
        .bind(artifact.sealed)
        .bind(now())
        .bind(new_etag.as_str())
        .fetch_optional(conn.as_exec())
        .await?;
        match row {
            Some(row) => artifact_from_row(&row),
            None => Err(stale_or_missing(conn, "artifacts", artifact.id.0, "artifact").await),
        }
    }

    async fn artifacts_for_job(
        &self,
        tx: Option<&mut Tx>,
        job_id: JobId,
        group_name: Option<&ResourceName>,
    ) -> Result<Vec<Artifact>> {
        let mut conn = self.conn(tx).await?;
        let rows = sqlx::query(
            "SELECT * FROM artifacts WHERE job_id = $1 \
             AND ($2::text IS NULL OR group_name = $2) ORDER BY created_at, id",
        )
        .bind(job_id.0)
        .bind(group_name.map(|g| g.as_str()))
        .fetch_all(conn.as_exec())
        .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    // ── Commits ──

    async fn upsert_commit(
        &self,
        tx: Option<&mut Tx>,
        commit: &Commit,
    ) -> Result<(Commit, bool, bool)> {
        let mut conn = self.conn(tx).await?;
        let existing = sqlx::query("SELECT * FROM commits WHERE repo_id = $1 AND sha = $2")
            .bind(commit.repo_id.0)
            .bind(&commit.sha)
            .fetch_optional(conn.as_exec())
            .await?;

        let stored = match existing {
            Some(row) => commit_from_row(&row)?,
            None => {
                let mut fresh = commit.clone();
                if fresh.id.is_nil() {
                    fresh.id = CommitId::new();
                }
                let inserted = sqlx::query(
                    "INSERT INTO commits (id, repo_id, sha, message, author_id, author_name, \
                     author_email, committer_id, committer_name, committer_email, config, \
                     config_type, link, created_at, updated_at, etag) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
                     ON CONFLICT (repo_id, sha) DO NOTHING",
                )
                .bind(fresh.id.0)
                .bind(fresh.repo_id.0)
                .bind(&fresh.sha)
                .bind(&fresh.message)
                .bind(fresh.author_id.map(|a| a.0))
                .bind(&fresh.author_name)
                .bind(&fresh.author_email)
                .bind(fresh.committer_id.map(|c| c.0))
                .bind(&fresh.committer_name)
                .bind(&fresh.committer_email)
                .bind(&fresh.config)
                .bind(enum_str(&fresh.config_type)?)
                .bind(&fresh.link)
                .bind(fresh.created_at)
                .bind(fresh.updated_at)
                .bind(fresh.etag.as_str())
                .execute(conn.as_exec())
                .await?;
                if inserted.rows_affected() == 1 {
                    return Ok((fresh, true, false));
                }
                // Lost the insert race: fall through to the merge path.
                let row = sqlx::query("SELECT * FROM commits WHERE repo_id = $1 AND sha = $2")
                    .bind(commit.repo_id.0)
                    .bind(&commit.sha)
                    .fetch_one(conn.as_exec())
                    .await?;
                commit_from_row(&row)?
            }
        };

        let mut merged = stored.clone();
        let changed = merged.fill_forward(commit.clone());
        if !changed {
            return Ok((merged, false, false));
        }
        let new_etag = Etag::mint();
        sqlx::query(
            "UPDATE commits SET message = $2, author_id = $3, author_name = $4, \
             author_email = $5, committer_id = $6, committer_name = $7, committer_email = $8, \
             config = $9, config_type = $10, link = $11, updated_at = $12, etag = $13 \
             WHERE id = $1",
        )
        .bind(merged.id.0)
        .bind(&merged.message)
        .bind(merged.author_id.map(|a| a.0))
        .bind(&merged.author_name)
        .bind(&merged.author_email)
        .bind(merged.committer_id.map(|c| c.0))
        .bind(&merged.committer_name)
        .bind(&merged.committer_email)
        .bind(&merged.config)
        .bind(enum_str(&merged.config_type)?)
        .bind(&merged.link)
        .bind(now())
        .bind(new_etag.as_str())
        .execute(conn.as_exec())
        .await?;
        merged.etag = new_etag;
        Ok((merged, false, true))
    }

    async fn commit_by_id(&self, tx: Option<&mut Tx>, id: CommitId) -> Result<Commit> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query("SELECT * FROM commits WHERE id = $1")
            .bind(id.0)
            .fetch_optional(conn.as_exec())
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        commit_from_row(&row)
    }

    async fn commit_by_sha(
        &self,
        tx: Option<&mut Tx>,
        repo_id: RepoId,
        sha: &str,
    ) -> Result<Option<Commit>> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query("SELECT * FROM commits WHERE repo_id = $1 AND sha = $2")
            .bind(repo_id.0)
            .bind(sha)
            .fetch_optional(conn.as_exec())
            .await?;
        row.as_ref().map(commit_from_row).transpose()
    }

    // ── Tenant model ──

    async fn upsert_legal_entity(
        &self,
        tx: Option<&mut Tx>,
        entity: &LegalEntity,
    ) -> Result<(LegalEntity, bool, bool)> {
        let mut conn = self.conn(tx).await?;
        let existing = sqlx::query(
            "SELECT * FROM legal_entities WHERE external_system = $1 AND external_id = $2",
        )
        .bind(&entity.external_id.system)
        .bind(&entity.external_id.id)
        .fetch_optional(conn.as_exec())
        .await?;

        match existing {
            None => {
                let mut fresh = entity.clone();
                if fresh.id.is_nil() {
                    fresh.id = LegalEntityId::new();
                }
                sqlx::query(
                    "INSERT INTO legal_entities (id, name, kind, external_system, external_id, \
                     email, created_at, updated_at, etag) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(fresh.id.0)
                .bind(fresh.name.as_str())
                .bind(enum_str(&fresh.kind)?)
                .bind(&fresh.external_id.system)
                .bind(&fresh.external_id.id)
                .bind(&fresh.email)
                .bind(fresh.created_at)
                .bind(fresh.updated_at)
                .bind(fresh.etag.as_str())
                .execute(conn.as_exec())
                .await?;
                Ok((fresh, true, false))
            }
            Some(row) => {
                let mut stored = legal_entity_from_row(&row)?;
                let changed = stored.name != entity.name
                    || stored.kind != entity.kind
                    || stored.email != entity.email;
                if !changed {
                    return Ok((stored, false, false));
                }
                stored.name = entity.name.clone();
                stored.kind = entity.kind;
                stored.email = entity.email.clone();
                stored.etag = Etag::mint();
                sqlx::query(
                    "UPDATE legal_entities SET name = $2, kind = $3, email = $4, \
                     updated_at = $5, etag = $6 WHERE id = $1",
                )
                .bind(stored.id.0)
                .bind(stored.name.as_str())
                .bind(enum_str(&stored.kind)?)
                .bind(&stored.email)
                .bind(now())
                .bind(stored.etag.as_str())
                .execute(conn.as_exec())
                .await?;
                Ok((stored, false, true))
            }
        }
    }

    async fn legal_entity(&self, tx: Option<&mut Tx>, id: LegalEntityId) -> Result<LegalEntity> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query("SELECT * FROM legal_entities WHERE id = $1")
            .bind(id.0)
            .fetch_optional(conn.as_exec())
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        legal_entity_from_row(&row)
    }

    async fn upsert_repo(&self, tx: Option<&mut Tx>, repo: &Repo) -> Result<(Repo, bool, bool)> {
        let mut conn = self.conn(tx).await?;
        let existing =
            sqlx::query("SELECT * FROM repos WHERE external_system = $1 AND external_id = $2")
                .bind(&repo.external_id.system)
                .bind(&repo.external_id.id)
                .fetch_optional(conn.as_exec())
                .await?;

        match existing {
            None => {
                let mut fresh = repo.clone();
                if fresh.id.is_nil() {
                    fresh.id = RepoId::new();
                }
                sqlx::query(
                    "INSERT INTO repos (id, legal_entity_id, name, external_system, external_id, \
                     default_branch, link, enabled, created_at, updated_at, deleted_at, etag) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                )
                .bind(fresh.id.0)
                .bind(fresh.legal_entity_id.0)
                .bind(fresh.name.as_str())
                .bind(&fresh.external_id.system)
                .bind(&fresh.external_id.id)
                .bind(&fresh.default_branch)
                .bind(&fresh.link)
                .bind(fresh.enabled)
                .bind(fresh.created_at)
                .bind(fresh.updated_at)
                .bind(fresh.deleted_at)
                .bind(fresh.etag.as_str())
                .execute(conn.as_exec())
                .await?;
                Ok((fresh, true, false))
            }
            Some(row) => {
                let mut stored = repo_from_row(&row)?;
                let changed = stored.name != repo.name
                    || stored.default_branch != repo.default_branch
                    || stored.link != repo.link;
                if !changed {
                    return Ok((stored, false, false));
                }
                stored.name = repo.name.clone();
                stored.default_branch = repo.default_branch.clone();
                stored.link = repo.link.clone();
                stored.etag = Etag::mint();
                sqlx::query(
                    "UPDATE repos SET name = $2, default_branch = $3, link = $4, \
                     updated_at = $5, etag = $6 WHERE id = $1",
                )
                .bind(stored.id.0)
                .bind(stored.name.as_str())
                .bind(&stored.default_branch)
                .bind(&stored.link)
                .bind(now())
                .bind(stored.etag.as_str())
                .execute(conn.as_exec())
                .await?;
                Ok((stored, false, true))
            }
        }
    }

    async fn repo(&self, tx: Option<&mut Tx>, id: RepoId) -> Result<Repo> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query("SELECT * FROM repos WHERE id = $1 AND deleted_at IS NULL")
            .bind(id.0)
            .fetch_optional(conn.as_exec())
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        repo_from_row(&row)
    }

    async fn upsert_group(
        &self,
        tx: Option<&mut Tx>,
        group: &Group,
    ) -> Result<(Group, bool, bool)> {
        let mut conn = self.conn(tx).await?;
        let existing = match &group.external_id {
            Some(ext) => {
                sqlx::query("SELECT * FROM groups WHERE external_system = $1 AND external_id = $2")
                    .bind(&ext.system)
                    .bind(&ext.id)
                    .fetch_optional(conn.as_exec())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM groups WHERE legal_entity_id = $1 AND name = $2")
                    .bind(group.legal_entity_id.0)
                    .bind(group.name.as_str())
                    .fetch_optional(conn.as_exec())
                    .await?
            }
        };

        match existing {
            None => {
                let mut fresh = group.clone();
                if fresh.id.is_nil() {
                    fresh.id = GroupId::new();
                }
                sqlx::query(
                    "INSERT INTO groups (id, legal_entity_id, name, external_system, \
                     external_id, created_at, updated_at, etag) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(fresh.id.0)
                .bind(fresh.legal_entity_id.0)
                .bind(fresh.name.as_str())
                .bind(fresh.external_id.as_ref().map(|e| e.system.clone()))
                .bind(fresh.external_id.as_ref().map(|e| e.id.clone()))
                .bind(fresh.created_at)
                .bind(fresh.updated_at)
                .bind(fresh.etag.as_str())
                .execute(conn.as_exec())
                .await?;
                Ok((fresh, true, false))
            }
            Some(row) => {
                let mut stored = group_from_row(&row)?;
                let changed = stored.name != group.name;
                if !changed {
                    return Ok((stored, false, false));
                }
                stored.name = group.name.clone();
                stored.etag = Etag::mint();
                sqlx::query("UPDATE groups SET name = $2, updated_at = $3, etag = $4 WHERE id = $1")
                    .bind(stored.id.0)
                    .bind(stored.name.as_str())
                    .bind(now())
                    .bind(stored.etag.as_str())
                    .execute(conn.as_exec())
                    .await?;
                Ok((stored, false, true))
            }
        }
    }

    async fn upsert_group_membership(
        &self,
        tx: Option<&mut Tx>,
        membership: &GroupMembership,
    ) -> Result<bool> {
        let mut conn = self.conn(tx).await?;
        let result = sqlx::query(
            "INSERT INTO group_memberships (group_id, identity_id, source_system, created_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
        )
        .bind(membership.group_id.0)
        .bind(membership.identity_id.0)
        .bind(&membership.source_system)
        .bind(membership.created_at)
        .execute(conn.as_exec())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_grant(&self, tx: Option<&mut Tx>, grant: &Grant) -> Result<bool> {
        let (holder_kind, holder_id) = match &grant.holder {
            GrantHolder::Identity(id) => ("identity", id.0),
            GrantHolder::Group(id) => ("group", id.0),
        };
        let mut conn = self.conn(tx).await?;
        let result = sqlx::query(
            "INSERT INTO grants (id, holder_kind, holder_id, operation, target_resource_id, \
             created_at) VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
        )
        .bind(grant.id.0)
        .bind(holder_kind)
        .bind(holder_id)
        .bind(&grant.operation)
        .bind(&grant.target_resource_id)
        .bind(grant.created_at)
        .execute(conn.as_exec())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_identity(&self, tx: Option<&mut Tx>, identity: &Identity) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        sqlx::query(
            "INSERT INTO identities (id, owner_resource_id, created_at) VALUES ($1, $2, $3)",
        )
        .bind(identity.id.0)
        .bind(&identity.owner_resource_id)
        .bind(identity.created_at)
        .execute(conn.as_exec())
        .await?;
        Ok(())
    }

    async fn identity_for_owner(
        &self,
        tx: Option<&mut Tx>,
        owner_resource_id: &str,
    ) -> Result<Option<Identity>> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query("SELECT * FROM identities WHERE owner_resource_id = $1")
            .bind(owner_resource_id)
            .fetch_optional(conn.as_exec())
            .await?;
        Ok(row.map(|row| {
            Ok::<_, Error>(Identity {
                id: IdentityId(row.try_get("id")?),
                owner_resource_id: row.try_get("owner_resource_id")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()?)
    }

    // ── Runners ──

    async fn create_runner(&self, tx: Option<&mut Tx>, runner: &Runner) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        sqlx::query(
            "INSERT INTO runners (id, legal_entity_id, name, labels, job_types, enabled, \
             created_at, updated_at, deleted_at, etag) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(runner.id.0)
        .bind(runner.legal_entity_id.0)
        .bind(runner.name.as_str())
        .bind(json(&runner.labels)?)
        .bind(json(&runner.job_types)?)
        .bind(runner.enabled)
        .bind(runner.created_at)
        .bind(runner.updated_at)
        .bind(runner.deleted_at)
        .bind(runner.etag.as_str())
        .execute(conn.as_exec())
        .await?;
        Ok(())
    }

    async fn runner(&self, tx: Option<&mut Tx>, id: RunnerId) -> Result<Runner> {
        let mut conn = self.conn(tx).await?;
        // No deleted_at filter: runners stay reachable after soft-delete.
        let row = sqlx::query("SELECT * FROM runners WHERE id = $1")
            .bind(id.0)
            .fetch_optional(conn.as_exec())
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        runner_from_row(&row)
    }

    async fn update_runner(&self, tx: Option<&mut Tx>, runner: &Runner) -> Result<Runner> {
        let mut conn = self.conn(tx).await?;
        let new_etag = Etag::mint();
        let row = sqlx::query(
            "UPDATE runners SET name = $3, labels = $4, job_types = $5, enabled = $6, \
             updated_at = $7, etag = $8 WHERE id = $1 AND etag = $2 RETURNING *",
        )
        .bind(runner.id.0)
        .bind(runner.etag.as_str())
        .bind(runner.name.as_str())
        .bind(json(&runner.labels)?)
        .bind(json(&runner.job_types)?)
        .bind(runner.enabled)
        .bind(now())
        .bind(new_etag.as_str())
        .fetch_optional(conn.as_exec())
        .await?;
        match row {
            Some(row) => runner_from_row(&row),
            None => Err(stale_or_missing(conn, "runners", runner.id.0, "runner").await),
        }
    }

    async fn soft_delete_runner(&self, tx: Option<&mut Tx>, id: RunnerId) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        let result = sqlx::query(
            "UPDATE runners SET deleted_at = $2, enabled = FALSE, updated_at = $2, etag = $3 \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.0)
        .bind(now())
        .bind(Etag::mint().as_str())
        .execute(conn.as_exec())
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(id.to_string()));
        }
        Ok(())
    }

    async fn runners_for_legal_entity(
        &self,
        tx: Option<&mut Tx>,
        legal_entity_id: LegalEntityId,
    ) -> Result<Vec<Runner>> {
        let mut conn = self.conn(tx).await?;
        let rows = sqlx::query(
            "SELECT * FROM runners WHERE legal_entity_id = $1 AND deleted_at IS NULL \
             ORDER BY created_at, id",
        )
        .bind(legal_entity_id.0)
        .fetch_all(conn.as_exec())
        .await?;
        rows.iter().map(runner_from_row).collect()
    }

    // ── Work queue ──

    async fn create_work_item(&self, tx: Option<&mut Tx>, item: &WorkItem) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        sqlx::query(
            "INSERT INTO work_items (id, item_type, data, concurrency_key, state_id, status, \
             completed_at, created_at, updated_at, etag) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(item.id.0)
        .bind(&item.item_type)
        .bind(&item.data)
        .bind(&item.concurrency_key)
        .bind(item.state_id.0)
        .bind(&item.status)
        .bind(item.completed_at)
        .bind(item.created_at)
        .bind(item.updated_at)
        .bind(item.etag.as_str())
        .execute(conn.as_exec())
        .await?;
        Ok(())
    }

    async fn work_item(&self, tx: Option<&mut Tx>, id: WorkItemId) -> Result<WorkItem> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query("SELECT * FROM work_items WHERE id = $1")
            .bind(id.0)
            .fetch_optional(conn.as_exec())
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        work_item_from_row(&row)
    }

    async fn update_work_item(&self, tx: Option<&mut Tx>, item: &WorkItem) -> Result<WorkItem> {
        let mut conn = self.conn(tx).await?;
        let new_etag = Etag::mint();
        let row = sqlx::query(
            "UPDATE work_items SET status = $3, completed_at = $4, updated_at = $5, etag = $6 \
             WHERE id = $1 AND etag = $2 RETURNING *",
        )
        .bind(item.id.0)
        .bind(item.etag.as_str())
        .bind(&item.status)
        .bind(item.completed_at)
        .bind(now())
        .bind(new_etag.as_str())
        .fetch_optional(conn.as_exec())
        .await?;
        match row {
            Some(row) => work_item_from_row(&row),
            None => Err(stale_or_missing(conn, "work_items", item.id.0, "work item").await),
        }
    }

    async fn delete_work_item(&self, tx: Option<&mut Tx>, id: WorkItemId) -> Result<()> {
        let mut conn = self.conn(tx).await?;
        sqlx::query("DELETE FROM work_items WHERE id = $1")
            .bind(id.0)
            .execute(conn.as_exec())
            .await?;
        Ok(())
    }

    async fn get_or_create_work_item_state(
        &self,
        tx: Option<&mut Tx>,
        concurrency_key: Option<&str>,
    ) -> Result<WorkItemState> {
        let mut conn = self.conn(tx).await?;
        if let Some(key) = concurrency_key {
            if let Some(row) =
                sqlx::query("SELECT * FROM work_item_states WHERE concurrency_key = $1")
                    .bind(key)
                    .fetch_optional(conn.as_exec())
                    .await?
            {
                return work_item_state_from_row(&row);
            }
        }
        let state = WorkItemState::fresh(concurrency_key.map(str::to_string));
        let inserted = sqlx::query(
            "INSERT INTO work_item_states (id, concurrency_key, attempts_so_far, not_before, \
             allocated_to, allocated_at, allocated_until, created_at, updated_at, etag) \
             VALUES ($1, $2, 0, NULL, NULL, NULL, NULL, $3, $4, $5) \
             ON CONFLICT (concurrency_key) WHERE concurrency_key IS NOT NULL DO NOTHING",
        )
        .bind(state.id.0)
        .bind(&state.concurrency_key)
        .bind(state.created_at)
        .bind(state.updated_at)
        .bind(state.etag.as_str())
        .execute(conn.as_exec())
        .await?;
        if inserted.rows_affected() == 1 {
            return Ok(state);
        }
        // Lost the race for a keyed row: read whoever won.
        let key = concurrency_key.expect("conflict only possible with a key");
        let row = sqlx::query("SELECT * FROM work_item_states WHERE concurrency_key = $1")
            .bind(key)
            .fetch_one(conn.as_exec())
            .await?;
        work_item_state_from_row(&row)
    }

    async fn work_item_state(
        &self,
        tx: Option<&mut Tx>,
        id: WorkItemStateId,
    ) -> Result<WorkItemState> {
        let mut conn = self.conn(tx).await?;
        let row = sqlx::query("SELECT * FROM work_item_states WHERE id = $1")
            .bind(id.0)
            .fetch_optional(conn.as_exec())
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        work_item_state_from_row(&row)
    }

    async fn update_work_item_state(
        &self,
        tx: Option<&mut Tx>,
        state: &WorkItemState,
    ) -> Result<WorkItemState> {
        let mut conn = self.conn(tx).await?;
        let new_etag = Etag::mint();
        let row = sqlx::query(
            "UPDATE work_item_states SET attempts_so_far = $3, not_before = $4, \
             allocated_to = $5, allocated_at = $6, allocated_until = $7, updated_at = $8, \
             etag = $9 WHERE id = $1 AND etag = $2 RETURNING *",
        )
        .bind(state.id.0)
        .bind(state.etag.as_str())
        .bind(state.attempts_so_far as i32)
        .bind(state.not_before)
        .bind(&state.allocated_to)
        .bind(state.allocated_at)
        .bind(state.allocated_until)
        .bind(now())
        .bind(new_etag.as_str())
        .fetch_optional(conn.as_exec())
        .await?;
        match row {
            Some(row) => work_item_state_from_row(&row),
            None => Err(stale_or_missing(conn, "work_item_states", state.id.0, "work item state").await),
        }
    }

    async fn find_queued_work_item(
        &self,
        tx: &mut Tx,
        types: &[String],
        at: DateTime<Utc>,
        lease: Duration,
        processor: &str,
    ) -> Result<Option<(WorkItem, WorkItemState)>> {
        let mut conn = self.conn(Some(tx)).await?;
        let types: Vec<String> = types.to_vec();
        // Oldest eligible item, locking the shared state row so racing
        // processors skip it instead of blocking.
        let candidate = sqlx::query(
            "SELECT wi.id AS item_id, ws.id AS state_id \
             FROM work_items wi JOIN work_item_states ws ON ws.id = wi.state_id \
             WHERE wi.completed_at IS NULL AND wi.item_type = ANY($1) \
             AND (ws.allocated_to IS NULL OR ws.allocated_until < $2) \
             AND (ws.not_before IS NULL OR ws.not_before <= $2) \
             ORDER BY wi.created_at, wi.id \
             LIMIT 1 FOR UPDATE OF ws SKIP LOCKED",
        )
        .bind(&types)
        .bind(at)
        .fetch_optional(conn.as_exec())
        .await?;

        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let item_id: Uuid = candidate.try_get("item_id")?;
        let state_id: Uuid = candidate.try_get("state_id")?;

        let state_row = sqlx::query(
            "UPDATE work_item_states SET allocated_to = $2, allocated_at = $3, \
             allocated_until = $4, attempts_so_far = attempts_so_far + 1, updated_at = $3, \
             etag = $5 WHERE id = $1 RETURNING *",
        )
        .bind(state_id)
        .bind(processor)
        .bind(at)
        .bind(at + lease)
        .bind(Etag::mint().as_str())
        .fetch_one(conn.as_exec())
        .await?;

        let item_row = sqlx::query(
            "UPDATE work_items SET status = 'processing', updated_at = $2, etag = $3 \
             WHERE id = $1 RETURNING *",
        )
        .bind(item_id)
        .bind(now())
        .bind(Etag::mint().as_str())
        .fetch_one(conn.as_exec())
        .await?;

        Ok(Some((
            work_item_from_row(&item_row)?,
            work_item_state_from_row(&state_row)?,
        )))
    }

    // ── Events ──

    async fn increment_event_counter(&self, tx: &mut Tx, build_id: BuildId) -> Result<u64> {
        let mut conn = self.conn(Some(tx)).await?;
        let row = sqlx::query(
            "INSERT INTO event_counters (build_id, seq) VALUES ($1, 1) \
             ON CONFLICT (build_id) DO UPDATE SET seq = event_counters.seq + 1 RETURNING seq",
        )
        .bind(build_id.0)
        .fetch_one(conn.as_exec())
        .await?;
        Ok(row.try_get::<i64, _>("seq")? as u64)
    }

    async fn create_event(&self, tx: &mut Tx, event: &Event) -> Result<()> {
        let mut conn = self.conn(Some(tx)).await?;
        sqlx::query(
            "INSERT INTO events (build_id, seq, kind, resource_id, workflow, job_name, \
             resource_name, payload, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(event.build_id.0)
        .bind(event.seq as i64)
        .bind(enum_str(&event.kind)?)
        .bind(&event.resource_id)
        .bind(&event.workflow)
        .bind(&event.job_name)
        .bind(&event.resource_name)
        .bind(json(&event.payload)?)
        .bind(event.created_at)
        .execute(conn.as_exec())
        .await?;
        Ok(())
    }

    async fn find_events(
        &self,
        tx: Option<&mut Tx>,
        build_id: BuildId,
        last_seq: u64,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let mut conn = self.conn(tx).await?;
        let rows = sqlx::query(
            "SELECT * FROM events WHERE build_id = $1 AND seq > $2 ORDER BY seq LIMIT $3",
        )
        .bind(build_id.0)
        .bind(last_seq as i64)
        .bind(limit.min(1_000) as i64)
        .fetch_all(conn.as_exec())
        .await?;
        rows.iter().map(event_from_row).collect()
    }
}

/// Distinguish an etag conflict from a missing row after a guarded
/// update matched nothing.
async fn stale_or_missing(mut conn: Conn<'_>, table: &str, id: Uuid, what: &str) -> Error {
    let exists = sqlx::query(&format!("SELECT 1 FROM {table} WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn.as_exec())
        .await;
    match exists {
        Ok(Some(_)) => Error::OptimisticLock(format!("{what} {id}: etag mismatch")),
        Ok(None) => Error::not_found(format!("{what} {id}")),
        Err(e) => Error::from(e),
    }
}

#[cfg(all(test, feature = "postgres"))]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn setup() -> Arc<PostgresStore> {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/gantry_test".to_string());
        let pool = PgPool::connect(&url).await.expect("connect to db");
        let store = PostgresStore::new(pool);
        store.migrate().await.expect("run migrations");
        Arc::new(store)
    }

    /// Requires a running PostgreSQL (set DATABASE_URL).
    #[tokio::test]
    #[ignore]
    async fn work_item_state_key_upsert_race() {
        let store = setup().await;
        let a = store
            .get_or_create_work_item_state(None, Some("race-key"))
            .await
            .unwrap();
        let b = store
            .get_or_create_work_item_state(None, Some("race-key"))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    /// Requires a running PostgreSQL (set DATABASE_URL).
    #[tokio::test]
    #[ignore]
    async fn build_number_allocation_is_monotonic() {
        let store = setup().await;
        let repo = RepoId::new();
        let mut tx = store.begin().await.unwrap();
        let first = store.next_build_number(&mut tx, repo).await.unwrap();
        let second = store.next_build_number(&mut tx, repo).await.unwrap();
        assert_eq!(second, first + 1);
        store.rollback(tx).await.unwrap();
    }
}
