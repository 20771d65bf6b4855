use crate::error::{Error, Result};
use crate::events::Event;
use crate::ids::*;
use crate::store::*;
use crate::types::*;
use crate::workqueue::{WorkItem, WorkItemState};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
struct Inner {
    builds: HashMap<BuildId, Build>,
    build_numbers: HashMap<RepoId, u64>,
    jobs: HashMap<JobId, Job>,
    job_deps: Vec<JobDependencyRow>,
    steps: HashMap<StepId, Step>,
    artifacts: HashMap<ArtifactId, Artifact>,
    commits: HashMap<CommitId, Commit>,
    repos: HashMap<RepoId, Repo>,
    legal_entities: HashMap<LegalEntityId, LegalEntity>,
    groups: HashMap<GroupId, Group>,
    memberships: Vec<GroupMembership>,
    grants: Vec<Grant>,
    identities: HashMap<IdentityId, Identity>,
    runners: HashMap<RunnerId, Runner>,
    work_items: HashMap<WorkItemId, WorkItem>,
    work_item_states: HashMap<WorkItemStateId, WorkItemState>,
    events: HashMap<BuildId, Vec<Event>>,
    event_seq: HashMap<BuildId, u64>,
}

/// A memory transaction holds the store's single mutex for its whole
/// lifetime, so transactions are serialized: every row-lock contract is
/// satisfied by construction. The pre-transaction snapshot restores the
/// state when the transaction is dropped uncommitted.
struct MemTx {
    guard: OwnedMutexGuard<Inner>,
    snapshot: Option<Inner>,
    committed: bool,
}

impl Drop for MemTx {
    fn drop(&mut self) {
        if !self.committed {
            if let Some(snapshot) = self.snapshot.take() {
                *self.guard = snapshot;
            }
        }
    }
}

/// In-memory implementation of [`Store`] for tests and single-process
/// deployments.
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    async fn with_inner<R>(
        &self,
        tx: Option<&mut Tx>,
        f: impl FnOnce(&mut Inner) -> Result<R>,
    ) -> Result<R> {
        match tx {
            Some(tx) => {
                let mem = tx.downcast_mut::<MemTx>()?;
                f(&mut mem.guard)
            }
            None => {
                let mut guard = self.inner.lock().await;
                f(&mut guard)
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_etag(stored: &Etag, given: &Etag, what: &str) -> Result<()> {
    if stored != given {
        return Err(Error::OptimisticLock(format!("{what}: etag mismatch")));
    }
    Ok(())
}

/// FIFO ordering used by dispatch and listings: `created_at`, ties broken
/// by id for determinism.
fn fifo_key<I: Ord + Copy>(created_at: DateTime<Utc>, id: I) -> (DateTime<Utc>, I) {
    (created_at, id)
}

#[async_trait]
impl Store for MemoryStore {
    // ── Transactions ──

    async fn begin(&self) -> Result<Tx> {
        let guard = self.inner.clone().lock_owned().await;
        let snapshot = Some(guard.clone());
        Ok(Tx::new(Box::new(MemTx {
            guard,
            snapshot,
            committed: false,
        })))
    }

    async fn commit(&self, tx: Tx) -> Result<()> {
        let mut mem = tx
            .into_inner()
            .downcast::<MemTx>()
            .map_err(|_| Error::internal("transaction belongs to a different store backend"))?;
        mem.committed = true;
        Ok(())
    }

    async fn rollback(&self, tx: Tx) -> Result<()> {
        // Dropping an uncommitted MemTx restores the snapshot.
        drop(tx);
        Ok(())
    }

    async fn lock_row_for_update(&self, tx: &mut Tx, _resource_id: &str) -> Result<()> {
        // The transaction already holds the store-wide mutex, which is
        // strictly stronger than any row lock.
        tx.downcast_mut::<MemTx>()?;
        Ok(())
    }

    // ── Builds ──

    async fn create_build(&self, tx: Option<&mut Tx>, build: &Build) -> Result<()> {
        let build = build.clone();
        self.with_inner(tx, move |inner| {
            if inner.builds.contains_key(&build.id) {
                return Err(Error::AlreadyExists(build.id.to_string()));
            }
            inner.builds.insert(build.id, build);
            Ok(())
        })
        .await
    }

    async fn build(&self, tx: Option<&mut Tx>, id: BuildId) -> Result<Build> {
        self.with_inner(tx, move |inner| {
            inner
                .builds
                .get(&id)
                .filter(|b| b.deleted_at.is_none())
                .cloned()
                .ok_or_else(|| Error::not_found(id.to_string()))
        })
        .await
    }

    async fn update_build(&self, tx: Option<&mut Tx>, build: &Build) -> Result<Build> {
        let build = build.clone();
        self.with_inner(tx, move |inner| {
            let stored = inner
                .builds
                .get_mut(&build.id)
                .filter(|b| b.deleted_at.is_none())
                .ok_or_else(|| Error::not_found(build.id.to_string()))?;
            check_etag(&stored.etag, &build.etag, "build")?;
            let mut updated = build;
            updated.updated_at = now();
            updated.etag = Etag::mint();
            *stored = updated.clone();
            Ok(updated)
        })
        .await
    }

    async fn soft_delete_build(&self, tx: Option<&mut Tx>, id: BuildId) -> Result<()> {
        self.with_inner(tx, move |inner| {
            let stored = inner
                .builds
                .get_mut(&id)
                .filter(|b| b.deleted_at.is_none())
                .ok_or_else(|| Error::not_found(id.to_string()))?;
            stored.deleted_at = Some(now());
            stored.updated_at = now();
            stored.etag = Etag::mint();
            Ok(())
        })
        .await
    }

    async fn hard_delete_build(&self, tx: Option<&mut Tx>, id: BuildId) -> Result<()> {
        self.with_inner(tx, move |inner| {
            inner.builds.remove(&id);
            inner.events.remove(&id);
            inner.event_seq.remove(&id);
            let job_ids: Vec<JobId> = inner
                .jobs
                .values()
                .filter(|j| j.build_id == id)
                .map(|j| j.id)
                .collect();
            for job_id in job_ids {
                inner.jobs.remove(&job_id);
                inner.steps.retain(|_, s| s.job_id != job_id);
                inner.artifacts.retain(|_, a| a.job_id != job_id);
            }
            inner.job_deps.retain(|d| d.build_id != id);
            Ok(())
        })
        .await
    }

    async fn next_build_number(&self, tx: &mut Tx, repo_id: RepoId) -> Result<u64> {
        self.with_inner(Some(tx), move |inner| {
            let n = inner.build_numbers.entry(repo_id).or_insert(0);
            *n += 1;
            Ok(*n)
        })
        .await
    }

    async fn builds_for_commit(
        &self,
        tx: Option<&mut Tx>,
        commit_id: CommitId,
        git_ref: &str,
        exclude_statuses: &[WorkflowStatus],
    ) -> Result<Vec<Build>> {
        let git_ref = git_ref.to_string();
        let exclude = exclude_statuses.to_vec();
        self.with_inner(tx, move |inner| {
            let mut builds: Vec<Build> = inner
                .builds
                .values()
                .filter(|b| {
                    b.deleted_at.is_none()
                        && b.commit_id == commit_id
                        && b.git_ref == git_ref
                        && !exclude.contains(&b.status)
                })
                .cloned()
                .collect();
            builds.sort_by_key(|b| fifo_key(b.created_at, b.id));
            Ok(builds)
        })
        .await
    }

    async fn search_builds(
        &self,
        tx: Option<&mut Tx>,
        search: &BuildSearch,
    ) -> Result<Page<Build>> {
        let search = search.clone();
        self.with_inner(tx, move |inner| {
            let mut builds: Vec<Build> = inner
                .builds
                .values()
                .filter(|b| b.deleted_at.is_none())
                .filter(|b| search.repo_id.map_or(true, |r| b.repo_id == r))
                .filter(|b| search.commit_id.map_or(true, |c| b.commit_id == c))
                .filter(|b| {
                    search
                        .git_ref
                        .as_ref()
                        .map_or(true, |r| &b.git_ref == r)
                })
                .filter(|b| !search.exclude_statuses.contains(&b.status))
                .cloned()
                .collect();
            builds.sort_by_key(|b| b.id);

            let limit = search.limit.max(1);
            let (window, more_before, more_after) = match &search.cursor {
                None => {
                    let more = builds.len() > limit;
                    builds.truncate(limit);
                    (builds, false, more)
                }
                Some(cursor) => {
                    let marker = BuildId::parse(&cursor.marker)?;
                    match cursor.direction {
                        CursorDirection::Next => {
                            let after: Vec<Build> =
                                builds.iter().filter(|b| b.id > marker).cloned().collect();
                            let more_before = builds.iter().any(|b| b.id <= marker);
                            let more_after = after.len() > limit;
                            let mut window = after;
                            window.truncate(limit);
                            (window, more_before, more_after)
                        }
                        CursorDirection::Prev => {
                            let before: Vec<Build> =
                                builds.iter().filter(|b| b.id < marker).cloned().collect();
                            let more_after = builds.iter().any(|b| b.id >= marker);
                            let skip = before.len().saturating_sub(limit);
                            let more_before = skip > 0;
                            let window = before.into_iter().skip(skip).collect();
                            (window, more_before, more_after)
                        }
                    }
                }
            };

            let prev = match (more_before, window.first()) {
                (true, Some(first)) => Some(Cursor::prev(first.id.to_string())),
                _ => None,
            };
            let next = match (more_after, window.last()) {
                (true, Some(last)) => Some(Cursor::next(last.id.to_string())),
                _ => None,
            };
            Ok(Page {
                items: window,
                next,
                prev,
            })
        })
        .await
    }

    // ── Jobs ──

    async fn create_job(&self, tx: Option<&mut Tx>, job: &Job) -> Result<()> {
        let job = job.clone();
        self.with_inner(tx, move |inner| {
            if inner.jobs.contains_key(&job.id) {
                return Err(Error::AlreadyExists(job.id.to_string()));
            }
            let fqn = job.fqn();
            if inner
                .jobs
                .values()
                .any(|j| j.build_id == job.build_id && j.fqn() == fqn)
            {
                return Err(Error::AlreadyExists(format!(
                    "job {fqn} in build {}",
                    job.build_id
                )));
            }
            inner.jobs.insert(job.id, job);
            Ok(())
        })
        .await
    }

    async fn job(&self, tx: Option<&mut Tx>, id: JobId) -> Result<Job> {
        self.with_inner(tx, move |inner| {
            inner
                .jobs
                .get(&id)
                .filter(|j| j.deleted_at.is_none())
                .cloned()
                .ok_or_else(|| Error::not_found(id.to_string()))
        })
        .await
    }

    async fn update_job(&self, tx: Option<&mut Tx>, job: &Job) -> Result<Job> {
        let job = job.clone();
        self.with_inner(tx, move |inner| {
            let stored = inner
                .jobs
                .get_mut(&job.id)
                .filter(|j| j.deleted_at.is_none())
                .ok_or_else(|| Error::not_found(job.id.to_string()))?;
            check_etag(&stored.etag, &job.etag, "job")?;
            let mut updated = job;
            updated.updated_at = now();
            updated.etag = Etag::mint();
            *stored = updated.clone();
            Ok(updated)
        })
        .await
    }

    async fn jobs_for_build(&self, tx: Option<&mut Tx>, build_id: BuildId) -> Result<Vec<Job>> {
        self.with_inner(tx, move |inner| {
            let mut jobs: Vec<Job> = inner
                .jobs
                .values()
                .filter(|j| j.build_id == build_id && j.deleted_at.is_none())
                .cloned()
                .collect();
            jobs.sort_by_key(|j| fifo_key(j.created_at, j.id));
            Ok(jobs)
        })
        .await
    }

    async fn list_queued_jobs(&self, tx: Option<&mut Tx>, limit: usize) -> Result<Vec<Job>> {
        self.with_inner(tx, move |inner| {
            let mut jobs: Vec<Job> = inner
                .jobs
                .values()
                .filter(|j| j.status == WorkflowStatus::Queued && j.deleted_at.is_none())
                .cloned()
                .collect();
            jobs.sort_by_key(|j| fifo_key(j.created_at, j.id));
            jobs.truncate(limit);
            Ok(jobs)
        })
        .await
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
        let workflow = workflow.to_string();
        let job_name = job_name.clone();
        let fingerprint = fingerprint.to_string();
        self.with_inner(tx, move |inner| {
            Ok(inner
                .jobs
                .values()
                .filter(|j| {
                    j.deleted_at.is_none()
                        && j.repo_id == repo_id
                        && j.workflow == workflow
                        && j.name == job_name
                        && j.status == WorkflowStatus::Succeeded
                        && j.indirect_to_job_id.is_none()
                        && j.fingerprint.as_deref() == Some(fingerprint.as_str())
                        && j.fingerprint_hash_type == Some(hash_type)
                })
                .max_by_key(|j| fifo_key(j.created_at, j.id))
                .cloned())
        })
        .await
    }

    // ── Job dependencies ──

    async fn create_job_dependency(
        &self,
        tx: Option<&mut Tx>,
        dep: &JobDependencyRow,
    ) -> Result<()> {
        let dep = dep.clone();
        self.with_inner(tx, move |inner| {
            let exists = inner.job_deps.iter().any(|d| {
                d.source_job_id == dep.source_job_id
                    && d.workflow == dep.workflow
                    && d.job_name == dep.job_name
            });
            if exists {
                return Err(Error::AlreadyExists(format!(
                    "dependency of {} on {}.{}",
                    dep.source_job_id, dep.workflow, dep.job_name
                )));
            }
            inner.job_deps.push(dep);
            Ok(())
        })
        .await
    }

    async fn dependencies_for_job(
        &self,
        tx: Option<&mut Tx>,
        job_id: JobId,
    ) -> Result<Vec<JobDependencyRow>> {
        self.with_inner(tx, move |inner| {
            Ok(inner
                .job_deps
                .iter()
                .filter(|d| d.source_job_id == job_id)
                .cloned()
                .collect())
        })
        .await
    }

    async fn fulfil_deferred_dependencies(
        &self,
        tx: &mut Tx,
        build_id: BuildId,
        workflow: &str,
        job_name: &ResourceName,
        target: JobId,
    ) -> Result<u64> {
        let workflow = workflow.to_string();
        let job_name = job_name.clone();
        self.with_inner(Some(tx), move |inner| {
            let mut fulfilled = 0;
            for dep in inner.job_deps.iter_mut() {
                if dep.build_id == build_id
                    && dep.is_deferred()
                    && dep.workflow == workflow
                    && dep.job_name == job_name
                {
                    dep.target_job_id = Some(target);
                    fulfilled += 1;
                }
            }
            Ok(fulfilled)
        })
        .await
    }

    // ── Steps ──

    async fn create_step(&self, tx: Option<&mut Tx>, step: &Step) -> Result<()> {
        let step = step.clone();
        self.with_inner(tx, move |inner| {
            if inner.steps.contains_key(&step.id) {
                return Err(Error::AlreadyExists(step.id.to_string()));
            }
            inner.steps.insert(step.id, step);
            Ok(())
        })
        .await
    }

    async fn step(&self, tx: Option<&mut Tx>, id: StepId) -> Result<Step> {
        self.with_inner(tx, move |inner| {
            inner
                .steps
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::not_found(id.to_string()))
        })
        .await
    }

    async fn update_step(&self, tx: Option<&mut Tx>, step: &Step) -> Result<Step> {
        let step = step.clone();
        self.with_inner(tx, move |inner| {
            let stored = inner
                .steps
                .get_mut(&step.id)
                .ok_or_else(|| Error::not_found(step.id.to_string()))?;
            check_etag(&stored.etag, &step.etag, "step")?;
            let mut updated = step;
            updated.updated_at = now();
            updated.etag = Etag::mint();
            *stored = updated.clone();
            Ok(updated)
        })
        .await
    }

    async fn steps_for_job(&self, tx: Option<&mut Tx>, job_id: JobId) -> Result<Vec<Step>> {
        self.with_inner(tx, move |inner| {
            let mut steps: Vec<Step> = inner
                .steps
                .values()
                .filter(|s| s.job_id == job_id)
                .cloned()
                .collect();
            steps.sort_by_key(|s| fifo_key(s.created_at, s.id));
            Ok(steps)
        })
        .await
    }

    // ── Artifacts ──

    async fn create_artifact(&self, tx: Option<&mut Tx>, artifact: &Artifact) -> Result<()> {
        let artifact = artifact.clone();
        self.with_inner(tx, move |inner| {
            if inner.artifacts.contains_key(&artifact.id) {
                return Err(Error::AlreadyExists(artifact.id.to_string()));
            }
            inner.artifacts.insert(artifact.id, artifact);
            Ok(())
        })
        .await
    }

    async fn artifact(&self, tx: Option<&mut Tx>, id: ArtifactId) -> Result<Artifact> {
        self.with_inner(tx, move |inner| {
            inner
                .artifacts
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::not_found(id.to_string()))
        })
        .await
    }

    async fn update_artifact(&self, tx: Option<&mut Tx>, artifact: &Artifact) -> Result<Artifact> {
        let artifact = artifact.clone();
        self.with_inner(tx, move |inner| {
            let stored = inner
                .artifacts
                .get_mut(&artifact.id)
                .ok_or_else(|| Error::not_found(artifact.id.to_string()))?;
            check_etag(&stored.etag, &artifact.etag, "artifact")?;
            let mut updated = artifact;
            updated.updated_at = now();
            updated.etag = Etag::mint();
            *stored = updated.clone();
            Ok(updated)
        })
        .await
    }

    async fn artifacts_for_job(
        &self,
        tx: Option<&mut Tx>,
        job_id: JobId,
        group_name: Option<&ResourceName>,
    ) -> Result<Vec<Artifact>> {
        let group_name = group_name.cloned();
        self.with_inner(tx, move |inner| {
            let mut artifacts: Vec<Artifact> = inner
                .artifacts
                .values()
                .filter(|a| a.job_id == job_id)
                .filter(|a| group_name.as_ref().map_or(true, |g| &a.group_name == g))
                .cloned()
                .collect();
            artifacts.sort_by_key(|a| fifo_key(a.created_at, a.id));
            Ok(artifacts)
        })
        .await
    }

    // ── Commits ──

    async fn upsert_commit(
        &self,
        tx: Option<&mut Tx>,
        commit: &Commit,
    ) -> Result<(Commit, bool, bool)> {
        let commit = commit.clone();
        self.with_inner(tx, move |inner| {
            let existing_id = inner
                .commits
                .values()
                .find(|c| c.repo_id == commit.repo_id && c.sha == commit.sha)
                .map(|c| c.id);

            let Some(id) = existing_id else {
                let mut fresh = commit;
                if fresh.id.is_nil() {
                    fresh.id = CommitId::new();
                }
                inner.commits.insert(fresh.id, fresh.clone());
                return Ok((fresh, true, false));
            };

            let stored = inner.commits.get_mut(&id).expect("commit present");
            let changed = stored.fill_forward(commit);
            if changed {
                stored.updated_at = now();
                stored.etag = Etag::mint();
            }
            Ok((stored.clone(), false, changed))
        })
        .await
    }

    async fn commit_by_id(&self, tx: Option<&mut Tx>, id: CommitId) -> Result<Commit> {
        self.with_inner(tx, move |inner| {
            inner
                .commits
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::not_found(id.to_string()))
        })
        .await
    }

    async fn commit_by_sha(
        &self,
        tx: Option<&mut Tx>,
        repo_id: RepoId,
        sha: &str,
    ) -> Result<Option<Commit>> {
        let sha = sha.to_string();
        self.with_inner(tx, move |inner| {
            Ok(inner
                .commits
                .values()
                .find(|c| c.repo_id == repo_id && c.sha == sha)
                .cloned())
        })
        .await
    }

    // ── Tenant model ──

    async fn upsert_legal_entity(
        &self,
        tx: Option<&mut Tx>,
        entity: &LegalEntity,
    ) -> Result<(LegalEntity, bool, bool)> {
        let entity = entity.clone();
        self.with_inner(tx, move |inner| {
            let existing_id = inner
                .legal_entities
                .values()
                .find(|e| e.external_id == entity.external_id)
                .map(|e| e.id);
            let Some(id) = existing_id else {
                let mut fresh = entity;
                if fresh.id.is_nil() {
                    fresh.id = LegalEntityId::new();
                }
                inner.legal_entities.insert(fresh.id, fresh.clone());
                return Ok((fresh, true, false));
            };
            let stored = inner.legal_entities.get_mut(&id).expect("entity present");
            let changed = stored.name != entity.name
                || stored.kind != entity.kind
                || stored.email != entity.email;
            if changed {
                stored.name = entity.name;
                stored.kind = entity.kind;
                stored.email = entity.email;
                stored.updated_at = now();
                stored.etag = Etag::mint();
            }
            Ok((stored.clone(), false, changed))
        })
        .await
    }

    async fn legal_entity(&self, tx: Option<&mut Tx>, id: LegalEntityId) -> Result<LegalEntity> {
        self.with_inner(tx, move |inner| {
            inner
                .legal_entities
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::not_found(id.to_string()))
        })
        .await
    }

    async fn upsert_repo(&self, tx: Option<&mut Tx>, repo: &Repo) -> Result<(Repo, bool, bool)> {
        let repo = repo.clone();
        self.with_inner(tx, move |inner| {
            let existing_id = inner
                .repos
                .values()
                .find(|r| r.external_id == repo.external_id)
                .map(|r| r.id);
            let Some(id) = existing_id else {
                let mut fresh = repo;
                if fresh.id.is_nil() {
                    fresh.id = RepoId::new();
                }
                inner.repos.insert(fresh.id, fresh.clone());
                return Ok((fresh, true, false));
            };
            let stored = inner.repos.get_mut(&id).expect("repo present");
            let changed = stored.name != repo.name
                || stored.default_branch != repo.default_branch
                || stored.link != repo.link;
            if changed {
                stored.name = repo.name;
                stored.default_branch = repo.default_branch;
                stored.link = repo.link;
                stored.updated_at = now();
                stored.etag = Etag::mint();
            }
            Ok((stored.clone(), false, changed))
        })
        .await
    }

    async fn repo(&self, tx: Option<&mut Tx>, id: RepoId) -> Result<Repo> {
        self.with_inner(tx, move |inner| {
            inner
                .repos
                .get(&id)
                .filter(|r| r.deleted_at.is_none())
                .cloned()
                .ok_or_else(|| Error::not_found(id.to_string()))
        })
        .await
    }

    async fn upsert_group(
        &self,
        tx: Option<&mut Tx>,
        group: &Group,
    ) -> Result<(Group, bool, bool)> {
        let group = group.clone();
        self.with_inner(tx, move |inner| {
            let existing_id = inner
                .groups
                .values()
                .find(|g| match (&g.external_id, &group.external_id) {
                    (Some(a), Some(b)) => a == b,
                    _ => g.legal_entity_id == group.legal_entity_id && g.name == group.name,
                })
                .map(|g| g.id);
            let Some(id) = existing_id else {
                let mut fresh = group;
                if fresh.id.is_nil() {
                    fresh.id = GroupId::new();
                }
                inner.groups.insert(fresh.id, fresh.clone());
                return Ok((fresh, true, false));
            };
            let stored = inner.groups.get_mut(&id).expect("group present");
            let changed = stored.name != group.name;
            if changed {
                stored.name = group.name;
                stored.updated_at = now();
                stored.etag = Etag::mint();
            }
            Ok((stored.clone(), false, changed))
        })
        .await
    }

    async fn upsert_group_membership(
        &self,
        tx: Option<&mut Tx>,
        membership: &GroupMembership,
    ) -> Result<bool> {
        let membership = membership.clone();
        self.with_inner(tx, move |inner| {
            let exists = inner.memberships.iter().any(|m| {
                m.group_id == membership.group_id
                    && m.identity_id == membership.identity_id
                    && m.source_system == membership.source_system
            });
            if exists {
                return Ok(false);
            }
            inner.memberships.push(membership);
            Ok(true)
        })
        .await
    }

    async fn upsert_grant(&self, tx: Option<&mut Tx>, grant: &Grant) -> Result<bool> {
        let grant = grant.clone();
        self.with_inner(tx, move |inner| {
            let exists = inner.grants.iter().any(|g| {
                g.holder == grant.holder
                    && g.operation == grant.operation
                    && g.target_resource_id == grant.target_resource_id
            });
            if exists {
                return Ok(false);
            }
            inner.grants.push(grant);
            Ok(true)
        })
        .await
    }

    async fn create_identity(&self, tx: Option<&mut Tx>, identity: &Identity) -> Result<()> {
        let identity = identity.clone();
        self.with_inner(tx, move |inner| {
            if inner.identities.contains_key(&identity.id) {
                return Err(Error::AlreadyExists(identity.id.to_string()));
            }
            inner.identities.insert(identity.id, identity);
            Ok(())
        })
        .await
    }

    async fn identity_for_owner(
        &self,
        tx: Option<&mut Tx>,
        owner_resource_id: &str,
    ) -> Result<Option<Identity>> {
        let owner = owner_resource_id.to_string();
        self.with_inner(tx, move |inner| {
            Ok(inner
                .identities
                .values()
                .find(|i| i.owner_resource_id == owner)
                .cloned())
        })
        .await
    }

    // ── Runners ──

    async fn create_runner(&self, tx: Option<&mut Tx>, runner: &Runner) -> Result<()> {
        let runner = runner.clone();
        self.with_inner(tx, move |inner| {
            if inner.runners.contains_key(&runner.id) {
                return Err(Error::AlreadyExists(runner.id.to_string()));
            }
            inner.runners.insert(runner.id, runner);
            Ok(())
        })
        .await
    }

    async fn runner(&self, tx: Option<&mut Tx>, id: RunnerId) -> Result<Runner> {
        self.with_inner(tx, move |inner| {
            // Soft-deleted runners stay reachable.
            inner
                .runners
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::not_found(id.to_string()))
        })
        .await
    }

    async fn update_runner(&self, tx: Option<&mut Tx>, runner: &Runner) -> Result<Runner> {
        let runner = runner.clone();
        self.with_inner(tx, move |inner| {
            let stored = inner
                .runners
                .get_mut(&runner.id)
                .ok_or_else(|| Error::not_found(runner.id.to_string()))?;
            check_etag(&stored.etag, &runner.etag, "runner")?;
            let mut updated = runner;
            updated.updated_at = now();
            updated.etag = Etag::mint();
            *stored = updated.clone();
            Ok(updated)
        })
        .await
    }

    async fn soft_delete_runner(&self, tx: Option<&mut Tx>, id: RunnerId) -> Result<()> {
        self.with_inner(tx, move |inner| {
            let stored = inner
                .runners
                .get_mut(&id)
                .ok_or_else(|| Error::not_found(id.to_string()))?;
            stored.deleted_at = Some(now());
            stored.enabled = false;
            stored.updated_at = now();
            stored.etag = Etag::mint();
            Ok(())
        })
        .await
    }

    async fn runners_for_legal_entity(
        &self,
        tx: Option<&mut Tx>,
        legal_entity_id: LegalEntityId,
    ) -> Result<Vec<Runner>> {
        self.with_inner(tx, move |inner| {
            let mut runners: Vec<Runner> = inner
                .runners
                .values()
                .filter(|r| r.legal_entity_id == legal_entity_id && r.deleted_at.is_none())
                .cloned()
                .collect();
            runners.sort_by_key(|r| fifo_key(r.created_at, r.id));
            Ok(runners)
        })
        .await
    }

    // ── Work queue ──

    async fn create_work_item(&self, tx: Option<&mut Tx>, item: &WorkItem) -> Result<()> {
        let item = item.clone();
        self.with_inner(tx, move |inner| {
            if inner.work_items.contains_key(&item.id) {
                return Err(Error::AlreadyExists(item.id.to_string()));
            }
            if !inner.work_item_states.contains_key(&item.state_id) {
                return Err(Error::not_found(item.state_id.to_string()));
            }
            inner.work_items.insert(item.id, item);
            Ok(())
        })
        .await
    }

    async fn work_item(&self, tx: Option<&mut Tx>, id: WorkItemId) -> Result<WorkItem> {
        self.with_inner(tx, move |inner| {
            inner
                .work_items
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::not_found(id.to_string()))
        })
        .await
    }

    async fn update_work_item(&self, tx: Option<&mut Tx>, item: &WorkItem) -> Result<WorkItem> {
        let item = item.clone();
        self.with_inner(tx, move |inner| {
            let stored = inner
                .work_items
                .get_mut(&item.id)
                .ok_or_else(|| Error::not_found(item.id.to_string()))?;
            check_etag(&stored.etag, &item.etag, "work item")?;
            let mut updated = item;
            updated.updated_at = now();
            updated.etag = Etag::mint();
            *stored = updated.clone();
            Ok(updated)
        })
        .await
    }

    async fn delete_work_item(&self, tx: Option<&mut Tx>, id: WorkItemId) -> Result<()> {
        self.with_inner(tx, move |inner| {
            inner.work_items.remove(&id);
            Ok(())
        })
        .await
    }

    async fn get_or_create_work_item_state(
        &self,
        tx: Option<&mut Tx>,
        concurrency_key: Option<&str>,
    ) -> Result<WorkItemState> {
        let key = concurrency_key.map(str::to_string);
        self.with_inner(tx, move |inner| {
            if let Some(key) = &key {
                if let Some(state) = inner
                    .work_item_states
                    .values()
                    .find(|s| s.concurrency_key.as_deref() == Some(key.as_str()))
                {
                    return Ok(state.clone());
                }
            }
            let state = WorkItemState::fresh(key);
            inner.work_item_states.insert(state.id, state.clone());
            Ok(state)
        })
        .await
    }

    async fn work_item_state(
        &self,
        tx: Option<&mut Tx>,
        id: WorkItemStateId,
    ) -> Result<WorkItemState> {
        self.with_inner(tx, move |inner| {
            inner
                .work_item_states
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::not_found(id.to_string()))
        })
        .await
    }

    async fn update_work_item_state(
        &self,
        tx: Option<&mut Tx>,
        state: &WorkItemState,
    ) -> Result<WorkItemState> {
        let state = state.clone();
        self.with_inner(tx, move |inner| {
            let stored = inner
                .work_item_states
                .get_mut(&state.id)
                .ok_or_else(|| Error::not_found(state.id.to_string()))?;
            check_etag(&stored.etag, &state.etag, "work item state")?;
            let mut updated = state;
            updated.updated_at = now();
            updated.etag = Etag::mint();
            *stored = updated.clone();
            Ok(updated)
        })
        .await
    }

    async fn find_queued_work_item(
        &self,
        tx: &mut Tx,
        types: &[String],
        at: DateTime<Utc>,
        lease: Duration,
        processor: &str,
    ) -> Result<Option<(WorkItem, WorkItemState)>> {
        let types = types.to_vec();
        let processor = processor.to_string();
        self.with_inner(Some(tx), move |inner| {
            let mut candidates: Vec<WorkItem> = inner
                .work_items
                .values()
                .filter(|i| i.completed_at.is_none() && types.contains(&i.item_type))
                .cloned()
                .collect();
            candidates.sort_by_key(|i| fifo_key(i.created_at, i.id));

            for item in candidates {
                let Some(state) = inner.work_item_states.get_mut(&item.state_id) else {
                    continue;
                };
                if !state.allocatable_at(at) {
                    continue;
                }
                state.allocated_to = Some(processor.clone());
                state.allocated_at = Some(at);
                state.allocated_until = Some(at + lease);
                state.attempts_so_far += 1;
                state.updated_at = now();
                state.etag = Etag::mint();
                let state = state.clone();

                let stored_item = inner.work_items.get_mut(&item.id).expect("item present");
                stored_item.status = "processing".to_string();
                stored_item.updated_at = now();
                stored_item.etag = Etag::mint();
                return Ok(Some((stored_item.clone(), state)));
            }
            Ok(None)
        })
        .await
    }

    // ── Events ──

    async fn increment_event_counter(&self, tx: &mut Tx, build_id: BuildId) -> Result<u64> {
        self.with_inner(Some(tx), move |inner| {
            let seq = inner.event_seq.entry(build_id).or_insert(0);
            *seq += 1;
            Ok(*seq)
        })
        .await
    }

    async fn create_event(&self, tx: &mut Tx, event: &Event) -> Result<()> {
        let event = event.clone();
        self.with_inner(Some(tx), move |inner| {
            inner.events.entry(event.build_id).or_default().push(event);
            Ok(())
        })
        .await
    }

    async fn find_events(
        &self,
        tx: Option<&mut Tx>,
        build_id: BuildId,
        last_seq: u64,
        limit: usize,
    ) -> Result<Vec<Event>> {
        self.with_inner(tx, move |inner| {
            Ok(inner
                .events
                .get(&build_id)
                .map(|events| {
                    events
                        .iter()
                        .filter(|e| e.seq > last_seq)
                        .take(limit)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_build() -> Build {
        let at = now();
        Build {
            id: BuildId::new(),
            repo_id: RepoId::new(),
            commit_id: CommitId::new(),
            git_ref: "refs/heads/main".into(),
            build_number: 1,
            status: WorkflowStatus::Queued,
            timings: WorkflowTimings::default(),
            error: None,
            opts: BuildOptions::default(),
            created_at: at,
            updated_at: at,
            deleted_at: None,
            etag: Etag::mint(),
        }
    }

    fn make_commit(repo_id: RepoId, sha: &str) -> Commit {
        let at = now();
        Commit {
            id: CommitId::new(),
            repo_id,
            sha: sha.into(),
            message: String::new(),
            author_id: None,
            author_name: String::new(),
            author_email: String::new(),
            committer_id: None,
            committer_name: String::new(),
            committer_email: String::new(),
            config: None,
            config_type: ConfigType::Unknown,
            link: String::new(),
            created_at: at,
            updated_at: at,
            etag: Etag::mint(),
        }
    }

    #[tokio::test]
    async fn build_round_trip_and_etag() {
        let store = MemoryStore::new();
        let build = make_build();
        store.create_build(None, &build).await.unwrap();

        let mut loaded = store.build(None, build.id).await.unwrap();
        assert_eq!(loaded, build);

        loaded.status = WorkflowStatus::Running;
        let updated = store.update_build(None, &loaded).await.unwrap();
        assert_ne!(updated.etag, build.etag);

        // Stale etag loses.
        let mut stale = loaded;
        stale.status = WorkflowStatus::Failed;
        let err = store.update_build(None, &stale).await.unwrap_err();
        assert!(err.is_optimistic_lock());
    }

    #[tokio::test]
    async fn soft_deleted_build_is_unreachable() {
        let store = MemoryStore::new();
        let build = make_build();
        store.create_build(None, &build).await.unwrap();
        store.soft_delete_build(None, build.id).await.unwrap();
        assert!(store.build(None, build.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn soft_deleted_runner_stays_reachable() {
        let store = MemoryStore::new();
        let at = now();
        let runner = Runner {
            id: RunnerId::new(),
            legal_entity_id: LegalEntityId::new(),
            name: ResourceName::new("runner-1").unwrap(),
            labels: vec![],
            job_types: vec![JobType::Exec],
            enabled: true,
            created_at: at,
            updated_at: at,
            deleted_at: None,
            etag: Etag::mint(),
        };
        store.create_runner(None, &runner).await.unwrap();
        store.soft_delete_runner(None, runner.id).await.unwrap();
        let loaded = store.runner(None, runner.id).await.unwrap();
        assert!(loaded.deleted_at.is_some());
    }

    #[tokio::test]
    async fn uncommitted_tx_rolls_back_on_drop() {
        let store = MemoryStore::new();
        let build = make_build();
        {
            let mut tx = store.begin().await.unwrap();
            store.create_build(Some(&mut tx), &build).await.unwrap();
            // Dropped without commit.
        }
        assert!(store.build(None, build.id).await.unwrap_err().is_not_found());

        let mut tx = store.begin().await.unwrap();
        store.create_build(Some(&mut tx), &build).await.unwrap();
        store.commit(tx).await.unwrap();
        assert!(store.build(None, build.id).await.is_ok());
    }

    #[tokio::test]
    async fn build_numbers_are_monotonic_per_repo() {
        let store = MemoryStore::new();
        let repo_a = RepoId::new();
        let repo_b = RepoId::new();
        let mut tx = store.begin().await.unwrap();
        assert_eq!(store.next_build_number(&mut tx, repo_a).await.unwrap(), 1);
        assert_eq!(store.next_build_number(&mut tx, repo_a).await.unwrap(), 2);
        assert_eq!(store.next_build_number(&mut tx, repo_b).await.unwrap(), 1);
        store.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn commit_upsert_fills_forward_only() {
        let store = MemoryStore::new();
        let repo = RepoId::new();

        let bare = make_commit(repo, "abc123");
        let (stored, created, updated) = store.upsert_commit(None, &bare).await.unwrap();
        assert!(created && !updated);

        // Second pass fills config and author.
        let mut with_config = make_commit(repo, "abc123");
        with_config.config = Some("jobs: []".into());
        with_config.config_type = ConfigType::Yaml;
        with_config.author_name = "Ada".into();
        let (merged, created, updated) = store.upsert_commit(None, &with_config).await.unwrap();
        assert!(!created && updated);
        assert_eq!(merged.id, stored.id);
        assert_eq!(merged.config.as_deref(), Some("jobs: []"));
        assert_eq!(merged.author_name, "Ada");

        // Third pass must not overwrite non-empty values.
        let mut other = make_commit(repo, "abc123");
        other.config = Some("jobs: [different]".into());
        other.author_name = "Mallory".into();
        let (merged, created, updated) = store.upsert_commit(None, &other).await.unwrap();
        assert!(!created && !updated);
        assert_eq!(merged.config.as_deref(), Some("jobs: []"));
        assert_eq!(merged.author_name, "Ada");
    }

    #[tokio::test]
    async fn upsert_twice_is_identity() {
        let store = MemoryStore::new();
        let at = now();
        let entity = LegalEntity {
            id: LegalEntityId::nil(),
            name: ResourceName::new("acme").unwrap(),
            kind: LegalEntityKind::Company,
            external_id: ExternalResourceId::new("scm", "org-1"),
            email: "ops@acme.test".into(),
            created_at: at,
            updated_at: at,
            etag: Etag::mint(),
        };
        let (stored, created, updated) = store.upsert_legal_entity(None, &entity).await.unwrap();
        assert!(created && !updated);
        let (again, created, updated) = store.upsert_legal_entity(None, &entity).await.unwrap();
        assert!(!created && !updated);
        assert_eq!(again.id, stored.id);
    }

    #[tokio::test]
    async fn event_log_is_gap_free_and_strictly_after() {
        let store = MemoryStore::new();
        let build_id = BuildId::new();
        let mut tx = store.begin().await.unwrap();
        for i in 1..=5u64 {
            let seq = store
                .increment_event_counter(&mut tx, build_id)
                .await
                .unwrap();
            assert_eq!(seq, i);
            let event = Event {
                build_id,
                seq,
                kind: crate::events::EventKind::BuildStatusChanged,
                resource_id: build_id.to_string(),
                workflow: String::new(),
                job_name: String::new(),
                resource_name: String::new(),
                payload: crate::events::EventPayload::StatusChanged {
                    status: WorkflowStatus::Queued,
                    error: None,
                },
                created_at: now(),
            };
            store.create_event(&mut tx, &event).await.unwrap();
        }
        store.commit(tx).await.unwrap();

        let events = store.find_events(None, build_id, 2, 10).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        let none = store.find_events(None, build_id, 5, 10).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn hard_delete_removes_events() {
        let store = MemoryStore::new();
        let build = make_build();
        store.create_build(None, &build).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        store
            .increment_event_counter(&mut tx, build.id)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        store.hard_delete_build(None, build.id).await.unwrap();
        let events = store.find_events(None, build.id, 0, 10).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn search_builds_paginates_both_ways() {
        let store = MemoryStore::new();
        let repo = RepoId::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let mut b = make_build();
            b.repo_id = repo;
            store.create_build(None, &b).await.unwrap();
            ids.push(b.id);
        }
        ids.sort();

        let search = BuildSearch {
            repo_id: Some(repo),
            limit: 2,
            ..Default::default()
        };
        let page1 = store.search_builds(None, &search).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        assert_eq!(page1.items[0].id, ids[0]);
        assert!(page1.prev.is_none());
        let next = page1.next.clone().unwrap();

        let page2 = store
            .search_builds(
                None,
                &BuildSearch {
                    cursor: Some(next),
                    ..search.clone()
                },
            )
            .await
            .unwrap();
        assert_eq!(page2.items[0].id, ids[2]);
        assert!(page2.prev.is_some());

        // Cursors survive the opaque encoding.
        let token = page2.prev.unwrap().encode();
        let back = Cursor::decode(&token).unwrap();
        let page_back = store
            .search_builds(
                None,
                &BuildSearch {
                    cursor: Some(back),
                    ..search
                },
            )
            .await
            .unwrap();
        assert_eq!(page_back.items.len(), 2);
        assert_eq!(page_back.items[0].id, ids[0]);
    }

    #[tokio::test]
    async fn duplicate_job_fqn_within_build_rejected() {
        let store = MemoryStore::new();
        let build = make_build();
        store.create_build(None, &build).await.unwrap();
        let at = now();
        let mut job = Job {
            id: JobId::new(),
            build_id: build.id,
            repo_id: build.repo_id,
            commit_id: build.commit_id,
            git_ref: build.git_ref.clone(),
            workflow: String::new(),
            name: ResourceName::new("build").unwrap(),
            job_type: JobType::Exec,
            docker: None,
            runs_on: vec![],
            depends: vec![],
            services: vec![],
            environment: vec![],
            step_execution: StepExecution::Sequential,
            artifact_definitions: vec![],
            fingerprint_commands: vec![],
            fingerprint: None,
            fingerprint_hash_type: None,
            indirect_to_job_id: None,
            definition_hash: String::new(),
            runner_id: None,
            status: WorkflowStatus::Queued,
            timings: WorkflowTimings::default(),
            error: None,
            created_at: at,
            updated_at: at,
            deleted_at: None,
            etag: Etag::mint(),
        };
        store.create_job(None, &job).await.unwrap();
        job.id = JobId::new();
        let err = store.create_job(None, &job).await.unwrap_err();
        assert!(err.is_already_exists());
    }
}
