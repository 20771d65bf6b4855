use crate::error::{Error, Result};
use crate::events::Event;
use crate::ids::*;
use crate::types::*;
use crate::workqueue::{WorkItem, WorkItemState};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::any::Any;

/// An in-flight transaction. The concrete state is backend-owned and
/// reached by downcast; callers treat the value as opaque and move it
/// between store calls.
///
/// Dropping an uncommitted `Tx` rolls it back.
pub struct Tx {
    inner: Box<dyn Any + Send>,
}

impl Tx {
    pub fn new(inner: Box<dyn Any + Send>) -> Self {
        Self { inner }
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Result<&mut T> {
        self.inner
            .downcast_mut::<T>()
            .ok_or_else(|| Error::internal("transaction belongs to a different store backend"))
    }

    pub fn into_inner(self) -> Box<dyn Any + Send> {
        self.inner
    }
}

/// Borrow the caller's transaction or open (and later commit) our own.
///
/// This is how multi-write operations compose: every service method takes
/// `Option<&mut Tx>`, enters a scope, performs its writes through
/// `scope.tx()`, and commits. When the caller supplied a transaction the
/// commit is theirs to make; when it didn't, the scope owns it. Early
/// returns drop an owned transaction, which rolls it back.
pub enum TxScope<'a> {
    Borrowed(&'a mut Tx),
    Owned(Tx),
}

impl<'a> TxScope<'a> {
    pub async fn enter(store: &dyn Store, existing: Option<&'a mut Tx>) -> Result<TxScope<'a>> {
        Ok(match existing {
            Some(tx) => TxScope::Borrowed(tx),
            None => TxScope::Owned(store.begin().await?),
        })
    }

    pub fn tx(&mut self) -> &mut Tx {
        match self {
            TxScope::Borrowed(tx) => tx,
            TxScope::Owned(tx) => tx,
        }
    }

    /// Commit if this scope owns the transaction; a borrowed transaction
    /// is left for the caller to commit.
    pub async fn commit(self, store: &dyn Store) -> Result<()> {
        match self {
            TxScope::Borrowed(_) => Ok(()),
            TxScope::Owned(tx) => store.commit(tx).await,
        }
    }
}

/// One page of a cursor-paginated listing.
#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<Cursor>,
    pub prev: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next: None,
            prev: None,
        }
    }
}

pub const DEFAULT_SEARCH_LIMIT: usize = 30;

#[derive(Clone, Debug)]
pub struct BuildSearch {
    pub repo_id: Option<RepoId>,
    pub commit_id: Option<CommitId>,
    pub git_ref: Option<String>,
    pub exclude_statuses: Vec<WorkflowStatus>,
    pub limit: usize,
    pub cursor: Option<Cursor>,
}

impl Default for BuildSearch {
    fn default() -> Self {
        Self {
            repo_id: None,
            commit_id: None,
            git_ref: None,
            exclude_statuses: Vec::new(),
            limit: DEFAULT_SEARCH_LIMIT,
            cursor: None,
        }
    }
}

/// One persisted job-dependency edge. `target_job_id` is `None` for a
/// deferred cross-workflow dependency whose target job does not exist
/// yet; fulfilment rewrites it in place.
#[derive(Clone, Debug, PartialEq)]
pub struct JobDependencyRow {
    pub build_id: BuildId,
    pub source_job_id: JobId,
    pub workflow: String,
    pub job_name: ResourceName,
    pub target_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
}

impl JobDependencyRow {
    pub fn is_deferred(&self) -> bool {
        self.target_job_id.is_none()
    }
}

/// The persistence boundary for the whole engine.
///
/// Mutating operations accept an optional in-flight transaction so
/// callers can compose multiple writes atomically; `None` autocommits.
/// Methods that only make sense transactionally (row locks, counters,
/// work-item allocation) require one.
///
/// Every update of a mutable resource validates the caller's etag and
/// fails with `optimistic-lock-failed` on mismatch. Soft-deleted
/// resources are unreachable by id lookup, with the single exception of
/// runners.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Transactions ──

    async fn begin(&self) -> Result<Tx>;
    async fn commit(&self, tx: Tx) -> Result<()>;
    async fn rollback(&self, tx: Tx) -> Result<()>;

    /// Take an exclusive row lock on the given resource until the
    /// transaction ends. Supported for builds, commits, runners and
    /// work-item states.
    async fn lock_row_for_update(&self, tx: &mut Tx, resource_id: &str) -> Result<()>;

    // ── Builds ──

    async fn create_build(&self, tx: Option<&mut Tx>, build: &Build) -> Result<()>;
    async fn build(&self, tx: Option<&mut Tx>, id: BuildId) -> Result<Build>;
    async fn update_build(&self, tx: Option<&mut Tx>, build: &Build) -> Result<Build>;
    async fn soft_delete_build(&self, tx: Option<&mut Tx>, id: BuildId) -> Result<()>;
    /// Hard delete: removes the build row and its event log.
    async fn hard_delete_build(&self, tx: Option<&mut Tx>, id: BuildId) -> Result<()>;
    /// Allocate the next monotonic build number for the repo.
    async fn next_build_number(&self, tx: &mut Tx, repo_id: RepoId) -> Result<u64>;
    async fn builds_for_commit(
        &self,
        tx: Option<&mut Tx>,
        commit_id: CommitId,
        git_ref: &str,
        exclude_statuses: &[WorkflowStatus],
    ) -> Result<Vec<Build>>;
    async fn search_builds(&self, tx: Option<&mut Tx>, search: &BuildSearch)
        -> Result<Page<Build>>;

    // ── Jobs ──

    async fn create_job(&self, tx: Option<&mut Tx>, job: &Job) -> Result<()>;
    async fn job(&self, tx: Option<&mut Tx>, id: JobId) -> Result<Job>;
    async fn update_job(&self, tx: Option<&mut Tx>, job: &Job) -> Result<Job>;
    async fn jobs_for_build(&self, tx: Option<&mut Tx>, build_id: BuildId) -> Result<Vec<Job>>;
    /// Queued, not-deleted jobs across all builds, FIFO by `created_at`
    /// then id.
    async fn list_queued_jobs(&self, tx: Option<&mut Tx>, limit: usize) -> Result<Vec<Job>>;
    /// The most recent successful job in the repo with the same workflow,
    /// job name, fingerprint and fingerprint hash type.
    async fn find_fingerprint_match(
        &self,
        tx: Option<&mut Tx>,
        repo_id: RepoId,
        workflow: &str,
        job_name: &ResourceName,
        fingerprint: &str,
        hash_type: HashType,
    ) -> Result<Option<Job>>;

    // ── Job dependencies ──

    async fn create_job_dependency(
        &self,
        tx: Option<&mut Tx>,
        dep: &JobDependencyRow,
    ) -> Result<()>;
    async fn dependencies_for_job(
        &self,
        tx: Option<&mut Tx>,
        job_id: JobId,
    ) -> Result<Vec<JobDependencyRow>>;
    /// Rewrite every deferred dependency row in the build matching
    /// (workflow, job_name) to reference `target`. Returns the number of
    /// rows fulfilled.
    async fn fulfil_deferred_dependencies(
        &self,
        tx: &mut Tx,
        build_id: BuildId,
        workflow: &str,
        job_name: &ResourceName,
        target: JobId,
    ) -> Result<u64>;

    // ── Steps ──

    async fn create_step(&self, tx: Option<&mut Tx>, step: &Step) -> Result<()>;
    async fn step(&self, tx: Option<&mut Tx>, id: StepId) -> Result<Step>;
    async fn update_step(&self, tx: Option<&mut Tx>, step: &Step) -> Result<Step>;
    async fn steps_for_job(&self, tx: Option<&mut Tx>, job_id: JobId) -> Result<Vec<Step>>;

    // ── Artifacts ──

    async fn create_artifact(&self, tx: Option<&mut Tx>, artifact: &Artifact) -> Result<()>;
    async fn artifact(&self, tx: Option<&mut Tx>, id: ArtifactId) -> Result<Artifact>;
    async fn update_artifact(&self, tx: Option<&mut Tx>, artifact: &Artifact) -> Result<Artifact>;
    async fn artifacts_for_job(
        &self,
        tx: Option<&mut Tx>,
        job_id: JobId,
        group_name: Option<&ResourceName>,
    ) -> Result<Vec<Artifact>>;

    // ── Commits ──

    /// Insert or fill-forward the commit keyed by (repo, sha). Existing
    /// non-empty config, config type and author/committer identities are
    /// never overwritten. Returns `(commit, created, updated)`.
    async fn upsert_commit(
        &self,
        tx: Option<&mut Tx>,
        commit: &Commit,
    ) -> Result<(Commit, bool, bool)>;
    async fn commit_by_id(&self, tx: Option<&mut Tx>, id: CommitId) -> Result<Commit>;
    async fn commit_by_sha(
        &self,
        tx: Option<&mut Tx>,
        repo_id: RepoId,
        sha: &str,
    ) -> Result<Option<Commit>>;

    // ── Tenant model ──

    async fn upsert_legal_entity(
        &self,
        tx: Option<&mut Tx>,
        entity: &LegalEntity,
    ) -> Result<(LegalEntity, bool, bool)>;
    async fn legal_entity(&self, tx: Option<&mut Tx>, id: LegalEntityId) -> Result<LegalEntity>;
    async fn upsert_repo(&self, tx: Option<&mut Tx>, repo: &Repo) -> Result<(Repo, bool, bool)>;
    async fn repo(&self, tx: Option<&mut Tx>, id: RepoId) -> Result<Repo>;
    async fn upsert_group(
        &self,
        tx: Option<&mut Tx>,
        group: &Group,
    ) -> Result<(Group, bool, bool)>;
    /// Returns true when the membership row was created (false: already
    /// present).
    async fn upsert_group_membership(
        &self,
        tx: Option<&mut Tx>,
        membership: &GroupMembership,
    ) -> Result<bool>;
    async fn upsert_grant(&self, tx: Option<&mut Tx>, grant: &Grant) -> Result<bool>;
    async fn create_identity(&self, tx: Option<&mut Tx>, identity: &Identity) -> Result<()>;
    async fn identity_for_owner(
        &self,
        tx: Option<&mut Tx>,
        owner_resource_id: &str,
    ) -> Result<Option<Identity>>;

    // ── Runners ──

    async fn create_runner(&self, tx: Option<&mut Tx>, runner: &Runner) -> Result<()>;
    /// Runners stay reachable after soft-deletion.
    async fn runner(&self, tx: Option<&mut Tx>, id: RunnerId) -> Result<Runner>;
    async fn update_runner(&self, tx: Option<&mut Tx>, runner: &Runner) -> Result<Runner>;
    async fn soft_delete_runner(&self, tx: Option<&mut Tx>, id: RunnerId) -> Result<()>;
    async fn runners_for_legal_entity(
        &self,
        tx: Option<&mut Tx>,
        legal_entity_id: LegalEntityId,
    ) -> Result<Vec<Runner>>;

    // ── Work queue ──

    async fn create_work_item(&self, tx: Option<&mut Tx>, item: &WorkItem) -> Result<()>;
    async fn work_item(&self, tx: Option<&mut Tx>, id: WorkItemId) -> Result<WorkItem>;
    async fn update_work_item(&self, tx: Option<&mut Tx>, item: &WorkItem) -> Result<WorkItem>;
    async fn delete_work_item(&self, tx: Option<&mut Tx>, id: WorkItemId) -> Result<()>;
    /// Find the state row for the concurrency key, creating it if absent.
    /// `None` always creates a fresh, unshared row.
    async fn get_or_create_work_item_state(
        &self,
        tx: Option<&mut Tx>,
        concurrency_key: Option<&str>,
    ) -> Result<WorkItemState>;
    async fn work_item_state(
        &self,
        tx: Option<&mut Tx>,
        id: WorkItemStateId,
    ) -> Result<WorkItemState>;
    async fn update_work_item_state(
        &self,
        tx: Option<&mut Tx>,
        state: &WorkItemState,
    ) -> Result<WorkItemState>;
    /// Atomically allocate the oldest eligible queued work item of one of
    /// `types`: not completed, state not allocated (or lease expired),
    /// `not_before` due. Takes a row lock on the state row, stamps the
    /// lease for `processor` and increments `attempts_so_far`.
    async fn find_queued_work_item(
        &self,
        tx: &mut Tx,
        types: &[String],
        now: DateTime<Utc>,
        lease: Duration,
        processor: &str,
    ) -> Result<Option<(WorkItem, WorkItemState)>>;

    // ── Events ──

    /// Atomically increment and return the build's event counter.
    async fn increment_event_counter(&self, tx: &mut Tx, build_id: BuildId) -> Result<u64>;
    async fn create_event(&self, tx: &mut Tx, event: &Event) -> Result<()>;
    /// Up to `limit` events with sequence numbers strictly greater than
    /// `last_seq`, in sequence order. Non-blocking; callers poll.
    async fn find_events(
        &self,
        tx: Option<&mut Tx>,
        build_id: BuildId,
        last_seq: u64,
        limit: usize,
    ) -> Result<Vec<Event>>;
}
