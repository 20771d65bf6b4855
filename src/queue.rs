use crate::adapters::{Authorizer, CommitState, CommitStatusNotification, ScmAdapter};
use crate::error::{Error, Result};
use crate::events::{append_status_event, EventKind};
use crate::graph::{definition_hash, BuildGraph, JobGraph};
use crate::ids::*;
use crate::parser::ConfigParser;
use crate::store::{BuildSearch, JobDependencyRow, Page, Store, Tx, TxScope};
use crate::types::*;
use crate::workqueue::{HandlerError, WorkHandler, WorkItem, WorkQueue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Work-item type for downstream commit-status notifications.
pub const COMMIT_STATUS_WORK_TYPE: &str = "notify-commit-status";

/// Configs above this size are stored as `invalid` and never queued.
pub const DEFAULT_MAX_CONFIG_LEN: usize = 256 * 1024;

/// How many queued jobs one dispatch pass inspects.
const DISPATCH_SCAN_LIMIT: usize = 100;

/// Queue & dispatch: turns validated commits into persisted build graphs,
/// hands ready jobs to polling runners, applies fingerprint elision, and
/// drives the status state machine with its event emissions and parent
/// roll-ups.
pub struct QueueService {
    store: Arc<dyn Store>,
    parser: Arc<dyn ConfigParser>,
    work_queue: Arc<WorkQueue>,
    authorizer: Arc<dyn Authorizer>,
}

impl QueueService {
    pub fn new(
        store: Arc<dyn Store>,
        parser: Arc<dyn ConfigParser>,
        work_queue: Arc<WorkQueue>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            store,
            parser,
            work_queue,
            authorizer,
        }
    }

    // ── Enqueue ──

    /// Turn a commit's pipeline config into a persisted, queued build:
    /// parse, form the graph, default and validate it, allocate the
    /// per-repo build number, fan out jobs/steps/dependency rows in one
    /// transaction, and emit the `queued` event.
    pub async fn enqueue_build_for_commit(
        &self,
        tx: Option<&mut Tx>,
        commit: &Commit,
        git_ref: &str,
        opts: BuildOptions,
    ) -> Result<BuildGraph> {
        let config = commit
            .config
            .as_ref()
            .ok_or_else(|| Error::not_found(format!("commit {} has no pipeline config", commit.sha)))?;
        let def = self
            .parser
            .parse(config.as_bytes(), commit.config_type)
            .map_err(|e| e.wrap("pipeline config"))?;

        let at = now();
        let build = Build {
            id: BuildId::nil(),
            repo_id: commit.repo_id,
            commit_id: commit.id,
            git_ref: git_ref.to_string(),
            build_number: 0,
            status: WorkflowStatus::Unknown,
            timings: WorkflowTimings::default(),
            error: None,
            opts: opts.clone(),
            created_at: at,
            updated_at: at,
            deleted_at: None,
            etag: Etag::mint(),
        };

        let mut graph = BuildGraph::from_definition(build, &def)?;
        graph.populate_defaults();
        graph.validate()?;
        if !opts.nodes_to_run.is_empty() {
            graph = graph.trim(&opts.nodes_to_run)?;
        }
        for jg in &mut graph.jobs {
            jg.job.definition_hash = definition_hash(jg);
        }

        let store = self.store.as_ref();
        let mut scope = TxScope::enter(store, tx).await?;
        graph.build.build_number = store
            .next_build_number(scope.tx(), graph.build.repo_id)
            .await?;
        store.create_build(Some(scope.tx()), &graph.build).await?;

        let ids_by_fqn: HashMap<NodeFqn, JobId> = graph
            .jobs
            .iter()
            .map(|jg| (jg.job.fqn(), jg.job.id))
            .collect();

        for jg in &graph.jobs {
            store.create_job(Some(scope.tx()), &jg.job).await?;
            for step in &jg.steps {
                store.create_step(Some(scope.tx()), step).await?;
            }
        }
        for jg in &graph.jobs {
            for dep in &jg.job.depends {
                // A target materialized in this build resolves now; a
                // cross-workflow target that does not exist yet is stored
                // deferred and fulfilled when the job appears.
                let target_job_id = ids_by_fqn.get(&dep.fqn()).copied();
                store
                    .create_job_dependency(
                        Some(scope.tx()),
                        &JobDependencyRow {
                            build_id: graph.build.id,
                            source_job_id: jg.job.id,
                            workflow: dep.workflow.clone(),
                            job_name: dep.job_name.clone(),
                            target_job_id,
                            created_at: graph.build.created_at,
                        },
                    )
                    .await?;
            }
        }

        append_status_event(
            store,
            scope.tx(),
            graph.build.id,
            EventKind::BuildStatusChanged,
            graph.build.id.to_string(),
            "",
            "",
            "",
            WorkflowStatus::Queued,
            None,
        )
        .await?;
        self.enqueue_commit_status(scope.tx(), &graph.build).await?;
        scope.commit(store).await?;

        tracing::info!(
            build_id = %graph.build.id,
            repo_id = %graph.build.repo_id,
            build_number = graph.build.build_number,
            jobs = graph.jobs.len(),
            "build queued"
        );
        Ok(graph)
    }

    /// Add jobs to an existing build (e.g. a workflow materialized late).
    /// Deferred dependency rows whose FQN matches a new job are fulfilled
    /// atomically with the insert.
    pub async fn add_jobs(
        &self,
        tx: Option<&mut Tx>,
        build_id: BuildId,
        mut new_jobs: Vec<JobGraph>,
    ) -> Result<Vec<JobGraph>> {
        let store = self.store.as_ref();
        let mut scope = TxScope::enter(store, tx).await?;
        store
            .lock_row_for_update(scope.tx(), &build_id.to_string())
            .await?;
        let build = store.build(Some(scope.tx()), build_id).await?;
        let existing = store.jobs_for_build(Some(scope.tx()), build_id).await?;

        let mut ids_by_fqn: HashMap<NodeFqn, JobId> =
            existing.iter().map(|j| (j.fqn(), j.id)).collect();
        let at = now();
        for jg in &mut new_jobs {
            let job = &mut jg.job;
            if job.id.is_nil() {
                job.id = JobId::new();
            }
            job.build_id = build.id;
            job.repo_id = build.repo_id;
            job.commit_id = build.commit_id;
            job.git_ref = build.git_ref.clone();
            job.created_at = at;
            job.updated_at = at;
            if job.status == WorkflowStatus::Unknown {
                job.status = WorkflowStatus::Queued;
            }
            job.timings.stamp(WorkflowStatus::Queued, at);
            for step in &mut jg.steps {
                if step.id.is_nil() {
                    step.id = StepId::new();
                }
                if step.log_descriptor_id.is_nil() {
                    step.log_descriptor_id = LogDescriptorId::new();
                }
                step.job_id = job.id;
                step.repo_id = job.repo_id;
                step.created_at = at;
                step.updated_at = at;
                if step.status == WorkflowStatus::Unknown {
                    step.status = WorkflowStatus::Queued;
                }
                step.timings.stamp(WorkflowStatus::Queued, at);
            }
            jg.job.definition_hash = definition_hash(jg);
            if let Some(errs) = Error::combine(
                jg.job
                    .validate()
                    .into_iter()
                    .chain(jg.steps.iter().flat_map(|s| s.validate()))
                    .map(|m| Error::validation(m))
                    .collect(),
            ) {
                return Err(errs);
            }
            ids_by_fqn.insert(jg.job.fqn(), jg.job.id);
        }

        for jg in &new_jobs {
            store.create_job(Some(scope.tx()), &jg.job).await?;
            for step in &jg.steps {
                store.create_step(Some(scope.tx()), step).await?;
            }
            for dep in &jg.job.depends {
                let target_job_id = ids_by_fqn.get(&dep.fqn()).copied();
                store
                    .create_job_dependency(
                        Some(scope.tx()),
                        &JobDependencyRow {
                            build_id: build.id,
                            source_job_id: jg.job.id,
                            workflow: dep.workflow.clone(),
                            job_name: dep.job_name.clone(),
                            target_job_id,
                            created_at: at,
                        },
                    )
                    .await?;
            }
            let fulfilled = store
                .fulfil_deferred_dependencies(
                    scope.tx(),
                    build.id,
                    &jg.job.workflow,
                    &jg.job.name,
                    jg.job.id,
                )
                .await?;
            if fulfilled > 0 {
                tracing::debug!(
                    build_id = %build.id,
                    job = %jg.job.fqn(),
                    fulfilled,
                    "fulfilled deferred dependencies"
                );
            }
        }

        scope.commit(store).await?;
        Ok(new_jobs)
    }

    // ── Dispatch ──

    /// Find one job ready for the polling runner: queued, every resolved
    /// dependency succeeded, no deferred dependency outstanding, job type
    /// and label set compatible. FIFO by `created_at`, tie-broken by id.
    /// A job whose upstream dependency failed or was canceled is failed
    /// here (dependency cascade) and never dispatched.
    pub async fn find_queued_job(&self, runner: &Runner) -> Result<Option<Job>> {
        if !runner.enabled || runner.deleted_at.is_some() {
            return Ok(None);
        }
        let store = self.store.as_ref();
        let mut tx = store.begin().await?;
        let queued = store
            .list_queued_jobs(Some(&mut tx), DISPATCH_SCAN_LIMIT)
            .await?;

        'candidates: for job in queued {
            if !runner.compatible_with(&job) {
                continue;
            }
            let deps = store.dependencies_for_job(Some(&mut tx), job.id).await?;
            for dep in &deps {
                let Some(target_id) = dep.target_job_id else {
                    // Deferred dependency not fulfilled yet.
                    continue 'candidates;
                };
                let target = store.job(Some(&mut tx), target_id).await?;
                match target.status {
                    WorkflowStatus::Succeeded => {}
                    WorkflowStatus::Failed | WorkflowStatus::Canceled => {
                        self.fail_for_dependency(&mut tx, &job, &target).await?;
                        continue 'candidates;
                    }
                    _ => continue 'candidates,
                }
            }

            store
                .lock_row_for_update(&mut tx, &job.build_id.to_string())
                .await?;
            let mut submitted = job.clone();
            submitted.status = WorkflowStatus::Submitted;
            submitted.runner_id = Some(runner.id);
            submitted.timings.stamp(WorkflowStatus::Submitted, now());
            let submitted = store.update_job(Some(&mut tx), &submitted).await?;
            self.append_job_event(&mut tx, &submitted).await?;

            let build = store.build(Some(&mut tx), submitted.build_id).await?;
            if build.status == WorkflowStatus::Queued {
                self.transition_build(&mut tx, build, WorkflowStatus::Running, None)
                    .await?;
            }
            store.commit(tx).await?;
            tracing::info!(
                job = %submitted.fqn(),
                job_id = %submitted.id,
                runner_id = %runner.id,
                "job dispatched"
            );
            return Ok(Some(submitted));
        }

        store.commit(tx).await?;
        Ok(None)
    }

    // ── Fingerprint elision ──

    /// Record the fingerprint a runner computed for a job. When a prior
    /// successful job in the same repo/workflow/name has the identical
    /// fingerprint and the build does not force execution, the job is
    /// elided: marked succeeded without running, indirected to the prior
    /// job, with the prior job's artifacts logically re-bound.
    pub async fn report_fingerprint(
        &self,
        job_id: JobId,
        etag: &Etag,
        fingerprint: &str,
        hash_type: HashType,
    ) -> Result<Job> {
        let store = self.store.as_ref();
        let mut tx = store.begin().await?;
        let mut job = store.job(Some(&mut tx), job_id).await?;
        if &job.etag != etag {
            return Err(Error::OptimisticLock(format!("job {job_id}: etag mismatch")));
        }
        job.fingerprint = Some(fingerprint.to_string());
        job.fingerprint_hash_type = Some(hash_type);

        let build = store.build(Some(&mut tx), job.build_id).await?;
        let prior = if build.opts.force {
            None
        } else {
            store
                .find_fingerprint_match(
                    Some(&mut tx),
                    job.repo_id,
                    &job.workflow,
                    &job.name,
                    fingerprint,
                    hash_type,
                )
                .await?
                .filter(|p| p.id != job.id)
        };

        let Some(prior) = prior else {
            let job = store.update_job(Some(&mut tx), &job).await?;
            store.commit(tx).await?;
            return Ok(job);
        };

        job.indirect_to_job_id = Some(prior.id);
        job.status = WorkflowStatus::Succeeded;
        job.error = None;
        job.timings.stamp(WorkflowStatus::Succeeded, now());
        let job = store.update_job(Some(&mut tx), &job).await?;

        // The job never executes, so its steps complete with it.
        for step in store.steps_for_job(Some(&mut tx), job.id).await? {
            if step.status.is_terminal() {
                continue;
            }
            let mut done = step;
            done.status = WorkflowStatus::Succeeded;
            done.timings.stamp(WorkflowStatus::Succeeded, now());
            let done = store.update_step(Some(&mut tx), &done).await?;
            self.append_step_event(&mut tx, &job, &done).await?;
        }

        for artifact in store.artifacts_for_job(Some(&mut tx), prior.id, None).await? {
            let rebound = Artifact {
                id: ArtifactId::new(),
                job_id: job.id,
                created_at: now(),
                updated_at: now(),
                etag: Etag::mint(),
                ..artifact
            };
            store.create_artifact(Some(&mut tx), &rebound).await?;
        }

        self.append_job_event(&mut tx, &job).await?;
        self.roll_up_build(&mut tx, job.build_id).await?;
        store.commit(tx).await?;
        tracing::info!(
            job = %job.fqn(),
            job_id = %job.id,
            prior_job_id = %prior.id,
            "job elided to prior identical fingerprint"
        );
        Ok(job)
    }

    // ── Status transitions ──

    /// Transition a step, then roll up: first running step sets its job
    /// running; once all steps are terminal the job completes (any failed
    /// step fails the job), which in turn may complete the build.
    pub async fn update_step_status(
        &self,
        step_id: StepId,
        etag: &Etag,
        new_status: WorkflowStatus,
        error: Option<String>,
    ) -> Result<Step> {
        let store = self.store.as_ref();
        let mut tx = store.begin().await?;
        let step = store.step(Some(&mut tx), step_id).await?;
        if &step.etag != etag {
            return Err(Error::OptimisticLock(format!(
                "step {step_id}: etag mismatch"
            )));
        }
        if !step.status.can_transition_to(new_status) {
            return Err(Error::validation(format!(
                "step {}: illegal transition {} → {new_status}",
                step.name, step.status
            )));
        }
        let mut updated = step;
        updated.status = new_status;
        updated.error = error;
        updated.timings.stamp(new_status, now());
        let updated = store.update_step(Some(&mut tx), &updated).await?;

        let job = store.job(Some(&mut tx), updated.job_id).await?;
        self.append_step_event(&mut tx, &job, &updated).await?;
        self.roll_up_job(&mut tx, job).await?;
        store.commit(tx).await?;
        Ok(updated)
    }

    /// Direct job transition (runner-reported, e.g. environment setup
    /// failure before any step ran). Rolls up to the build.
    pub async fn update_job_status(
        &self,
        job_id: JobId,
        etag: &Etag,
        new_status: WorkflowStatus,
        error: Option<String>,
    ) -> Result<Job> {
        let store = self.store.as_ref();
        let mut tx = store.begin().await?;
        let job = store.job(Some(&mut tx), job_id).await?;
        if &job.etag != etag {
            return Err(Error::OptimisticLock(format!("job {job_id}: etag mismatch")));
        }
        if !job.status.can_transition_to(new_status) {
            return Err(Error::validation(format!(
                "job {}: illegal transition {} → {new_status}",
                job.fqn(),
                job.status
            )));
        }
        let mut updated = job;
        updated.status = new_status;
        updated.error = error;
        updated.timings.stamp(new_status, now());
        let updated = store.update_job(Some(&mut tx), &updated).await?;
        self.append_job_event(&mut tx, &updated).await?;
        self.roll_up_build(&mut tx, updated.build_id).await?;
        store.commit(tx).await?;
        Ok(updated)
    }

    /// Cancel every non-terminal job and step of the build, then the
    /// build itself.
    pub async fn cancel_build(&self, build_id: BuildId) -> Result<Build> {
        let store = self.store.as_ref();
        let mut tx = store.begin().await?;
        store
            .lock_row_for_update(&mut tx, &build_id.to_string())
            .await?;
        let build = store.build(Some(&mut tx), build_id).await?;
        if build.status.is_terminal() {
            store.commit(tx).await?;
            return Ok(build);
        }

        for job in store.jobs_for_build(Some(&mut tx), build_id).await? {
            if job.status.is_terminal() {
                continue;
            }
            for step in store.steps_for_job(Some(&mut tx), job.id).await? {
                if step.status.is_terminal() {
                    continue;
                }
                let mut canceled = step;
                canceled.status = WorkflowStatus::Canceled;
                canceled.timings.stamp(WorkflowStatus::Canceled, now());
                let canceled = store.update_step(Some(&mut tx), &canceled).await?;
                self.append_step_event(&mut tx, &job, &canceled).await?;
            }
            let mut canceled = job;
            canceled.status = WorkflowStatus::Canceled;
            canceled.timings.stamp(WorkflowStatus::Canceled, now());
            let canceled = store.update_job(Some(&mut tx), &canceled).await?;
            self.append_job_event(&mut tx, &canceled).await?;
        }

        let build = self
            .transition_build(&mut tx, build, WorkflowStatus::Canceled, None)
            .await?;
        store.commit(tx).await?;
        tracing::info!(build_id = %build.id, "build canceled");
        Ok(build)
    }

    // ── Search ──

    /// Cursor-paginated build search. With an identity, only builds whose
    /// repo the identity may read survive the filter.
    pub async fn search_builds(
        &self,
        identity: Option<IdentityId>,
        search: &BuildSearch,
    ) -> Result<Page<Build>> {
        let mut page = self.store.search_builds(None, search).await?;
        if let Some(identity) = identity {
            let mut allowed = Vec::with_capacity(page.items.len());
            for build in page.items {
                if self
                    .authorizer
                    .is_authorized(identity, "build.read", &build.repo_id.to_string())
                    .await?
                {
                    allowed.push(build);
                }
            }
            page.items = allowed;
        }
        Ok(page)
    }

    pub async fn find_events(
        &self,
        build_id: BuildId,
        last_seq: u64,
        limit: usize,
    ) -> Result<Vec<crate::events::Event>> {
        self.store.find_events(None, build_id, last_seq, limit).await
    }

    // ── Runners ──

    /// Register a runner and mint its identity.
    pub async fn register_runner(
        &self,
        legal_entity_id: LegalEntityId,
        name: ResourceName,
        labels: Vec<Label>,
        job_types: Vec<JobType>,
    ) -> Result<Runner> {
        let store = self.store.as_ref();
        let at = now();
        let runner = Runner {
            id: RunnerId::new(),
            legal_entity_id,
            name,
            labels,
            job_types,
            enabled: true,
            created_at: at,
            updated_at: at,
            deleted_at: None,
            etag: Etag::mint(),
        };
        let mut scope = TxScope::enter(store, None).await?;
        store.create_runner(Some(scope.tx()), &runner).await?;
        store
            .create_identity(
                Some(scope.tx()),
                &Identity {
                    id: IdentityId::new(),
                    owner_resource_id: runner.id.to_string(),
                    created_at: at,
                },
            )
            .await?;
        scope.commit(store).await?;
        Ok(runner)
    }

    // ── Internal transitions ──

    async fn fail_for_dependency(&self, tx: &mut Tx, job: &Job, failed_dep: &Job) -> Result<()> {
        let reason = Error::DependencyFailed(format!(
            "dependency {} ended {}",
            failed_dep.fqn(),
            failed_dep.status
        ));
        let mut failed = job.clone();
        failed.status = WorkflowStatus::Failed;
        failed.error = Some(reason.to_string());
        failed.timings.stamp(WorkflowStatus::Failed, now());
        let failed = self.store.update_job(Some(tx), &failed).await?;
        self.append_job_event(tx, &failed).await?;
        tracing::info!(
            job = %failed.fqn(),
            job_id = %failed.id,
            dependency = %failed_dep.fqn(),
            "job failed: upstream dependency did not succeed"
        );
        self.roll_up_build(tx, failed.build_id).await
    }

    async fn roll_up_job(&self, tx: &mut Tx, job: Job) -> Result<()> {
        let store = self.store.as_ref();
        let steps = store.steps_for_job(Some(tx), job.id).await?;

        if steps
            .iter()
            .any(|s| s.status == WorkflowStatus::Running)
            && job.status == WorkflowStatus::Submitted
        {
            let mut running = job;
            running.status = WorkflowStatus::Running;
            running.timings.stamp(WorkflowStatus::Running, now());
            let running = store.update_job(Some(tx), &running).await?;
            self.append_job_event(tx, &running).await?;
            return Ok(());
        }

        if job.status.is_terminal() || !steps.iter().all(|s| s.status.is_terminal()) {
            return Ok(());
        }

        let failed_step = steps.iter().find(|s| s.status == WorkflowStatus::Failed);
        let (status, error) = match failed_step {
            Some(step) => (
                WorkflowStatus::Failed,
                Some(format!("step {} failed", step.name)),
            ),
            None if steps.iter().any(|s| s.status == WorkflowStatus::Canceled) => {
                (WorkflowStatus::Canceled, None)
            }
            None => (WorkflowStatus::Succeeded, None),
        };
        let mut done = job;
        done.status = status;
        done.error = error;
        done.timings.stamp(status, now());
        let done = store.update_job(Some(tx), &done).await?;
        self.append_job_event(tx, &done).await?;
        self.roll_up_build(tx, done.build_id).await
    }

    async fn roll_up_build(&self, tx: &mut Tx, build_id: BuildId) -> Result<()> {
        let store = self.store.as_ref();
        let build = store.build(Some(tx), build_id).await?;
        if build.status.is_terminal() {
            return Ok(());
        }
        let jobs = store.jobs_for_build(Some(tx), build_id).await?;
        if jobs.is_empty() || !jobs.iter().all(|j| j.status.is_terminal()) {
            return Ok(());
        }
        let failed = jobs
            .iter()
            .filter(|j| j.status == WorkflowStatus::Failed)
            .count();
        let (status, error) = if failed > 0 {
            (WorkflowStatus::Failed, Some(format!("{failed} job(s) failed")))
        } else if jobs.iter().any(|j| j.status == WorkflowStatus::Canceled) {
            (WorkflowStatus::Canceled, None)
        } else {
            (WorkflowStatus::Succeeded, None)
        };
        self.transition_build(tx, build, status, error).await?;
        Ok(())
    }

    async fn transition_build(
        &self,
        tx: &mut Tx,
        build: Build,
        status: WorkflowStatus,
        error: Option<String>,
    ) -> Result<Build> {
        if !build.status.can_transition_to(status) {
            return Err(Error::validation(format!(
                "build {}: illegal transition {} → {status}",
                build.id, build.status
            )));
        }
        let mut updated = build;
        updated.status = status;
        updated.error = error.clone();
        updated.timings.stamp(status, now());
        let updated = self.store.update_build(Some(tx), &updated).await?;
        append_status_event(
            self.store.as_ref(),
            tx,
            updated.id,
            EventKind::BuildStatusChanged,
            updated.id.to_string(),
            "",
            "",
            "",
            status,
            error,
        )
        .await?;
        self.enqueue_commit_status(tx, &updated).await?;
        tracing::info!(build_id = %updated.id, status = %status, "build status changed");
        Ok(updated)
    }

    async fn append_job_event(&self, tx: &mut Tx, job: &Job) -> Result<()> {
        append_status_event(
            self.store.as_ref(),
            tx,
            job.build_id,
            EventKind::JobStatusChanged,
            job.id.to_string(),
            &job.workflow,
            job.name.as_str(),
            job.name.as_str(),
            job.status,
            job.error.clone(),
        )
        .await?;
        Ok(())
    }

    async fn append_step_event(&self, tx: &mut Tx, job: &Job, step: &Step) -> Result<()> {
        append_status_event(
            self.store.as_ref(),
            tx,
            job.build_id,
            EventKind::StepStatusChanged,
            step.id.to_string(),
            &job.workflow,
            job.name.as_str(),
            step.name.as_str(),
            step.status,
            step.error.clone(),
        )
        .await?;
        Ok(())
    }

    /// Queue a commit-status notification for the build's current status,
    /// keyed per repo so deliveries to one host repo stay serialized.
    async fn enqueue_commit_status(&self, tx: &mut Tx, build: &Build) -> Result<()> {
        let payload = CommitStatusPayload {
            build_id: build.id,
            repo_id: build.repo_id,
            commit_id: build.commit_id,
            status: build.status,
        };
        self.work_queue
            .add(
                Some(tx),
                COMMIT_STATUS_WORK_TYPE,
                serde_json::to_string(&payload)?,
                Some(format!("commit-status:{}", build.repo_id)),
            )
            .await?;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitStatusPayload {
    pub build_id: BuildId,
    pub repo_id: RepoId,
    pub commit_id: CommitId,
    pub status: WorkflowStatus,
}

/// Work-queue handler that delivers commit-status notifications through
/// the source-control adapter. Retryable host failures reschedule under
/// the registered back-off policy.
pub struct CommitStatusHandler {
    store: Arc<dyn Store>,
    scm: Arc<dyn ScmAdapter>,
    /// `context` string shown next to the status on the host.
    pub context: String,
    /// Base URL builds are linked from, e.g. the UI's build page.
    pub target_url_base: String,
}

impl CommitStatusHandler {
    pub fn new(store: Arc<dyn Store>, scm: Arc<dyn ScmAdapter>) -> Self {
        Self {
            store,
            scm,
            context: "gantry/build".to_string(),
            target_url_base: String::new(),
        }
    }
}

#[async_trait]
impl WorkHandler for CommitStatusHandler {
    async fn handle(&self, item: &WorkItem) -> std::result::Result<(), HandlerError> {
        let payload: CommitStatusPayload = serde_json::from_str(&item.data)
            .map_err(|e| HandlerError::terminal(format!("malformed payload: {e}")))?;
        let load = async {
            let repo = self.store.repo(None, payload.repo_id).await?;
            let commit = self.store.commit_by_id(None, payload.commit_id).await?;
            let owner = self.store.legal_entity(None, repo.legal_entity_id).await?;
            Ok::<_, Error>((repo, commit, owner))
        };
        let (repo, commit, owner) = load
            .await
            .map_err(|e| HandlerError::terminal(e.to_string()))?;

        let state = CommitState::from_workflow_status(payload.status);
        let notification = CommitStatusNotification {
            installation_id: repo.external_id.system.clone(),
            owner: owner.name.as_str().to_string(),
            repo: repo.name.as_str().to_string(),
            sha: commit.sha.clone(),
            state,
            target_url: format!("{}/{}", self.target_url_base, payload.build_id),
            description: format!("build {}", payload.status),
            context: self.context.clone(),
        };
        match self.scm.notify_commit_status(&notification).await {
            Ok(receipt) => {
                tracing::debug!(
                    build_id = %payload.build_id,
                    state = state.as_str(),
                    status_code = receipt.status_code,
                    "commit status delivered"
                );
                Ok(())
            }
            Err(e) => Err(HandlerError {
                can_retry: e.is_retryable(),
                message: e.to_string(),
            }),
        }
    }
}
