//! End-to-end scenarios driving intake, enqueue, dispatch, elision and
//! the event log against the in-memory store.

use async_trait::async_trait;
use gantry::adapters::*;
use gantry::error::Result;
use gantry::events::{Event, EventPayload};
use gantry::graph::{BuildGraph, JobGraph};
use gantry::ids::*;
use gantry::intake::IntakeService;
use gantry::parser::StandardParser;
use gantry::queue::{CommitStatusHandler, QueueService, COMMIT_STATUS_WORK_TYPE};
use gantry::retry::BackoffPolicy;
use gantry::store::{BuildSearch, Store};
use gantry::store_memory::MemoryStore;
use gantry::types::*;
use gantry::workqueue::WorkQueue;
use std::sync::Arc;

// ─── Harness ──────────────────────────────────────────────────

struct Harness {
    store: Arc<dyn Store>,
    queue: Arc<QueueService>,
    work_queue: Arc<WorkQueue>,
    repo: Repo,
    runner: Runner,
}

async fn harness() -> Harness {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let work_queue = Arc::new(WorkQueue::new(store.clone()));
    let queue = Arc::new(QueueService::new(
        store.clone(),
        Arc::new(StandardParser),
        work_queue.clone(),
        Arc::new(AllowAll),
    ));

    let at = now();
    let (owner, _, _) = store
        .upsert_legal_entity(
            None,
            &LegalEntity {
                id: LegalEntityId::nil(),
                name: ResourceName::new("acme").unwrap(),
                kind: LegalEntityKind::Company,
                external_id: ExternalResourceId::new("scm", "org-1"),
                email: String::new(),
                created_at: at,
                updated_at: at,
                etag: Etag::mint(),
            },
        )
        .await
        .unwrap();
    let (repo, _, _) = store
        .upsert_repo(
            None,
            &Repo {
                id: RepoId::nil(),
                legal_entity_id: owner.id,
                name: ResourceName::new("widget").unwrap(),
                external_id: ExternalResourceId::new("scm", "repo-1"),
                default_branch: "main".into(),
                link: String::new(),
                enabled: true,
                created_at: at,
                updated_at: at,
                deleted_at: None,
                etag: Etag::mint(),
            },
        )
        .await
        .unwrap();
    let runner = queue
        .register_runner(
            owner.id,
            ResourceName::new("runner-1").unwrap(),
            vec![Label::new("linux").unwrap()],
            vec![JobType::Exec],
        )
        .await
        .unwrap();

    Harness {
        store,
        queue,
        work_queue,
        repo,
        runner,
    }
}

impl Harness {
    async fn commit_with_config(&self, sha: &str, config: &str) -> Commit {
        let at = now();
        let (commit, _, _) = self
            .store
            .upsert_commit(
                None,
                &Commit {
                    id: CommitId::nil(),
                    repo_id: self.repo.id,
                    sha: sha.into(),
                    message: format!("commit {sha}"),
                    author_id: None,
                    author_name: "Ada".into(),
                    author_email: "ada@acme.test".into(),
                    committer_id: None,
                    committer_name: "Ada".into(),
                    committer_email: "ada@acme.test".into(),
                    config: Some(config.to_string()),
                    config_type: ConfigType::Yaml,
                    link: String::new(),
                    created_at: at,
                    updated_at: at,
                    etag: Etag::mint(),
                },
            )
            .await
            .unwrap();
        commit
    }

    async fn enqueue(&self, sha: &str, config: &str, opts: BuildOptions) -> BuildGraph {
        let commit = self.commit_with_config(sha, config).await;
        self.queue
            .enqueue_build_for_commit(None, &commit, "refs/heads/main", opts)
            .await
            .unwrap()
    }

    async fn dispatch(&self) -> Option<Job> {
        self.queue.find_queued_job(&self.runner).await.unwrap()
    }

    /// Run every step of a dispatched job to the given terminal status.
    async fn run_job(&self, job: &Job, terminal: WorkflowStatus) {
        for step in self.store.steps_for_job(None, job.id).await.unwrap() {
            let step = self
                .queue
                .update_step_status(step.id, &step.etag, WorkflowStatus::Running, None)
                .await
                .unwrap();
            let error = match terminal {
                WorkflowStatus::Failed => Some("command exited 1".to_string()),
                _ => None,
            };
            self.queue
                .update_step_status(step.id, &step.etag, terminal, error)
                .await
                .unwrap();
        }
    }

    async fn events(&self, build_id: BuildId) -> Vec<Event> {
        self.queue.find_events(build_id, 0, 1_000).await.unwrap()
    }
}

fn assert_monotonic_gap_free(events: &[Event]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(
            event.seq,
            (i + 1) as u64,
            "event sequence must be gap-free and strictly increasing"
        );
    }
}

fn statuses(events: &[Event]) -> Vec<(String, WorkflowStatus)> {
    events
        .iter()
        .map(|e| {
            let EventPayload::StatusChanged { status, .. } = &e.payload;
            (format!("{:?}", e.kind), *status)
        })
        .collect()
}

const SINGLE_JOB: &str = r#"
jobs:
  - name: hello
    type: exec
    runs_on: [linux]
    steps:
      - name: say
        commands: ["echo hi"]
"#;

const FAN_OUT_FAN_IN: &str = r#"
jobs:
  - name: a
    type: exec
    runs_on: [linux]
    steps: [{ name: s, commands: ["true"] }]
  - name: b
    type: exec
    runs_on: [linux]
    depends: [a]
    steps: [{ name: s, commands: ["true"] }]
  - name: c
    type: exec
    runs_on: [linux]
    depends: [a]
    steps: [{ name: s, commands: ["true"] }]
  - name: d
    type: exec
    runs_on: [linux]
    depends: [b, c]
    steps: [{ name: s, commands: ["true"] }]
"#;

// ─── Happy path: single job, single step ──────────────────────

#[tokio::test]
async fn single_job_lifecycle() {
    let h = harness().await;
    let graph = h.enqueue("0a1f", SINGLE_JOB, BuildOptions::default()).await;
    let build_id = graph.build.id;

    assert_eq!(graph.build.status, WorkflowStatus::Queued);
    assert_eq!(graph.build.build_number, 1);
    assert_eq!(graph.jobs.len(), 1);
    assert_eq!(graph.jobs[0].job.status, WorkflowStatus::Queued);
    assert_eq!(graph.jobs[0].steps[0].status, WorkflowStatus::Queued);

    let events = h.events(build_id).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].seq, 1);

    // Runner polls and receives the job; job flips to submitted, build
    // to running.
    let job = h.dispatch().await.expect("job should be dispatched");
    assert_eq!(job.status, WorkflowStatus::Submitted);
    assert_eq!(job.runner_id, Some(h.runner.id));
    assert!(job.timings.submitted_at.is_some());
    let build = h.store.build(None, build_id).await.unwrap();
    assert_eq!(build.status, WorkflowStatus::Running);

    // No second job for another poll.
    assert!(h.dispatch().await.is_none());

    h.run_job(&job, WorkflowStatus::Succeeded).await;

    let job = h.store.job(None, job.id).await.unwrap();
    assert_eq!(job.status, WorkflowStatus::Succeeded);
    let build = h.store.build(None, build_id).await.unwrap();
    assert_eq!(build.status, WorkflowStatus::Succeeded);
    assert!(build.timings.finished_at.is_some());

    let events = h.events(build_id).await;
    assert_monotonic_gap_free(&events);
    let seen = statuses(&events);
    assert_eq!(
        seen.first(),
        Some(&("BuildStatusChanged".to_string(), WorkflowStatus::Queued))
    );
    assert_eq!(
        seen.last(),
        Some(&("BuildStatusChanged".to_string(), WorkflowStatus::Succeeded))
    );
}

// ─── Fan-out / fan-in with dependency cascade ─────────────────

#[tokio::test]
async fn fan_out_fan_in_ordering() {
    let h = harness().await;
    let graph = h
        .enqueue("0b2e", FAN_OUT_FAN_IN, BuildOptions::default())
        .await;

    // Only A is eligible first.
    let a = h.dispatch().await.expect("a should be dispatched");
    assert_eq!(a.name.as_str(), "a");
    assert!(h.dispatch().await.is_none());

    h.run_job(&a, WorkflowStatus::Succeeded).await;

    // A succeeded: B then C become eligible, FIFO by id.
    let b = h.dispatch().await.expect("b should be dispatched");
    assert_eq!(b.name.as_str(), "b");
    let c = h.dispatch().await.expect("c should be dispatched");
    assert_eq!(c.name.as_str(), "c");
    assert!(h.dispatch().await.is_none());

    h.run_job(&b, WorkflowStatus::Succeeded).await;
    h.run_job(&c, WorkflowStatus::Succeeded).await;

    let d = h.dispatch().await.expect("d should be dispatched last");
    assert_eq!(d.name.as_str(), "d");
    h.run_job(&d, WorkflowStatus::Succeeded).await;

    let build = h.store.build(None, graph.build.id).await.unwrap();
    assert_eq!(build.status, WorkflowStatus::Succeeded);
    assert_monotonic_gap_free(&h.events(graph.build.id).await);
}

#[tokio::test]
async fn failed_dependency_cascades() {
    let h = harness().await;
    let graph = h
        .enqueue("0c3d", FAN_OUT_FAN_IN, BuildOptions::default())
        .await;

    let a = h.dispatch().await.unwrap();
    h.run_job(&a, WorkflowStatus::Succeeded).await;
    let b = h.dispatch().await.unwrap();
    let c = h.dispatch().await.unwrap();
    h.run_job(&b, WorkflowStatus::Failed).await;
    h.run_job(&c, WorkflowStatus::Succeeded).await;

    // D is never dispatched: its dependency on B failed, so it fails
    // with a dependency error instead.
    assert!(h.dispatch().await.is_none());
    let jobs = h.store.jobs_for_build(None, graph.build.id).await.unwrap();
    let d = jobs.iter().find(|j| j.name.as_str() == "d").unwrap();
    assert_eq!(d.status, WorkflowStatus::Failed);
    assert!(d.error.as_deref().unwrap().contains("dependency"));
    assert!(d.runner_id.is_none());

    let build = h.store.build(None, graph.build.id).await.unwrap();
    assert_eq!(build.status, WorkflowStatus::Failed);
}

// ─── Trimming ─────────────────────────────────────────────────

#[tokio::test]
async fn trim_keeps_upstream_closure() {
    let h = harness().await;
    let commit = h.commit_with_config("0d4c", FAN_OUT_FAN_IN).await;
    let graph = h
        .queue
        .enqueue_build_for_commit(None, &commit, "refs/heads/main", BuildOptions::default())
        .await
        .unwrap();

    // Keeping B keeps its ancestor A and nothing else.
    let trimmed = graph.trim(&[NodeFqn::job("", "b")]).unwrap();
    let names: Vec<&str> = trimmed
        .jobs
        .iter()
        .map(|jg| jg.job.name.as_str())
        .collect();
    assert_eq!(names, vec!["a", "b"]);

    // Keeping D pulls in every ancestor on every upstream path.
    let trimmed = graph
        .trim(&[NodeFqn::job("", "d"), NodeFqn::job("", "b")])
        .unwrap();
    let names: Vec<&str> = trimmed
        .jobs
        .iter()
        .map(|jg| jg.job.name.as_str())
        .collect();
    assert_eq!(names, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn nodes_to_run_trims_enqueued_build() {
    let h = harness().await;
    let opts = BuildOptions {
        force: false,
        nodes_to_run: vec![NodeFqn::job("", "b")],
    };
    let graph = h.enqueue("0e5b", FAN_OUT_FAN_IN, opts).await;
    let names: Vec<&str> = graph.jobs.iter().map(|jg| jg.job.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);

    let a = h.dispatch().await.unwrap();
    h.run_job(&a, WorkflowStatus::Succeeded).await;
    let b = h.dispatch().await.unwrap();
    h.run_job(&b, WorkflowStatus::Succeeded).await;
    assert!(h.dispatch().await.is_none());

    let build = h.store.build(None, graph.build.id).await.unwrap();
    assert_eq!(build.status, WorkflowStatus::Succeeded);
}

// ─── Fingerprint elision ──────────────────────────────────────

const FINGERPRINTED: &str = r#"
jobs:
  - name: build
    type: exec
    runs_on: [linux]
    fingerprint_commands: ["sha256sum go.sum"]
    steps:
      - name: compile
        commands: ["make build"]
"#;

#[tokio::test]
async fn fingerprint_elision_and_force() {
    let h = harness().await;

    // First build runs for real and records its fingerprint.
    h.enqueue("1f6a", FINGERPRINTED, BuildOptions::default()).await;
    let job1 = h.dispatch().await.unwrap();
    let job1 = h
        .queue
        .report_fingerprint(job1.id, &job1.etag, "f00d", HashType::Sha256)
        .await
        .unwrap();
    assert_eq!(job1.status, WorkflowStatus::Submitted);
    h.run_job(&job1, WorkflowStatus::Succeeded).await;
    let job1 = h.store.job(None, job1.id).await.unwrap();
    assert_eq!(job1.status, WorkflowStatus::Succeeded);

    // Second build with the identical fingerprint is elided.
    let second = h.enqueue("2a79", FINGERPRINTED, BuildOptions::default()).await;
    let job2 = h.dispatch().await.unwrap();
    let job2 = h
        .queue
        .report_fingerprint(job2.id, &job2.etag, "f00d", HashType::Sha256)
        .await
        .unwrap();
    assert_eq!(job2.status, WorkflowStatus::Succeeded);
    assert_eq!(job2.indirect_to_job_id, Some(job1.id));
    let build2 = h.store.build(None, second.build.id).await.unwrap();
    assert_eq!(build2.status, WorkflowStatus::Succeeded);

    // A different fingerprint hash type is not a match.
    h.enqueue("3b88", FINGERPRINTED, BuildOptions::default()).await;
    let job3 = h.dispatch().await.unwrap();
    let job3 = h
        .queue
        .report_fingerprint(job3.id, &job3.etag, "f00d", HashType::Blake2b)
        .await
        .unwrap();
    assert_eq!(job3.status, WorkflowStatus::Submitted);
    h.run_job(&job3, WorkflowStatus::Succeeded).await;

    // force=true disables elision globally.
    let opts = BuildOptions {
        force: true,
        nodes_to_run: vec![],
    };
    h.enqueue("4c97", FINGERPRINTED, opts).await;
    let job4 = h.dispatch().await.unwrap();
    let job4 = h
        .queue
        .report_fingerprint(job4.id, &job4.etag, "f00d", HashType::Sha256)
        .await
        .unwrap();
    assert_eq!(job4.status, WorkflowStatus::Submitted);
    assert_eq!(job4.indirect_to_job_id, None);
}

// ─── Racing webhooks ──────────────────────────────────────────

struct StaticScm {
    sha: String,
    config: String,
    notified: std::sync::Mutex<Vec<CommitStatusNotification>>,
}

impl StaticScm {
    fn new(sha: &str, config: &str) -> Self {
        Self {
            sha: sha.into(),
            config: config.into(),
            notified: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ScmAdapter for StaticScm {
    async fn head_commit(&self, _repo: &Repo, _git_ref: &str) -> Result<CommitMeta> {
        Ok(CommitMeta {
            sha: self.sha.clone(),
            message: "tip".into(),
            author_name: "Ada".into(),
            author_email: "ada@acme.test".into(),
            author_external_id: None,
            committer_name: "Ada".into(),
            committer_email: "ada@acme.test".into(),
            committer_external_id: None,
            link: String::new(),
        })
    }

    async fn config_file(&self, _repo: &Repo, _sha: &str) -> Result<(Vec<u8>, ConfigType)> {
        Ok((self.config.clone().into_bytes(), ConfigType::Yaml))
    }

    async fn notify_commit_status(
        &self,
        notification: &CommitStatusNotification,
    ) -> Result<NotifyReceipt> {
        self.notified
            .lock()
            .expect("notification lock")
            .push(notification.clone());
        Ok(NotifyReceipt {
            status_code: 201,
            rate_remaining: None,
        })
    }

    async fn list_legal_entities(&self) -> Result<Vec<LegalEntityMeta>> {
        Ok(vec![])
    }
    async fn list_repos(&self, _owner: &LegalEntityMeta) -> Result<Vec<RepoMeta>> {
        Ok(vec![])
    }
    async fn list_groups(&self, _owner: &LegalEntityMeta) -> Result<Vec<GroupMeta>> {
        Ok(vec![])
    }
    async fn list_permissions(&self, _owner: &LegalEntityMeta) -> Result<Vec<PermissionMeta>> {
        Ok(vec![])
    }
}

#[tokio::test]
async fn racing_webhooks_enqueue_exactly_one_build() {
    let h = harness().await;
    let scm = Arc::new(StaticScm::new("5da6", SINGLE_JOB));
    let intake = Arc::new(IntakeService::new(
        h.store.clone(),
        h.queue.clone(),
        scm,
    ));

    let (left, right) = tokio::join!(
        {
            let intake = intake.clone();
            let repo_id = h.repo.id;
            async move {
                intake
                    .handle_ref_update(repo_id, "refs/heads/main", BuildOptions::default())
                    .await
            }
        },
        {
            let intake = intake.clone();
            let repo_id = h.repo.id;
            async move {
                intake
                    .handle_ref_update(repo_id, "refs/heads/main", BuildOptions::default())
                    .await
            }
        },
    );
    let produced = [left.unwrap(), right.unwrap()]
        .iter()
        .filter(|g| g.is_some())
        .count();
    assert_eq!(produced, 1, "exactly one delivery wins the critical section");

    let commit = h
        .store
        .commit_by_sha(None, h.repo.id, "5da6")
        .await
        .unwrap()
        .unwrap();
    let builds = h
        .store
        .builds_for_commit(
            None,
            commit.id,
            "refs/heads/main",
            &[WorkflowStatus::Canceled, WorkflowStatus::Unknown],
        )
        .await
        .unwrap();
    assert_eq!(builds.len(), 1);

    // A repeat delivery afterwards is a no-op.
    let again = intake
        .handle_ref_update(h.repo.id, "refs/heads/main", BuildOptions::default())
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn intake_records_oversized_config_as_invalid() {
    let h = harness().await;

    // Oversized config: stored as invalid, no build.
    let scm = Arc::new(StaticScm::new("8ad3", "jobs: []"));
    let intake =
        IntakeService::new(h.store.clone(), h.queue.clone(), scm).with_max_config_len(4);
    let produced = intake
        .handle_ref_update(h.repo.id, "refs/heads/main", BuildOptions::default())
        .await
        .unwrap();
    assert!(produced.is_none());
    let commit = h
        .store
        .commit_by_sha(None, h.repo.id, "8ad3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(commit.config_type, ConfigType::Invalid);
    assert!(commit
        .config
        .as_deref()
        .unwrap()
        .contains("exceeding"));
    let builds = h
        .store
        .builds_for_commit(None, commit.id, "refs/heads/main", &[])
        .await
        .unwrap();
    assert!(builds.is_empty());
}

// ─── Commit-status notifications ──────────────────────────────

#[tokio::test]
async fn build_status_changes_notify_the_commit_status() {
    let h = harness().await;
    let scm = Arc::new(StaticScm::new("c0de", SINGLE_JOB));
    h.work_queue.register(
        COMMIT_STATUS_WORK_TYPE,
        Arc::new(CommitStatusHandler::new(h.store.clone(), scm.clone())),
        std::time::Duration::from_secs(10),
        BackoffPolicy::default(),
        true,
        false,
    );

    let graph = h.enqueue("c0de", SINGLE_JOB, BuildOptions::default()).await;
    let job = h.dispatch().await.unwrap();
    h.run_job(&job, WorkflowStatus::Succeeded).await;

    // Drain the queue: one notification per build status change, in
    // order, serialized on the repo's concurrency key.
    while h.work_queue.process_one().await.unwrap() {}

    let notified = scm.notified.lock().unwrap();
    let states: Vec<CommitState> = notified.iter().map(|n| n.state).collect();
    assert_eq!(states, vec![CommitState::Pending, CommitState::Pending, CommitState::Success]);
    assert!(notified.iter().all(|n| n.sha == "c0de"));
    assert!(notified
        .iter()
        .all(|n| n.target_url.ends_with(&graph.build.id.to_string())));
}

// ─── Deferred cross-workflow dependencies ─────────────────────

const DEFERRED_DEP: &str = r#"
jobs:
  - name: prepare
    type: exec
    runs_on: [linux]
    steps: [{ name: s, commands: ["true"] }]
  - name: publish
    type: exec
    runs_on: [linux]
    depends: ["later.package"]
    steps: [{ name: s, commands: ["true"] }]
"#;

#[tokio::test]
async fn deferred_dependency_blocks_until_fulfilled() {
    let h = harness().await;
    let graph = h.enqueue("6eb5", DEFERRED_DEP, BuildOptions::default()).await;

    // prepare dispatches; publish is blocked on the deferred dep.
    let prepare = h.dispatch().await.unwrap();
    assert_eq!(prepare.name.as_str(), "prepare");
    h.run_job(&prepare, WorkflowStatus::Succeeded).await;
    assert!(h.dispatch().await.is_none());

    // Materialize later.package; the deferred row is fulfilled on insert.
    let template = &graph.jobs[0];
    let mut job = template.job.clone();
    job.id = JobId::nil();
    job.workflow = "later".into();
    job.name = ResourceName::new("package").unwrap();
    job.status = WorkflowStatus::Unknown;
    job.depends = vec![];
    job.etag = Etag::mint();
    let mut step = template.steps[0].clone();
    step.id = StepId::nil();
    step.status = WorkflowStatus::Unknown;
    step.etag = Etag::mint();
    h.queue
        .add_jobs(
            None,
            graph.build.id,
            vec![JobGraph {
                job,
                steps: vec![step],
            }],
        )
        .await
        .unwrap();

    // Now later.package runs first, then publish.
    let package = h.dispatch().await.unwrap();
    assert_eq!(package.workflow, "later");
    assert_eq!(package.name.as_str(), "package");
    h.run_job(&package, WorkflowStatus::Succeeded).await;

    let publish = h.dispatch().await.unwrap();
    assert_eq!(publish.name.as_str(), "publish");
    h.run_job(&publish, WorkflowStatus::Succeeded).await;

    let build = h.store.build(None, graph.build.id).await.unwrap();
    assert_eq!(build.status, WorkflowStatus::Succeeded);
}

// ─── Cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn cancel_build_cascades() {
    let h = harness().await;
    let graph = h
        .enqueue("7fc4", FAN_OUT_FAN_IN, BuildOptions::default())
        .await;
    let a = h.dispatch().await.unwrap();

    let build = h.queue.cancel_build(graph.build.id).await.unwrap();
    assert_eq!(build.status, WorkflowStatus::Canceled);
    assert!(build.timings.canceled_at.is_some());

    for job in h.store.jobs_for_build(None, graph.build.id).await.unwrap() {
        assert_eq!(job.status, WorkflowStatus::Canceled, "{}", job.name);
        for step in h.store.steps_for_job(None, job.id).await.unwrap() {
            assert_eq!(step.status, WorkflowStatus::Canceled);
        }
    }
    // Canceling again is a no-op.
    let again = h.queue.cancel_build(graph.build.id).await.unwrap();
    assert_eq!(again.status, WorkflowStatus::Canceled);
    // The dispatched job's stale etag can no longer transition it.
    let err = h
        .queue
        .update_job_status(a.id, &a.etag, WorkflowStatus::Running, None)
        .await
        .unwrap_err();
    assert!(err.is_optimistic_lock());

    assert_monotonic_gap_free(&h.events(graph.build.id).await);
}

// ─── Runner compatibility ─────────────────────────────────────

#[tokio::test]
async fn dispatch_respects_labels_and_job_types() {
    let h = harness().await;
    let config = r#"
jobs:
  - name: gpu-job
    type: exec
    runs_on: [linux, gpu]
    steps: [{ name: s, commands: ["true"] }]
"#;
    h.enqueue("9be2", config, BuildOptions::default()).await;

    // Harness runner has only the linux label.
    assert!(h.dispatch().await.is_none());

    let gpu_runner = h
        .queue
        .register_runner(
            h.repo.legal_entity_id,
            ResourceName::new("runner-gpu").unwrap(),
            vec![
                Label::new("linux").unwrap(),
                Label::new("gpu").unwrap(),
                Label::new("x86").unwrap(),
            ],
            vec![JobType::Exec],
        )
        .await
        .unwrap();
    let job = h
        .queue
        .find_queued_job(&gpu_runner)
        .await
        .unwrap()
        .expect("superset of labels matches");
    assert_eq!(job.name.as_str(), "gpu-job");
}

// ─── Search ───────────────────────────────────────────────────

#[tokio::test]
async fn search_builds_filters_and_paginates() {
    let h = harness().await;
    for i in 0..4 {
        h.enqueue(&format!("ab{i}"), SINGLE_JOB, BuildOptions::default())
            .await;
    }
    let page = h
        .queue
        .search_builds(
            None,
            &BuildSearch {
                repo_id: Some(h.repo.id),
                limit: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 3);
    let next = page.next.expect("one more page");
    let rest = h
        .queue
        .search_builds(
            None,
            &BuildSearch {
                repo_id: Some(h.repo.id),
                limit: 3,
                cursor: Some(next),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rest.items.len(), 1);
    assert!(rest.next.is_none());
}
