use crate::ids::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Workflow status ──────────────────────────────────────────

/// Lifecycle status shared by builds, jobs and steps.
///
/// ```text
/// queued → submitted → running → {succeeded, failed}
/// queued → canceled
/// (any non-terminal) → canceled
/// ```
///
/// A queued job may also go straight to `failed` when an upstream
/// dependency ends in failed/canceled (dependency cascade).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Unknown,
    Queued,
    Submitted,
    Running,
    Failed,
    Succeeded,
    Canceled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Failed | WorkflowStatus::Succeeded | WorkflowStatus::Canceled
        )
    }

    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, next) {
            (Unknown, Queued) => true,
            (Queued, Submitted) => true,
            // Steps are not individually submitted to a runner; they go
            // straight from queued to running.
            (Queued, Running) => true,
            // Dependency-failed cascade skips submission entirely.
            (Queued, Failed) => true,
            (Submitted, Running) => true,
            // Fingerprint elision completes a job straight from submitted.
            (Submitted, Succeeded) => true,
            (Submitted, Failed) => true,
            (Running, Succeeded) | (Running, Failed) => true,
            (from, Canceled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Unknown => "unknown",
            WorkflowStatus::Queued => "queued",
            WorkflowStatus::Submitted => "submitted",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-phase timestamps. Stamped by the status state machine, never
/// rewritten once set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTimings {
    pub queued_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub running_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl WorkflowTimings {
    /// Record the moment `status` was entered.
    pub fn stamp(&mut self, status: WorkflowStatus, at: DateTime<Utc>) {
        match status {
            WorkflowStatus::Queued => self.queued_at.get_or_insert(at),
            WorkflowStatus::Submitted => self.submitted_at.get_or_insert(at),
            WorkflowStatus::Running => self.running_at.get_or_insert(at),
            WorkflowStatus::Succeeded | WorkflowStatus::Failed => {
                self.finished_at.get_or_insert(at)
            }
            WorkflowStatus::Canceled => {
                self.finished_at.get_or_insert(at);
                self.canceled_at.get_or_insert(at)
            }
            WorkflowStatus::Unknown => return,
        };
    }
}

// ─── Enumerated wire values ───────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Docker,
    Exec,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Docker => "docker",
            JobType::Exec => "exec",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DockerPullStrategy {
    #[default]
    Default,
    Never,
    Always,
    IfNotExists,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepExecution {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashType {
    #[serde(rename = "BLAKE2B")]
    Blake2b,
    #[serde(rename = "SHA1")]
    Sha1,
    #[serde(rename = "SHA256")]
    Sha256,
    #[serde(rename = "MD5")]
    Md5,
    #[serde(rename = "FNV")]
    Fnv,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    Yaml,
    Json,
    Jsonnet,
    /// Stored when the config was rejected before parsing (e.g. too long);
    /// the config body then carries the error message.
    Invalid,
    #[default]
    Unknown,
    /// The commit has no config file at all.
    #[serde(rename = "none")]
    Absent,
}

// ─── JSON-valued column schemas ───────────────────────────────
//
// Each JSON column has a fixed serde schema. Arbitrary values are never
// stored.

/// One entry in a job's dependency list. `workflow` + `job_name` form the
/// target FQN; artifact dependencies name artifact groups of that job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDependency {
    pub workflow: String,
    pub job_name: ResourceName,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDependency>,
}

impl JobDependency {
    pub fn fqn(&self) -> NodeFqn {
        NodeFqn::job(self.workflow.clone(), self.job_name.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDependency {
    pub group_name: ResourceName,
}

/// A named Docker side-car started alongside a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: ResourceName,
    pub image: String,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(flatten)]
    pub value: EnvValue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvValue {
    Literal(String),
    /// Resolved by the secret service at job start, never by the engine.
    FromSecret(String),
}

/// Docker execution settings for `JobType::Docker` jobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    pub image: String,
    #[serde(default)]
    pub pull: DockerPullStrategy,
    #[serde(default)]
    pub shell: Option<String>,
}

/// A group of files a job publishes, named so other jobs can depend on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDefinition {
    pub group_name: ResourceName,
    pub paths: Vec<String>,
}

/// Build options supplied at enqueue time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Force every job to run; disables fingerprint elision globally.
    #[serde(default)]
    pub force: bool,
    /// When non-empty, only these nodes (and their ancestors) run.
    #[serde(default)]
    pub nodes_to_run: Vec<NodeFqn>,
}

// ─── Build ────────────────────────────────────────────────────

/// One attempt to realize a pipeline at a specific commit on a specific ref.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub repo_id: RepoId,
    pub commit_id: CommitId,
    pub git_ref: String,
    /// Monotonic per-repo build number, allocated at enqueue.
    pub build_number: u64,
    pub status: WorkflowStatus,
    pub timings: WorkflowTimings,
    pub error: Option<String>,
    pub opts: BuildOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub etag: Etag,
}

impl Build {
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();
        if self.repo_id.is_nil() {
            errs.push("build: repo id is required".to_string());
        }
        if self.commit_id.is_nil() {
            errs.push("build: commit id is required".to_string());
        }
        if self.git_ref.is_empty() {
            errs.push("build: ref is required".to_string());
        }
        errs
    }
}

// ─── Job ──────────────────────────────────────────────────────

/// One stage inside a build, executed on exactly one runner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub build_id: BuildId,
    pub repo_id: RepoId,
    pub commit_id: CommitId,
    pub git_ref: String,
    /// FQN = (workflow, name). The empty workflow is the default workflow.
    pub workflow: String,
    pub name: ResourceName,
    pub job_type: JobType,
    pub docker: Option<DockerConfig>,
    pub runs_on: Vec<Label>,
    pub depends: Vec<JobDependency>,
    pub services: Vec<ServiceDefinition>,
    pub environment: Vec<EnvVar>,
    pub step_execution: StepExecution,
    pub artifact_definitions: Vec<ArtifactDefinition>,
    pub fingerprint_commands: Vec<String>,
    /// Hex digest of the fingerprint-commands output, set post-run.
    pub fingerprint: Option<String>,
    pub fingerprint_hash_type: Option<HashType>,
    /// Non-nil when this job was elided to a previously succeeded job.
    pub indirect_to_job_id: Option<JobId>,
    /// Stable hash of the job's definition data.
    pub definition_hash: String,
    pub runner_id: Option<RunnerId>,
    pub status: WorkflowStatus,
    pub timings: WorkflowTimings,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub etag: Etag,
}

impl Job {
    pub fn fqn(&self) -> NodeFqn {
        NodeFqn::job(self.workflow.clone(), self.name.as_str())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();
        let fqn = self.fqn();
        if self.workflow.contains('.') {
            errs.push(format!("job {fqn}: workflow name may not contain '.'"));
        }
        if self.job_type == JobType::Docker && self.docker.is_none() {
            errs.push(format!("job {fqn}: docker jobs require a docker image"));
        }
        if let Some(d) = &self.docker {
            if d.image.is_empty() {
                errs.push(format!("job {fqn}: docker image must not be blank"));
            }
        }
        // Submitted and later imply a runner was assigned, except for
        // elided jobs which never reach a runner.
        if self.status == WorkflowStatus::Submitted
            && self.runner_id.is_none()
            && self.indirect_to_job_id.is_none()
        {
            errs.push(format!("job {fqn}: submitted without a runner"));
        }
        let mut seen = std::collections::HashSet::new();
        for dep in &self.depends {
            if !seen.insert(dep.fqn()) {
                errs.push(format!("job {fqn}: duplicate dependency {}", dep.fqn()));
            }
            if dep.fqn() == fqn {
                errs.push(format!("job {fqn}: depends on itself"));
            }
        }
        let mut svc_seen = std::collections::HashSet::new();
        for svc in &self.services {
            if !svc_seen.insert(svc.name.clone()) {
                errs.push(format!("job {fqn}: duplicate service {}", svc.name));
            }
        }
        let mut group_seen = std::collections::HashSet::new();
        for def in &self.artifact_definitions {
            if !group_seen.insert(def.group_name.clone()) {
                errs.push(format!(
                    "job {fqn}: duplicate artifact group {}",
                    def.group_name
                ));
            }
        }
        errs
    }
}

// ─── Step ─────────────────────────────────────────────────────

/// One shell-command unit inside a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub job_id: JobId,
    pub repo_id: RepoId,
    pub name: ResourceName,
    pub log_descriptor_id: LogDescriptorId,
    pub commands: Vec<String>,
    /// Names of steps within the same job that must finish first.
    pub depends: Vec<ResourceName>,
    pub status: WorkflowStatus,
    pub timings: WorkflowTimings,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub etag: Etag,
}

impl Step {
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();
        if self.commands.is_empty() {
            errs.push(format!("step {}: at least one command required", self.name));
        }
        for cmd in &self.commands {
            if cmd.trim().is_empty() {
                errs.push(format!("step {}: blank command", self.name));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for dep in &self.depends {
            if !seen.insert(dep.clone()) {
                errs.push(format!("step {}: duplicate dependency {dep}", self.name));
            }
            if dep == &self.name {
                errs.push(format!("step {}: depends on itself", self.name));
            }
        }
        errs
    }
}

// ─── Artifact ─────────────────────────────────────────────────

/// A file produced by a job. Metadata fields are unset until `sealed`
/// (upload complete); unsealed artifacts may still have bytes on the
/// blob store that need deleting before the record goes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub job_id: JobId,
    pub group_name: ResourceName,
    /// Path relative to the job workspace; never absolute.
    pub relative_path: String,
    pub hash: Option<String>,
    pub hash_type: Option<HashType>,
    pub size: Option<u64>,
    pub mime: Option<String>,
    pub sealed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub etag: Etag,
}

impl Artifact {
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();
        if self.relative_path.is_empty() {
            errs.push("artifact: path is required".to_string());
        }
        if self.relative_path.starts_with('/') || self.relative_path.starts_with('\\') {
            errs.push(format!(
                "artifact: path must be relative: {:?}",
                self.relative_path
            ));
        }
        errs
    }
}

// ─── Commit ───────────────────────────────────────────────────

/// Immutable record of a source revision. The config blob and the
/// author/committer identities are fill-forward only: an upsert may
/// populate them but never overwrite existing non-empty values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub repo_id: RepoId,
    /// Unique within the repo.
    pub sha: String,
    pub message: String,
    pub author_id: Option<LegalEntityId>,
    pub author_name: String,
    pub author_email: String,
    pub committer_id: Option<LegalEntityId>,
    pub committer_name: String,
    pub committer_email: String,
    pub config: Option<String>,
    pub config_type: ConfigType,
    pub link: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub etag: Etag,
}

impl Commit {
    /// Apply fill-forward semantics: populate fields of `self` that are
    /// still empty from `incoming`, never overwriting non-empty values.
    /// The config and its type move together. Returns whether anything
    /// changed.
    pub fn fill_forward(&mut self, incoming: Commit) -> bool {
        let mut changed = false;
        let mut fill = |dst: &mut String, src: String| {
            if dst.is_empty() && !src.is_empty() {
                *dst = src;
                changed = true;
            }
        };
        fill(&mut self.message, incoming.message);
        fill(&mut self.link, incoming.link);
        fill(&mut self.author_name, incoming.author_name);
        fill(&mut self.author_email, incoming.author_email);
        fill(&mut self.committer_name, incoming.committer_name);
        fill(&mut self.committer_email, incoming.committer_email);
        if self.author_id.is_none() && incoming.author_id.is_some() {
            self.author_id = incoming.author_id;
            changed = true;
        }
        if self.committer_id.is_none() && incoming.committer_id.is_some() {
            self.committer_id = incoming.committer_id;
            changed = true;
        }
        if self.config.is_none() && incoming.config.is_some() {
            self.config = incoming.config;
            self.config_type = incoming.config_type;
            changed = true;
        } else if self.config_type == ConfigType::Unknown
            && incoming.config_type != ConfigType::Unknown
        {
            self.config_type = incoming.config_type;
            changed = true;
        }
        changed
    }
}

// ─── Runner ───────────────────────────────────────────────────

/// A registered worker agent. Soft-deletable, but unlike every other
/// entity it stays reachable by id after soft-deletion so historical
/// jobs can still resolve the runner that executed them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    pub legal_entity_id: LegalEntityId,
    pub name: ResourceName,
    pub labels: Vec<Label>,
    pub job_types: Vec<JobType>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub etag: Etag,
}

impl Runner {
    /// True when this runner can execute the job: job type supported and
    /// the job's label set is a subset of the runner's.
    pub fn compatible_with(&self, job: &Job) -> bool {
        self.enabled
            && self.deleted_at.is_none()
            && self.job_types.contains(&job.job_type)
            && job.runs_on.iter().all(|l| self.labels.contains(l))
    }
}

// ─── Tenant model ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegalEntityKind {
    Person,
    Company,
}

/// An owner (person or org) mirrored from the source-control system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LegalEntity {
    pub id: LegalEntityId,
    pub name: ResourceName,
    pub kind: LegalEntityKind,
    pub external_id: ExternalResourceId,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub etag: Etag,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    pub legal_entity_id: LegalEntityId,
    pub name: ResourceName,
    pub external_id: ExternalResourceId,
    pub default_branch: String,
    pub link: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub etag: Etag,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub legal_entity_id: LegalEntityId,
    pub name: ResourceName,
    pub external_id: Option<ExternalResourceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub etag: Etag,
}

/// Relation row: membership of an identity in a group, tagged with the
/// system that asserted it so reconciliation can remove only its own rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_id: GroupId,
    pub identity_id: IdentityId,
    pub source_system: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantHolder {
    Identity(IdentityId),
    Group(GroupId),
}

/// Permission for a holder to perform an operation on a target resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub id: GrantId,
    pub holder: GrantHolder,
    pub operation: String,
    /// Rendered resource id (`kind:uuid`) of the target.
    pub target_resource_id: String,
    pub created_at: DateTime<Utc>,
}

/// The authenticatable face of a legal entity or runner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    /// Rendered resource id of the owning legal entity or runner.
    pub owner_resource_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(WorkflowStatus::Succeeded.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Canceled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Queued.is_terminal());
    }

    #[test]
    fn legal_transitions() {
        use WorkflowStatus::*;
        assert!(Queued.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Queued.can_transition_to(Canceled));
        assert!(Running.can_transition_to(Canceled));
        assert!(Queued.can_transition_to(Failed)); // dependency cascade
        assert!(Submitted.can_transition_to(Succeeded)); // elision

        assert!(Queued.can_transition_to(Running)); // steps skip submission

        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Canceled.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Canceled));
        assert!(!Running.can_transition_to(Queued));
    }

    #[test]
    fn status_wire_values() {
        let s: String = serde_json::to_string(&WorkflowStatus::Succeeded).unwrap();
        assert_eq!(s, "\"succeeded\"");
        let t: WorkflowStatus = serde_json::from_str("\"canceled\"").unwrap();
        assert_eq!(t, WorkflowStatus::Canceled);
    }

    #[test]
    fn hash_type_wire_values() {
        assert_eq!(
            serde_json::to_string(&HashType::Blake2b).unwrap(),
            "\"BLAKE2B\""
        );
        assert_eq!(serde_json::to_string(&HashType::Fnv).unwrap(), "\"FNV\"");
    }

    #[test]
    fn config_type_none_rename() {
        assert_eq!(
            serde_json::to_string(&ConfigType::Absent).unwrap(),
            "\"none\""
        );
        assert_eq!(
            serde_json::to_string(&ConfigType::Jsonnet).unwrap(),
            "\"jsonnet\""
        );
    }

    #[test]
    fn pull_strategy_wire_values() {
        assert_eq!(
            serde_json::to_string(&DockerPullStrategy::IfNotExists).unwrap(),
            "\"if-not-exists\""
        );
    }

    #[test]
    fn timings_stamp_once() {
        let mut t = WorkflowTimings::default();
        let first = crate::ids::now();
        t.stamp(WorkflowStatus::Running, first);
        let later = first + chrono::Duration::seconds(10);
        t.stamp(WorkflowStatus::Running, later);
        assert_eq!(t.running_at, Some(first));

        t.stamp(WorkflowStatus::Canceled, later);
        assert_eq!(t.canceled_at, Some(later));
        assert_eq!(t.finished_at, Some(later));
    }

    fn minimal_job() -> Job {
        Job {
            id: JobId::new(),
            build_id: BuildId::new(),
            repo_id: RepoId::new(),
            commit_id: CommitId::new(),
            git_ref: "refs/heads/main".into(),
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
            created_at: crate::ids::now(),
            updated_at: crate::ids::now(),
            deleted_at: None,
            etag: Etag::mint(),
        }
    }

    #[test]
    fn job_validate_duplicate_dependency() {
        let mut job = minimal_job();
        let dep = JobDependency {
            workflow: String::new(),
            job_name: ResourceName::new("lint").unwrap(),
            artifacts: vec![],
        };
        job.depends = vec![dep.clone(), dep];
        let errs = job.validate();
        assert!(errs.iter().any(|e| e.contains("duplicate dependency")));
    }

    #[test]
    fn job_validate_docker_requires_image() {
        let mut job = minimal_job();
        job.job_type = JobType::Docker;
        assert!(!job.validate().is_empty());
        job.docker = Some(DockerConfig {
            image: "golang:1.22".into(),
            pull: DockerPullStrategy::Default,
            shell: None,
        });
        assert!(job.validate().is_empty());
    }

    #[test]
    fn job_submitted_requires_runner() {
        let mut job = minimal_job();
        job.status = WorkflowStatus::Submitted;
        assert!(!job.validate().is_empty());
        job.runner_id = Some(RunnerId::new());
        assert!(job.validate().is_empty());
    }

    #[test]
    fn step_validate_commands() {
        let step = Step {
            id: StepId::new(),
            job_id: JobId::new(),
            repo_id: RepoId::new(),
            name: ResourceName::new("test").unwrap(),
            log_descriptor_id: LogDescriptorId::new(),
            commands: vec![],
            depends: vec![],
            status: WorkflowStatus::Queued,
            timings: WorkflowTimings::default(),
            error: None,
            created_at: crate::ids::now(),
            updated_at: crate::ids::now(),
            etag: Etag::mint(),
        };
        assert!(!step.validate().is_empty());

        let mut ok = step.clone();
        ok.commands = vec!["cargo test".into()];
        assert!(ok.validate().is_empty());

        let mut blank = step;
        blank.commands = vec!["   ".into()];
        assert!(!blank.validate().is_empty());
    }

    #[test]
    fn artifact_path_must_be_relative() {
        let a = Artifact {
            id: ArtifactId::new(),
            job_id: JobId::new(),
            group_name: ResourceName::new("binaries").unwrap(),
            relative_path: "/usr/bin/thing".into(),
            hash: None,
            hash_type: None,
            size: None,
            mime: None,
            sealed: false,
            created_at: crate::ids::now(),
            updated_at: crate::ids::now(),
            etag: Etag::mint(),
        };
        assert!(!a.validate().is_empty());
    }

    #[test]
    fn runner_compatibility() {
        let job = {
            let mut j = minimal_job();
            j.runs_on = vec![Label::new("linux").unwrap(), Label::new("x86").unwrap()];
            j
        };
        let mut runner = Runner {
            id: RunnerId::new(),
            legal_entity_id: LegalEntityId::new(),
            name: ResourceName::new("runner-1").unwrap(),
            labels: vec![
                Label::new("linux").unwrap(),
                Label::new("x86").unwrap(),
                Label::new("gpu").unwrap(),
            ],
            job_types: vec![JobType::Exec],
            enabled: true,
            created_at: crate::ids::now(),
            updated_at: crate::ids::now(),
            deleted_at: None,
            etag: Etag::mint(),
        };
        assert!(runner.compatible_with(&job));

        runner.job_types = vec![JobType::Docker];
        assert!(!runner.compatible_with(&job));

        runner.job_types = vec![JobType::Exec];
        runner.labels = vec![Label::new("linux").unwrap()];
        assert!(!runner.compatible_with(&job));
    }
}
