use crate::dag::{Dag, GraphNode};
use crate::error::{Error, Result};
use crate::ids::*;
use crate::parser::{BuildDefinition, EnvEntry, JobDefinition};
use crate::types::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// A build plus its jobs; each job plus its steps.
#[derive(Clone, Debug)]
pub struct BuildGraph {
    pub build: Build,
    pub jobs: Vec<JobGraph>,
}

#[derive(Clone, Debug)]
pub struct JobGraph {
    pub job: Job,
    pub steps: Vec<Step>,
}

/// Lightweight DAG node for a job: the FQN plus the dependency FQNs.
#[derive(Clone, Debug)]
pub struct JobNode {
    pub fqn: NodeFqn,
    pub deps: Vec<NodeFqn>,
}

impl GraphNode for JobNode {
    fn fqn(&self) -> NodeFqn {
        self.fqn.clone()
    }
    fn depends_on(&self) -> Vec<NodeFqn> {
        self.deps.clone()
    }
}

/// Lightweight DAG node for a step within one job.
#[derive(Clone, Debug)]
pub struct StepNode {
    pub fqn: NodeFqn,
    pub deps: Vec<NodeFqn>,
}

impl GraphNode for StepNode {
    fn fqn(&self) -> NodeFqn {
        self.fqn.clone()
    }
    fn depends_on(&self) -> Vec<NodeFqn> {
        self.deps.clone()
    }
}

impl BuildGraph {
    /// Convert a parsed pipeline definition into a build graph rooted at
    /// `build`. Names and environment entries are validated here; graph
    /// rules (duplicates, cycles, dangling deps) in [`BuildGraph::validate`].
    pub fn from_definition(build: Build, def: &BuildDefinition) -> Result<BuildGraph> {
        let mut errors: Vec<String> = Vec::new();
        let mut jobs = Vec::new();
        for jd in &def.jobs {
            if let Some(jg) = job_graph_from_definition(&build, jd, &mut errors) {
                jobs.push(jg);
            }
        }
        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }
        Ok(BuildGraph { build, jobs })
    }

    /// Fill any unset id, timestamps and status, recursively, taking
    /// defaults from the parent entity. After this every job and step has
    /// a fresh id, `created_at == updated_at`, its parent ids set, and
    /// status `queued` where it was unknown.
    pub fn populate_defaults(&mut self) {
        if self.build.id.is_nil() {
            self.build.id = BuildId::new();
        }
        if self.build.status == WorkflowStatus::Unknown {
            self.build.status = WorkflowStatus::Queued;
        }
        self.build.timings.stamp(WorkflowStatus::Queued, self.build.created_at);
        for jg in &mut self.jobs {
            let job = &mut jg.job;
            if job.id.is_nil() {
                job.id = JobId::new();
            }
            job.build_id = self.build.id;
            job.repo_id = self.build.repo_id;
            job.commit_id = self.build.commit_id;
            job.git_ref = self.build.git_ref.clone();
            job.created_at = self.build.created_at;
            job.updated_at = self.build.created_at;
            if job.status == WorkflowStatus::Unknown {
                job.status = WorkflowStatus::Queued;
            }
            job.timings.stamp(WorkflowStatus::Queued, job.created_at);
            for step in &mut jg.steps {
                if step.id.is_nil() {
                    step.id = StepId::new();
                }
                if step.log_descriptor_id.is_nil() {
                    step.log_descriptor_id = LogDescriptorId::new();
                }
                step.job_id = job.id;
                step.repo_id = job.repo_id;
                step.created_at = job.created_at;
                step.updated_at = job.created_at;
                if step.status == WorkflowStatus::Unknown {
                    step.status = WorkflowStatus::Queued;
                }
                step.timings.stamp(WorkflowStatus::Queued, step.created_at);
            }
        }
    }

    /// Composite validation of the whole graph. Collects every failure
    /// rather than stopping at the first, so callers can surface the full
    /// list in one response.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        errors.extend(self.build.validate());

        let mut job_fqns = HashSet::new();
        for jg in &self.jobs {
            let fqn = jg.job.fqn();
            if !job_fqns.insert(fqn.clone()) {
                errors.push(format!("duplicate job {fqn}"));
            }
            errors.extend(jg.job.validate());

            let mut step_names = HashSet::new();
            for step in &jg.steps {
                if !step_names.insert(step.name.clone()) {
                    errors.push(format!("job {fqn}: duplicate step {}", step.name));
                }
                errors.extend(step.validate());
            }
        }

        // Graph formation covers same-workflow dependency resolution and
        // acyclicity for jobs and for each job's steps.
        match self.job_dag() {
            Ok(_) => {}
            Err(e) => errors.push(e.to_string()),
        }
        for jg in &self.jobs {
            if let Err(e) = step_dag(jg) {
                errors.push(e.to_string());
            }
        }

        for fqn in &self.build.opts.nodes_to_run {
            let job_level = fqn.job_fqn();
            let Some(jg) = self.jobs.iter().find(|jg| jg.job.fqn() == job_level) else {
                errors.push(format!("build option references unknown job {job_level}"));
                continue;
            };
            if !fqn.is_job_level()
                && !jg.steps.iter().any(|s| s.name.as_str() == fqn.step)
            {
                errors.push(format!("build option references unknown step {fqn}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }

    /// The job-level dependency DAG of this build.
    pub fn job_dag(&self) -> Result<Dag<JobNode>> {
        let nodes = self
            .jobs
            .iter()
            .map(|jg| JobNode {
                fqn: jg.job.fqn(),
                deps: jg.job.depends.iter().map(|d| d.fqn()).collect(),
            })
            .collect();
        Dag::build(nodes)
    }

    /// Trim to `keep` plus everything upstream. A job-level FQN keeps the
    /// whole job; a step-level FQN keeps the job and trims its steps to
    /// that step's upstream closure.
    pub fn trim(&self, keep: &[NodeFqn]) -> Result<BuildGraph> {
        if keep.is_empty() {
            return Err(Error::InvalidArgument(
                "trim requires at least one node to keep".to_string(),
            ));
        }

        let mut step_keeps: HashMap<NodeFqn, Vec<NodeFqn>> = HashMap::new();
        let mut whole_jobs: HashSet<NodeFqn> = HashSet::new();
        for fqn in keep {
            if fqn.is_job_level() {
                whole_jobs.insert(fqn.clone());
            } else {
                step_keeps.entry(fqn.job_fqn()).or_default().push(fqn.clone());
            }
        }

        let job_level: Vec<NodeFqn> = keep.iter().map(|f| f.job_fqn()).collect();
        let trimmed_jobs = self.job_dag()?.trim(&job_level)?;

        let mut jobs = Vec::new();
        for jg in &self.jobs {
            let fqn = jg.job.fqn();
            if !trimmed_jobs.contains(&fqn) {
                continue;
            }
            // Ancestors pulled in by the job trim, and jobs kept at job
            // level, keep all of their steps.
            let keep_steps = match step_keeps.get(&fqn) {
                Some(steps) if !whole_jobs.contains(&fqn) => Some(steps),
                _ => None,
            };
            match keep_steps {
                None => jobs.push(jg.clone()),
                Some(wanted) => {
                    let dag = step_dag(jg)?;
                    let trimmed = dag.trim(wanted)?;
                    let steps = jg
                        .steps
                        .iter()
                        .filter(|s| {
                            trimmed.contains(&NodeFqn::step(
                                jg.job.workflow.clone(),
                                jg.job.name.as_str(),
                                s.name.as_str(),
                            ))
                        })
                        .cloned()
                        .collect();
                    jobs.push(JobGraph {
                        job: jg.job.clone(),
                        steps,
                    });
                }
            }
        }

        Ok(BuildGraph {
            build: self.build.clone(),
            jobs,
        })
    }
}

/// The step-level dependency DAG of one job.
pub fn step_dag(jg: &JobGraph) -> Result<Dag<StepNode>> {
    let workflow = jg.job.workflow.clone();
    let job = jg.job.name.as_str().to_string();
    let nodes = jg
        .steps
        .iter()
        .map(|s| StepNode {
            fqn: NodeFqn::step(workflow.clone(), job.clone(), s.name.as_str()),
            deps: s
                .depends
                .iter()
                .map(|d| NodeFqn::step(workflow.clone(), job.clone(), d.as_str()))
                .collect(),
        })
        .collect();
    Dag::build(nodes)
}

// ─── Definition-data hash ─────────────────────────────────────

#[derive(Serialize)]
struct StepData<'a> {
    name: &'a str,
    commands: &'a [String],
    depends: &'a [ResourceName],
}

/// The definition fields that identify what a job *is*, independent of
/// runtime state. Serialization order is the struct declaration order, so
/// the hash is stable.
#[derive(Serialize)]
struct JobDefinitionData<'a> {
    workflow: &'a str,
    name: &'a str,
    job_type: JobType,
    docker: &'a Option<DockerConfig>,
    runs_on: &'a [Label],
    depends: &'a [JobDependency],
    services: &'a [ServiceDefinition],
    environment: &'a [EnvVar],
    step_execution: StepExecution,
    fingerprint_commands: &'a [String],
    artifact_definitions: &'a [ArtifactDefinition],
    steps: Vec<StepData<'a>>,
}

/// Stable hex SHA-256 over a job's definition data (including its steps).
pub fn definition_hash(jg: &JobGraph) -> String {
    let data = JobDefinitionData {
        workflow: &jg.job.workflow,
        name: jg.job.name.as_str(),
        job_type: jg.job.job_type,
        docker: &jg.job.docker,
        runs_on: &jg.job.runs_on,
        depends: &jg.job.depends,
        services: &jg.job.services,
        environment: &jg.job.environment,
        step_execution: jg.job.step_execution,
        fingerprint_commands: &jg.job.fingerprint_commands,
        artifact_definitions: &jg.job.artifact_definitions,
        steps: jg
            .steps
            .iter()
            .map(|s| StepData {
                name: s.name.as_str(),
                commands: &s.commands,
                depends: &s.depends,
            })
            .collect(),
    };
    let json = serde_json::to_vec(&data).expect("definition data serialization");
    let mut hasher = Sha256::new();
    hasher.update(&json);
    hex::encode(hasher.finalize())
}

// ─── Definition conversion ────────────────────────────────────

fn job_graph_from_definition(
    build: &Build,
    jd: &JobDefinition,
    errors: &mut Vec<String>,
) -> Option<JobGraph> {
    let before = errors.len();

    let name = collect(ResourceName::new(jd.name.clone()), errors);
    if jd.workflow.contains('.') {
        errors.push(format!(
            "job {}: workflow name may not contain '.'",
            jd.name
        ));
    }

    let mut depends = Vec::new();
    for entry in &jd.depends {
        // A bare name (no dot) targets a job in the same workflow; a
        // dotted form is a full workflow.job reference.
        let target = entry.target();
        let fqn = if target.contains('.') {
            match NodeFqn::parse(target) {
                Ok(f) => f,
                Err(e) => {
                    errors.push(format!("job {}: {e}", jd.name));
                    continue;
                }
            }
        } else {
            NodeFqn::job(jd.workflow.clone(), target)
        };
        let job_name = match ResourceName::new(fqn.job.clone()) {
            Ok(n) => n,
            Err(e) => {
                errors.push(format!("job {}: dependency target: {e}", jd.name));
                continue;
            }
        };
        let mut artifacts = Vec::new();
        for group in entry.artifacts() {
            match ResourceName::new(group.clone()) {
                Ok(g) => artifacts.push(ArtifactDependency { group_name: g }),
                Err(e) => errors.push(format!("job {}: artifact dependency: {e}", jd.name)),
            }
        }
        depends.push(JobDependency {
            workflow: fqn.workflow,
            job_name,
            artifacts,
        });
    }

    let mut services = Vec::new();
    for svc in &jd.services {
        let Some(svc_name) = collect(ResourceName::new(svc.name.clone()), errors) else {
            continue;
        };
        services.push(ServiceDefinition {
            name: svc_name,
            image: svc.image.clone(),
            environment: env_vars(&svc.environment, &jd.name, errors),
        });
    }

    let mut runs_on = Vec::new();
    for label in &jd.runs_on {
        match Label::new(label.clone()) {
            Ok(l) => runs_on.push(l),
            Err(e) => errors.push(format!("job {}: {e}", jd.name)),
        }
    }

    let mut artifact_definitions = Vec::new();
    for entry in &jd.artifacts {
        match ResourceName::new(entry.group_name.clone()) {
            Ok(g) => artifact_definitions.push(ArtifactDefinition {
                group_name: g,
                paths: entry.paths.clone(),
            }),
            Err(e) => errors.push(format!("job {}: artifact group: {e}", jd.name)),
        }
    }

    let mut steps = Vec::new();
    for sd in &jd.steps {
        let Some(step_name) = collect(ResourceName::new(sd.name.clone()), errors) else {
            continue;
        };
        let mut step_deps = Vec::new();
        for dep in &sd.depends {
            match ResourceName::new(dep.clone()) {
                Ok(d) => step_deps.push(d),
                Err(e) => errors.push(format!("step {}: {e}", sd.name)),
            }
        }
        steps.push(Step {
            id: StepId::nil(),
            job_id: JobId::nil(),
            repo_id: build.repo_id,
            name: step_name,
            log_descriptor_id: LogDescriptorId::nil(),
            commands: sd.commands.clone(),
            depends: step_deps,
            status: WorkflowStatus::Unknown,
            timings: WorkflowTimings::default(),
            error: None,
            created_at: build.created_at,
            updated_at: build.created_at,
            etag: Etag::mint(),
        });
    }

    if errors.len() > before {
        return None;
    }
    let name = name?;

    Some(JobGraph {
        job: Job {
            id: JobId::nil(),
            build_id: build.id,
            repo_id: build.repo_id,
            commit_id: build.commit_id,
            git_ref: build.git_ref.clone(),
            workflow: jd.workflow.clone(),
            name,
            job_type: jd.job_type,
            docker: jd.docker.as_ref().map(|d| DockerConfig {
                image: d.image.clone(),
                pull: d.pull,
                shell: d.shell.clone(),
            }),
            runs_on,
            depends,
            services,
            environment: env_vars(&jd.environment, &jd.name, errors),
            step_execution: jd.step_execution,
            artifact_definitions,
            fingerprint_commands: jd.fingerprint_commands.clone(),
            fingerprint: None,
            fingerprint_hash_type: None,
            indirect_to_job_id: None,
            definition_hash: String::new(),
            runner_id: None,
            status: WorkflowStatus::Unknown,
            timings: WorkflowTimings::default(),
            error: None,
            created_at: build.created_at,
            updated_at: build.created_at,
            deleted_at: None,
            etag: Etag::mint(),
        },
        steps,
    })
}

fn env_vars(entries: &[EnvEntry], owner: &str, errors: &mut Vec<String>) -> Vec<EnvVar> {
    let mut out = Vec::new();
    for e in entries {
        let value = match (&e.literal, &e.from_secret) {
            (Some(v), None) => EnvValue::Literal(v.clone()),
            (None, Some(s)) => EnvValue::FromSecret(s.clone()),
            _ => {
                errors.push(format!(
                    "{owner}: environment variable {} must set exactly one of literal/from_secret",
                    e.name
                ));
                continue;
            }
        };
        out.push(EnvVar {
            name: e.name.clone(),
            value,
        });
    }
    out
}

fn collect<T>(r: Result<T>, errors: &mut Vec<String>) -> Option<T> {
    match r {
        Ok(v) => Some(v),
        Err(e) => {
            errors.push(e.to_string());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ConfigParser, StandardParser};

    fn empty_build() -> Build {
        Build {
            id: BuildId::nil(),
            repo_id: RepoId::new(),
            commit_id: CommitId::new(),
            git_ref: "refs/heads/main".into(),
            build_number: 0,
            status: WorkflowStatus::Unknown,
            timings: WorkflowTimings::default(),
            error: None,
            opts: BuildOptions::default(),
            created_at: now(),
            updated_at: now(),
            deleted_at: None,
            etag: Etag::mint(),
        }
    }

    fn graph_from_yaml(yaml: &str) -> Result<BuildGraph> {
        let def = StandardParser.parse(yaml.as_bytes(), ConfigType::Yaml)?;
        BuildGraph::from_definition(empty_build(), &def)
    }

    const FAN_OUT_FAN_IN: &str = r#"
jobs:
  - name: a
    type: exec
    steps: [{ name: s, commands: ["true"] }]
  - name: b
    type: exec
    depends: [a]
    steps: [{ name: s, commands: ["true"] }]
  - name: c
    type: exec
    depends: [a]
    steps: [{ name: s, commands: ["true"] }]
  - name: d
    type: exec
    depends: [b, c]
    steps: [{ name: s, commands: ["true"] }]
"#;

    #[test]
    fn defaults_make_everything_queued() {
        let mut g = graph_from_yaml(FAN_OUT_FAN_IN).unwrap();
        g.populate_defaults();
        assert!(!g.build.id.is_nil());
        assert_eq!(g.build.status, WorkflowStatus::Queued);
        for jg in &g.jobs {
            assert!(!jg.job.id.is_nil());
            assert_eq!(jg.job.status, WorkflowStatus::Queued);
            assert_eq!(jg.job.build_id, g.build.id);
            assert_eq!(jg.job.created_at, jg.job.updated_at);
            for s in &jg.steps {
                assert!(!s.id.is_nil());
                assert_eq!(s.status, WorkflowStatus::Queued);
                assert_eq!(s.job_id, jg.job.id);
                assert_eq!(s.created_at, s.updated_at);
            }
        }
        g.validate().unwrap();
    }

    #[test]
    fn duplicate_job_fqn_rejected() {
        let yaml = r#"
jobs:
  - name: a
    type: exec
    steps: [{ name: s, commands: ["true"] }]
  - name: a
    type: exec
    steps: [{ name: s, commands: ["true"] }]
"#;
        let mut g = graph_from_yaml(yaml).unwrap();
        g.populate_defaults();
        let err = g.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate job"));
    }

    #[test]
    fn dangling_same_workflow_dep_rejected() {
        let yaml = r#"
jobs:
  - name: a
    type: exec
    depends: [ghost]
    steps: [{ name: s, commands: ["true"] }]
"#;
        let mut g = graph_from_yaml(yaml).unwrap();
        g.populate_defaults();
        assert!(g.validate().is_err());
    }

    #[test]
    fn cross_workflow_dep_may_dangle() {
        let yaml = r#"
jobs:
  - name: a
    type: exec
    depends: ["later.publish"]
    steps: [{ name: s, commands: ["true"] }]
"#;
        let mut g = graph_from_yaml(yaml).unwrap();
        g.populate_defaults();
        g.validate().unwrap();
    }

    #[test]
    fn step_cycle_rejected() {
        let yaml = r#"
jobs:
  - name: a
    type: exec
    steps:
      - { name: x, commands: ["true"], depends: [y] }
      - { name: y, commands: ["true"], depends: [x] }
"#;
        let mut g = graph_from_yaml(yaml).unwrap();
        g.populate_defaults();
        let err = g.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn allow_list_must_reference_existing_nodes() {
        let mut g = graph_from_yaml(FAN_OUT_FAN_IN).unwrap();
        g.build.opts.nodes_to_run = vec![NodeFqn::job("", "ghost")];
        g.populate_defaults();
        assert!(g.validate().is_err());

        g.build.opts.nodes_to_run = vec![NodeFqn::job("", "d")];
        g.validate().unwrap();
    }

    #[test]
    fn trim_keeps_upstream_jobs() {
        let mut g = graph_from_yaml(FAN_OUT_FAN_IN).unwrap();
        g.populate_defaults();
        let trimmed = g.trim(&[NodeFqn::job("", "b")]).unwrap();
        let names: Vec<&str> = trimmed
            .jobs
            .iter()
            .map(|jg| jg.job.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn trim_step_level_prunes_steps() {
        let yaml = r#"
jobs:
  - name: a
    type: exec
    steps:
      - { name: fetch, commands: ["true"] }
      - { name: compile, commands: ["true"], depends: [fetch] }
      - { name: docs, commands: ["true"] }
"#;
        let mut g = graph_from_yaml(yaml).unwrap();
        g.populate_defaults();
        let trimmed = g
            .trim(&[NodeFqn::step("", "a", "compile")])
            .unwrap();
        let steps: Vec<&str> = trimmed.jobs[0]
            .steps
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(steps, vec!["fetch", "compile"]);
    }

    #[test]
    fn trim_empty_keep_is_invalid() {
        let mut g = graph_from_yaml(FAN_OUT_FAN_IN).unwrap();
        g.populate_defaults();
        assert!(matches!(
            g.trim(&[]).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn definition_hash_is_stable_and_sensitive() {
        let mut g = graph_from_yaml(FAN_OUT_FAN_IN).unwrap();
        g.populate_defaults();
        let h1 = definition_hash(&g.jobs[0]);
        let h2 = definition_hash(&g.jobs[0]);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);

        let mut changed = g.jobs[0].clone();
        changed.steps[0].commands = vec!["false".into()];
        assert_ne!(h1, definition_hash(&changed));
    }

    #[test]
    fn env_entries_require_exactly_one_value() {
        let yaml = r#"
jobs:
  - name: a
    type: exec
    environment:
      - name: BOTH
        literal: x
        from_secret: y
    steps: [{ name: s, commands: ["true"] }]
"#;
        assert!(graph_from_yaml(yaml).is_err());
    }
}
