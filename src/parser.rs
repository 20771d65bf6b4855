use crate::error::{Error, Result};
use crate::types::{ConfigType, DockerPullStrategy, JobType, StepExecution};
use serde::{Deserialize, Serialize};

/// Parsed pipeline description: the parser collaborator's output, consumed
/// by queue enqueue. Field names here are the user-facing config schema;
/// names are raw strings, validated when the build graph is formed.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BuildDefinition {
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct JobDefinition {
    /// Empty string selects the default workflow.
    #[serde(default)]
    pub workflow: String,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub docker: Option<DockerDefinition>,
    #[serde(default)]
    pub runs_on: Vec<String>,
    #[serde(default)]
    pub depends: Vec<DependsEntry>,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub environment: Vec<EnvEntry>,
    #[serde(default)]
    pub step_execution: StepExecution,
    #[serde(default)]
    pub fingerprint_commands: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactEntry>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DockerDefinition {
    pub image: String,
    #[serde(default)]
    pub pull: DockerPullStrategy,
    #[serde(default)]
    pub shell: Option<String>,
}

/// A job dependency in config form: either a bare FQN string or the full
/// form with artifact groups.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DependsEntry {
    Target(String),
    Full {
        target: String,
        #[serde(default)]
        artifacts: Vec<String>,
    },
}

impl DependsEntry {
    pub fn target(&self) -> &str {
        match self {
            DependsEntry::Target(t) => t,
            DependsEntry::Full { target, .. } => target,
        }
    }

    pub fn artifacts(&self) -> &[String] {
        match self {
            DependsEntry::Target(_) => &[],
            DependsEntry::Full { artifacts, .. } => artifacts,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServiceEntry {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub environment: Vec<EnvEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EnvEntry {
    pub name: String,
    #[serde(default)]
    pub literal: Option<String>,
    #[serde(default)]
    pub from_secret: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ArtifactEntry {
    pub group_name: String,
    pub paths: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
}

/// Pipeline-source parser. The grammar of pipeline files is a collaborator
/// concern; the engine only requires this contract.
pub trait ConfigParser: Send + Sync {
    fn parse(&self, bytes: &[u8], config_type: ConfigType) -> Result<BuildDefinition>;
}

/// Built-in parser for the `yaml` and `json` config types. `jsonnet`
/// requires an external evaluator and is rejected with a detailed error.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardParser;

impl ConfigParser for StandardParser {
    fn parse(&self, bytes: &[u8], config_type: ConfigType) -> Result<BuildDefinition> {
        match config_type {
            ConfigType::Yaml => serde_yaml::from_slice(bytes)
                .map_err(|e| Error::validation(format!("yaml config: {e}"))),
            ConfigType::Json => serde_json::from_slice(bytes)
                .map_err(|e| Error::validation(format!("json config: {e}"))),
            ConfigType::Jsonnet => Err(Error::validation(
                "jsonnet configs require an external evaluator",
            )),
            ConfigType::Invalid | ConfigType::Unknown | ConfigType::Absent => Err(
                Error::validation(format!("cannot parse config of type {config_type:?}")),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
jobs:
  - name: build
    type: docker
    docker:
      image: golang:1.22
      pull: if-not-exists
    runs_on: [linux, x86]
    fingerprint_commands:
      - find . -name 'go.sum' | xargs sha256sum
    artifacts:
      - group_name: binaries
        paths: ["bin/*"]
    steps:
      - name: compile
        commands: ["go build -o bin/app ./..."]
  - name: test
    type: docker
    docker:
      image: golang:1.22
    depends:
      - target: .build
        artifacts: [binaries]
    steps:
      - name: unit
        commands: ["go test ./..."]
"#;

    #[test]
    fn parses_yaml() {
        let def = StandardParser.parse(YAML.as_bytes(), ConfigType::Yaml).unwrap();
        assert_eq!(def.jobs.len(), 2);
        assert_eq!(def.jobs[0].name, "build");
        assert_eq!(
            def.jobs[0].docker.as_ref().unwrap().pull,
            DockerPullStrategy::IfNotExists
        );
        assert_eq!(def.jobs[1].depends.len(), 1);
        assert_eq!(def.jobs[1].depends[0].target(), ".build");
        assert_eq!(def.jobs[1].depends[0].artifacts(), ["binaries"]);
    }

    #[test]
    fn parses_bare_dependency_strings() {
        let yaml = r#"
jobs:
  - name: b
    type: exec
    depends: [".a"]
    steps:
      - name: s
        commands: ["true"]
"#;
        let def = StandardParser.parse(yaml.as_bytes(), ConfigType::Yaml).unwrap();
        assert_eq!(def.jobs[0].depends[0].target(), ".a");
    }

    #[test]
    fn parses_json() {
        let json = r#"{"jobs":[{"name":"a","type":"exec","steps":[{"name":"s","commands":["true"]}]}]}"#;
        let def = StandardParser.parse(json.as_bytes(), ConfigType::Json).unwrap();
        assert_eq!(def.jobs[0].job_type, JobType::Exec);
    }

    #[test]
    fn rejects_jsonnet() {
        let err = StandardParser.parse(b"{}", ConfigType::Jsonnet).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn yaml_syntax_error_is_validation() {
        let err = StandardParser
            .parse(b"jobs: [unterminated", ConfigType::Yaml)
            .unwrap_err();
        assert!(err.is_validation());
    }
}
