use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// UTC now, rounded to microseconds — the precision every timestamp is
/// stored with, so round-trips through the store compare equal.
pub fn now() -> DateTime<Utc> {
    Utc::now().round_subsecs(6)
}

// ─── Typed resource ids ───────────────────────────────────────

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub const KIND: &'static str = $kind;

            /// Mint a fresh id. UUIDv7, so ids sort in creation order.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            /// Parse the `kind:uuid` wire form, rejecting a wrong kind.
            pub fn parse(s: &str) -> Result<Self> {
                let (kind, rest) = s
                    .split_once(':')
                    .ok_or_else(|| Error::InvalidArgument(format!("malformed id: {s:?}")))?;
                if kind != $kind {
                    return Err(Error::InvalidArgument(format!(
                        "expected {} id, got {s:?}",
                        $kind
                    )));
                }
                let uuid = Uuid::parse_str(rest)
                    .map_err(|e| Error::InvalidArgument(format!("malformed id {s:?}: {e}")))?;
                Ok(Self(uuid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}", $kind, self.0)
            }
        }
    };
}

define_id!(BuildId, "build");
define_id!(JobId, "job");
define_id!(StepId, "step");
define_id!(ArtifactId, "artifact");
define_id!(CommitId, "commit");
define_id!(RepoId, "repo");
define_id!(LegalEntityId, "legal-entity");
define_id!(RunnerId, "runner");
define_id!(GroupId, "group");
define_id!(GrantId, "grant");
define_id!(IdentityId, "identity");
define_id!(SecretId, "secret");
define_id!(
    /// Opaque handle into the log byte store. The engine never reads log
    /// bytes; it only threads the descriptor through.
    LogDescriptorId,
    "log-descriptor"
);
define_id!(WorkItemId, "work-item");
define_id!(WorkItemStateId, "work-item-state");

macro_rules! fmt_delegate {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    };
}

// ─── Names & labels ───────────────────────────────────────────

pub const MAX_NAME_LEN: usize = 100;

fn name_char_ok(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Name of a user-visible resource. Matches `^[A-Za-z0-9_-]{1,100}$`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() || s.len() > MAX_NAME_LEN {
            return Err(Error::validation(format!(
                "resource name must be 1-{MAX_NAME_LEN} characters, got {:?}",
                s
            )));
        }
        if !s.chars().all(name_char_ok) {
            return Err(Error::validation(format!(
                "resource name may only contain letters, digits, '_' and '-': {s:?}"
            )));
        }
        Ok(Self(s))
    }

    /// Coerce an arbitrary string into a valid resource name: lowercase,
    /// invalid characters replaced with '-', truncated to the length cap.
    /// Idempotent: normalizing a normalized name is a no-op.
    pub fn normalize(s: &str) -> Self {
        let mut out: String = s
            .to_lowercase()
            .chars()
            .map(|c| if name_char_ok(c) { c } else { '-' })
            .collect();
        out.truncate(MAX_NAME_LEN);
        if out.is_empty() {
            out.push('-');
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fmt_delegate!();
}

/// Name of a secret. Matches `^[A-Za-z0-9_]{1,100}$` (no dashes).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretName(String);

impl SecretName {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() || s.len() > MAX_NAME_LEN {
            return Err(Error::validation(format!(
                "secret name must be 1-{MAX_NAME_LEN} characters, got {s:?}"
            )));
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::validation(format!(
                "secret name may only contain letters, digits and '_': {s:?}"
            )));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretName {
    fmt_delegate!();
}

/// Runner-selection label: lowercase letters, digits, '_' and '-'.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() || s.len() > MAX_NAME_LEN {
            return Err(Error::validation(format!(
                "label must be 1-{MAX_NAME_LEN} characters, got {s:?}"
            )));
        }
        let ok = s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !ok {
            return Err(Error::validation(format!(
                "label may only contain lowercase letters, digits, '_' and '-': {s:?}"
            )));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fmt_delegate!();
}

// ─── Fully-qualified node names ───────────────────────────────

/// Fully-qualified name of a node in a build graph:
/// `workflow[.job[.step]]`. The empty workflow is the default workflow;
/// an empty step names the job itself. Dots are forbidden inside parts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeFqn {
    pub workflow: String,
    pub job: String,
    pub step: String,
}

impl NodeFqn {
    pub fn job(workflow: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            job: job.into(),
            step: String::new(),
        }
    }

    pub fn step(
        workflow: impl Into<String>,
        job: impl Into<String>,
        step: impl Into<String>,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            job: job.into(),
            step: step.into(),
        }
    }

    /// The job-level prefix of this name (step stripped).
    pub fn job_fqn(&self) -> NodeFqn {
        NodeFqn::job(self.workflow.clone(), self.job.clone())
    }

    pub fn is_job_level(&self) -> bool {
        self.step.is_empty()
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '.');
        let workflow = parts.next().unwrap_or("").to_string();
        let job = parts.next().unwrap_or("").to_string();
        let step = parts.next().unwrap_or("").to_string();
        if !step.is_empty() && job.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "node name has a step but no job: {s:?}"
            )));
        }
        Ok(Self {
            workflow,
            job,
            step,
        })
    }
}

impl fmt::Display for NodeFqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.workflow)?;
        if !self.job.is_empty() || !self.step.is_empty() {
            write!(f, ".{}", self.job)?;
        }
        if !self.step.is_empty() {
            write!(f, ".{}", self.step)?;
        }
        Ok(())
    }
}

// ─── Etags ────────────────────────────────────────────────────

/// Opaque optimistic-concurrency token. Writers must present the current
/// etag; every successful write mints a new one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Etag(String);

impl Etag {
    pub fn mint() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn from_str_unchecked(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Etag {
    fn default() -> Self {
        Self::mint()
    }
}

impl fmt::Display for Etag {
    fmt_delegate!();
}

// ─── External resource ids ────────────────────────────────────

/// Identity of a resource inside an external system (e.g. an SCM host).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalResourceId {
    pub system: String,
    pub id: String,
}

impl ExternalResourceId {
    pub fn new(system: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ExternalResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.system, self.id)
    }
}

// ─── Pagination cursors ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorDirection {
    Next,
    Prev,
}

/// Opaque bidirectional pagination cursor: base64 of
/// `{"direction":…,"marker":…}`. Callers must treat the token as opaque.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub direction: CursorDirection,
    pub marker: String,
}

impl Cursor {
    pub fn next(marker: impl Into<String>) -> Self {
        Self {
            direction: CursorDirection::Next,
            marker: marker.into(),
        }
    }

    pub fn prev(marker: impl Into<String>) -> Self {
        Self {
            direction: CursorDirection::Prev,
            marker: marker.into(),
        }
    }

    pub fn encode(&self) -> String {
        // Serializing a two-field struct cannot fail.
        let json = serde_json::to_vec(self).expect("cursor serialization");
        BASE64.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(token)
            .map_err(|e| Error::InvalidArgument(format!("malformed cursor: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidArgument(format!("malformed cursor: {e}")))
    }
}
