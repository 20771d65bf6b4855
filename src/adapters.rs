use crate::error::Result;
use crate::ids::*;
use crate::types::{ConfigType, LegalEntityKind, Repo, WorkflowStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Commit metadata as delivered by the source-control host.
#[derive(Clone, Debug)]
pub struct CommitMeta {
    pub sha: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub author_external_id: Option<ExternalResourceId>,
    pub committer_name: String,
    pub committer_email: String,
    pub committer_external_id: Option<ExternalResourceId>,
    pub link: String,
}

/// Commit-status state strings accepted by the external system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    /// Map an engine workflow status onto the external status vocabulary.
    pub fn from_workflow_status(status: WorkflowStatus) -> Self {
        match status {
            WorkflowStatus::Queued | WorkflowStatus::Submitted | WorkflowStatus::Running => {
                CommitState::Pending
            }
            WorkflowStatus::Succeeded => CommitState::Success,
            WorkflowStatus::Failed | WorkflowStatus::Canceled => CommitState::Failure,
            WorkflowStatus::Unknown => CommitState::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitStatusNotification {
    pub installation_id: String,
    pub owner: String,
    pub repo: String,
    pub sha: String,
    pub state: CommitState,
    pub target_url: String,
    pub description: String,
    pub context: String,
}

/// Receipt from a commit-status delivery; rate information lets callers
/// back off before the host starts rejecting.
#[derive(Clone, Copy, Debug)]
pub struct NotifyReceipt {
    pub status_code: u16,
    pub rate_remaining: Option<u32>,
}

/// An owner as listed by the source-control host during reconciliation.
#[derive(Clone, Debug)]
pub struct LegalEntityMeta {
    pub external_id: ExternalResourceId,
    pub name: String,
    pub kind: LegalEntityKind,
    pub email: String,
}

#[derive(Clone, Debug)]
pub struct RepoMeta {
    pub external_id: ExternalResourceId,
    pub name: String,
    pub default_branch: String,
    pub link: String,
}

#[derive(Clone, Debug)]
pub struct GroupMeta {
    pub external_id: ExternalResourceId,
    pub name: String,
    /// External ids of the member users.
    pub members: Vec<ExternalResourceId>,
}

#[derive(Clone, Debug)]
pub struct PermissionMeta {
    pub group_external_id: ExternalResourceId,
    pub operation: String,
    pub repo_external_id: ExternalResourceId,
}

/// Source-control integration contract. Implementations wrap a concrete
/// host API; failures surface as `Error::External` with `retryable` set
/// according to the host's response.
#[async_trait]
pub trait ScmAdapter: Send + Sync {
    async fn head_commit(&self, repo: &Repo, git_ref: &str) -> Result<CommitMeta>;

    /// The pipeline config file at the commit, with its detected type.
    /// `not-found` when the commit has no config file.
    async fn config_file(&self, repo: &Repo, sha: &str) -> Result<(Vec<u8>, ConfigType)>;

    async fn notify_commit_status(
        &self,
        notification: &CommitStatusNotification,
    ) -> Result<NotifyReceipt>;

    // Reconciliation listings.
    async fn list_legal_entities(&self) -> Result<Vec<LegalEntityMeta>>;
    async fn list_repos(&self, owner: &LegalEntityMeta) -> Result<Vec<RepoMeta>>;
    async fn list_groups(&self, owner: &LegalEntityMeta) -> Result<Vec<GroupMeta>>;
    async fn list_permissions(&self, owner: &LegalEntityMeta) -> Result<Vec<PermissionMeta>>;
}

/// Descriptor for bytes held by the blob store. The engine stores only
/// descriptors; byte I/O is the collaborator's problem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobDescriptor>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn stat(&self, key: &str) -> Result<BlobDescriptor>;
}

/// Authorization decisions are a collaborator concern; the engine only
/// consults the answer to filter reads and gate mutations.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_authorized(
        &self,
        identity: IdentityId,
        operation: &str,
        target_resource_id: &str,
    ) -> Result<bool>;

    /// Number of grants the identity holds for the operation; search
    /// filtering uses this to skip per-row checks when zero.
    async fn count_grants_for_operation(
        &self,
        identity: IdentityId,
        operation: &str,
    ) -> Result<u64>;
}

/// Permit-everything authorizer for tests and single-tenant deployments.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn is_authorized(&self, _: IdentityId, _: &str, _: &str) -> Result<bool> {
        Ok(true)
    }

    async fn count_grants_for_operation(&self, _: IdentityId, _: &str) -> Result<u64> {
        Ok(u64::MAX)
    }
}

/// Secret plaintext is gated behind an explicit `read_plaintext`
/// operation granted only to runner identities during a job, never to
/// administrators.
#[async_trait]
pub trait SecretService: Send + Sync {
    async fn read_plaintext(&self, identity: IdentityId, secret: SecretId) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_status_maps_to_commit_state() {
        use WorkflowStatus::*;
        for s in [Queued, Submitted, Running] {
            assert_eq!(CommitState::from_workflow_status(s), CommitState::Pending);
        }
        assert_eq!(
            CommitState::from_workflow_status(Succeeded),
            CommitState::Success
        );
        assert_eq!(
            CommitState::from_workflow_status(Failed),
            CommitState::Failure
        );
        assert_eq!(
            CommitState::from_workflow_status(Canceled),
            CommitState::Failure
        );
        assert_eq!(
            CommitState::from_workflow_status(Unknown),
            CommitState::Error
        );
    }
}
