use crate::adapters::{CommitMeta, ScmAdapter};
use crate::error::{Error, Result};
use crate::graph::BuildGraph;
use crate::ids::*;
use crate::queue::{QueueService, DEFAULT_MAX_CONFIG_LEN};
use crate::store::{Store, TxScope};
use crate::types::*;
use std::sync::Arc;

/// Commit→build intake: the critical section that guarantees exactly one
/// build per commit-on-ref no matter how many webhook deliveries or
/// reconciler passes race each other.
pub struct IntakeService {
    store: Arc<dyn Store>,
    queue: Arc<QueueService>,
    scm: Arc<dyn ScmAdapter>,
    max_config_len: usize,
}

impl IntakeService {
    pub fn new(store: Arc<dyn Store>, queue: Arc<QueueService>, scm: Arc<dyn ScmAdapter>) -> Self {
        Self {
            store,
            queue,
            scm,
            max_config_len: DEFAULT_MAX_CONFIG_LEN,
        }
    }

    pub fn with_max_config_len(mut self, max: usize) -> Self {
        self.max_config_len = max;
        self
    }

    /// Handle a ref-update notification: resolve the head commit, decide
    /// whether a build is needed, and enqueue at most one.
    ///
    /// The fast path reads outside any transaction so racing deliveries
    /// for already-built commits never contend on locks. The slow path
    /// re-runs the build search under a commit-row lock, which serializes
    /// the enqueue decision.
    pub async fn handle_ref_update(
        &self,
        repo_id: RepoId,
        git_ref: &str,
        opts: BuildOptions,
    ) -> Result<Option<BuildGraph>> {
        let store = self.store.as_ref();
        let repo = store.repo(None, repo_id).await?;
        if !repo.enabled {
            tracing::debug!(repo_id = %repo_id, "intake skipped: repo disabled");
            return Ok(None);
        }

        // 1. Head commit, upserted without config.
        let meta = self
            .scm
            .head_commit(&repo, git_ref)
            .await
            .map_err(|e| e.wrap("read head commit"))?;
        let (commit, _, _) = store
            .upsert_commit(None, &commit_row(&repo, &meta, None, ConfigType::Unknown))
            .await?;

        // 2. Fast path: any existing non-canceled build (including
        //    successful completions) means there is nothing to do.
        let existing = store
            .builds_for_commit(
                None,
                commit.id,
                git_ref,
                &[WorkflowStatus::Canceled, WorkflowStatus::Unknown],
            )
            .await?;
        if !existing.is_empty() {
            tracing::debug!(
                commit = %commit.sha,
                git_ref,
                builds = existing.len(),
                "intake skipped: build already exists"
            );
            return Ok(None);
        }

        // 3. Read the config and fill the commit forward.
        let commit = match self.scm.config_file(&repo, &meta.sha).await {
            Ok((bytes, config_type)) => {
                if bytes.len() > self.max_config_len {
                    let message = format!(
                        "pipeline config is {} bytes, exceeding the {} byte limit",
                        bytes.len(),
                        self.max_config_len
                    );
                    let (commit, _, _) = store
                        .upsert_commit(
                            None,
                            &commit_row(&repo, &meta, Some(message), ConfigType::Invalid),
                        )
                        .await?;
                    tracing::warn!(commit = %commit.sha, "pipeline config over length limit");
                    return Ok(None);
                }
                let body = String::from_utf8(bytes).map_err(|_| {
                    Error::validation(format!("commit {}: config is not utf-8", meta.sha))
                })?;
                let (commit, _, _) = store
                    .upsert_commit(None, &commit_row(&repo, &meta, Some(body), config_type))
                    .await?;
                commit
            }
            Err(e) if e.is_not_found() => {
                // No pipeline config at this commit: record that and stop.
                let (commit, _, _) = store
                    .upsert_commit(None, &commit_row(&repo, &meta, None, ConfigType::Absent))
                    .await?;
                tracing::debug!(commit = %commit.sha, "intake skipped: no pipeline config");
                return Ok(None);
            }
            Err(e) => return Err(e.wrap("read pipeline config")),
        };

        if commit.config.is_none() || commit.config_type == ConfigType::Invalid {
            return Ok(None);
        }

        // 4.–5. The critical section: lock the commit row, re-check, enqueue.
        let mut scope = TxScope::enter(store, None).await?;
        store
            .lock_row_for_update(scope.tx(), &commit.id.to_string())
            .await?;
        let existing = store
            .builds_for_commit(
                Some(scope.tx()),
                commit.id,
                git_ref,
                &[WorkflowStatus::Canceled, WorkflowStatus::Unknown],
            )
            .await?;
        if !existing.is_empty() {
            scope.commit(store).await?;
            return Ok(None);
        }
        let graph = self
            .queue
            .enqueue_build_for_commit(Some(scope.tx()), &commit, git_ref, opts)
            .await?;
        scope.commit(store).await?;
        tracing::info!(
            commit = %commit.sha,
            git_ref,
            build_id = %graph.build.id,
            "build enqueued for ref update"
        );
        Ok(Some(graph))
    }
}

/// Commit row for an upsert. Fill-forward semantics live in the store:
/// author/committer identities and an existing config are never
/// overwritten by later upserts.
fn commit_row(
    repo: &Repo,
    meta: &CommitMeta,
    config: Option<String>,
    config_type: ConfigType,
) -> Commit {
    let at = now();
    Commit {
        id: CommitId::nil(),
        repo_id: repo.id,
        sha: meta.sha.clone(),
        message: meta.message.clone(),
        author_id: None,
        author_name: meta.author_name.clone(),
        author_email: meta.author_email.clone(),
        committer_id: None,
        committer_name: meta.committer_name.clone(),
        committer_email: meta.committer_email.clone(),
        config,
        config_type,
        link: meta.link.clone(),
        created_at: at,
        updated_at: at,
        etag: Etag::mint(),
    }
}
