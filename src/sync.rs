use crate::adapters::{GroupMeta, LegalEntityMeta, PermissionMeta, ScmAdapter};
use crate::error::Result;
use crate::ids::*;
use crate::store::Store;
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Counts of what one reconciliation pass touched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub legal_entities: u32,
    pub repos: u32,
    pub groups: u32,
    pub memberships: u32,
    pub grants: u32,
    pub errors: u32,
}

/// Reconciles the tenant model (owners, repos, groups, memberships,
/// grants) from the source-of-truth listings of the SCM adapter.
///
/// Every write is an idempotent upsert, so a pass can be repeated or
/// interrupted at any point. A failure for one owner is logged and the
/// pass continues; a sync never aborts on a single-tenant error.
pub struct Reconciler {
    store: Arc<dyn Store>,
    scm: Arc<dyn ScmAdapter>,
    source_system: String,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, scm: Arc<dyn ScmAdapter>, source_system: String) -> Self {
        Self {
            store,
            scm,
            source_system,
        }
    }

    /// Reconcile every owner the adapter lists. Callers bound the pass
    /// with an enclosing timeout; store calls return `cancelled` when it
    /// fires.
    pub async fn sync_all(&self) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        let owners = self.scm.list_legal_entities().await?;
        tracing::info!(owners = owners.len(), "reconciliation pass started");
        for owner in owners {
            match self.sync_legal_entity(&owner).await {
                Ok(s) => {
                    stats.legal_entities += s.legal_entities;
                    stats.repos += s.repos;
                    stats.groups += s.groups;
                    stats.memberships += s.memberships;
                    stats.grants += s.grants;
                    stats.errors += s.errors;
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(
                        owner = %owner.external_id,
                        error = %e,
                        "owner reconciliation failed, continuing"
                    );
                }
            }
        }
        tracing::info!(?stats, "reconciliation pass finished");
        Ok(stats)
    }

    /// Reconcile a single owner: the legal entity itself, its repos, its
    /// groups and memberships, and its permission grants.
    pub async fn sync_legal_entity(&self, owner: &LegalEntityMeta) -> Result<SyncStats> {
        let store = self.store.as_ref();
        let mut stats = SyncStats::default();

        let at = now();
        let (entity, created, updated) = store
            .upsert_legal_entity(
                None,
                &LegalEntity {
                    id: LegalEntityId::nil(),
                    name: ResourceName::normalize(&owner.name),
                    kind: owner.kind,
                    external_id: owner.external_id.clone(),
                    email: owner.email.clone(),
                    created_at: at,
                    updated_at: at,
                    etag: Etag::mint(),
                },
            )
            .await?;
        if created || updated {
            stats.legal_entities += 1;
        }
        // The owner's identity is what grants attach to.
        let identity = self.ensure_identity(&entity.id.to_string()).await?;

        let mut repos_by_external: HashMap<ExternalResourceId, RepoId> = HashMap::new();
        match self.scm.list_repos(owner).await {
            Ok(repos) => {
                for meta in repos {
                    let (repo, created, updated) = store
                        .upsert_repo(
                            None,
                            &Repo {
                                id: RepoId::nil(),
                                legal_entity_id: entity.id,
                                name: ResourceName::normalize(&meta.name),
                                external_id: meta.external_id.clone(),
                                default_branch: meta.default_branch.clone(),
                                link: meta.link.clone(),
                                enabled: true,
                                created_at: at,
                                updated_at: at,
                                deleted_at: None,
                                etag: Etag::mint(),
                            },
                        )
                        .await?;
                    if created || updated {
                        stats.repos += 1;
                    }
                    repos_by_external.insert(meta.external_id, repo.id);
                }
            }
            Err(e) => {
                stats.errors += 1;
                tracing::warn!(owner = %owner.external_id, error = %e, "repo listing failed");
            }
        }

        let mut groups_by_external: HashMap<ExternalResourceId, GroupId> = HashMap::new();
        match self.scm.list_groups(owner).await {
            Ok(groups) => {
                for meta in groups {
                    match self.sync_group(&entity, &meta).await {
                        Ok((group_id, group_touched, members_added)) => {
                            groups_by_external.insert(meta.external_id.clone(), group_id);
                            if group_touched {
                                stats.groups += 1;
                            }
                            stats.memberships += members_added;
                        }
                        Err(e) => {
                            stats.errors += 1;
                            tracing::warn!(
                                group = %meta.external_id,
                                error = %e,
                                "group reconciliation failed, continuing"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                stats.errors += 1;
                tracing::warn!(owner = %owner.external_id, error = %e, "group listing failed");
            }
        }

        match self.scm.list_permissions(owner).await {
            Ok(permissions) => {
                for meta in permissions {
                    match self
                        .sync_grant(&meta, &groups_by_external, &repos_by_external, identity.id)
                        .await
                    {
                        Ok(true) => stats.grants += 1,
                        Ok(false) => {}
                        Err(e) => {
                            stats.errors += 1;
                            tracing::warn!(
                                operation = %meta.operation,
                                error = %e,
                                "grant reconciliation failed, continuing"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                stats.errors += 1;
                tracing::warn!(owner = %owner.external_id, error = %e, "permission listing failed");
            }
        }

        Ok(stats)
    }

    async fn sync_group(
        &self,
        owner: &LegalEntity,
        meta: &GroupMeta,
    ) -> Result<(GroupId, bool, u32)> {
        let store = self.store.as_ref();
        let at = now();
        let (group, created, updated) = store
            .upsert_group(
                None,
                &Group {
                    id: GroupId::nil(),
                    legal_entity_id: owner.id,
                    name: ResourceName::normalize(&meta.name),
                    external_id: Some(meta.external_id.clone()),
                    created_at: at,
                    updated_at: at,
                    etag: Etag::mint(),
                },
            )
            .await?;

        let mut added = 0;
        for member in &meta.members {
            // Members are identified externally; their identity row is
            // created on first sight.
            let identity = self.ensure_identity(&member.to_string()).await?;
            let fresh = store
                .upsert_group_membership(
                    None,
                    &GroupMembership {
                        group_id: group.id,
                        identity_id: identity.id,
                        source_system: self.source_system.clone(),
                        created_at: at,
                    },
                )
                .await?;
            if fresh {
                added += 1;
            }
        }
        Ok((group.id, created || updated, added))
    }

    async fn sync_grant(
        &self,
        meta: &PermissionMeta,
        groups: &HashMap<ExternalResourceId, GroupId>,
        repos: &HashMap<ExternalResourceId, RepoId>,
        fallback_identity: IdentityId,
    ) -> Result<bool> {
        let Some(repo_id) = repos.get(&meta.repo_external_id) else {
            tracing::debug!(
                repo = %meta.repo_external_id,
                "grant references unlisted repo, skipping"
            );
            return Ok(false);
        };
        let holder = match groups.get(&meta.group_external_id) {
            Some(group_id) => GrantHolder::Group(*group_id),
            None => GrantHolder::Identity(fallback_identity),
        };
        self.store
            .upsert_grant(
                None,
                &Grant {
                    id: GrantId::new(),
                    holder,
                    operation: meta.operation.clone(),
                    target_resource_id: repo_id.to_string(),
                    created_at: now(),
                },
            )
            .await
    }

    async fn ensure_identity(&self, owner_resource_id: &str) -> Result<Identity> {
        let store = self.store.as_ref();
        if let Some(identity) = store.identity_for_owner(None, owner_resource_id).await? {
            return Ok(identity);
        }
        let identity = Identity {
            id: IdentityId::new(),
            owner_resource_id: owner_resource_id.to_string(),
            created_at: now(),
        };
        store.create_identity(None, &identity).await?;
        Ok(identity)
    }
}
