//! Tag immutability audit.
//!
//! SCM-sourced versions record the tag and commit they were published from.
//! This worker periodically re-resolves each tag; a tag that now points at a
//! different commit produces an open alert for operators.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::constants::TAG_AUDIT_INTERVAL_SECS;
use crate::db::Database;

use super::Publisher;

pub struct TagAuditWorker {
    db: Database,
    publisher: Arc<Publisher>,
    interval: Duration,
}

impl std::fmt::Debug for TagAuditWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagAuditWorker").finish_non_exhaustive()
    }
}

impl TagAuditWorker {
    pub fn new(db: Database, publisher: Arc<Publisher>) -> Self {
        Self {
            db,
            publisher,
            interval: Duration::from_secs(TAG_AUDIT_INTERVAL_SECS),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {
                    tracing::info!("tag audit worker stopping");
                    return;
                }
            }
            if let Err(error) = self.run_once().await {
                tracing::error!(%error, "tag audit pass failed");
            }
        }
    }

    /// One audit pass over every SCM-sourced version.
    pub async fn run_once(&self) -> anyhow::Result<()> {
        let versions = self.db.modules().list_scm_sourced_versions().await?;
        tracing::debug!(count = versions.len(), "auditing scm-sourced versions");
        for version in versions {
            let (Some(link_id), Some(tag_name), Some(original_sha)) = (
                version.scm_repo_id,
                version.tag_name.clone(),
                version.commit_sha.clone(),
            ) else {
                continue;
            };
            let Some(link) = self.db.scm().get_repo_link(link_id).await? else {
                continue;
            };
            let Some(module) = self.db.modules().get_by_id(link.module_id).await? else {
                continue;
            };

            let (provider, connector) = match self.publisher.connector_for(link.scm_provider_id).await {
                Ok(pair) => pair,
                Err(error) => {
                    tracing::warn!(link_id = %link.id, %error, "cannot build connector for audit");
                    continue;
                }
            };
            let token = self
                .publisher
                .user_token_for_audit(module.created_by, provider.id)
                .await;

            let current = match connector
                .get_tag_commit(
                    token.as_deref(),
                    &link.repository_owner,
                    &link.repository_name,
                    &tag_name,
                )
                .await
            {
                Ok(sha) => sha,
                Err(error) => {
                    tracing::warn!(tag = %tag_name, %error, "tag re-resolution failed");
                    continue;
                }
            };

            if let Some(detected) = current {
                if detected != original_sha {
                    tracing::warn!(
                        version_id = %version.id,
                        tag = %tag_name,
                        original = %original_sha,
                        detected = %detected,
                        "tag moved after publication"
                    );
                    let _ = self
                        .db
                        .scm()
                        .create_tag_alert(version.id, &tag_name, &original_sha, &detected)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

impl Publisher {
    /// Token resolution for the audit worker, which shares the publisher's
    /// decryption boundary.
    pub(crate) async fn user_token_for_audit(
        &self,
        user_id: Option<uuid::Uuid>,
        scm_provider_id: uuid::Uuid,
    ) -> Option<String> {
        self.user_token(user_id, scm_provider_id).await
    }
}
