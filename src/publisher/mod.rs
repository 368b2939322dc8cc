//! # SCM Publisher
//!
//! Turns a repository tag into a published module version: download the
//! source tarball at the exact commit, extract it with the archive guards,
//! validate the module, rebuild an immutable tarball with the commit
//! manifest, upload it, and record the version row.
//!
//! Both entry points (webhook dispatch and operator-triggered manual sync)
//! converge on [`Publisher::publish_module_version`], which is idempotent on
//! `(module_id, version)`.

pub mod archive;
pub mod audit;
pub mod tag;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::db::modules::{ModuleVersion, NewModuleVersion};
use crate::db::scm::{ModuleScmRepo, ScmProvider};
use crate::db::{Database, DbError};
use crate::scm::{ConnectorConfig, ConnectorRegistry, Pagination, ScmConnector, ScmProviderType};
use crate::storage::LazyStorage;

#[derive(Debug)]
pub enum PublishOutcome {
    Published(ModuleVersion),
    Skipped(String),
}

/// Counters reported by a manual tag sync.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SyncSummary {
    pub published: u32,
    pub skipped: u32,
    pub failed: u32,
}

pub struct Publisher {
    db: Database,
    storage: Arc<LazyStorage>,
    connectors: &'static ConnectorRegistry,
    cipher: TokenCipher,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

impl Publisher {
    pub fn new(
        db: Database,
        storage: Arc<LazyStorage>,
        connectors: &'static ConnectorRegistry,
        cipher: TokenCipher,
    ) -> Self {
        Self {
            db,
            storage,
            connectors,
            cipher,
        }
    }

    /// Build a connector for a stored SCM provider, decrypting its client
    /// secret at this boundary only.
    pub async fn connector_for(
        &self,
        scm_provider_id: Uuid,
    ) -> Result<(ScmProvider, Arc<dyn ScmConnector>)> {
        let provider = self
            .db
            .scm()
            .get_provider(scm_provider_id)
            .await?
            .context("scm provider not found")?;
        let provider_type = ScmProviderType::parse(&provider.provider_type)
            .with_context(|| format!("unknown scm provider type {:?}", provider.provider_type))?;
        let client_secret = match &provider.client_secret_encrypted {
            Some(sealed) => Some(self.cipher.open(sealed)?),
            None => None,
        };
        let connector = self.connectors.create(ConnectorConfig {
            provider_type,
            base_url: provider.base_url.clone(),
            client_id: provider.client_id.clone(),
            client_secret,
            tenant_id: provider.tenant_id.clone(),
        })?;
        Ok((provider, connector))
    }

    /// OAuth token for the module owner on this provider, decrypted.
    /// Absent token means the repository must be public.
    async fn user_token(&self, user_id: Option<Uuid>, scm_provider_id: Uuid) -> Option<String> {
        let user_id = user_id?;
        let token = self
            .db
            .scm()
            .get_user_token(user_id, scm_provider_id)
            .await
            .ok()??;
        match self.cipher.open(&token.access_token_encrypted) {
            Ok(plaintext) => Some(plaintext),
            Err(error) => {
                tracing::warn!(%user_id, %error, "cannot decrypt scm token, proceeding unauthenticated");
                None
            }
        }
    }

    /// The tag → version pipeline. Idempotent: an existing
    /// `(module, version)` row short-circuits to `Skipped`.
    #[tracing::instrument(skip(self, repo_link), fields(module_id = %repo_link.module_id, tag = tag_name))]
    pub async fn publish_module_version(
        &self,
        repo_link: &ModuleScmRepo,
        tag_name: &str,
        commit_sha: &str,
        published_by: Option<Uuid>,
    ) -> Result<PublishOutcome> {
        let module = self
            .db
            .modules()
            .get_by_id(repo_link.module_id)
            .await?
            .context("module not found")?;

        let Some(version) = tag::extract_version_from_tag(tag_name, &repo_link.tag_pattern) else {
            return Ok(PublishOutcome::Skipped(format!(
                "tag {tag_name:?} does not match pattern {:?}",
                repo_link.tag_pattern
            )));
        };

        if self.db.modules().get_version(module.id, &version).await?.is_some() {
            return Ok(PublishOutcome::Skipped(format!(
                "version {version} already published"
            )));
        }

        let (provider, connector) = self.connector_for(repo_link.scm_provider_id).await?;
        let token = self.user_token(module.created_by, provider.id).await;

        tracing::info!(%version, commit = commit_sha, "downloading source archive");
        let mut stream = connector
            .download_source_archive(
                token.as_deref(),
                &repo_link.repository_owner,
                &repo_link.repository_name,
                commit_sha,
            )
            .await?;

        // Spool the archive; extraction and re-tarballing are blocking work.
        let mut source = tempfile::NamedTempFile::new()?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            source.write_all(&buf[..n])?;
        }
        source.flush()?;

        let module_path = repo_link.module_path.clone();
        let commit = commit_sha.to_string();
        let published_at = Utc::now();
        let (tarball, _size, _sha256, readme) = tokio::task::spawn_blocking(
            move || -> Result<(tempfile::NamedTempFile, u64, String, Option<String>)> {
                let extract_dir = tempfile::tempdir()?;
                archive::extract_tar_gz(std::fs::File::open(source.path())?, extract_dir.path())?;
                let module_dir = archive::resolve_module_dir(extract_dir.path(), &module_path)?;
                archive::validate_module_dir(&module_dir)?;
                let readme = archive::extract_readme(&module_dir);
                let out = tempfile::NamedTempFile::new()?;
                let (size, sha256) =
                    archive::build_module_archive(&module_dir, &commit, published_at, out.path())?;
                Ok((out, size, sha256, readme))
            },
        )
        .await
        .context("archive worker panicked")??;

        let storage_path = format!(
            "modules/{}/{}/{}/{}-{}.tar.gz",
            module.namespace, module.name, module.system, module.name, version
        );
        let backend = self.storage.get().await?;
        let file = tokio::fs::File::open(tarball.path()).await?;
        let info = backend.upload(&storage_path, Box::pin(file)).await?;
        crate::observability::metrics::increment_module_publishes();

        let created = self
            .db
            .modules()
            .create_version(&NewModuleVersion {
                module_id: module.id,
                version: version.clone(),
                storage_path: info.path,
                storage_backend: backend.name().to_string(),
                size_bytes: info.size as i64,
                checksum: info.sha256,
                readme,
                published_by,
                commit_sha: Some(commit_sha.to_string()),
                tag_name: Some(tag_name.to_string()),
                scm_repo_id: Some(repo_link.id),
            })
            .await;

        match created {
            Ok(row) => {
                self.db
                    .scm()
                    .record_repo_sync(repo_link.id, Some(commit_sha))
                    .await
                    .ok();
                tracing::info!(version_id = %row.id, %version, "module version published");
                Ok(PublishOutcome::Published(row))
            }
            // A concurrent publisher won the insert; its row is the result.
            // The tarball we uploaded may be an orphan, which operators accept.
            Err(DbError::Conflict(_)) => Ok(PublishOutcome::Skipped(format!(
                "version {version} published concurrently"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Operator-triggered sync: walk the repository tags and publish every
    /// one matching the link's pattern.
    #[tracing::instrument(skip(self))]
    pub async fn sync_module_tags(&self, module_id: Uuid) -> Result<SyncSummary> {
        let link = self
            .db
            .scm()
            .get_repo_link_by_module(module_id)
            .await?
            .context("module has no scm link")?;
        let module = self
            .db
            .modules()
            .get_by_id(module_id)
            .await?
            .context("module not found")?;
        let (provider, connector) = self.connector_for(link.scm_provider_id).await?;
        let token = self.user_token(module.created_by, provider.id).await;

        let mut summary = SyncSummary::default();
        let mut page = Pagination::default();
        loop {
            let tags = connector
                .fetch_tags(
                    token.as_deref(),
                    &link.repository_owner,
                    &link.repository_name,
                    page,
                )
                .await?;
            let page_len = tags.len() as u32;
            for tag in tags {
                if tag::extract_version_from_tag(&tag.name, &link.tag_pattern).is_none() {
                    continue;
                }
                match self
                    .publish_module_version(&link, &tag.name, &tag.commit_sha, None)
                    .await
                {
                    Ok(PublishOutcome::Published(_)) => summary.published += 1,
                    Ok(PublishOutcome::Skipped(_)) => summary.skipped += 1,
                    Err(error) => {
                        tracing::warn!(tag = %tag.name, %error, "tag publish failed");
                        summary.failed += 1;
                    }
                }
            }
            if page_len < page.per_page || page.page >= 20 {
                break;
            }
            page.page += 1;
        }
        self.db.scm().record_repo_sync(link.id, None).await.ok();
        Ok(summary)
    }

    /// Webhook continuation: run the pipeline for a logged event and record
    /// the terminal state on the event row.
    pub async fn process_webhook_event(&self, event_id: Uuid) {
        if let Err(error) = self.run_webhook_event(event_id).await {
            tracing::error!(%event_id, %error, "webhook event processing failed");
            self.db
                .scm()
                .complete_event(event_id, "failed", None, Some(&error.to_string()))
                .await
                .ok();
        }
    }

    async fn run_webhook_event(&self, event_id: Uuid) -> Result<()> {
        let event = self
            .db
            .scm()
            .get_webhook_event(event_id)
            .await?
            .context("webhook event not found")?;
        let link = self
            .db
            .scm()
            .get_repo_link(event.module_scm_repo_id)
            .await?
            .context("repo link not found")?;
        self.db.scm().mark_event_processing(event.id).await?;

        let tag_name = event
            .tag_name
            .clone()
            .context("event carries no tag name")?;
        let commit_sha = match event.commit_sha.clone() {
            Some(sha) => sha,
            None => {
                // Some providers omit the commit on tag-create events.
                let module = self
                    .db
                    .modules()
                    .get_by_id(link.module_id)
                    .await?
                    .context("module not found")?;
                let (provider, connector) = self.connector_for(link.scm_provider_id).await?;
                let token = self.user_token(module.created_by, provider.id).await;
                connector
                    .get_tag_commit(
                        token.as_deref(),
                        &link.repository_owner,
                        &link.repository_name,
                        &tag_name,
                    )
                    .await?
                    .context("tag not found on repository")?
            }
        };

        match self
            .publish_module_version(&link, &tag_name, &commit_sha, None)
            .await
        {
            Ok(PublishOutcome::Published(version)) => {
                self.db
                    .scm()
                    .complete_event(event.id, "completed", Some(version.id), None)
                    .await?;
            }
            Ok(PublishOutcome::Skipped(reason)) => {
                self.db
                    .scm()
                    .complete_event(event.id, "skipped", None, Some(&reason))
                    .await?;
            }
            Err(error) => {
                self.db
                    .scm()
                    .complete_event(event.id, "failed", None, Some(&error.to_string()))
                    .await?;
            }
        }
        Ok(())
    }
}
