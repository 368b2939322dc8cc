//! Terraform/OpenTofu binary mirror sync worker.
//!
//! Same interval skeleton as the provider mirror: wake, query due configs,
//! sync each. Within a config, the version list is reconciled first, then
//! pending or previously failed platforms are downloaded, verified, and
//! uploaded with bounded parallelism.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::auth::policy;
use crate::constants::{
    SYNC_BACKOFF_MAX_MS, SYNC_BACKOFF_START_MS, SYNC_DOWNLOAD_RETRIES,
    SYNC_PLATFORM_CONCURRENCY, SYNC_TICK_INTERVAL_SECS,
};
use crate::db::mirrors::SyncStatus;
use crate::db::tf_mirrors::{parse_platform_filter, TerraformMirrorConfig, TerraformVersionPlatform};
use crate::db::Database;
use crate::storage::LazyStorage;

use super::releases::{Release, ReleaseIndexClient};

#[derive(Debug, Default)]
struct SyncCounters {
    versions_synced: i64,
    platforms_synced: i64,
    platforms_failed: i64,
}

#[derive(Clone)]
pub struct TerraformMirrorWorker {
    db: Database,
    storage: Arc<LazyStorage>,
}

impl std::fmt::Debug for TerraformMirrorWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerraformMirrorWorker").finish_non_exhaustive()
    }
}

impl TerraformMirrorWorker {
    pub fn new(db: Database, storage: Arc<LazyStorage>) -> Self {
        Self { db, storage }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(SYNC_TICK_INTERVAL_SECS));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let due = match self.db.tf_mirrors().get_configs_needing_sync().await {
                Ok(configs) => configs,
                Err(error) => {
                    tracing::error!(%error, "cannot query terraform mirrors due for sync");
                    continue;
                }
            };
            for config in due {
                let worker = self.clone();
                in_flight.spawn(async move {
                    let config_id = config.id;
                    if let Err(error) = worker.sync_config(config, "scheduler").await {
                        tracing::error!(%config_id, %error, "terraform mirror sync failed");
                    }
                });
            }
            while in_flight.try_join_next().is_some() {}
        }

        tracing::info!("terraform mirror worker draining in-flight syncs");
        while in_flight.join_next().await.is_some() {}
    }

    #[tracing::instrument(skip(self, config), fields(config_id = %config.id, name = %config.name, tool = %config.tool))]
    pub async fn sync_config(&self, config: TerraformMirrorConfig, triggered_by: &str) -> Result<()> {
        let repo = self.db.tf_mirrors();
        repo.update_sync_status(config.id, SyncStatus::InProgress, None)
            .await?;
        let history_id = repo.create_sync_history(config.id, triggered_by).await?;
        crate::observability::metrics::increment_binary_syncs();

        match self.sync_inner(&config).await {
            Ok(counters) => {
                let status = if counters.platforms_failed > 0 && counters.platforms_synced == 0 {
                    SyncStatus::Failed
                } else {
                    SyncStatus::Success
                };
                let error = (status == SyncStatus::Failed)
                    .then(|| "all platform downloads failed".to_string());
                repo.update_sync_status(config.id, status, error.as_deref())
                    .await?;
                repo.complete_sync_history(
                    history_id,
                    status.as_str(),
                    counters.versions_synced,
                    counters.platforms_synced,
                    counters.platforms_failed,
                    error.as_deref(),
                    None,
                )
                .await?;
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                repo.update_sync_status(config.id, SyncStatus::Failed, Some(&message))
                    .await?;
                repo.complete_sync_history(history_id, "failed", 0, 0, 0, Some(&message), None)
                    .await?;
                Err(error)
            }
        }
    }

    async fn sync_inner(&self, config: &TerraformMirrorConfig) -> Result<SyncCounters> {
        let client = ReleaseIndexClient::new();
        let releases = client
            .fetch_index(&config.tool, config.upstream_url.as_deref())
            .await?;
        let platform_filter = parse_platform_filter(config.platform_filter.as_deref());
        let mut counters = SyncCounters::default();

        // Reconcile version rows first, then flip the latest flag once.
        let mut kept: Vec<(Release, uuid::Uuid)> = Vec::new();
        for release in releases {
            if config.stable_only && release.prerelease {
                continue;
            }
            if !policy::pattern_matches(config.version_filter.as_deref(), &release.version) {
                continue;
            }
            let row = self
                .db
                .tf_mirrors()
                .upsert_version(config.id, &release.version, release.release_date)
                .await?;
            kept.push((release, row.id));
        }

        // Releases arrive newest-first; the head stable release is latest.
        if let Some((_, latest_id)) = kept.first() {
            self.db
                .tf_mirrors()
                .set_latest_version(config.id, *latest_id)
                .await?;
        }

        for (release, version_id) in kept {
            let shasums = match &release.shasums_url {
                Some(url) => client.fetch_shasums(url).await.unwrap_or_default(),
                None => Default::default(),
            };

            let mut attempted = 0u32;
            let mut synced = 0u32;
            let semaphore = Arc::new(Semaphore::new(SYNC_PLATFORM_CONCURRENCY));
            let mut tasks: JoinSet<Result<bool>> = JoinSet::new();

            for platform in &release.platforms {
                let key = format!("{}_{}", platform.os, platform.arch);
                if let Some(filter) = &platform_filter {
                    if !filter.contains(&key) {
                        continue;
                    }
                }
                let row = self
                    .db
                    .tf_mirrors()
                    .upsert_platform(
                        version_id,
                        &platform.os,
                        &platform.arch,
                        &platform.url,
                        &platform.filename,
                        shasums.get(&platform.filename).map(String::as_str),
                    )
                    .await?;
                if row.sync_status != "pending" && row.sync_status != "failed" {
                    continue;
                }

                attempted += 1;
                let permit = Arc::clone(&semaphore).acquire_owned().await?;
                let worker = self.clone();
                let config_name = config.name.clone();
                let version = release.version.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    worker.sync_platform(&config_name, &version, row).await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined.context("platform task panicked")? {
                    Ok(_) => {
                        synced += 1;
                        counters.platforms_synced += 1;
                    }
                    Err(error) => {
                        counters.platforms_failed += 1;
                        tracing::warn!(version = %release.version, %error, "binary platform sync failed");
                    }
                }
            }

            let status = if attempted == 0 {
                // Everything already synced on an earlier pass.
                "synced"
            } else if synced > 0 {
                counters.versions_synced += 1;
                "synced"
            } else {
                "failed"
            };
            let error = (status == "failed").then(|| "all platform downloads failed".to_string());
            self.db
                .tf_mirrors()
                .update_version_sync_status(version_id, status, error.as_deref())
                .await?;
        }
        Ok(counters)
    }

    /// Download one binary zip with retries, verify, upload, and record.
    async fn sync_platform(
        &self,
        config_name: &str,
        version: &str,
        platform: TerraformVersionPlatform,
    ) -> Result<bool> {
        let client = ReleaseIndexClient::new();
        let backend = self.storage.get().await.context("storage unavailable")?;
        let storage_key = format!(
            "terraform-mirror/{config_name}/{version}/{}_{}/{}",
            platform.os, platform.arch, platform.filename
        );

        let mut attempt = 0u32;
        let result = loop {
            attempt += 1;
            let outcome = async {
                let reader = client.download(&platform.upstream_url).await?;
                backend
                    .upload(&storage_key, Box::pin(reader))
                    .await
                    .context("binary upload failed")
            }
            .await;
            match outcome {
                Ok(uploaded) => break Ok(uploaded),
                Err(error) if attempt < SYNC_DOWNLOAD_RETRIES => {
                    let delay =
                        (SYNC_BACKOFF_START_MS * 2u64.pow(attempt - 1)).min(SYNC_BACKOFF_MAX_MS);
                    tracing::warn!(%error, attempt, delay_ms = delay, "binary download retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(error) => break Err(error),
            }
        };

        let uploaded = match result {
            Ok(uploaded) => uploaded,
            Err(error) => {
                self.db
                    .tf_mirrors()
                    .update_platform_sync_status(
                        platform.id,
                        "failed",
                        None,
                        None,
                        0,
                        false,
                        false,
                        Some(&error.to_string()),
                    )
                    .await?;
                return Err(error);
            }
        };

        let sha_verified = match &platform.sha256 {
            Some(expected) => &uploaded.sha256 == expected,
            None => false,
        };
        if platform.sha256.is_some() && !sha_verified {
            backend.delete(&storage_key).await.ok();
            let message = format!(
                "checksum mismatch for {}: expected {}, got {}",
                platform.filename,
                platform.sha256.as_deref().unwrap_or(""),
                uploaded.sha256
            );
            self.db
                .tf_mirrors()
                .update_platform_sync_status(
                    platform.id,
                    "failed",
                    None,
                    None,
                    0,
                    false,
                    false,
                    Some(&message),
                )
                .await?;
            anyhow::bail!(message);
        }

        self.db
            .tf_mirrors()
            .update_platform_sync_status(
                platform.id,
                "synced",
                Some(&storage_key),
                Some(backend.name()),
                uploaded.size as i64,
                sha_verified,
                false,
                None,
            )
            .await?;
        Ok(sha_verified)
    }
}
