//! Provider mirror sync worker.
//!
//! Wakes on an interval, asks the repository which configs are due, and runs
//! one sync per config. Within a config, platform downloads run with bounded
//! parallelism and capped exponential retry; a config reports success when
//! at least one platform synced.

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
use crate::db::mirrors::{MirrorConfig, SyncStatus};
use crate::db::providers::{NewProviderPlatform, NewProviderVersion};
use crate::db::Database;
use crate::storage::LazyStorage;

use super::upstream::UpstreamRegistryClient;

#[derive(Debug, Default)]
struct SyncCounters {
    providers_synced: i64,
    versions_synced: i64,
    versions_failed: i64,
}

#[derive(Clone)]
pub struct MirrorSyncWorker {
    db: Database,
    storage: Arc<LazyStorage>,
}

impl std::fmt::Debug for MirrorSyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSyncWorker").finish_non_exhaustive()
    }
}

impl MirrorSyncWorker {
    pub fn new(db: Database, storage: Arc<LazyStorage>) -> Self {
        Self { db, storage }
    }

    /// Interval loop. The first tick fires immediately; cancellation drains
    /// in-flight config syncs before returning.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(SYNC_TICK_INTERVAL_SECS));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let due = match self.db.mirrors().get_configs_needing_sync().await {
                Ok(configs) => configs,
                Err(error) => {
                    tracing::error!(%error, "cannot query mirror configs due for sync");
                    continue;
                }
            };
            for config in due {
                let worker = self.clone();
                in_flight.spawn(async move {
                    let config_id = config.id;
                    if let Err(error) = worker.sync_config(config, "scheduler").await {
                        tracing::error!(%config_id, %error, "mirror sync failed");
                    }
                });
            }
            // Reap finished syncs without blocking the tick.
            while in_flight.try_join_next().is_some() {}
        }

        tracing::info!("mirror sync worker draining in-flight syncs");
        while in_flight.join_next().await.is_some() {}
    }

    /// Sync one config end to end, owning its `last_sync_*` fields.
    #[tracing::instrument(skip(self, config), fields(config_id = %config.id, name = %config.name))]
    pub async fn sync_config(&self, config: MirrorConfig, triggered_by: &str) -> Result<()> {
        let mirrors = self.db.mirrors();
        mirrors
            .update_sync_status(config.id, SyncStatus::InProgress, None)
            .await?;
        let history_id = mirrors.create_sync_history(config.id, triggered_by).await?;
        crate::observability::metrics::increment_mirror_syncs();

        let outcome = self.sync_inner(&config).await;
        match outcome {
            Ok(counters) => {
                let status = if counters.versions_synced > 0 || counters.versions_failed == 0 {
                    SyncStatus::Success
                } else {
                    SyncStatus::Failed
                };
                let error = (status == SyncStatus::Failed)
                    .then(|| "all candidate versions failed to sync".to_string());
                mirrors
                    .update_sync_status(config.id, status, error.as_deref())
                    .await?;
                mirrors
                    .complete_sync_history(
                        history_id,
                        status.as_str(),
                        counters.providers_synced,
                        counters.versions_synced,
                        counters.versions_failed,
                        error.as_deref(),
                        None,
                    )
                    .await?;
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                mirrors
                    .update_sync_status(config.id, SyncStatus::Failed, Some(&message))
                    .await?;
                mirrors
                    .complete_sync_history(history_id, "failed", 0, 0, 0, Some(&message), None)
                    .await?;
                Err(error)
            }
        }
    }

    /// Candidate `(namespace, provider)` pairs for a config: the exact
    /// filter pair when both are literal, plus everything already tracked.
    /// The registry protocol cannot enumerate a namespace, so wildcard
    /// filters only constrain known providers.
    async fn candidate_pairs(&self, config: &MirrorConfig) -> Result<Vec<(String, String)>> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        if let (Some(ns), Some(provider)) = (&config.namespace_filter, &config.provider_filter) {
            if !ns.contains('*') && !provider.contains('*') {
                pairs.push((ns.clone(), provider.clone()));
            }
        }

        let tracked: Vec<(String, String)> = sqlx::query_as(
            "SELECT upstream_namespace, upstream_type FROM mirrored_providers
             WHERE mirror_config_id = ? AND sync_enabled = 1",
        )
        .bind(config.id.to_string())
        .fetch_all(self.db.pool())
        .await
        .context("cannot list tracked providers")?;
        for pair in tracked {
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }

        pairs.retain(|(ns, provider)| {
            policy::pattern_matches(config.namespace_filter.as_deref(), ns)
                && policy::pattern_matches(config.provider_filter.as_deref(), provider)
        });
        Ok(pairs)
    }

    async fn sync_inner(&self, config: &MirrorConfig) -> Result<SyncCounters> {
        let upstream = UpstreamRegistryClient::new(&config.upstream_registry_url);
        let policies = self
            .db
            .mirrors()
            .list_active_policies(config.organization_id)
            .await?;
        let mut counters = SyncCounters::default();

        for (namespace, provider_type) in self.candidate_pairs(config).await? {
            let decision = policy::evaluate(
                &policies,
                &config.upstream_registry_url,
                &namespace,
                &provider_type,
            );
            if !decision.allowed {
                tracing::warn!(%namespace, %provider_type, reason = %decision.reason, "provider denied by policy");
                counters.versions_failed += 1;
                continue;
            }
            if decision.requires_approval {
                let approval = self
                    .db
                    .mirrors()
                    .get_approval(config.id, &namespace, &provider_type)
                    .await?;
                if approval.is_none() {
                    tracing::warn!(%namespace, %provider_type, "provider awaiting mirror approval");
                    counters.versions_failed += 1;
                    continue;
                }
            }

            match self
                .sync_provider(config, &upstream, &namespace, &provider_type, &mut counters)
                .await
            {
                Ok(()) => counters.providers_synced += 1,
                Err(error) => {
                    tracing::error!(%namespace, %provider_type, %error, "provider sync failed");
                    counters.versions_failed += 1;
                }
            }
        }
        Ok(counters)
    }

    async fn sync_provider(
        &self,
        config: &MirrorConfig,
        upstream: &UpstreamRegistryClient,
        namespace: &str,
        provider_type: &str,
        counters: &mut SyncCounters,
    ) -> Result<()> {
        let provider = self
            .db
            .providers()
            .upsert_provider(
                config.organization_id,
                namespace,
                provider_type,
                &format!("Mirrored from {}", config.upstream_registry_url),
                &config.upstream_registry_url,
                None,
            )
            .await?;
        let mirrored = self
            .db
            .mirrors()
            .upsert_mirrored_provider(config.id, provider.id, namespace, provider_type)
            .await?;

        let known = self.db.mirrors().list_mirrored_versions(mirrored.id).await?;
        let upstream_versions = upstream.list_versions(namespace, provider_type).await?;

        for entry in upstream_versions {
            if known.contains(&entry.version) {
                continue;
            }
            if !policy::pattern_matches(config.version_filter.as_deref(), &entry.version) {
                continue;
            }
            match self
                .sync_version(config, upstream, &provider.id, mirrored.id, namespace, provider_type, &entry)
                .await
            {
                Ok(()) => counters.versions_synced += 1,
                Err(error) => {
                    tracing::error!(version = %entry.version, %error, "version sync failed");
                    counters.versions_failed += 1;
                }
            }
        }
        self.db.mirrors().touch_mirrored_provider(mirrored.id).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_version(
        &self,
        config: &MirrorConfig,
        upstream: &UpstreamRegistryClient,
        provider_id: &uuid::Uuid,
        mirrored_provider_id: uuid::Uuid,
        namespace: &str,
        provider_type: &str,
        entry: &super::upstream::UpstreamVersionEntry,
    ) -> Result<()> {
        let platforms: Vec<_> = entry
            .platforms
            .iter()
            .filter(|p| {
                policy::pattern_matches(
                    config.platform_filter.as_deref(),
                    &format!("{}_{}", p.os, p.arch),
                )
            })
            .collect();
        let first = platforms
            .first()
            .context("upstream version lists no matching platforms")?;

        // The first platform's download document carries the version-level
        // fields: protocols, shasums URLs, and signing keys.
        let head = upstream
            .download_info(namespace, provider_type, &entry.version, &first.os, &first.arch)
            .await?;
        let gpg_key = head.signing_keys.as_ref().and_then(|k| {
            k.gpg_public_keys
                .first()
                .and_then(|key| key.ascii_armor.clone())
        });
        let gpg_key_id = head.signing_keys.as_ref().and_then(|k| {
            k.gpg_public_keys.first().and_then(|key| key.key_id.clone())
        });

        let version_row = match self.db.providers().get_version(*provider_id, &entry.version).await? {
            Some(existing) => existing,
            None => {
                self.db
                    .providers()
                    .create_version(&NewProviderVersion {
                        provider_id: *provider_id,
                        version: entry.version.clone(),
                        protocols: if entry.protocols.is_empty() {
                            head.protocols.clone()
                        } else {
                            entry.protocols.clone()
                        },
                        gpg_public_key: gpg_key,
                        gpg_key_id,
                        shasums_url: head.shasums_url.clone(),
                        shasums_signature_url: head.shasums_signature_url.clone(),
                        published_by: None,
                    })
                    .await?
            }
        };

        let shasums = match &head.shasums_url {
            Some(url) => upstream.fetch_shasums(url).await.unwrap_or_default(),
            None => Default::default(),
        };

        let semaphore = Arc::new(Semaphore::new(SYNC_PLATFORM_CONCURRENCY));
        let mut tasks: JoinSet<Result<bool>> = JoinSet::new();
        for platform in platforms {
            let permit = Arc::clone(&semaphore).acquire_owned().await?;
            let worker = self.clone();
            let upstream_url = config.upstream_registry_url.clone();
            let namespace = namespace.to_string();
            let provider_type = provider_type.to_string();
            let version = entry.version.clone();
            let os = platform.os.clone();
            let arch = platform.arch.clone();
            let version_id = version_row.id;
            let expected = shasums.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker
                    .sync_platform(&upstream_url, &namespace, &provider_type, &version, version_id, &os, &arch, &expected)
                    .await
            });
        }

        let mut any_ok = false;
        let mut all_verified = true;
        let mut failures = 0u32;
        while let Some(joined) = tasks.join_next().await {
            match joined.context("platform task panicked")? {
                Ok(verified) => {
                    any_ok = true;
                    all_verified &= verified;
                }
                Err(error) => {
                    failures += 1;
                    tracing::warn!(version = %entry.version, %error, "platform sync failed");
                }
            }
        }
        if !any_ok {
            anyhow::bail!("no platform synced for version {}", entry.version);
        }
        if failures > 0 {
            tracing::warn!(version = %entry.version, failures, "version synced partially");
        }

        self.db
            .mirrors()
            .upsert_mirrored_version(
                mirrored_provider_id,
                version_row.id,
                &entry.version,
                all_verified,
                false,
            )
            .await?;
        Ok(())
    }

    /// Download, verify, store, and record one platform artifact.
    /// Returns whether the shasum matched the upstream document.
    #[allow(clippy::too_many_arguments)]
    async fn sync_platform(
        &self,
        upstream_url: &str,
        namespace: &str,
        provider_type: &str,
        version: &str,
        version_id: uuid::Uuid,
        os: &str,
        arch: &str,
        expected_shasums: &std::collections::HashMap<String, String>,
    ) -> Result<bool> {
        if self
            .db
            .providers()
            .get_platform(version_id, os, arch)
            .await?
            .is_some()
        {
            return Ok(true);
        }

        let upstream = UpstreamRegistryClient::new(upstream_url);
        let info = upstream
            .download_info(namespace, provider_type, version, os, arch)
            .await?;
        let storage_path = format!(
            "providers/{namespace}/{provider_type}/{version}/{}",
            info.filename
        );
        let backend = self.storage.get().await.context("storage unavailable")?;

        let mut attempt = 0u32;
        let uploaded = loop {
            attempt += 1;
            let result = async {
                let reader = upstream.download_artifact(&info.download_url).await?;
                backend
                    .upload(&storage_path, Box::pin(reader))
                    .await
                    .context("artifact upload failed")
            }
            .await;
            match result {
                Ok(uploaded) => break uploaded,
                Err(error) if attempt < SYNC_DOWNLOAD_RETRIES => {
                    let delay = (SYNC_BACKOFF_START_MS * 2u64.pow(attempt - 1))
                        .min(SYNC_BACKOFF_MAX_MS);
                    tracing::warn!(%error, attempt, delay_ms = delay, "platform download retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(error) => return Err(error),
            }
        };

        // Verify against the upstream shasums document and the inline shasum.
        let expected = expected_shasums
            .get(&info.filename)
            .cloned()
            .unwrap_or_else(|| info.shasum.clone());
        let verified = uploaded.sha256 == expected;
        if !verified {
            backend.delete(&storage_path).await.ok();
            anyhow::bail!(
                "checksum mismatch for {}: expected {expected}, got {}",
                info.filename,
                uploaded.sha256
            );
        }

        self.db
            .providers()
            .create_platform(&NewProviderPlatform {
                provider_version_id: version_id,
                os: os.to_string(),
                arch: arch.to_string(),
                filename: info.filename.clone(),
                storage_path,
                storage_backend: backend.name().to_string(),
                size_bytes: uploaded.size as i64,
                shasum: uploaded.sha256,
            })
            .await?;
        Ok(verified)
    }
}
