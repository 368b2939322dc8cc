//! # Background Services Supervisor
//!
//! Owns every long-running task: both mirror sync workers, the tag
//! immutability audit, the API-key expiry notifier, and the rate-limiter
//! sweeper. Tasks run under a restart-on-panic supervisor and stop together
//! through one cancellation token after the HTTP server has drained.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::constants::{KEY_EXPIRY_SCAN_INTERVAL_SECS, KEY_EXPIRY_WARNING_DAYS};
use crate::db::api_keys::ApiKey;
use crate::db::Database;
use crate::mirror::MirrorSyncWorker;
use crate::publisher::audit::TagAuditWorker;
use crate::tfmirror::TerraformMirrorWorker;

/// Expiry notification sink. SMTP delivery lives outside this crate; the
/// default implementation records the event in the log.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_key_expiring(&self, key: &ApiKey);
}

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify_key_expiring(&self, key: &ApiKey) {
        tracing::warn!(
            key_id = %key.id,
            name = %key.name,
            expires_at = ?key.expires_at,
            "api key expires soon"
        );
    }
}

pub struct BackgroundServices {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for BackgroundServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundServices")
            .field("tasks", &self.handles.len())
            .finish()
    }
}

impl BackgroundServices {
    /// Start all workers against the shared state.
    pub fn start(state: &AppState, notifier: Arc<dyn Notifier>) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        {
            let db = state.db.clone();
            let storage = state.storage.clone();
            let token = cancel.clone();
            handles.push(supervise("mirror-sync", token.clone(), move || {
                let worker = MirrorSyncWorker::new(db.clone(), storage.clone());
                let token = token.clone();
                async move { worker.run(token).await }
            }));
        }
        {
            let db = state.db.clone();
            let storage = state.storage.clone();
            let token = cancel.clone();
            handles.push(supervise("terraform-mirror-sync", token.clone(), move || {
                let worker = TerraformMirrorWorker::new(db.clone(), storage.clone());
                let token = token.clone();
                async move { worker.run(token).await }
            }));
        }
        {
            let db = state.db.clone();
            let publisher = state.publisher.clone();
            let token = cancel.clone();
            handles.push(supervise("tag-audit", token.clone(), move || {
                let worker = TagAuditWorker::new(db.clone(), publisher.clone());
                let token = token.clone();
                async move { worker.run(token).await }
            }));
        }
        {
            let db = state.db.clone();
            let token = cancel.clone();
            let notifier = Arc::clone(&notifier);
            handles.push(supervise("key-expiry", token.clone(), move || {
                let db = db.clone();
                let token = token.clone();
                let notifier = Arc::clone(&notifier);
                async move { key_expiry_loop(db, notifier, token).await }
            }));
        }
        {
            let limiter = state.limiter.clone();
            let token = cancel.clone();
            handles.push(supervise("ratelimit-sweeper", token.clone(), move || {
                let limiter = limiter.clone();
                let token = token.clone();
                async move { crate::ratelimit::run_sweeper(limiter, token).await }
            }));
        }

        tracing::info!(tasks = handles.len(), "background services started");
        Self { cancel, handles }
    }

    /// Stop everything and wait. Called after the HTTP server has drained
    /// its in-flight requests.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            handle.await.ok();
        }
        tracing::info!("background services stopped");
    }
}

/// Run a worker future, restarting it after a panic until cancellation.
fn supervise<F, Fut>(name: &'static str, cancel: CancellationToken, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let task = tokio::spawn(factory());
            match task.await {
                Ok(()) => return,
                Err(join_error) if join_error.is_panic() => {
                    tracing::error!(worker = name, error = %join_error, "worker panicked, restarting");
                }
                Err(join_error) => {
                    tracing::error!(worker = name, error = %join_error, "worker aborted");
                    return;
                }
            }
            if cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    })
}

/// Daily scan for keys expiring inside the warning window that have not
/// been notified yet.
async fn key_expiry_loop(db: Database, notifier: Arc<dyn Notifier>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(KEY_EXPIRY_SCAN_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => {
                tracing::info!("key expiry notifier stopping");
                return;
            }
        }
        let expiring = match db
            .api_keys()
            .list_expiring(chrono::Duration::days(KEY_EXPIRY_WARNING_DAYS))
            .await
        {
            Ok(keys) => keys,
            Err(error) => {
                tracing::error!(%error, "expiry scan failed");
                continue;
            }
        };
        for key in expiring {
            notifier.notify_key_expiring(&key).await;
            if let Err(error) = db.api_keys().mark_expiry_notified(key.id).await {
                tracing::error!(key_id = %key.id, %error, "cannot mark expiry notification");
            }
        }
    }
}
