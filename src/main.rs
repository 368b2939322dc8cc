//! # Terraform Registry
//!
//! A private Terraform/OpenTofu registry and binary mirror.
//!
//! ## Overview
//!
//! The server provides:
//!
//! 1. **Registry protocols** - HashiCorp Module Registry Protocol v1 and
//!    Provider Registry Protocol v1 for Terraform CLI clients
//! 2. **Network mirror** - Provider Network Mirror Protocol v1 for
//!    air-gapped installs
//! 3. **Binary mirror** - Terraform and OpenTofu release binaries served
//!    from local storage
//! 4. **SCM publishing** - webhook-driven and manual publication of module
//!    versions from GitHub, GitLab, Bitbucket, and Azure DevOps tags
//! 5. **Mirror sync workers** - periodic replication of upstream providers
//!    and tool binaries, gated by policies and approvals
//!
//! Configuration beyond the bootstrap file (database, listen address) lives
//! in the database and is managed through the API after the setup wizard
//! completes. `ENCRYPTION_KEY` must be present in the environment.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use terraform_registry::api::AppState;
use terraform_registry::config::BootstrapConfig;
use terraform_registry::crypto::TokenCipher;
use terraform_registry::db::Database;
use terraform_registry::observability;
use terraform_registry::server;
use terraform_registry::services::{BackgroundServices, LogNotifier};

#[derive(Debug, Parser)]
#[command(name = "terraform-registry", about = "Private Terraform/OpenTofu registry and binary mirror")]
struct Args {
    /// Path to the bootstrap configuration file (YAML)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    observability::init_tracing();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = ?err, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    observability::metrics::register_metrics();

    // Both are unrecoverable at startup: a missing key or unreachable
    // database leaves nothing to serve.
    let cipher = TokenCipher::from_env().context("token cipher initialization failed")?;
    let config = BootstrapConfig::load(args.config.as_deref())?;
    let db = Database::connect(&config.database_url)
        .await
        .context("database connection failed")?;
    info!(listen = %config.listen_addr, "starting terraform-registry");

    let state = AppState::new(db, cipher, &config);
    let services = BackgroundServices::start(&state, Arc::new(LogNotifier));

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal, draining");
    };
    server::serve(state, &config.listen_addr, shutdown).await?;

    // Workers stop only after the HTTP server has drained.
    services.shutdown().await;
    info!("clean shutdown");
    Ok(())
}
