//! # Terraform Binary Mirror
//!
//! Replicates Terraform and OpenTofu release binaries into local storage and
//! serves them through the custom binary-mirror endpoints.

pub mod releases;
pub mod worker;

pub use worker::TerraformMirrorWorker;
