//! # Provider Mirror
//!
//! Pull-based replication of upstream registry providers into local storage,
//! gated by mirror policies and approval requests.

pub mod upstream;
pub mod worker;

pub use worker::MirrorSyncWorker;
