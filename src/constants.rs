//! # Constants
//!
//! Shared constants used throughout the registry.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default listen address for the HTTP server
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default SQLite database path
pub const DEFAULT_DATABASE_URL: &str = "sqlite://registry.db?mode=rwc";

/// Minimum length of the token-cipher key material (bytes)
pub const MIN_ENCRYPTION_KEY_BYTES: usize = 32;

/// Database pool size shared by all repositories
pub const DB_POOL_SIZE: u32 = 25;

/// Interval between mirror-worker wakeups (seconds)
pub const SYNC_TICK_INTERVAL_SECS: u64 = 600;

/// Bound on concurrent platform downloads within one sync config
pub const SYNC_PLATFORM_CONCURRENCY: usize = 4;

/// Per-platform download retry attempts before recording a failure
pub const SYNC_DOWNLOAD_RETRIES: u32 = 3;

/// Exponential backoff starting value for download retries (milliseconds)
pub const SYNC_BACKOFF_START_MS: u64 = 1_000;

/// Exponential backoff maximum value for download retries (milliseconds)
pub const SYNC_BACKOFF_MAX_MS: u64 = 30_000;

/// SCM API request timeout (seconds)
pub const SCM_API_TIMEOUT_SECS: u64 = 30;

/// Upstream registry index request timeout (seconds)
pub const UPSTREAM_INDEX_TIMEOUT_SECS: u64 = 30;

/// Artifact (zip / tarball) download timeout (seconds)
pub const ARTIFACT_DOWNLOAD_TIMEOUT_SECS: u64 = 900;

/// Signed-URL issuance timeout (seconds)
pub const SIGNED_URL_TIMEOUT_SECS: u64 = 10;

/// Default TTL for signed download URLs (seconds)
pub const SIGNED_URL_TTL_SECS: u64 = 3_600;

/// Per-entry extraction cap for module source tarballs (bytes)
pub const MAX_TAR_ENTRY_BYTES: u64 = 500 * 1024 * 1024;

/// Upper bound on uploaded module tarballs (bytes)
pub const MAX_MODULE_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Interval between tag-immutability audit runs (seconds)
pub const TAG_AUDIT_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Interval between API-key expiry scans (seconds)
pub const KEY_EXPIRY_SCAN_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Days before expiry at which an API-key warning is sent
pub const KEY_EXPIRY_WARNING_DAYS: i64 = 7;

/// Auth endpoints: requests per minute per client IP
pub const RATE_LIMIT_AUTH_PER_MIN: u32 = 10;

/// General authenticated API: requests per minute per client IP
pub const RATE_LIMIT_API_PER_MIN: u32 = 120;

/// Upload endpoints: requests per minute per client IP
pub const RATE_LIMIT_UPLOAD_PER_MIN: u32 = 6;

/// Interval between rate-limiter bucket sweeps (seconds)
pub const RATE_LIMIT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Storage key used by the readiness probe; never written
pub const READINESS_PROBE_KEY: &str = ".readiness-probe";

/// Synthetic manifest entry added to every published module archive
pub const COMMIT_MANIFEST_NAME: &str = ".terraform-registry-commit";

/// Name of the synthetic single-tenant organization
pub const DEFAULT_ORGANIZATION: &str = "default";
