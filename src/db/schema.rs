//! Relational schema, applied as idempotent statements at startup.
//!
//! IDs are UUIDv4 TEXT, timestamps are RFC3339 UTC TEXT (microsecond
//! precision, `Z` suffix) so lexicographic and `datetime()` ordering agree.
//! JSON payloads are stored as TEXT.

/// Statements run in order by [`super::Database::migrate`].
pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS organizations (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        oidc_sub TEXT UNIQUE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS role_templates (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        scopes TEXT NOT NULL,
        is_system INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS organization_members (
        organization_id TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        role_template_id TEXT REFERENCES role_templates(id),
        created_at TEXT NOT NULL,
        PRIMARY KEY (organization_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS api_keys (
        id TEXT PRIMARY KEY,
        user_id TEXT REFERENCES users(id) ON DELETE CASCADE,
        organization_id TEXT NOT NULL,
        name TEXT NOT NULL,
        key_hash TEXT NOT NULL,
        key_prefix TEXT NOT NULL,
        scopes TEXT NOT NULL,
        expires_at TEXT,
        last_used_at TEXT,
        expiry_notification_sent_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys(key_prefix)",
    "CREATE TABLE IF NOT EXISTS providers (
        id TEXT PRIMARY KEY,
        organization_id TEXT,
        namespace TEXT NOT NULL,
        type TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        source TEXT NOT NULL DEFAULT '',
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (organization_id, namespace, type)
    )",
    "CREATE TABLE IF NOT EXISTS provider_versions (
        id TEXT PRIMARY KEY,
        provider_id TEXT NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
        version TEXT NOT NULL,
        protocols TEXT NOT NULL,
        gpg_public_key TEXT,
        gpg_key_id TEXT,
        shasums_url TEXT,
        shasums_signature_url TEXT,
        published_by TEXT,
        deprecated INTEGER NOT NULL DEFAULT 0,
        deprecated_at TEXT,
        deprecation_message TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (provider_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS provider_platforms (
        id TEXT PRIMARY KEY,
        provider_version_id TEXT NOT NULL REFERENCES provider_versions(id) ON DELETE CASCADE,
        os TEXT NOT NULL,
        arch TEXT NOT NULL,
        filename TEXT NOT NULL,
        storage_path TEXT NOT NULL,
        storage_backend TEXT NOT NULL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        shasum TEXT NOT NULL,
        download_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (provider_version_id, os, arch)
    )",
    "CREATE TABLE IF NOT EXISTS modules (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        system TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        source TEXT NOT NULL DEFAULT '',
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (organization_id, namespace, name, system)
    )",
    "CREATE TABLE IF NOT EXISTS module_versions (
        id TEXT PRIMARY KEY,
        module_id TEXT NOT NULL REFERENCES modules(id) ON DELETE CASCADE,
        version TEXT NOT NULL,
        storage_path TEXT NOT NULL,
        storage_backend TEXT NOT NULL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        checksum TEXT NOT NULL,
        readme TEXT,
        published_by TEXT,
        download_count INTEGER NOT NULL DEFAULT 0,
        deprecated INTEGER NOT NULL DEFAULT 0,
        commit_sha TEXT,
        tag_name TEXT,
        scm_repo_id TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (module_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS mirror_configs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        upstream_registry_url TEXT NOT NULL,
        organization_id TEXT,
        namespace_filter TEXT,
        provider_filter TEXT,
        version_filter TEXT,
        platform_filter TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        sync_interval_hours INTEGER NOT NULL DEFAULT 24,
        last_sync_at TEXT,
        last_sync_status TEXT,
        last_sync_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS mirrored_providers (
        id TEXT PRIMARY KEY,
        mirror_config_id TEXT NOT NULL REFERENCES mirror_configs(id) ON DELETE CASCADE,
        provider_id TEXT NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
        upstream_namespace TEXT NOT NULL,
        upstream_type TEXT NOT NULL,
        last_synced_at TEXT,
        sync_enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        UNIQUE (mirror_config_id, upstream_namespace, upstream_type)
    )",
    "CREATE TABLE IF NOT EXISTS mirrored_provider_versions (
        id TEXT PRIMARY KEY,
        mirrored_provider_id TEXT NOT NULL REFERENCES mirrored_providers(id) ON DELETE CASCADE,
        provider_version_id TEXT NOT NULL,
        upstream_version TEXT NOT NULL,
        synced_at TEXT NOT NULL,
        shasum_verified INTEGER NOT NULL DEFAULT 0,
        gpg_verified INTEGER NOT NULL DEFAULT 0,
        UNIQUE (mirrored_provider_id, upstream_version)
    )",
    "CREATE TABLE IF NOT EXISTS mirror_sync_history (
        id TEXT PRIMARY KEY,
        config_id TEXT NOT NULL,
        triggered_by TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        status TEXT NOT NULL,
        providers_synced INTEGER NOT NULL DEFAULT 0,
        versions_synced INTEGER NOT NULL DEFAULT 0,
        versions_failed INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        sync_details TEXT
    )",
    "CREATE TABLE IF NOT EXISTS terraform_mirror_configs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        tool TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        upstream_url TEXT,
        platform_filter TEXT,
        version_filter TEXT,
        gpg_verify INTEGER NOT NULL DEFAULT 0,
        stable_only INTEGER NOT NULL DEFAULT 1,
        sync_interval_hours INTEGER NOT NULL DEFAULT 24,
        last_sync_at TEXT,
        last_sync_status TEXT,
        last_sync_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS terraform_versions (
        id TEXT PRIMARY KEY,
        config_id TEXT NOT NULL REFERENCES terraform_mirror_configs(id) ON DELETE CASCADE,
        version TEXT NOT NULL,
        is_latest INTEGER NOT NULL DEFAULT 0,
        is_deprecated INTEGER NOT NULL DEFAULT 0,
        release_date TEXT,
        sync_status TEXT NOT NULL DEFAULT 'pending',
        sync_error TEXT,
        synced_at TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (config_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS terraform_version_platforms (
        id TEXT PRIMARY KEY,
        version_id TEXT NOT NULL REFERENCES terraform_versions(id) ON DELETE CASCADE,
        os TEXT NOT NULL,
        arch TEXT NOT NULL,
        upstream_url TEXT NOT NULL,
        filename TEXT NOT NULL,
        sha256 TEXT,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        storage_key TEXT,
        storage_backend TEXT,
        sha256_verified INTEGER NOT NULL DEFAULT 0,
        gpg_verified INTEGER NOT NULL DEFAULT 0,
        sync_status TEXT NOT NULL DEFAULT 'pending',
        sync_error TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (version_id, os, arch)
    )",
    "CREATE TABLE IF NOT EXISTS terraform_sync_history (
        id TEXT PRIMARY KEY,
        config_id TEXT NOT NULL,
        triggered_by TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        status TEXT NOT NULL,
        versions_synced INTEGER NOT NULL DEFAULT 0,
        platforms_synced INTEGER NOT NULL DEFAULT 0,
        platforms_failed INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        sync_details TEXT
    )",
    "CREATE TABLE IF NOT EXISTS scm_providers (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL,
        provider_type TEXT NOT NULL,
        name TEXT NOT NULL,
        base_url TEXT,
        tenant_id TEXT,
        client_id TEXT NOT NULL DEFAULT '',
        client_secret_encrypted TEXT,
        webhook_secret TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS scm_user_tokens (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        scm_provider_id TEXT NOT NULL REFERENCES scm_providers(id) ON DELETE CASCADE,
        access_token_encrypted TEXT NOT NULL,
        refresh_token_encrypted TEXT,
        token_type TEXT NOT NULL DEFAULT 'bearer',
        expires_at TEXT,
        scopes TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (user_id, scm_provider_id)
    )",
    "CREATE TABLE IF NOT EXISTS module_scm_repos (
        id TEXT PRIMARY KEY,
        module_id TEXT NOT NULL UNIQUE REFERENCES modules(id) ON DELETE CASCADE,
        scm_provider_id TEXT NOT NULL REFERENCES scm_providers(id),
        repository_owner TEXT NOT NULL,
        repository_name TEXT NOT NULL,
        default_branch TEXT NOT NULL DEFAULT 'main',
        module_path TEXT NOT NULL DEFAULT '',
        tag_pattern TEXT NOT NULL DEFAULT 'v*',
        auto_publish INTEGER NOT NULL DEFAULT 1,
        webhook_id TEXT,
        webhook_url TEXT,
        webhook_secret TEXT NOT NULL,
        webhook_enabled INTEGER NOT NULL DEFAULT 0,
        last_sync_at TEXT,
        last_sync_commit TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS scm_webhook_events (
        id TEXT PRIMARY KEY,
        module_scm_repo_id TEXT NOT NULL REFERENCES module_scm_repos(id) ON DELETE CASCADE,
        event_id TEXT,
        event_type TEXT NOT NULL,
        ref_name TEXT,
        commit_sha TEXT,
        tag_name TEXT,
        payload TEXT NOT NULL,
        headers TEXT NOT NULL,
        signature TEXT,
        signature_valid INTEGER NOT NULL DEFAULT 0,
        processed INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        processing_started_at TEXT,
        processed_at TEXT,
        result_version_id TEXT,
        error TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_scm_webhook_events_dedup
        ON scm_webhook_events(module_scm_repo_id, event_id)",
    "CREATE TABLE IF NOT EXISTS tag_immutability_alerts (
        id TEXT PRIMARY KEY,
        module_version_id TEXT NOT NULL REFERENCES module_versions(id) ON DELETE CASCADE,
        tag_name TEXT NOT NULL,
        original_commit_sha TEXT NOT NULL,
        detected_commit_sha TEXT NOT NULL,
        detected_at TEXT NOT NULL,
        alert_sent INTEGER NOT NULL DEFAULT 0,
        resolved INTEGER NOT NULL DEFAULT 0,
        resolved_by TEXT,
        notes TEXT
    )",
    "CREATE TABLE IF NOT EXISTS mirror_approval_requests (
        id TEXT PRIMARY KEY,
        mirror_config_id TEXT NOT NULL REFERENCES mirror_configs(id) ON DELETE CASCADE,
        organization_id TEXT,
        requested_by TEXT,
        provider_namespace TEXT NOT NULL,
        provider_name TEXT,
        reason TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        reviewed_by TEXT,
        reviewed_at TEXT,
        review_notes TEXT,
        auto_approved INTEGER NOT NULL DEFAULT 0,
        expires_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS mirror_policies (
        id TEXT PRIMARY KEY,
        organization_id TEXT,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        policy_type TEXT NOT NULL,
        upstream_registry TEXT,
        namespace_pattern TEXT,
        provider_pattern TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1,
        requires_approval INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS system_settings (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        storage_configured INTEGER NOT NULL DEFAULT 0,
        storage_configured_at TEXT,
        storage_configured_by TEXT,
        setup_completed INTEGER NOT NULL DEFAULT 0,
        setup_token_hash TEXT,
        oidc_configured INTEGER NOT NULL DEFAULT 0,
        pending_admin_email TEXT,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS storage_configs (
        id TEXT PRIMARY KEY,
        backend_type TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 0,
        settings TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS oidc_configs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        provider_type TEXT NOT NULL DEFAULT 'generic',
        issuer_url TEXT NOT NULL,
        client_id TEXT NOT NULL,
        client_secret_encrypted TEXT,
        redirect_url TEXT,
        scopes TEXT NOT NULL DEFAULT '[]',
        is_active INTEGER NOT NULL DEFAULT 0,
        extra_config TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS audit_log (
        id TEXT PRIMARY KEY,
        organization_id TEXT,
        user_id TEXT,
        action TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        resource_id TEXT,
        details TEXT,
        created_at TEXT NOT NULL
    )",
];
