//! End-to-end protocol tests over an in-memory database and a temp-dir
//! local storage backend, exercising the router exactly as Terraform and
//! operators do.

use axum_test::TestServer;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use terraform_registry::api::{router, AppState};
use terraform_registry::config::BootstrapConfig;
use terraform_registry::crypto::TokenCipher;
use terraform_registry::db::users::NewUser;
use terraform_registry::db::Database;

const ADMIN_EMAIL: &str = "admin@registry.test";

struct TestContext {
    server: TestServer,
    state: AppState,
    _storage_dir: tempfile::TempDir,
}

/// Fresh registry with an active local storage config and a dev-mode admin.
async fn setup() -> TestContext {
    let db = Database::in_memory().await.expect("in-memory database");
    let cipher = TokenCipher::new(b"integration-test-key-0123456789abcdef").expect("cipher");
    let config = BootstrapConfig {
        database_url: "sqlite::memory:".to_string(),
        listen_addr: "127.0.0.1:0".to_string(),
        base_url: Some("http://registry.test".to_string()),
        dev_mode: true,
        ..BootstrapConfig::default()
    };

    db.users()
        .create(&NewUser {
            email: ADMIN_EMAIL.to_string(),
            name: "Admin".to_string(),
            oidc_sub: None,
        })
        .await
        .expect("admin user");

    let storage_dir = tempfile::tempdir().expect("storage dir");
    let settings = json!({ "base_path": storage_dir.path().to_str().unwrap() });
    let storage = db
        .settings()
        .create_storage_config("local", &settings.to_string())
        .await
        .expect("storage config");
    db.settings()
        .activate_storage_config(storage.id)
        .await
        .expect("activate storage");

    let state = AppState::new(db, cipher, &config);
    let server = TestServer::new(router(state.clone())).expect("test server");
    TestContext {
        server,
        state,
        _storage_dir: storage_dir,
    }
}

/// Minimal gzip tarball with one `main.tf`.
fn module_tarball() -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let content = b"resource \"null_resource\" \"x\" {}\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "main.tf", &content[..]).unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

#[tokio::test]
async fn test_service_discovery() {
    let ctx = setup().await;
    let response = ctx.server.get("/.well-known/terraform.json").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["modules.v1"], "http://registry.test/v1/modules/");
    assert_eq!(body["providers.v1"], "http://registry.test/v1/providers/");
}

#[tokio::test]
async fn test_module_upload_list_download_roundtrip() {
    let ctx = setup().await;
    let tarball = module_tarball();
    let expected_sha = hex::encode(Sha256::digest(&tarball));

    // Upload through the management API.
    let response = ctx
        .server
        .post("/api/v1/modules/hashicorp/vpc/aws/1.0.0")
        .add_header("x-dev-impersonate", ADMIN_EMAIL)
        .bytes(tarball.clone().into())
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);
    let created: Value = response.json();
    assert_eq!(created["checksum"], json!(expected_sha));
    assert_eq!(created["size_bytes"], json!(tarball.len()));
    assert_eq!(
        created["storage_path"],
        json!("modules/hashicorp/vpc/aws/vpc-1.0.0.tar.gz")
    );

    // Versions listing matches the module protocol shape.
    let response = ctx.server.get("/v1/modules/hashicorp/vpc/aws/versions").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["modules"][0]["versions"], json!([{ "version": "1.0.0" }]));

    // Download handshake: 204 + X-Terraform-Get.
    let response = ctx
        .server
        .get("/v1/modules/hashicorp/vpc/aws/1.0.0/download")
        .await;
    response.assert_status(axum::http::StatusCode::NO_CONTENT);
    let signed = response
        .headers()
        .get("x-terraform-get")
        .expect("X-Terraform-Get header")
        .to_str()
        .unwrap()
        .to_string();
    assert!(signed.starts_with("http://registry.test/files/"));

    // Following the signed URL yields the exact bytes.
    let path_and_query = signed.strip_prefix("http://registry.test").unwrap();
    let response = ctx.server.get(path_and_query).await;
    response.assert_status_ok();
    assert_eq!(response.as_bytes().as_ref(), tarball.as_slice());

    // A tampered signature is refused.
    let tampered = path_and_query.replace("signature=", "signature=00");
    let response = ctx.server.get(&tampered).await;
    response.assert_status(axum::http::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_duplicate_module_upload_conflicts() {
    let ctx = setup().await;
    let tarball = module_tarball();
    for (i, expected) in [(0, 201u16), (1, 409u16)] {
        let response = ctx
            .server
            .post("/api/v1/modules/acme/net/aws/2.0.0")
            .add_header("x-dev-impersonate", ADMIN_EMAIL)
            .bytes(tarball.clone().into())
            .await;
        assert_eq!(response.status_code().as_u16(), expected, "attempt {i}");
    }
    // The conflict body uses the protocol error shape.
    let response = ctx
        .server
        .post("/api/v1/modules/acme/net/aws/2.0.0")
        .add_header("x-dev-impersonate", ADMIN_EMAIL)
        .bytes(module_tarball().into())
        .await;
    let body: Value = response.json();
    assert!(body["errors"][0].as_str().unwrap().contains("already exists"));
}

#[tokio::test]
async fn test_upload_requires_auth_and_scope() {
    let ctx = setup().await;
    let response = ctx
        .server
        .post("/api/v1/modules/acme/net/aws/1.0.0")
        .bytes(module_tarball().into())
        .await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert!(body["errors"][0].as_str().is_some());
}

#[tokio::test]
async fn test_provider_protocol_and_network_mirror() {
    let ctx = setup().await;

    // Publish a provider with one version and one platform zip.
    let response = ctx
        .server
        .post("/api/v1/providers")
        .add_header("x-dev-impersonate", ADMIN_EMAIL)
        .json(&json!({ "namespace": "hashicorp", "type": "aws" }))
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);
    let provider_id = response.json::<Value>()["provider"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = ctx
        .server
        .post(&format!("/api/v1/providers/{provider_id}/versions"))
        .add_header("x-dev-impersonate", ADMIN_EMAIL)
        .json(&json!({ "version": "1.2.3", "protocols": ["5.0", "6.0"] }))
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);

    let zip_bytes = b"PK\x03\x04fake-provider-zip".to_vec();
    let expected_sha = hex::encode(Sha256::digest(&zip_bytes));
    let response = ctx
        .server
        .post("/api/v1/providers/hashicorp/aws/1.2.3/platforms/linux/amd64")
        .add_header("x-dev-impersonate", ADMIN_EMAIL)
        .bytes(zip_bytes.clone().into())
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);

    // Registry protocol: versions then download document.
    let response = ctx.server.get("/v1/providers/hashicorp/aws/versions").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["versions"][0]["version"], "1.2.3");
    assert_eq!(body["versions"][0]["platforms"][0]["os"], "linux");

    let response = ctx
        .server
        .get("/v1/providers/hashicorp/aws/1.2.3/download/linux/amd64")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["shasum"], json!(expected_sha));
    assert_eq!(body["os"], "linux");
    assert!(body["download_url"].as_str().unwrap().contains("/files/"));

    // Network mirror index: exact content type, no charset.
    let response = ctx
        .server
        .get("/terraform/providers/registry.terraform.io/hashicorp/aws/index.json")
        .await;
    response.assert_status_ok();
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    let body: Value = response.json();
    assert_eq!(body["versions"]["1.2.3"], json!({}));

    // Network mirror archives: h1 hash decodes to the stored sha bytes.
    let response = ctx
        .server
        .get("/terraform/providers/registry.terraform.io/hashicorp/aws/1.2.3.json")
        .await;
    response.assert_status_ok();
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    let body: Value = response.json();
    let hash = body["archives"]["linux_amd64"]["hashes"][0].as_str().unwrap();
    let raw = BASE64.decode(hash.strip_prefix("h1:").unwrap()).unwrap();
    assert_eq!(raw.len(), 32);
    assert_eq!(hex::encode(raw), expected_sha);

    // Bad semver in the archives path is a validation error.
    let response = ctx
        .server
        .get("/terraform/providers/registry.terraform.io/hashicorp/aws/not-semver.json")
        .await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_api_key_lifecycle() {
    let ctx = setup().await;

    // Create a key scoped to module publishing.
    let response = ctx
        .server
        .post("/api/v1/apikeys")
        .add_header("x-dev-impersonate", ADMIN_EMAIL)
        .json(&json!({ "name": "ci", "scopes": ["modules:write"] }))
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);
    let created: Value = response.json();
    let plaintext = created["key"].as_str().unwrap().to_string();
    let key_id = created["id"].as_str().unwrap().to_string();
    assert!(plaintext.starts_with("tfr_"));

    // The key authenticates an upload.
    let response = ctx
        .server
        .post("/api/v1/modules/acme/db/aws/1.0.0")
        .add_header("authorization", format!("Bearer {plaintext}"))
        .bytes(module_tarball().into())
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);

    // Reads expose only the prefix, never the plaintext or hash.
    let response = ctx
        .server
        .get(&format!("/api/v1/apikeys/{key_id}"))
        .add_header("x-dev-impersonate", ADMIN_EMAIL)
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["key_prefix"], json!(&plaintext[..12]));
    assert!(body["last_used_at"].as_str().is_some());
    assert!(body.get("key").is_none());
    assert!(body.get("key_hash").is_none());

    // Revoked keys stop authenticating.
    let response = ctx
        .server
        .delete(&format!("/api/v1/apikeys/{key_id}"))
        .add_header("x-dev-impersonate", ADMIN_EMAIL)
        .await;
    response.assert_status(axum::http::StatusCode::NO_CONTENT);
    let response = ctx
        .server
        .post("/api/v1/modules/acme/db/aws/1.1.0")
        .add_header("authorization", format!("Bearer {plaintext}"))
        .bytes(module_tarball().into())
        .await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_webhook_secret_and_signature_checks() {
    let ctx = setup().await;

    // Seed a module with an SCM provider and link directly.
    let org = ctx.state.db.organizations().default_org().await.unwrap();
    let module = ctx
        .state
        .db
        .modules()
        .upsert_module(org.id, "acme", "vpc", "aws", "", "", None)
        .await
        .unwrap();
    let provider = ctx
        .state
        .db
        .scm()
        .create_provider(&terraform_registry::db::scm::NewScmProvider {
            organization_id: org.id,
            provider_type: "github".to_string(),
            name: "GitHub".to_string(),
            base_url: None,
            tenant_id: None,
            client_id: "client".to_string(),
            client_secret_encrypted: None,
            webhook_secret: Some("provider-hook-secret".to_string()),
        })
        .await
        .unwrap();
    let link = ctx
        .state
        .db
        .scm()
        .create_repo_link(&terraform_registry::db::scm::NewModuleScmRepo {
            module_id: module.id,
            scm_provider_id: provider.id,
            repository_owner: "acme".to_string(),
            repository_name: "terraform-aws-vpc".to_string(),
            default_branch: "main".to_string(),
            module_path: String::new(),
            tag_pattern: "v*".to_string(),
            auto_publish: true,
            webhook_secret: "link-secret".to_string(),
        })
        .await
        .unwrap();

    let payload = br#"{"ref":"refs/heads/main","after":"abc123"}"#.to_vec();

    // Wrong path secret: 403, nothing logged.
    let response = ctx
        .server
        .post(&format!("/webhooks/scm/{}/wrong-secret", link.id))
        .add_header("x-github-event", "push")
        .bytes(payload.clone().into())
        .await;
    response.assert_status(axum::http::StatusCode::FORBIDDEN);

    // Right path secret but missing signature: event logged invalid, 401.
    let response = ctx
        .server
        .post(&format!("/webhooks/scm/{}/link-secret", link.id))
        .add_header("x-github-event", "push")
        .bytes(payload.clone().into())
        .await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    let events = ctx.state.db.scm().list_events(link.id, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].signature_valid);
    assert!(!events[0].processed);

    // Valid signature on a branch push: accepted but skipped (not a tag).
    use hmac::Mac;
    let mut mac = hmac::Hmac::<Sha256>::new_from_slice(b"provider-hook-secret").unwrap();
    mac.update(&payload);
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    let response = ctx
        .server
        .post(&format!("/webhooks/scm/{}/link-secret", link.id))
        .add_header("x-github-event", "push")
        .add_header("x-github-delivery", "delivery-1")
        .add_header("x-hub-signature-256", signature)
        .bytes(payload.into())
        .await;
    response.assert_status(axum::http::StatusCode::ACCEPTED);
    let events = ctx.state.db.scm().list_events(link.id, 10).await.unwrap();
    let valid = events.iter().find(|e| e.signature_valid).unwrap();
    assert_eq!(valid.status, "skipped");
}

#[tokio::test]
async fn test_binary_mirror_endpoints() {
    let ctx = setup().await;
    let db = &ctx.state.db;

    let config = db
        .tf_mirrors()
        .create_config(&terraform_registry::db::tf_mirrors::NewTerraformMirrorConfig {
            name: "tf".to_string(),
            tool: "terraform".to_string(),
            enabled: true,
            upstream_url: None,
            platform_filter: None,
            version_filter: None,
            gpg_verify: false,
            stable_only: true,
            sync_interval_hours: 24,
        })
        .await
        .unwrap();
    let version = db
        .tf_mirrors()
        .upsert_version(config.id, "1.6.0", None)
        .await
        .unwrap();
    db.tf_mirrors()
        .update_version_sync_status(version.id, "synced", None)
        .await
        .unwrap();
    db.tf_mirrors()
        .set_latest_version(config.id, version.id)
        .await
        .unwrap();
    let platform = db
        .tf_mirrors()
        .upsert_platform(
            version.id,
            "linux",
            "amd64",
            "https://releases.example/terraform_1.6.0_linux_amd64.zip",
            "terraform_1.6.0_linux_amd64.zip",
            None,
        )
        .await
        .unwrap();
    db.tf_mirrors()
        .update_platform_sync_status(
            platform.id,
            "synced",
            Some("terraform-mirror/tf/1.6.0/linux_amd64/terraform_1.6.0_linux_amd64.zip"),
            Some("local"),
            1024,
            true,
            false,
            None,
        )
        .await
        .unwrap();

    let response = ctx.server.get("/terraform/binaries").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["binaries"][0]["name"], "tf");

    let response = ctx.server.get("/terraform/binaries/tf/versions").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["versions"][0]["version"], "1.6.0");
    assert_eq!(body["versions"][0]["is_latest"], json!(true));

    let response = ctx.server.get("/terraform/binaries/tf/versions/latest").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["version"], "1.6.0");
    assert_eq!(body["platforms"][0]["os"], "linux");

    let response = ctx
        .server
        .get("/terraform/binaries/tf/versions/1.6.0/linux/amd64")
        .await;
    response.assert_status(axum::http::StatusCode::FOUND);
    let location = response.headers().get("location").unwrap().to_str().unwrap();
    assert!(location.contains("/files/terraform-mirror/tf/1.6.0/linux_amd64/"));
}

#[tokio::test]
async fn test_setup_status_and_health() {
    let ctx = setup().await;
    let response = ctx.server.get("/healthz").await;
    response.assert_status_ok();
    let response = ctx.server.get("/readyz").await;
    response.assert_status_ok();

    let response = ctx.server.get("/api/v1/setup/status").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["setup_completed"], json!(false));
}

#[tokio::test]
async fn test_webhook_rate_limit() {
    let ctx = setup().await;
    let missing = uuid::Uuid::new_v4();
    let mut limited = false;
    for _ in 0..12 {
        let response = ctx
            .server
            .post(&format!("/webhooks/scm/{missing}/secret"))
            .bytes(b"{}".to_vec().into())
            .await;
        if response.status_code().as_u16() == 429 {
            assert!(response.headers().get("retry-after").is_some());
            limited = true;
            break;
        }
    }
    assert!(limited, "auth route class never rate limited");
}
