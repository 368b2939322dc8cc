//! SCM webhook dispatcher.
//!
//! `POST /webhooks/scm/:module_source_repo_id/:secret`. The path secret is
//! the coarse per-link authorization; the provider-specific header signature
//! is the fine-grained check. Events are logged verbatim, deduplicated, and
//! handed to the publisher asynchronously.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::json;
use uuid::Uuid;

use crate::db::scm::NewScmWebhookEvent;
use crate::error::ApiError;
use crate::publisher::tag::extract_version_from_tag;
use crate::scm::WebhookEventKind;

use super::AppState;

/// `POST /webhooks/scm/:repo_id/:secret`
pub async fn receive(
    State(state): State<AppState>,
    Path((repo_id, secret)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let repo_id = Uuid::parse_str(&repo_id)
        .map_err(|_| ApiError::not_found("unknown webhook endpoint"))?;
    let link = state
        .db
        .scm()
        .get_repo_link(repo_id)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown webhook endpoint"))?;

    if !crate::scm::constant_time_eq(&secret, &link.webhook_secret) {
        return Err(ApiError::forbidden("webhook secret mismatch"));
    }

    let (provider, connector) = state
        .publisher
        .connector_for(link.scm_provider_id)
        .await
        .map_err(ApiError::Internal)?;
    let provider_secret = provider.webhook_secret.clone().unwrap_or_default();
    let signature_valid = connector.verify_webhook_signature(&headers, &body, &provider_secret);

    let event_info = connector
        .parse_webhook_event(&headers, &body)
        .map_err(|e| ApiError::validation(format!("unparseable webhook payload: {e}")))?;

    // At-most-once: a processed event with the same key answers immediately.
    let duplicate = state
        .db
        .scm()
        .find_processed_duplicate(
            link.id,
            event_info.event_id.as_deref(),
            event_info.commit_sha.as_deref(),
            event_info.tag_name.as_deref(),
        )
        .await?;
    if signature_valid && duplicate.is_some() {
        return Ok((StatusCode::ACCEPTED, Json(json!({ "status": "duplicate" }))).into_response());
    }

    let headers_json = serde_json::to_string(
        &headers
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect::<std::collections::HashMap<_, _>>(),
    )
    .unwrap_or_else(|_| "{}".to_string());
    let signature = headers
        .get("x-hub-signature-256")
        .or_else(|| headers.get("x-hub-signature"))
        .or_else(|| headers.get("x-gitlab-token"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let event = state
        .db
        .scm()
        .create_webhook_event(&NewScmWebhookEvent {
            module_scm_repo_id: link.id,
            event_id: event_info.event_id.clone(),
            event_type: event_info.event_type.clone(),
            ref_name: event_info.ref_name.clone(),
            commit_sha: event_info.commit_sha.clone(),
            tag_name: event_info.tag_name.clone(),
            payload: String::from_utf8_lossy(&body).into_owned(),
            headers: headers_json,
            signature,
            signature_valid,
        })
        .await?;
    crate::observability::metrics::increment_webhook_events();

    if !signature_valid {
        tracing::warn!(link_id = %link.id, "webhook signature invalid, event logged and dropped");
        return Err(ApiError::unauthenticated("webhook signature invalid"));
    }

    let publishable = matches!(event_info.kind, WebhookEventKind::TagPush)
        && event_info
            .tag_name
            .as_deref()
            .and_then(|tag| extract_version_from_tag(tag, &link.tag_pattern))
            .is_some();

    if !publishable || !link.auto_publish {
        state
            .db
            .scm()
            .complete_event(event.id, "skipped", None, Some("event does not publish a version"))
            .await?;
        return Ok((StatusCode::ACCEPTED, Json(json!({ "status": "ignored" }))).into_response());
    }

    // Answer the SCM now; the pipeline continues in the background and
    // records its outcome on the event row.
    let publisher = state.publisher.clone();
    let event_id = event.id;
    tokio::spawn(async move {
        publisher.process_webhook_event(event_id).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "event_id": event.id })),
    )
        .into_response())
}
