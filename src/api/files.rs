//! File proxy for backends without native signed URLs.
//!
//! Serves `GET /files/<key>?expires=<unix>&signature=<hex>` by verifying the
//! HMAC issued by the URL signer and streaming the object.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::error::ApiError;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
}

/// `GET /files/*path`
pub async fn serve(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, ApiError> {
    if !state.signer.verify(&path, query.expires, &query.signature) {
        return Err(ApiError::forbidden("invalid or expired signature"));
    }

    let backend = state.storage.get().await?;
    let reader = backend.download(&path).await?;
    let filename = path.rsplit('/').next().unwrap_or("download").to_string();

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}
