//! User, organization, and role-template management. All admin-gated.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{require_scope, MaybeAuth};
use crate::db::users::NewUser;
use crate::error::ApiError;

use super::{audit, parse_id};
use crate::api::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub name: String,
}

pub async fn list_users(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "admin")?;
    let users = state.db.users().list_users().await?;
    Ok(Json(json!({ "users": users })))
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "admin")?.clone();
    if request.email.is_empty() || !request.email.contains('@') {
        return Err(ApiError::validation("a valid email is required"));
    }
    let user = state
        .db
        .users()
        .create(&NewUser {
            email: request.email,
            name: request.name,
            oidc_sub: None,
        })
        .await?;
    audit(&state, &caller, "user.create", "user", Some(user.id)).await;
    Ok((StatusCode::CREATED, Json(json!({ "user": user }))))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "admin")?;
    let id = parse_id(&id)?;
    let user = state
        .db
        .users()
        .get_by_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found("user not found"))?;
    let roles = state.db.users().get_user_with_org_roles(id).await?;
    Ok(Json(json!({ "user": user, "organizations": roles })))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<CreateUserRequest>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "admin")?.clone();
    let id = parse_id(&id)?;
    state
        .db
        .users()
        .update_user(id, &request.email, &request.name)
        .await?;
    audit(&state, &caller, "user.update", "user", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "admin")?.clone();
    let id = parse_id(&id)?;
    state.db.users().delete(id).await?;
    audit(&state, &caller, "user.delete", "user", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CreateOrganizationRequest {
    pub name: String,
    pub display_name: String,
}

pub async fn list_organizations(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "admin")?;
    let organizations = state.db.organizations().list().await?;
    Ok(Json(json!({ "organizations": organizations })))
}

pub async fn create_organization(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<CreateOrganizationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = require_scope(&auth, "admin")?.clone();
    let org = state
        .db
        .organizations()
        .create_organization(&request.name, &request.display_name)
        .await?;
    audit(&state, &caller, "organization.create", "organization", Some(org.id)).await;
    Ok((StatusCode::CREATED, Json(json!({ "organization": org }))))
}

pub async fn update_organization(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<CreateOrganizationRequest>,
) -> Result<StatusCode, ApiError> {
    require_scope(&auth, "admin")?;
    let id = parse_id(&id)?;
    state
        .db
        .organizations()
        .update(id, &request.display_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_organization(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = require_scope(&auth, "admin")?.clone();
    let id = parse_id(&id)?;
    state.db.organizations().delete(id).await?;
    audit(&state, &caller, "organization.delete", "organization", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: String,
    pub role_template_id: Option<String>,
}

pub async fn list_members(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "admin")?;
    let id = parse_id(&id)?;
    let members = state.db.organizations().list_members(id).await?;
    Ok(Json(json!({ "members": members })))
}

pub async fn add_member(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<AddMemberRequest>,
) -> Result<StatusCode, ApiError> {
    require_scope(&auth, "admin")?;
    let org_id = parse_id(&id)?;
    let user_id = parse_id(&request.user_id)?;
    let role_id = request
        .role_template_id
        .as_deref()
        .map(parse_id)
        .transpose()?;
    state
        .db
        .organizations()
        .add_member(org_id, user_id, role_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_member(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    require_scope(&auth, "admin")?;
    state
        .db
        .organizations()
        .remove_member(parse_id(&id)?, parse_id(&user_id)?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub name: Option<String>,
    pub display_name: String,
    pub scopes: Vec<String>,
}

pub async fn list_roles(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&auth, "admin")?;
    let roles = state.db.rbac().list_roles().await?;
    Ok(Json(json!({ "roles": roles })))
}

pub async fn create_role(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Json(request): Json<RoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_scope(&auth, "admin")?;
    let name = request
        .name
        .ok_or_else(|| ApiError::validation("role name is required"))?;
    let role = state
        .db
        .rbac()
        .create_role(&name, &request.display_name, &request.scopes)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "role": role }))))
}

pub async fn update_role(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
    Json(request): Json<RoleRequest>,
) -> Result<StatusCode, ApiError> {
    require_scope(&auth, "admin")?;
    state
        .db
        .rbac()
        .update_role(parse_id(&id)?, &request.display_name, &request.scopes)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_role(
    State(state): State<AppState>,
    Extension(auth): Extension<MaybeAuth>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_scope(&auth, "admin")?;
    state.db.rbac().delete_role(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}
