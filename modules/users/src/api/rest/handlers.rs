use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use tracing::info;
use uuid::Uuid;

use appkit::{Principal, Problem};

use crate::api::rest::dto::{CreateUserRequest, ListQuery, PlanDto, UserDto};
use crate::domain::service::UsersService;

/// Upper bound for `?limit=`, taken from config.
#[derive(Debug, Clone, Copy)]
pub struct PageLimit(pub u32);

#[tracing::instrument(name = "users.list", skip(svc))]
pub async fn list_users(
    Extension(svc): Extension<Arc<UsersService>>,
    Extension(PageLimit(max)): Extension<PageLimit>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<UserDto>>, Problem> {
    let limit = query.limit.unwrap_or(max).clamp(1, max);
    let users = svc.list(limit).await?;
    Ok(Json(users.into_iter().map(UserDto::from).collect()))
}

#[tracing::instrument(name = "users.get", skip(svc))]
pub async fn get_user(
    Extension(svc): Extension<Arc<UsersService>>,
    Path(id): Path<Uuid>,
) -> Result<Json<UserDto>, Problem> {
    match svc.get(id).await? {
        Some(user) => Ok(Json(user.into())),
        None => Err(Problem::not_found(format!("User not found: {id}"))),
    }
}

#[tracing::instrument(name = "users.create", skip(svc, req), fields(email = %req.email))]
pub async fn create_user(
    Extension(svc): Extension<Arc<UsersService>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserDto>), Problem> {
    let user = svc.create(req.into()).await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

#[tracing::instrument(name = "users.delete", skip(svc, principal))]
pub async fn delete_user(
    Extension(svc): Extension<Arc<UsersService>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Problem> {
    svc.delete(id, &principal.subject).await?;
    info!(user_id = %id, by = %principal.subject, "User removed via REST");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_plans(
    Extension(svc): Extension<Arc<UsersService>>,
) -> Result<Json<Vec<PlanDto>>, Problem> {
    let plans = svc.plans().await?;
    Ok(Json(plans.into_iter().map(PlanDto::from).collect()))
}
