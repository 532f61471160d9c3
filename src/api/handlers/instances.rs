//! Instance management handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::{AppError, AppState};
use crate::db::activity::ActivityRecord;
use crate::db::instances::{Instance, InstanceInput};
use crate::db::settings::ReannounceSettings;
use crate::pool::HealthStatus;

#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    #[serde(flatten)]
    pub instance: Instance,
    pub health: HealthStatus,
}

#[derive(Debug, Deserialize)]
pub struct InstanceRequest {
    pub name: String,
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_mins: u64,
}

fn default_active() -> bool {
    true
}

fn default_sync_interval() -> u64 {
    2
}

impl InstanceRequest {
    fn validate(&self) -> Result<InstanceInput, AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::bad_request("name must not be empty"));
        }
        let base_url = self.base_url.trim();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(AppError::bad_request("base_url must be an http(s) URL"));
        }
        Ok(InstanceInput {
            name: self.name.trim().to_string(),
            base_url: base_url.to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
            active: self.active,
            sync_interval_mins: self.sync_interval_mins,
        })
    }
}

/// List all instances with their current health
pub async fn list(
    State(state): State<AppState>,
) -> Result<Json<Vec<InstanceResponse>>, AppError> {
    let instances = state.instances.list()?;
    let mut out = Vec::with_capacity(instances.len());
    for instance in instances {
        let health = state.pool.health(instance.id).await;
        out.push(InstanceResponse { instance, health });
    }
    Ok(Json(out))
}

/// Get a single instance
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<InstanceResponse>, AppError> {
    let instance = state
        .instances
        .get_by_id(id)?
        .ok_or_else(|| AppError::not_found("Instance not found"))?;
    let health = state.pool.health(id).await;
    Ok(Json(InstanceResponse { instance, health }))
}

/// Create a new instance
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<InstanceRequest>,
) -> Result<Json<InstanceResponse>, AppError> {
    let input = req.validate()?;
    let instance = state.instances.create(&input)?;
    let health = state.pool.health(instance.id).await;
    Ok(Json(InstanceResponse { instance, health }))
}

/// Update an instance; the change event evicts the cached client and any
/// dependent sync state.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<InstanceRequest>,
) -> Result<Json<InstanceResponse>, AppError> {
    let input = req.validate()?;
    if !state.instances.update(id, &input)? {
        return Err(AppError::not_found("Instance not found"));
    }
    let instance = state
        .instances
        .get_by_id(id)?
        .ok_or_else(|| AppError::not_found("Instance not found"))?;
    let health = state.pool.health(id).await;
    Ok(Json(InstanceResponse { instance, health }))
}

/// Delete an instance
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.instances.delete(id)? {
        return Err(AppError::not_found("Instance not found"));
    }
    Ok(Json(serde_json::json!({"deleted": true})))
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_activity_limit")]
    pub limit: usize,
}

fn default_activity_limit() -> usize {
    50
}

/// Page through recorded activity for one instance
pub async fn activity(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityRecord>>, AppError> {
    let limit = query.limit.clamp(1, 500);
    let records = state.activity.list(id, query.page, limit)?;
    Ok(Json(records))
}

/// Current reannounce tuning for an instance
pub async fn reannounce_settings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ReannounceSettings>, AppError> {
    Ok(Json(state.reannounce_settings.get(id)?))
}

/// Replace the reannounce tuning; the controller's settings cache is
/// invalidated so the next scan sees the new values.
pub async fn put_reannounce_settings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(settings): Json<ReannounceSettings>,
) -> Result<Json<ReannounceSettings>, AppError> {
    if state.instances.get_by_id(id)?.is_none() {
        return Err(AppError::not_found("Instance not found"));
    }
    if settings.interval_secs == 0 {
        return Err(AppError::bad_request("interval_secs must be > 0"));
    }
    if settings.max_retries == 0 {
        return Err(AppError::bad_request("max_retries must be > 0"));
    }
    state.reannounce_settings.put(id, &settings)?;
    state.reannounce.invalidate_settings(id);
    Ok(Json(settings))
}
