//! Torrent view and mutation handlers

use axum::{
    extract::{FromRequest, Multipart, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::api::{AppError, AppState};
use crate::qbit::{AddTorrentOptions, Category, TorrentSource};
use crate::rules::{evaluate, Condition};
use crate::sync::filter::{QueryOptions, SortOrder, TorrentFilters};
use crate::sync::index::DuplicateGroup;
use crate::sync::{MutationAction, MutationOutcome, TorrentPage};
use crate::utils::format_size;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: usize,
    pub limit: Option<usize>,
    pub sort: Option<String>,
    pub order: Option<String>,
    /// Search term (whole-word or glob)
    pub q: Option<String>,
    /// Status bucket name
    pub filter: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub tracker: Option<String>,
}

impl ListQuery {
    fn into_options(self) -> QueryOptions {
        let mut filters = TorrentFilters::default();
        if let Some(filter) = self.filter {
            filters.status.push(filter);
        }
        if let Some(category) = self.category {
            filters.categories.push(category);
        }
        if let Some(tag) = self.tag {
            filters.tags.push(tag);
        }
        if let Some(tracker) = self.tracker {
            filters.trackers.push(tracker);
        }

        let mut opts = QueryOptions {
            page: self.page,
            limit: crate::sync::filter::clamp_limit(self.limit),
            sort: self
                .sort
                .unwrap_or_else(|| crate::sync::filter::DEFAULT_SORT.to_string()),
            order: SortOrder::parse(self.order.as_deref().unwrap_or("desc")),
            search: self.q,
            filters,
        };
        opts.normalize();
        opts
    }
}

/// Paginated, filtered torrent listing from the cached snapshot
pub async fn list(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ListQuery>,
) -> Result<Json<TorrentPage>, AppError> {
    let page = state.sync.query(id, &query.into_options()).await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct AddTorrentRequest {
    /// HTTP or magnet URLs
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(flatten)]
    pub options: AddTorrentOptions,
}

/// Add a torrent from a multipart upload (.torrent file) or a JSON body
/// with URLs/magnets. Responds with the new info-hash when it is knowable
/// up front.
pub async fn add(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: axum::http::HeaderMap,
    body: axum::extract::Request,
) -> Result<Json<serde_json::Value>, AppError> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let (source, options) = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(body, &())
            .await
            .map_err(|e| AppError::bad_request(e.to_string()))?;
        parse_multipart(multipart).await?
    } else {
        let bytes = axum::body::to_bytes(body.into_body(), 64 * 1024 * 1024)
            .await
            .map_err(|e| AppError::bad_request(e.to_string()))?;
        let req: AddTorrentRequest = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::bad_request(format!("invalid JSON body: {e}")))?;
        if req.urls.is_empty() {
            return Err(AppError::bad_request("urls must not be empty"));
        }
        (TorrentSource::Urls(req.urls), req.options)
    };

    let hash = state.sync.add_torrent(id, &source, &options).await?;
    Ok(Json(serde_json::json!({ "added": true, "hash": hash })))
}

async fn parse_multipart(
    mut multipart: Multipart,
) -> Result<(TorrentSource, AddTorrentOptions), AppError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut urls: Vec<String> = Vec::new();
    let mut options = AddTorrentOptions::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "torrents" | "torrent" | "file" => {
                let filename = field
                    .file_name()
                    .unwrap_or("upload.torrent")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(e.to_string()))?;
                file = Some((filename, bytes.to_vec()));
            }
            "urls" => {
                let text = field.text().await.unwrap_or_default();
                urls.extend(text.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()));
            }
            "category" => options.category = Some(field.text().await.unwrap_or_default()),
            "tags" => {
                options.tags = field
                    .text()
                    .await
                    .unwrap_or_default()
                    .split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect();
            }
            "savepath" => options.savepath = Some(field.text().await.unwrap_or_default()),
            "rename" => options.rename = Some(field.text().await.unwrap_or_default()),
            "paused" => options.paused = field.text().await.unwrap_or_default() == "true",
            "skip_checking" => {
                options.skip_checking = field.text().await.unwrap_or_default() == "true"
            }
            "sequential" => options.sequential = field.text().await.unwrap_or_default() == "true",
            "first_last_piece_prio" => {
                options.first_last_piece_prio = field.text().await.unwrap_or_default() == "true"
            }
            _ => {}
        }
    }

    if let Some((filename, bytes)) = file {
        Ok((TorrentSource::File { filename, bytes }, options))
    } else if !urls.is_empty() {
        Ok((TorrentSource::Urls(urls), options))
    } else {
        Err(AppError::bad_request("no torrent file or urls supplied"))
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub hashes: Vec<String>,
    #[serde(flatten)]
    pub action: MutationAction,
}

/// Bulk mutation with per-hash outcomes
pub async fn bulk(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<BulkRequest>,
) -> Result<Json<HashMap<String, MutationOutcome>>, AppError> {
    if req.hashes.is_empty() {
        return Err(AppError::bad_request("hashes must not be empty"));
    }
    let outcomes = state.sync.mutate(id, &req.action, &req.hashes).await?;
    Ok(Json(outcomes))
}

/// File listing for one torrent
pub async fn files(
    State(state): State<AppState>,
    Path((id, hash)): Path<(i64, String)>,
) -> Result<Json<Vec<crate::qbit::TorrentContent>>, AppError> {
    Ok(Json(state.sync.files(id, &hash).await?))
}

/// Tracker listing for one torrent
pub async fn trackers(
    State(state): State<AppState>,
    Path((id, hash)): Path<(i64, String)>,
) -> Result<Json<Vec<crate::qbit::TrackerInfo>>, AppError> {
    Ok(Json(state.sync.trackers(id, &hash).await?))
}

/// Index cardinalities: categories, tags, trackers, status buckets
pub async fn counts(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(state.sync.counts(id).await?))
}

#[derive(Debug, Serialize)]
pub struct DuplicateGroupResponse {
    #[serde(flatten)]
    pub group: DuplicateGroup,
    pub size_human: String,
}

/// Name-normalized duplicate groups with the reclaimable size spelled out
pub async fn duplicates(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<DuplicateGroupResponse>>, AppError> {
    let groups = state.sync.duplicates(id).await?;
    Ok(Json(
        groups
            .into_iter()
            .map(|group| DuplicateGroupResponse {
                size_human: format_size(group.size.max(0) as u64),
                group,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RuleTestRequest {
    pub condition: Condition,
    /// Fixed evaluation clock for reproducible results; 0 = wall clock
    #[serde(default)]
    pub now_unix: i64,
}

/// Evaluate a rule against the cached snapshot and report matches
pub async fn test_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<RuleTestRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctx = state.sync.eval_context(id, req.now_unix).await?;
    let torrents = state.sync.all_torrents(id).await?;

    let total = torrents.len();
    let matched: Vec<String> = torrents
        .into_iter()
        .filter(|t| evaluate(&req.condition, t, &ctx))
        .map(|t| t.hash)
        .collect();

    Ok(Json(serde_json::json!({
        "matched": matched,
        "total": total,
    })))
}

// ---- categories / tags / preferences pass-through ----

pub async fn categories(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<HashMap<String, Category>>, AppError> {
    Ok(Json(state.sync.categories(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CategoryRequest {
    pub name: String,
    #[serde(default)]
    pub save_path: String,
}

pub async fn create_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CategoryRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.name.trim().is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    let client = state.pool.get_client(id).await?;
    client.create_category(&req.name, &req.save_path).await?;
    refresh_in_background(&state, id);
    Ok(Json(serde_json::json!({"created": true})))
}

pub async fn edit_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CategoryRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let client = state.pool.get_client(id).await?;
    client.edit_category(&req.name, &req.save_path).await?;
    refresh_in_background(&state, id);
    Ok(Json(serde_json::json!({"updated": true})))
}

#[derive(Debug, Deserialize)]
pub struct RemoveCategoriesRequest {
    pub categories: Vec<String>,
}

pub async fn remove_categories(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<RemoveCategoriesRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let client = state.pool.get_client(id).await?;
    client.remove_categories(&req.categories).await?;
    refresh_in_background(&state, id);
    Ok(Json(serde_json::json!({"removed": true})))
}

pub async fn tags(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.sync.tags(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct TagsRequest {
    pub tags: Vec<String>,
}

pub async fn create_tags(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<TagsRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let client = state.pool.get_client(id).await?;
    client.create_tags(&req.tags).await?;
    refresh_in_background(&state, id);
    Ok(Json(serde_json::json!({"created": true})))
}

pub async fn delete_tags(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<TagsRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let client = state.pool.get_client(id).await?;
    client.delete_tags(&req.tags).await?;
    refresh_in_background(&state, id);
    Ok(Json(serde_json::json!({"deleted": true})))
}

pub async fn preferences(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let client = state.pool.get_client(id).await?;
    Ok(Json(client.get_preferences().await?))
}

pub async fn set_preferences(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(prefs): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let client = state.pool.get_client(id).await?;
    client.set_preferences(&prefs).await?;
    Ok(Json(serde_json::json!({"updated": true})))
}

/// Category/tag mutations change listing metadata; pick the change up on
/// the next snapshot without blocking the response.
fn refresh_in_background(state: &AppState, id: i64) {
    let sync = state.sync.clone();
    tokio::spawn(async move {
        if let Err(e) = sync.refresh(id).await {
            tracing::debug!("Post-mutation refresh for instance {} failed: {}", id, e);
        }
    });
}
