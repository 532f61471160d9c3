//! qBittorrent WebUI API client
//!
//! Implements the qBittorrent WebUI API v2.x
//! Reference: https://github.com/qbittorrent/qBittorrent/wiki/WebUI-API-(qBittorrent-4.1)

use super::models::{
    AddTorrentOptions, Category, MainData, TorrentContent, TorrentInfo, TorrentListQuery,
    TorrentSource, TrackerInfo,
};
use super::{QbitError, Result};
use chrono::{DateTime, Utc};
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Session state. The auth mutex is held for the whole Authenticating
/// phase, so concurrent callers wait for one login instead of racing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthPhase {
    Idle,
    Authenticating,
    Authenticated,
    Expired,
}

#[derive(Debug)]
struct AuthState {
    phase: AuthPhase,
    since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ServerVersion {
    app: String,
    api: String,
    supports_tracker_health: bool,
}

pub struct QbitClient {
    base_url: String,
    username: String,
    password: String,
    http: Client,
    auth: Mutex<AuthState>,
    version: RwLock<Option<ServerVersion>>,
}

impl QbitClient {
    pub fn new(base_url: &str, username: &str, password: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|e| QbitError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http,
            auth: Mutex::new(AuthState {
                phase: AuthPhase::Idle,
                since: None,
            }),
            version: RwLock::new(None),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/v2{}", self.base_url, endpoint)
    }

    /// Timestamp of the last successful login, if any
    pub async fn authenticated_since(&self) -> Option<DateTime<Utc>> {
        self.auth.lock().await.since
    }

    /// Cached API version string from the capability probe
    pub async fn api_version(&self) -> Option<String> {
        self.version.read().await.as_ref().map(|v| v.api.clone())
    }

    /// Cached application version from the capability probe
    pub async fn app_version(&self) -> Option<String> {
        self.version.read().await.as_ref().map(|v| v.app.clone())
    }

    /// Whether `/torrents/info` can inline tracker health (API >= 2.11.4)
    pub async fn supports_tracker_health(&self) -> bool {
        self.version
            .read()
            .await
            .as_ref()
            .map(|v| v.supports_tracker_health)
            .unwrap_or(false)
    }

    /// Establish the SID session cookie
    pub async fn login(&self) -> Result<()> {
        let mut auth = self.auth.lock().await;
        auth.phase = AuthPhase::Authenticating;

        match self.do_login().await {
            Ok(()) => {
                auth.phase = AuthPhase::Authenticated;
                auth.since = Some(Utc::now());
                drop(auth);
                self.probe_version().await;
                Ok(())
            }
            Err(e) => {
                auth.phase = AuthPhase::Idle;
                Err(e)
            }
        }
    }

    async fn do_login(&self) -> Result<()> {
        let url = self.api_url("/auth/login");

        let params = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];

        let response = self.http.post(&url).form(&params).send().await?;

        if response.status() == StatusCode::FORBIDDEN {
            return Err(QbitError::AuthenticationFailed);
        }

        // The endpoint answers 200 with a literal "Fails." body on bad
        // credentials; the SID cookie lands in the jar on success.
        let text = response.text().await?;
        if text.starts_with("Fails") {
            return Err(QbitError::AuthenticationFailed);
        }

        Ok(())
    }

    /// Cache the server's version strings on first successful login
    async fn probe_version(&self) {
        if self.version.read().await.is_some() {
            return;
        }

        let api = match self.fetch_text("/app/webapiVersion").await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("API version probe failed: {}", e);
                return;
            }
        };
        let app = self.fetch_text("/app/version").await.unwrap_or_default();

        let supports = super::supports_tracker_health(&api);
        *self.version.write().await = Some(ServerVersion {
            app,
            api,
            supports_tracker_health: supports,
        });
    }

    async fn fetch_text(&self, endpoint: &str) -> Result<String> {
        let response = self.http.get(self.api_url(endpoint)).send().await?;
        if !response.status().is_success() {
            return Err(QbitError::Status(response.status()));
        }
        Ok(response.text().await?)
    }

    async fn ensure_authenticated(&self) -> Result<()> {
        {
            let auth = self.auth.lock().await;
            if auth.phase == AuthPhase::Authenticated {
                return Ok(());
            }
        }
        self.login().await
    }

    async fn mark_expired(&self) {
        let mut auth = self.auth.lock().await;
        auth.phase = AuthPhase::Expired;
    }

    /// Send a request, retrying once through a fresh login when the session
    /// cookie has expired (403 on an authenticated call).
    async fn execute<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        self.ensure_authenticated().await?;

        let response = build().send().await?;
        if response.status() != StatusCode::FORBIDDEN {
            return Ok(response);
        }

        self.mark_expired().await;
        self.login().await?;

        let retried = build().send().await?;
        if retried.status() == StatusCode::FORBIDDEN {
            self.mark_expired().await;
            return Err(QbitError::AuthenticationFailed);
        }
        Ok(retried)
    }

    async fn check(response: Response) -> Result<Response> {
        if !response.status().is_success() {
            return Err(QbitError::Status(response.status()));
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.api_url(endpoint);
        let response = self
            .execute(|| self.http.get(&url).query(query))
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    async fn post_form(&self, endpoint: &str, params: &[(&str, String)]) -> Result<()> {
        let url = self.api_url(endpoint);
        let response = self
            .execute(|| self.http.post(&url).form(params))
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    // ---- sync ----

    /// Fetch the incremental sync object at the given revision id
    pub async fn get_main_data(&self, rid: i64) -> Result<MainData> {
        self.get_json("/sync/maindata", &[("rid", rid.to_string())])
            .await
    }

    // ---- torrent listing ----

    pub async fn get_torrents(&self, query: &TorrentListQuery) -> Result<Vec<TorrentInfo>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(ref filter) = query.filter {
            params.push(("filter", filter.clone()));
        }
        if let Some(ref category) = query.category {
            params.push(("category", category.clone()));
        }
        if let Some(ref tag) = query.tag {
            params.push(("tag", tag.clone()));
        }
        if let Some(ref hashes) = query.hashes {
            params.push(("hashes", hashes.join("|")));
        }
        if query.include_trackers && self.supports_tracker_health().await {
            params.push(("includeTrackers", "true".to_string()));
        }

        self.get_json("/torrents/info", &params).await
    }

    pub async fn get_torrent_trackers(&self, hash: &str) -> Result<Vec<TrackerInfo>> {
        let url = self.api_url("/torrents/trackers");
        let response = self
            .execute(|| self.http.get(&url).query(&[("hash", hash)]))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(QbitError::TorrentNotFound(hash.to_string()));
        }
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn get_torrent_files(&self, hash: &str) -> Result<Vec<TorrentContent>> {
        let url = self.api_url("/torrents/files");
        let response = self
            .execute(|| self.http.get(&url).query(&[("hash", hash)]))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(QbitError::TorrentNotFound(hash.to_string()));
        }
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    // ---- mutations ----

    pub async fn add_torrent(
        &self,
        source: &TorrentSource,
        options: &AddTorrentOptions,
    ) -> Result<()> {
        let url = self.api_url("/torrents/add");

        let build_form = || -> Result<multipart::Form> {
            let mut form = multipart::Form::new();

            match source {
                TorrentSource::File { filename, bytes } => {
                    let part = multipart::Part::bytes(bytes.clone())
                        .file_name(filename.clone())
                        .mime_str("application/x-bittorrent")
                        .map_err(|e| QbitError::InvalidResponse(e.to_string()))?;
                    form = form.part("torrents", part);
                }
                TorrentSource::Urls(urls) => {
                    form = form.text("urls", urls.join("\n"));
                }
            }

            if let Some(ref path) = options.savepath {
                form = form.text("savepath", path.clone());
            }
            if let Some(ref category) = options.category {
                form = form.text("category", category.clone());
            }
            if !options.tags.is_empty() {
                form = form.text("tags", options.tags.join(","));
            }
            if let Some(ref rename) = options.rename {
                form = form.text("rename", rename.clone());
            }
            if options.paused {
                form = form.text("paused", "true");
            }
            if options.skip_checking {
                form = form.text("skip_checking", "true");
            }
            if options.sequential {
                form = form.text("sequentialDownload", "true");
            }
            if options.first_last_piece_prio {
                form = form.text("firstLastPiecePrio", "true");
            }
            Ok(form)
        };

        self.ensure_authenticated().await?;

        let response = self.http.post(&url).multipart(build_form()?).send().await?;
        if response.status() == StatusCode::FORBIDDEN {
            self.mark_expired().await;
            self.login().await?;
            let retried = self.http.post(&url).multipart(build_form()?).send().await?;
            Self::check(retried).await?;
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    pub async fn pause(&self, hashes: &[String]) -> Result<()> {
        self.post_form("/torrents/pause", &[("hashes", hashes.join("|"))])
            .await
    }

    pub async fn resume(&self, hashes: &[String]) -> Result<()> {
        self.post_form("/torrents/resume", &[("hashes", hashes.join("|"))])
            .await
    }

    pub async fn recheck(&self, hashes: &[String]) -> Result<()> {
        self.post_form("/torrents/recheck", &[("hashes", hashes.join("|"))])
            .await
    }

    pub async fn reannounce(&self, hashes: &[String]) -> Result<()> {
        self.post_form("/torrents/reannounce", &[("hashes", hashes.join("|"))])
            .await
    }

    /// Reannounce on behalf of specific trackers of one torrent.
    ///
    /// The upstream endpoint is torrent-scoped, so the whole torrent is
    /// reannounced; the URL list scopes the caller's per-domain attempt
    /// accounting, not the request itself.
    pub async fn reannounce_trackers(&self, hash: &str, _urls: &[String]) -> Result<()> {
        self.post_form("/torrents/reannounce", &[("hashes", hash.to_string())])
            .await
    }

    pub async fn delete(&self, hashes: &[String], delete_files: bool) -> Result<()> {
        self.post_form(
            "/torrents/delete",
            &[
                ("hashes", hashes.join("|")),
                ("deleteFiles", delete_files.to_string()),
            ],
        )
        .await
    }

    pub async fn set_location(&self, hashes: &[String], location: &str) -> Result<()> {
        self.post_form(
            "/torrents/setLocation",
            &[
                ("hashes", hashes.join("|")),
                ("location", location.to_string()),
            ],
        )
        .await
    }

    pub async fn rename_torrent(&self, hash: &str, name: &str) -> Result<()> {
        self.post_form(
            "/torrents/rename",
            &[("hash", hash.to_string()), ("name", name.to_string())],
        )
        .await
    }

    pub async fn set_file_priority(&self, hash: &str, file_index: i64, priority: i64) -> Result<()> {
        self.post_form(
            "/torrents/filePrio",
            &[
                ("hash", hash.to_string()),
                ("id", file_index.to_string()),
                ("priority", priority.to_string()),
            ],
        )
        .await
    }

    pub async fn set_share_limits(
        &self,
        hashes: &[String],
        ratio_limit: f64,
        seeding_time_limit: i64,
        inactive_seeding_time_limit: i64,
    ) -> Result<()> {
        self.post_form(
            "/torrents/setShareLimits",
            &[
                ("hashes", hashes.join("|")),
                ("ratioLimit", ratio_limit.to_string()),
                ("seedingTimeLimit", seeding_time_limit.to_string()),
                ("inactiveSeedingTimeLimit", inactive_seeding_time_limit.to_string()),
            ],
        )
        .await
    }

    // ---- categories & tags ----

    pub async fn get_categories(&self) -> Result<HashMap<String, Category>> {
        self.get_json("/torrents/categories", &[]).await
    }

    pub async fn create_category(&self, name: &str, save_path: &str) -> Result<()> {
        self.post_form(
            "/torrents/createCategory",
            &[
                ("category", name.to_string()),
                ("savePath", save_path.to_string()),
            ],
        )
        .await
    }

    pub async fn edit_category(&self, name: &str, save_path: &str) -> Result<()> {
        self.post_form(
            "/torrents/editCategory",
            &[
                ("category", name.to_string()),
                ("savePath", save_path.to_string()),
            ],
        )
        .await
    }

    pub async fn remove_categories(&self, names: &[String]) -> Result<()> {
        self.post_form(
            "/torrents/removeCategories",
            &[("categories", names.join("\n"))],
        )
        .await
    }

    pub async fn set_category(&self, hashes: &[String], category: &str) -> Result<()> {
        self.post_form(
            "/torrents/setCategory",
            &[
                ("hashes", hashes.join("|")),
                ("category", category.to_string()),
            ],
        )
        .await
    }

    pub async fn get_tags(&self) -> Result<Vec<String>> {
        self.get_json("/torrents/tags", &[]).await
    }

    pub async fn create_tags(&self, tags: &[String]) -> Result<()> {
        self.post_form("/torrents/createTags", &[("tags", tags.join(","))])
            .await
    }

    pub async fn delete_tags(&self, tags: &[String]) -> Result<()> {
        self.post_form("/torrents/deleteTags", &[("tags", tags.join(","))])
            .await
    }

    pub async fn add_tags(&self, hashes: &[String], tags: &[String]) -> Result<()> {
        self.post_form(
            "/torrents/addTags",
            &[("hashes", hashes.join("|")), ("tags", tags.join(","))],
        )
        .await
    }

    pub async fn remove_tags(&self, hashes: &[String], tags: &[String]) -> Result<()> {
        self.post_form(
            "/torrents/removeTags",
            &[("hashes", hashes.join("|")), ("tags", tags.join(","))],
        )
        .await
    }

    // ---- preferences & app info ----

    pub async fn get_preferences(&self) -> Result<serde_json::Value> {
        self.get_json("/app/preferences", &[]).await
    }

    pub async fn set_preferences(&self, prefs: &serde_json::Value) -> Result<()> {
        self.post_form("/app/setPreferences", &[("json", prefs.to_string())])
            .await
    }

    pub async fn get_version(&self) -> Result<String> {
        let url = self.api_url("/app/version");
        let response = self.execute(|| self.http.get(&url)).await?;
        let response = Self::check(response).await?;
        Ok(response.text().await?)
    }

    pub async fn get_api_version(&self) -> Result<String> {
        let url = self.api_url("/app/webapiVersion");
        let response = self.execute(|| self.http.get(&url)).await?;
        let response = Self::check(response).await?;
        Ok(response.text().await?)
    }

    // ---- transparent proxy ----

    /// Forward an arbitrary `/api/v2/...` request, re-authenticating once on
    /// session expiry. The upstream response is handed back untouched so the
    /// proxy layer can relay status, headers, and body.
    pub async fn raw_request(
        &self,
        method: &str,
        path_and_query: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Response> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| QbitError::InvalidResponse(format!("bad method: {method}")))?;
        let url = format!("{}/api/v2/{}", self.base_url, path_and_query.trim_start_matches('/'));

        self.execute(|| {
            let mut req = self.http.request(method.clone(), &url);
            if let Some(ct) = content_type {
                req = req.header(reqwest::header::CONTENT_TYPE, ct);
            }
            if !body.is_empty() {
                req = req.body(body.clone());
            }
            req
        })
        .await
    }
}
