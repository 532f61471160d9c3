//! qBittorrent Web API client
//!
//! One client per configured instance, with the session cookie managed
//! internally. The pool owns client lifecycles; everything above it talks in
//! the typed operations this module exposes.

mod client;
pub mod models;

pub use client::QbitClient;
pub use models::{
    AddTorrentOptions, Category, MainData, ServerState, TorrentContent, TorrentInfo,
    TorrentListQuery, TorrentPatch, TorrentSource, TrackerInfo,
};

/// Unified error type for upstream operations
#[derive(Debug, thiserror::Error)]
pub enum QbitError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Torrent not found: {0}")]
    TorrentNotFound(String),

    #[error("Upstream returned status {0}")]
    Status(reqwest::StatusCode),
}

impl QbitError {
    /// Transient errors clear on their own at the next cadence; permanent
    /// ones need operator attention.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::RequestFailed(_) => true,
            Self::Status(code) => code.is_server_error(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, QbitError>;

/// Parse a dotted API version string ("2.11.4", optionally "v"-prefixed)
pub fn parse_api_version(raw: &str) -> Option<(u32, u32, u32)> {
    let trimmed = raw.trim().trim_start_matches('v');
    let mut parts = trimmed.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor, patch))
}

/// Tracker-health fields in `/torrents/info` responses arrived in 2.11.4
pub fn supports_tracker_health(api_version: &str) -> bool {
    match parse_api_version(api_version) {
        Some(v) => v >= (2, 11, 4),
        None => false,
    }
}
