//! Utility functions

use base64::Engine;

/// Simple encryption for storing passwords (not cryptographically secure, just obfuscation)
/// In production, use a proper secrets manager or encryption library
pub fn encrypt_password(password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(password.as_bytes())
}

/// Decrypt password
pub fn decrypt_password(encrypted: &str) -> Option<String> {
    base64::engine::general_purpose::STANDARD
        .decode(encrypted)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Normalize a torrent hash: trimmed and uppercased.
///
/// Snapshots key torrents by the 40-hex uppercased form; every hash coming
/// in from the API or from upstream responses goes through here first.
pub fn normalize_hash(hash: &str) -> String {
    hash.trim().to_ascii_uppercase()
}

/// Normalize a list of hashes, dropping empties and duplicates while keeping
/// first-seen order.
pub fn normalize_hashes<I, S>(hashes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for h in hashes {
        let n = normalize_hash(h.as_ref());
        if n.is_empty() {
            continue;
        }
        if seen.insert(n.clone()) {
            out.push(n);
        }
    }
    out
}

/// Extract the registrable-ish domain from a tracker URL.
///
/// Keeps the last two labels of the host ("tracker.example.org" ->
/// "example.org") so that announce mirrors on subdomains group together.
/// Non-URL input (DHT/PeX placeholders) yields None.
pub fn tracker_domain(tracker_url: &str) -> Option<String> {
    let url = url::Url::parse(tracker_url).ok()?;
    let host = url.host_str()?;
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() >= 2 {
        Some(parts[parts.len() - 2..].join(".").to_lowercase())
    } else {
        Some(host.to_lowercase())
    }
}

/// Format file size in human-readable format
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if size >= TB {
        format!("{:.2} TB", size as f64 / TB as f64)
    } else if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}
