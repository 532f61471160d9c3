//! Hardlink scope collector
//!
//! Best-effort, Unix-only: walks each torrent's content path and classifies
//! extra links as pointing at other torrents in the snapshot or outside the
//! client. On platforms without inode metadata the map stays empty and
//! hardlink-scoped rules evaluate false.

use std::collections::HashMap;

use super::index::HardlinkScope;
use crate::qbit::TorrentInfo;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;
#[cfg(unix)]
use std::path::Path;

#[cfg(unix)]
const MAX_FILES_PER_TORRENT: usize = 10_000;

#[cfg(unix)]
fn walk(path: &Path, out: &mut Vec<(u64, u64, u64)>, budget: &mut usize) {
    if *budget == 0 {
        return;
    }
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };
    if meta.is_file() {
        *budget -= 1;
        out.push((meta.dev(), meta.ino(), meta.nlink()));
    } else if meta.is_dir() {
        let entries = match std::fs::read_dir(path) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            walk(&entry.path(), out, budget);
        }
    }
}

#[cfg(unix)]
pub fn collect(torrents: &HashMap<String, TorrentInfo>) -> HashMap<String, HardlinkScope> {
    // Pass 1: per-torrent file inventories, and which torrent owns which inode.
    let mut files_by_hash: HashMap<&str, Vec<(u64, u64, u64)>> = HashMap::new();
    let mut owners: HashMap<(u64, u64), usize> = HashMap::new();

    for (hash, t) in torrents {
        if t.content_path.is_empty() {
            continue;
        }
        let mut files = Vec::new();
        let mut budget = MAX_FILES_PER_TORRENT;
        walk(Path::new(&t.content_path), &mut files, &mut budget);
        for (dev, ino, _) in &files {
            *owners.entry((*dev, *ino)).or_default() += 1;
        }
        files_by_hash.insert(hash.as_str(), files);
    }

    // Pass 2: classify. A file with nlink > 1 is internal when another
    // torrent holds the same inode, external otherwise.
    let mut scopes = HashMap::new();
    for (hash, files) in files_by_hash {
        if files.is_empty() {
            continue;
        }
        let mut internal = false;
        let mut external = false;
        for (dev, ino, nlink) in &files {
            if *nlink <= 1 {
                continue;
            }
            let shared_inside = owners.get(&(*dev, *ino)).copied().unwrap_or(0) > 1;
            let links_outside = *nlink > owners.get(&(*dev, *ino)).copied().unwrap_or(0) as u64;
            if shared_inside {
                internal = true;
            }
            if links_outside {
                external = true;
            }
        }
        let scope = match (internal, external) {
            (false, false) => HardlinkScope::None,
            (true, false) => HardlinkScope::Internal,
            (false, true) => HardlinkScope::External,
            (true, true) => HardlinkScope::Mixed,
        };
        scopes.insert(hash.to_string(), scope);
    }
    scopes
}

#[cfg(not(unix))]
pub fn collect(_torrents: &HashMap<String, TorrentInfo>) -> HashMap<String, HardlinkScope> {
    HashMap::new()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_unlinked_file_scopes_none() {
        let dir = std::env::temp_dir().join(format!("armada-hl-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("payload.bin");
        std::fs::write(&file, b"data").unwrap();

        let mut torrents = HashMap::new();
        torrents.insert(
            "A1".to_string(),
            TorrentInfo {
                hash: "A1".to_string(),
                content_path: file.to_string_lossy().into_owned(),
                ..Default::default()
            },
        );

        let scopes = collect(&torrents);
        assert_eq!(scopes.get("A1"), Some(&HardlinkScope::None));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_cross_torrent_link_is_internal() {
        let dir = std::env::temp_dir().join(format!("armada-hl2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let a = dir.join("a.bin");
        let b = dir.join("b.bin");
        std::fs::write(&a, b"data").unwrap();
        let _ = std::fs::remove_file(&b);
        std::fs::hard_link(&a, &b).unwrap();

        let mut torrents = HashMap::new();
        for (hash, path) in [("A1", &a), ("B2", &b)] {
            torrents.insert(
                hash.to_string(),
                TorrentInfo {
                    hash: hash.to_string(),
                    content_path: path.to_string_lossy().into_owned(),
                    ..Default::default()
                },
            );
        }

        let scopes = collect(&torrents);
        assert_eq!(scopes.get("A1"), Some(&HardlinkScope::Internal));
        assert_eq!(scopes.get("B2"), Some(&HardlinkScope::Internal));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
