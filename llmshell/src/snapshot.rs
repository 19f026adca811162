//! Best-effort recursive snapshot of a directory tree.
//!
//! The tree may change while it is being walked, so anything that cannot be
//! stat'ed or read is left out instead of failing the whole snapshot.

use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::Path;

use chrono::{DateTime, Local};
use log::{debug, trace};
use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

use crate::models::{EntryMeta, EntryType, Snapshot};

const HASH_CHUNK_BYTES: usize = 64 * 1024;

pub fn snapshot(root: &Path) -> Snapshot {
    let mut entries = Snapshot::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                trace!("Skipping unreadable entry: {}", err);
                continue;
            }
        };
        let Some(rel) = relative_key(root, entry.path()) else {
            continue;
        };
        // a link is recorded as its target but never descended into
        let meta = if entry.path_is_symlink() {
            fs::metadata(entry.path())
        } else {
            entry.metadata().map_err(io::Error::from)
        };
        let meta = match meta {
            Ok(meta) => meta,
            Err(err) => {
                trace!("Skipping {}: {}", rel, err);
                continue;
            }
        };

        let record = if meta.is_dir() {
            EntryMeta {
                kind: EntryType::Dir,
                size: None,
                last_modified: modified_iso(&meta),
                hash: None,
            }
        } else if meta.is_file() {
            let hash = match hash_file(entry.path()) {
                Ok(hash) => hash,
                Err(err) => {
                    trace!("Skipping {}: {}", rel, err);
                    continue;
                }
            };
            EntryMeta {
                kind: EntryType::File,
                size: Some(meta.len()),
                last_modified: modified_iso(&meta),
                hash: Some(hash),
            }
        } else {
            // sockets, fifos and devices
            continue;
        };
        entries.insert(rel, record);
    }

    debug!("Snapshot of {} has {} entries", root.display(), entries.len());
    entries
}

/// SHA-256 over the full file contents, read in fixed-size chunks.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn modified_iso(meta: &Metadata) -> String {
    meta.modified()
        .map(|time| {
            DateTime::<Local>::from(time)
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::write(dir.path().join("README"), "hello").unwrap();
        fs::write(dir.path().join("src/main.py"), "print('hi')").unwrap();
        fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join(".git/objects/blob"), "x").unwrap();
        fs::write(dir.path().join("src/.cache"), "x").unwrap();
        dir
    }

    #[test]
    fn records_files_and_dirs_relative_to_root() {
        let dir = fixture();
        let snap = snapshot(dir.path());

        let readme = &snap["README"];
        assert_eq!(readme.kind, EntryType::File);
        assert_eq!(readme.size, Some(5));
        assert!(readme.hash.is_some());
        assert!(!readme.last_modified.is_empty());

        let src = &snap["src"];
        assert_eq!(src.kind, EntryType::Dir);
        assert!(src.hash.is_none());
        assert!(src.size.is_none());

        assert!(snap.contains_key("src/nested"));
        assert!(snap.contains_key("src/main.py"));
    }

    #[test]
    fn hidden_entries_are_skipped_at_every_level() {
        let dir = fixture();
        let snap = snapshot(dir.path());
        assert!(
            snap.keys()
                .all(|key| key.split('/').all(|part| !part.starts_with('.')))
        );
        assert_eq!(snap.len(), 4);
    }

    #[test]
    fn hash_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "same").unwrap();
        fs::write(&b, "same").unwrap();
        assert_eq!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
        fs::write(&b, "different").unwrap();
        assert_ne!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
        assert_eq!(hash_file(&a).unwrap().len(), 64);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recorded_as_their_targets() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("target.txt"), "payload").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.txt"), "x").unwrap();
        symlink(dir.path().join("target.txt"), dir.path().join("link.txt")).unwrap();
        symlink(dir.path().join("sub"), dir.path().join("linkdir")).unwrap();
        symlink(dir.path().join("gone"), dir.path().join("dangling")).unwrap();

        let snap = snapshot(dir.path());
        let link = &snap["link.txt"];
        assert_eq!(link.kind, EntryType::File);
        assert_eq!(link.size, Some(7));
        assert_eq!(link.hash, snap["target.txt"].hash);

        assert_eq!(snap["linkdir"].kind, EntryType::Dir);
        assert!(!snap.contains_key("linkdir/inner.txt"));
        assert!(snap.contains_key("sub/inner.txt"));
        assert!(!snap.contains_key("dangling"));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_entries_are_left_out() {
        use std::os::unix::fs::PermissionsExt;

        // root reads through permission bits
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("visible.txt"), "ok").unwrap();
        fs::write(dir.path().join("secret.txt"), "no").unwrap();
        fs::create_dir(dir.path().join("locked")).unwrap();
        fs::write(dir.path().join("locked/inner.txt"), "x").unwrap();
        fs::create_dir(dir.path().join("open")).unwrap();
        fs::write(dir.path().join("open/after.txt"), "y").unwrap();
        let mode = |path: &str, bits: u32| {
            fs::set_permissions(dir.path().join(path), fs::Permissions::from_mode(bits)).unwrap()
        };
        mode("secret.txt", 0o000);
        mode("locked", 0o000);

        let snap = snapshot(dir.path());
        mode("locked", 0o755);

        assert!(!snap.contains_key("secret.txt"));
        assert!(!snap.contains_key("locked/inner.txt"));
        assert!(snap.contains_key("visible.txt"));
        assert!(snap.contains_key("open/after.txt"));
    }

    #[test]
    fn missing_root_yields_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        assert!(snapshot(&dir.path().join("nope")).is_empty());
    }
}
