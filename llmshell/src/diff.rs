use crate::models::{Change, ChangeType, EntryType, Snapshot};

/// Path-level changes between two snapshots.
///
/// Only file content hashes are compared for `modified`; a directory whose
/// children changed is not itself reported.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<Change> {
    let mut changes = Vec::new();

    for (path, after) in new {
        match old.get(path) {
            None => changes.push(Change {
                path: path.clone(),
                change_type: ChangeType::Created,
                file_type: after.kind,
                before_hash: None,
                after_hash: after.hash.clone(),
            }),
            Some(before) if after.kind == EntryType::File && before.hash != after.hash => {
                changes.push(Change {
                    path: path.clone(),
                    change_type: ChangeType::Modified,
                    file_type: EntryType::File,
                    before_hash: before.hash.clone(),
                    after_hash: after.hash.clone(),
                })
            }
            Some(_) => {}
        }
    }

    for (path, before) in old {
        if !new.contains_key(path) {
            changes.push(Change {
                path: path.clone(),
                change_type: ChangeType::Deleted,
                file_type: before.kind,
                before_hash: before.hash.clone(),
                after_hash: None,
            });
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntryMeta;
    use std::collections::BTreeSet;

    fn file(hash: &str) -> EntryMeta {
        EntryMeta {
            kind: EntryType::File,
            size: Some(hash.len() as u64),
            last_modified: "2024-01-01T00:00:00".into(),
            hash: Some(hash.into()),
        }
    }

    fn dir(modified: &str) -> EntryMeta {
        EntryMeta {
            kind: EntryType::Dir,
            size: None,
            last_modified: modified.into(),
            hash: None,
        }
    }

    fn paths(changes: &[Change], kind: ChangeType) -> BTreeSet<String> {
        changes
            .iter()
            .filter(|c| c.change_type == kind)
            .map(|c| c.path.clone())
            .collect()
    }

    #[test]
    fn diff_against_itself_is_empty() {
        let mut snap = Snapshot::new();
        snap.insert("a.txt".into(), file("aaa"));
        snap.insert("docs".into(), dir("t0"));
        assert!(diff(&snap, &snap).is_empty());
    }

    #[test]
    fn created_and_deleted_are_key_set_differences() {
        let mut old = Snapshot::new();
        old.insert("keep".into(), file("k"));
        old.insert("gone.txt".into(), file("g"));
        old.insert("olddir".into(), dir("t0"));

        let mut new = Snapshot::new();
        new.insert("keep".into(), file("k"));
        new.insert("fresh.txt".into(), file("f"));
        new.insert("newdir".into(), dir("t1"));

        let changes = diff(&old, &new);
        assert_eq!(
            paths(&changes, ChangeType::Deleted),
            BTreeSet::from(["gone.txt".to_string(), "olddir".to_string()])
        );
        assert_eq!(
            paths(&changes, ChangeType::Created),
            BTreeSet::from(["fresh.txt".to_string(), "newdir".to_string()])
        );
        assert!(paths(&changes, ChangeType::Modified).is_empty());

        let deleted = changes.iter().find(|c| c.path == "gone.txt").unwrap();
        assert_eq!(deleted.before_hash.as_deref(), Some("g"));
        assert!(deleted.after_hash.is_none());

        let created_dir = changes.iter().find(|c| c.path == "newdir").unwrap();
        assert_eq!(created_dir.file_type, EntryType::Dir);
        assert!(created_dir.after_hash.is_none());
    }

    #[test]
    fn modified_carries_both_hashes() {
        let mut old = Snapshot::new();
        old.insert("a.txt".into(), file("before"));
        let mut new = Snapshot::new();
        new.insert("a.txt".into(), file("after"));

        let changes = diff(&old, &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Modified);
        assert_eq!(changes[0].before_hash.as_deref(), Some("before"));
        assert_eq!(changes[0].after_hash.as_deref(), Some("after"));
    }

    #[test]
    fn directory_metadata_changes_are_ignored() {
        let mut old = Snapshot::new();
        old.insert("src".into(), dir("t0"));
        let mut new = Snapshot::new();
        new.insert("src".into(), dir("t1"));
        assert!(diff(&old, &new).is_empty());
    }
}
