//! Version & history ledger
//!
//! Each file carries `(version, serverId)` plus the list of versions it has
//! moved through. Every local mutation bumps the version by one and records
//! the pre-mutation pair; a synchronized copy adopts the source's ledger
//! wholesale so both peers agree on the version afterwards.

use rdsync_core::metadata::{HISTORY, SOURCE, VERSION};
use rdsync_core::{FileVersion, HistoryItem, Metadata, RdsyncError, RdsyncResult};

/// Current version of a file; `0@""` when the ledger is absent.
pub fn file_version(meta: &Metadata) -> FileVersion {
    FileVersion {
        version: meta.get(VERSION).and_then(|v| v.parse().ok()).unwrap_or(0),
        server_id: meta.get(SOURCE).unwrap_or_default().to_string(),
    }
}

pub fn history(meta: &Metadata) -> RdsyncResult<Vec<HistoryItem>> {
    match meta.get(HISTORY) {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
            .map_err(|e| RdsyncError::Storage(format!("corrupt {HISTORY} entry: {e}"))),
        _ => Ok(Vec::new()),
    }
}

fn set_ledger(meta: &mut Metadata, version: &FileVersion, history: &[HistoryItem]) -> RdsyncResult<()> {
    let encoded = serde_json::to_string(history)
        .map_err(|e| RdsyncError::Storage(format!("encoding {HISTORY}: {e}")))?;
    meta.insert(VERSION, version.version.to_string());
    meta.insert(SOURCE, version.server_id.clone());
    meta.insert(HISTORY, encoded);
    Ok(())
}

fn trim(history: &mut Vec<HistoryItem>, limit: Option<usize>) {
    if let Some(limit) = limit {
        if history.len() > limit {
            history.drain(..history.len() - limit);
        }
    }
}

/// Record a local mutation in `target`.
///
/// `previous` is the metadata before the mutation, `None` for a new file.
/// A new file starts at version 1 with an empty history; otherwise the old
/// pair is appended and the version goes up by exactly one.
pub fn bump(
    previous: Option<&Metadata>,
    target: &mut Metadata,
    server_id: &str,
    limit: Option<usize>,
) -> RdsyncResult<FileVersion> {
    let (next, items) = match previous {
        Some(prev) => {
            let current = file_version(prev);
            let mut items = history(prev)?;
            if current.version > 0 {
                items.push(HistoryItem::from(&current));
            }
            trim(&mut items, limit);
            (FileVersion::new(current.version + 1, server_id), items)
        }
        None => (FileVersion::new(1, server_id), Vec::new()),
    };
    set_ledger(target, &next, &items)?;
    Ok(next)
}

/// Make `target` carry the same ledger as `source`.
pub fn adopt(target: &mut Metadata, source: &Metadata) -> RdsyncResult<()> {
    set_ledger(target, &file_version(source), &history(source)?)
}

/// Add `acknowledged` to the history without changing the version, so the
/// remote copy counts as an ancestor of the local one.
pub fn acknowledge(meta: &mut Metadata, acknowledged: &FileVersion, limit: Option<usize>) -> RdsyncResult<()> {
    let current = file_version(meta);
    let mut items = history(meta)?;
    if !items.iter().any(|h| h.matches(acknowledged)) {
        items.push(HistoryItem::from(acknowledged));
    }
    trim(&mut items, limit);
    set_ledger(meta, &current, &items)
}

/// How an incoming version relates to the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ancestry {
    /// The local copy is missing or an ancestor of the incoming one.
    Descendant,
    /// Both sides already hold the same version, or the incoming version
    /// is an ancestor of the local one.
    AlreadyKnown,
    /// Neither side descends from the other.
    Diverged,
}

/// Compare the destination's version against the source's ledger.
pub fn ancestry(
    local: &FileVersion,
    local_history: &[HistoryItem],
    incoming: &FileVersion,
    incoming_history: &[HistoryItem],
) -> Ancestry {
    if local.version == 0 || incoming_history.iter().any(|h| h.matches(local)) {
        return Ancestry::Descendant;
    }
    if local == incoming || local_history.iter().any(|h| h.matches(incoming)) {
        return Ancestry::AlreadyKnown;
    }
    Ancestry::Diverged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn meta_at(version: u64, server: &str, hist: &[(u64, &str)]) -> Metadata {
        let mut m = Metadata::new();
        let items: Vec<HistoryItem> = hist
            .iter()
            .map(|(v, s)| HistoryItem::from(FileVersion::new(*v, *s)))
            .collect();
        set_ledger(&mut m, &FileVersion::new(version, server), &items).unwrap();
        m
    }

    #[test]
    fn new_file_starts_at_version_one() {
        let mut m = Metadata::new();
        let v = bump(None, &mut m, "a", None).unwrap();
        assert_eq!(v, FileVersion::new(1, "a"));
        assert!(history(&m).unwrap().is_empty());
    }

    #[test]
    fn two_uploads_leave_one_history_item() {
        let mut first = Metadata::new();
        bump(None, &mut first, "a", None).unwrap();
        let mut second = Metadata::new();
        bump(Some(&first), &mut second, "a", None).unwrap();

        let items = history(&second).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].version, 1);
        assert_eq!(file_version(&second).version, 2);
    }

    #[test]
    fn mutation_takes_the_mutating_server_id() {
        let prev = meta_at(4, "remote", &[(3, "remote")]);
        let mut next = Metadata::new();
        bump(Some(&prev), &mut next, "local", None).unwrap();
        assert_eq!(file_version(&next), FileVersion::new(5, "local"));
        assert_eq!(history(&next).unwrap().last().unwrap().server_id, "remote");
    }

    #[test]
    fn limit_drops_oldest_entries() {
        let prev = meta_at(4, "a", &[(1, "a"), (2, "a"), (3, "a")]);
        let mut next = Metadata::new();
        bump(Some(&prev), &mut next, "a", Some(2)).unwrap();
        let versions: Vec<u64> = history(&next).unwrap().iter().map(|h| h.version).collect();
        assert_eq!(versions, vec![3, 4]);
    }

    #[test]
    fn ancestry_rules() {
        let src = FileVersion::new(2, "s");
        let src_hist = vec![HistoryItem::from(FileVersion::new(1, "d"))];

        assert_eq!(ancestry(&FileVersion::default(), &[], &src, &src_hist), Ancestry::Descendant);
        assert_eq!(ancestry(&FileVersion::new(1, "d"), &[], &src, &src_hist), Ancestry::Descendant);
        assert_eq!(ancestry(&src, &src_hist, &src, &src_hist), Ancestry::AlreadyKnown);
        assert_eq!(
            ancestry(&FileVersion::new(1, "x"), &[], &FileVersion::new(1, "s"), &[]),
            Ancestry::Diverged
        );
        // Local acknowledged the remote version earlier.
        let local_hist = vec![HistoryItem::from(FileVersion::new(1, "s"))];
        assert_eq!(
            ancestry(&FileVersion::new(1, "x"), &local_hist, &FileVersion::new(1, "s"), &[]),
            Ancestry::AlreadyKnown
        );
    }

    #[test]
    fn acknowledge_keeps_version() {
        let mut m = meta_at(1, "ours", &[]);
        acknowledge(&mut m, &FileVersion::new(1, "theirs"), None).unwrap();
        acknowledge(&mut m, &FileVersion::new(1, "theirs"), None).unwrap();
        assert_eq!(file_version(&m), FileVersion::new(1, "ours"));
        assert_eq!(history(&m).unwrap(), vec![HistoryItem::from(FileVersion::new(1, "theirs"))]);
    }

    proptest! {
        #[test]
        fn each_mutation_adds_one_item(mutations in 1usize..40) {
            let mut meta = Metadata::new();
            bump(None, &mut meta, "a", None).unwrap();
            for _ in 1..mutations {
                let mut next = Metadata::new();
                bump(Some(&meta), &mut next, "a", None).unwrap();
                meta = next;
            }
            prop_assert_eq!(file_version(&meta).version, mutations as u64);
            prop_assert_eq!(history(&meta).unwrap().len(), mutations - 1);
        }
    }
}
