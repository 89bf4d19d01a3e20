/// What a pass should do with a document, given the version tag captured at
/// the last successful sync (`base_tag`), the tag the server reports now, and
/// whether local content changed since that sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    UpToDate,
    Download,
    Upload,
    Conflict,
}

pub fn classify(base_tag: Option<&str>, remote_tag: &str, local_dirty: bool) -> SyncAction {
    let remote_changed = base_tag != Some(remote_tag);
    match (local_dirty, remote_changed) {
        (false, false) => SyncAction::UpToDate,
        (false, true) => SyncAction::Download,
        (true, false) => SyncAction::Upload,
        (true, true) => SyncAction::Conflict,
    }
}

/// How the user chose to settle a conflicted document. Conflicts are never
/// settled without one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    KeepLocal,
    KeepRemote,
    SaveAsCopy,
}

/// Sibling name for the save-as-copy resolution, e.g.
/// `Budget (conflict 1700000000).xlsx`.
pub fn copy_name(name: &str, stamp: i64) -> String {
    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{stem} (conflict {stamp}).{ext}");
    }
    format!("{name} (conflict {stamp})")
}
