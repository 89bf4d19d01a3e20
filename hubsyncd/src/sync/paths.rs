use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("name is empty")]
    Empty,
    #[error("name contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Content for a tracked node lives at `<root>/<account>/<node id>/<name>`.
/// One directory per node keeps renames cheap and makes the reverse lookup
/// used by the local watcher unambiguous.
pub fn content_path_for(
    content_root: &Path,
    account_id: &str,
    node_id: &str,
    name: &str,
) -> Result<PathBuf, PathError> {
    let mut out = content_root.to_path_buf();
    for part in [account_id, node_id, name] {
        out.push(checked_component(part)?);
    }
    Ok(out)
}

pub fn node_dir_for(
    content_root: &Path,
    account_id: &str,
    node_id: &str,
) -> Result<PathBuf, PathError> {
    let mut out = content_root.to_path_buf();
    out.push(checked_component(account_id)?);
    out.push(checked_component(node_id)?);
    Ok(out)
}

/// Reverse of [`content_path_for`]: recover `(account id, node id)` from a
/// path under the content root. Returns `None` for paths outside the root or
/// not shaped like a node content file.
pub fn parse_content_path(content_root: &Path, path: &Path) -> Option<(String, String)> {
    let relative = path.strip_prefix(content_root).ok()?;
    let mut parts = relative.components();
    let account = parts.next()?.as_os_str().to_str()?.to_string();
    let node = parts.next()?.as_os_str().to_str()?.to_string();
    parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((account, node))
}

fn checked_component(part: &str) -> Result<&str, PathError> {
    if part.is_empty() {
        return Err(PathError::Empty);
    }
    if part == "." || part == ".." || part.contains('/') || part.contains('\\') {
        return Err(PathError::UnsupportedComponent(part.to_string()));
    }
    Ok(part)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_node_under_content_root() {
        let root = PathBuf::from("/content");
        let mapped = content_path_for(&root, "acme", "doc-1", "Budget.xlsx").unwrap();
        assert_eq!(mapped, PathBuf::from("/content/acme/doc-1/Budget.xlsx"));
    }

    #[test]
    fn rejects_traversal_components() {
        let root = PathBuf::from("/content");
        assert!(matches!(
            content_path_for(&root, "acme", "..", "secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(matches!(
            content_path_for(&root, "acme", "doc-1", "a/b"),
            Err(PathError::UnsupportedComponent(_))
        ));
    }

    #[test]
    fn parses_content_path_back_to_ids() {
        let root = PathBuf::from("/content");
        let path = PathBuf::from("/content/acme/doc-1/Budget.xlsx");
        assert_eq!(
            parse_content_path(&root, &path),
            Some(("acme".to_string(), "doc-1".to_string()))
        );
        assert_eq!(
            parse_content_path(&root, Path::new("/content/acme/doc-1")),
            None
        );
        assert_eq!(parse_content_path(&root, Path::new("/elsewhere/x")), None);
    }
}
