use std::path::Path;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::paths::parse_content_path;

/// Change to a tracked node's local content, mapped back to repository ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    ContentModified { account: String, node_id: String },
    ContentRemoved { account: String, node_id: String },
}

pub fn start_notify_watcher(
    content_root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = content_root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter_map(|path| parse_content_path(root, &path))
            .map(|(account, node_id)| LocalEvent::ContentModified { account, node_id })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .filter_map(|path| parse_content_path(root, &path))
            .map(|(account, node_id)| LocalEvent::ContentRemoved { account, node_id })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn maps_modify_event_to_content_modified() {
        let root = Path::new("/content");
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Any,
            )),
            paths: vec![PathBuf::from("/content/acme/doc-1/Budget.xlsx")],
            attrs: Default::default(),
        };
        let mapped = map_event(root, event);
        assert_eq!(
            mapped,
            vec![LocalEvent::ContentModified {
                account: "acme".into(),
                node_id: "doc-1".into()
            }]
        );
    }

    #[test]
    fn ignores_paths_outside_node_directories() {
        let root = Path::new("/content");
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![
                PathBuf::from("/content/acme"),
                PathBuf::from("/elsewhere/file.txt"),
            ],
            attrs: Default::default(),
        };
        assert!(map_event(root, event).is_empty());
    }

    #[test]
    fn maps_remove_event_to_content_removed() {
        let root = Path::new("/content");
        let event = Event {
            kind: EventKind::Remove(notify::event::RemoveKind::File),
            paths: vec![PathBuf::from("/content/acme/doc-1/Budget.xlsx")],
            attrs: Default::default(),
        };
        let mapped = map_event(root, event);
        assert_eq!(
            mapped,
            vec![LocalEvent::ContentRemoved {
                account: "acme".into(),
                node_id: "doc-1".into()
            }]
        );
    }
}
