use std::path::Path;

use serde_json::json;
use sqlx::SqlitePool;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::sync::queue::{NodeRef, UploadQueue, UploadStatus};
use crate::sync::store::AccountRecord;

async fn make_engine(server_uri: &str, dir: &Path) -> SyncCoordinator {
    let client = HubClient::new(server_uri, "test-token").unwrap();
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = NodeStore::from_pool(pool);
    store.init().await.unwrap();
    store
        .put_account(&AccountRecord {
            id: "acme".to_string(),
            server_url: server_uri.to_string(),
            protocol: "https".to_string(),
            username: "reviewer".to_string(),
            repository_id: "main".to_string(),
        })
        .await
        .unwrap();
    let uploads = UploadQueue::open(&dir.join("queue")).unwrap();
    SyncCoordinator::new(client, store, uploads, dir.join("content"))
}

fn folder_json(id: &str, name: &str, tag: &str) -> serde_json::Value {
    json!({"id": id, "name": name, "type": "folder", "version_tag": tag})
}

fn file_json(id: &str, name: &str, parent: &str, tag: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "type": "file",
        "parent_id": parent,
        "size": 5,
        "modified": "2024-01-01T00:00:00Z",
        "version_tag": tag
    })
}

fn children_json(entries: &[serde_json::Value]) -> serde_json::Value {
    json!({"entries": entries, "limit": 100, "skip": 0, "total": entries.len()})
}

fn link_json(server_uri: &str, suffix: &str, method: &str) -> serde_json::Value {
    json!({"href": format!("{server_uri}/{suffix}"), "method": method})
}

async fn mount_folder_with_doc(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/nodes/folder-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(folder_json("folder-1", "Reports", "f1")),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/folder-1/children"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(children_json(&[file_json("doc-1", "A.txt", "folder-1", "1.0")])),
        )
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-1/download-link"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(link_json(&server.uri(), "dl/doc-1", "GET")),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dl/doc-1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .mount(server)
        .await;
}

fn summary(outcome: PassOutcome) -> PassSummary {
    match outcome {
        PassOutcome::Completed(summary) => summary,
        PassOutcome::Coalesced => panic!("expected a completed pass"),
    }
}

#[tokio::test]
async fn first_pass_syncs_tree_and_second_pass_issues_no_transfers() {
    let server = MockServer::start().await;
    mount_folder_with_doc(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("doc-1", "A.txt", "folder-1", "1.0")),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server.uri(), dir.path()).await;

    let root = engine.add_to_sync("acme", "folder-1").await.unwrap();
    assert!(root.top_level);
    assert_eq!(root.state, SyncState::Unsynced);

    let first = summary(engine.request_pass("acme").await.unwrap());
    assert_eq!(first.synced, 2);
    assert_eq!(first.conflicts, 0);
    assert!(first.errors.is_empty());
    assert!(!first.aborted_offline);

    let folder = engine.store().get_node(root.id).await.unwrap().unwrap();
    assert_eq!(folder.state, SyncState::Synced);
    assert!(folder.last_downloaded.is_some());
    assert_eq!(folder.version_tag.as_deref(), Some("f1"));

    let children = engine.store().children(root.id).await.unwrap();
    assert_eq!(children.len(), 1);
    let doc = &children[0];
    assert_eq!(doc.state, SyncState::Synced);
    assert_eq!(doc.version_tag.as_deref(), Some("1.0"));
    assert!(doc.last_downloaded.is_some());

    let target = dir.path().join("content/acme/doc-1/A.txt");
    assert_eq!(std::fs::read(&target).unwrap(), b"hello");

    // Unchanged markers on both sides: the second pass stays idle. The
    // download mocks carry expect(1), so a second fetch would fail the test.
    let second = summary(engine.request_pass("acme").await.unwrap());
    assert_eq!(second.synced, 2);
    let doc_after = engine.store().get_node(doc.id).await.unwrap().unwrap();
    assert_eq!(doc_after.state, SyncState::Synced);

    let requests = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/dl/doc-1")
        .count();
    assert_eq!(requests, 1);
}

#[tokio::test]
async fn divergent_edits_surface_conflict_without_error() {
    let server = MockServer::start().await;
    mount_folder_with_doc(&server).await;
    // One metadata fetch during the first pass, a newer tag afterwards.
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("doc-1", "A.txt", "folder-1", "1.0")),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("doc-1", "A.txt", "folder-1", "2.0")),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server.uri(), dir.path()).await;
    let root = engine.add_to_sync("acme", "folder-1").await.unwrap();
    summary(engine.request_pass("acme").await.unwrap());

    // Local edit between passes.
    let target = dir.path().join("content/acme/doc-1/A.txt");
    std::fs::write(&target, b"local edit").unwrap();
    assert!(engine.mark_dirty("acme", "doc-1").await.unwrap());

    let second = summary(engine.request_pass("acme").await.unwrap());
    assert_eq!(second.conflicts, 1);
    assert_eq!(second.failed, 0);

    let doc = engine
        .store()
        .children(root.id)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(doc.state, SyncState::Conflict);
    assert!(engine.store().get_error(doc.id).await.unwrap().is_none());
    // Neither side was overwritten.
    assert_eq!(std::fs::read(&target).unwrap(), b"local edit");
}

#[tokio::test]
async fn node_failure_is_recorded_once_and_does_not_abort_the_pass() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/folder-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(folder_json("folder-1", "Reports", "f1")),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/folder-1/children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(children_json(&[
            file_json("doc-bad", "bad.txt", "folder-1", "1.0"),
            file_json("doc-good", "good.txt", "folder-1", "1.0"),
        ])))
        .mount(&server)
        .await;
    for doc in ["doc-bad", "doc-good"] {
        Mock::given(method("GET"))
            .and(path(format!("/api/nodes/{doc}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(file_json(doc, &format!("{doc}.txt"), "folder-1", "1.0")),
            )
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-bad/download-link"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-good/download-link"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(link_json(&server.uri(), "dl/good", "GET")),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dl/good"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fine"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server.uri(), dir.path()).await;
    engine.add_to_sync("acme", "folder-1").await.unwrap();

    let first = summary(engine.request_pass("acme").await.unwrap());
    assert_eq!(first.failed, 1);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.errors[0].node_id, "doc-bad");
    assert_eq!(first.errors[0].code, "transfer_failed");
    // The healthy sibling still made it through.
    assert_eq!(first.synced, 2);

    // A second failing pass replaces the ledger entry instead of stacking.
    let second = summary(engine.request_pass("acme").await.unwrap());
    assert_eq!(second.errors.len(), 1);
    assert_eq!(engine.store().list_errors("acme").await.unwrap().len(), 1);
}

#[tokio::test]
async fn connectivity_loss_aborts_the_pass_without_per_node_errors() {
    let dir = tempdir().unwrap();
    let engine = make_engine("http://127.0.0.1:1", dir.path()).await;

    let repository = engine
        .store()
        .ensure_repository("acme", "main")
        .await
        .unwrap();
    engine
        .store()
        .upsert_node(
            repository,
            &NodeInput {
                node_id: "folder-1".to_string(),
                parent: None,
                name: "Reports".to_string(),
                is_folder: true,
                top_level: true,
                snapshot: None,
                version_tag: None,
            },
        )
        .await
        .unwrap();

    let result = summary(engine.request_pass("acme").await.unwrap());
    assert!(result.aborted_offline);
    assert!(result.errors.is_empty());
    assert!(engine.store().list_errors("acme").await.unwrap().is_empty());
}

#[tokio::test]
async fn tombstoned_edits_upload_then_reconcile_away() {
    let server = MockServer::start().await;
    mount_folder_with_doc(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("doc-1", "A.txt", "folder-1", "1.0")),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-1/upload-link"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(link_json(&server.uri(), "up/doc-1", "PUT")),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/up/doc-1"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server.uri(), dir.path()).await;
    let root = engine.add_to_sync("acme", "folder-1").await.unwrap();
    summary(engine.request_pass("acme").await.unwrap());

    let doc = engine
        .store()
        .children(root.id)
        .await
        .unwrap()
        .remove(0);
    let target = dir.path().join("content/acme/doc-1/A.txt");
    std::fs::write(&target, b"unsaved work").unwrap();
    engine.mark_dirty("acme", "doc-1").await.unwrap();

    engine.remove_from_sync(root.id).await.unwrap();

    // The dirty document and its retaining ancestor are tombstoned, not lost.
    let doc_after = engine.store().get_node(doc.id).await.unwrap().unwrap();
    assert!(doc_after.removed_with_edits);
    assert_eq!(doc_after.state, SyncState::PendingRemoval);
    let root_after = engine.store().get_node(root.id).await.unwrap().unwrap();
    assert!(root_after.removed_with_edits);

    // The next pass drains the edits and hard-deletes the records.
    summary(engine.request_pass("acme").await.unwrap());
    assert!(engine.store().get_node(doc.id).await.unwrap().is_none());
    assert!(engine.store().get_node(root.id).await.unwrap().is_none());
}

#[tokio::test]
async fn clean_subtree_removal_deletes_records_and_content() {
    let server = MockServer::start().await;
    mount_folder_with_doc(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("doc-1", "A.txt", "folder-1", "1.0")),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server.uri(), dir.path()).await;
    let root = engine.add_to_sync("acme", "folder-1").await.unwrap();
    summary(engine.request_pass("acme").await.unwrap());

    engine.remove_from_sync(root.id).await.unwrap();

    assert!(engine.store().get_node(root.id).await.unwrap().is_none());
    assert!(engine.store().top_level_nodes("acme").await.unwrap().is_empty());
    assert!(!dir.path().join("content/acme/doc-1").exists());
}

#[tokio::test]
async fn upload_queue_entry_survives_failures_until_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-9/upload-link"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-9/upload-link"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(link_json(&server.uri(), "up/doc-9", "PUT")),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/up/doc-9"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server.uri(), dir.path()).await;

    let source = dir.path().join("draft.txt");
    std::fs::write(&source, b"draft").unwrap();
    engine
        .enqueue_upload(FileMetadata::new(
            "acme",
            Some(NodeRef {
                repository_id: "main".to_string(),
                node_id: "doc-9".to_string(),
            }),
            source,
            SourceLocation::Repository,
        ))
        .await
        .unwrap();

    // Two timeouts: the entry goes back to pending each time.
    for _ in 0..2 {
        assert_eq!(engine.process_next_upload().await.unwrap(), Some(false));
        let queue = UploadQueue::open(&dir.path().join("queue")).unwrap();
        assert_eq!(queue.entries().len(), 1);
        assert_eq!(queue.entries()[0].status, UploadStatus::PendingUpload);
    }

    // Third attempt is accepted and only then removes the entry.
    assert_eq!(engine.process_next_upload().await.unwrap(), Some(true));
    assert_eq!(engine.pending_uploads().await, 0);
    let queue = UploadQueue::open(&dir.path().join("queue")).unwrap();
    assert!(queue.is_empty());
}

#[tokio::test]
async fn keep_remote_resolution_downloads_and_clears_conflict() {
    let server = MockServer::start().await;
    // Mount order matters: the first download serves the initial pass, every
    // later one hands out the post-conflict content.
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-1/download-link"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(link_json(&server.uri(), "dl/doc-1", "GET")),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-1/download-link"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(link_json(&server.uri(), "dl2/doc-1", "GET")),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("doc-1", "A.txt", "folder-1", "1.0")),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/doc-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("doc-1", "A.txt", "folder-1", "2.0")),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dl2/doc-1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"remote wins"))
        .mount(&server)
        .await;
    mount_folder_with_doc(&server).await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server.uri(), dir.path()).await;
    let root = engine.add_to_sync("acme", "folder-1").await.unwrap();
    summary(engine.request_pass("acme").await.unwrap());

    let target = dir.path().join("content/acme/doc-1/A.txt");
    std::fs::write(&target, b"local edit").unwrap();
    engine.mark_dirty("acme", "doc-1").await.unwrap();
    summary(engine.request_pass("acme").await.unwrap());

    let doc = engine
        .store()
        .children(root.id)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(doc.state, SyncState::Conflict);

    engine
        .resolve_conflict(doc.id, ConflictChoice::KeepRemote)
        .await
        .unwrap();

    let resolved = engine.store().get_node(doc.id).await.unwrap().unwrap();
    assert_eq!(resolved.state, SyncState::Synced);
    assert!(!resolved.dirty);
    assert_eq!(resolved.version_tag.as_deref(), Some("2.0"));
    assert_eq!(std::fs::read(&target).unwrap(), b"remote wins");
}

#[tokio::test]
async fn resolving_an_unconflicted_node_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/nodes/folder-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(folder_json("folder-1", "Reports", "f1")),
        )
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = make_engine(&server.uri(), dir.path()).await;
    let root = engine.add_to_sync("acme", "folder-1").await.unwrap();

    assert!(matches!(
        engine
            .resolve_conflict(root.id, ConflictChoice::KeepLocal)
            .await,
        Err(EngineError::Precondition(_))
    ));
}
