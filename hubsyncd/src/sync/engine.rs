use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hubsync_core::{ApiErrorClass, HubClient, HubError, NodeEntry, NodeType};

use super::backoff::Backoff;
use super::conflict::{self, ConflictChoice, SyncAction};
use super::local_watcher::LocalEvent;
use super::paths::{PathError, content_path_for, node_dir_for, parse_content_path};
use super::queue::{FileMetadata, QueueError, SourceLocation, UploadQueue};
use super::store::{
    AccountRecord, NodeInput, NodeRecord, NodeStore, StoreError, SyncErrorRecord, SyncState,
    now_unix,
};
use super::transfer::{TransferClient, TransferError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("api error: {0}")]
    Api(#[from] HubError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("account {0} is not registered")]
    MissingAccount(String),
    #[error("node not found: {0}")]
    MissingNode(String),
    #[error("precondition failed: {0}")]
    Precondition(&'static str),
}

/// Outstanding error carried into the pass report.
#[derive(Debug, Clone)]
pub struct PassError {
    pub node_id: String,
    pub code: String,
    pub description: String,
}

/// Result of one full traversal-and-transfer cycle over an account.
#[derive(Debug, Default, Clone)]
pub struct PassSummary {
    pub synced: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub aborted_offline: bool,
    pub errors: Vec<PassError>,
}

#[derive(Debug, Clone)]
pub enum PassOutcome {
    Completed(PassSummary),
    /// A pass for the account was already running; it will run once more
    /// after the current one finishes.
    Coalesced,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UploadDrain {
    pub completed: usize,
    pub failed: usize,
    pub gave_up: bool,
}

#[derive(Default)]
struct PassRegistry {
    active: HashMap<String, CancellationToken>,
    rerun: HashSet<String>,
}

/// What a finished document worker reports back to the pass loop. Workers do
/// network and file I/O only; every store mutation goes through the single
/// pass loop that drains these.
#[derive(Debug)]
enum DocOutcome {
    UpToDate,
    Downloaded {
        snapshot: NodeEntry,
        content_hash: String,
    },
    Uploaded {
        snapshot: NodeEntry,
        content_hash: String,
    },
    Conflicted,
    RemoteMissing,
    Cancelled,
    Offline(String),
    Failed {
        code: &'static str,
        description: String,
        permanent: bool,
    },
}

pub struct SyncCoordinator {
    client: HubClient,
    store: NodeStore,
    transfer: TransferClient,
    uploads: Mutex<UploadQueue>,
    content_root: PathBuf,
    backoff: Backoff,
    worker_limit: Arc<Semaphore>,
    max_upload_attempts: u32,
    passes: Mutex<PassRegistry>,
    transfers: Mutex<HashMap<i64, CancellationToken>>,
}

impl SyncCoordinator {
    pub fn new(
        client: HubClient,
        store: NodeStore,
        uploads: UploadQueue,
        content_root: PathBuf,
    ) -> Self {
        Self {
            client,
            store,
            transfer: TransferClient::new(),
            uploads: Mutex::new(uploads),
            content_root,
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(10), true),
            worker_limit: Arc::new(Semaphore::new(3)),
            max_upload_attempts: 3,
            passes: Mutex::default(),
            transfers: Mutex::default(),
        }
    }

    pub fn with_transfer(mut self, transfer: TransferClient) -> Self {
        self.transfer = transfer;
        self
    }

    /// Bound on concurrent node transfers within a pass.
    pub fn with_worker_limit(mut self, limit: usize) -> Self {
        self.worker_limit = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    pub fn with_max_upload_attempts(mut self, attempts: u32) -> Self {
        self.max_upload_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Run a pass for `account_id`, or coalesce if one is already running:
    /// the running pass picks up a "run again" marker instead of overlapping.
    pub async fn request_pass(&self, account_id: &str) -> Result<PassOutcome, EngineError> {
        {
            let mut registry = self.passes.lock().await;
            if registry.active.contains_key(account_id) {
                registry.rerun.insert(account_id.to_string());
                debug!(account = account_id, "pass in progress, coalescing request");
                return Ok(PassOutcome::Coalesced);
            }
            registry
                .active
                .insert(account_id.to_string(), CancellationToken::new());
        }

        let result = self.run_pass_loop(account_id).await;

        let mut registry = self.passes.lock().await;
        registry.active.remove(account_id);
        registry.rerun.remove(account_id);
        result.map(PassOutcome::Completed)
    }

    async fn run_pass_loop(&self, account_id: &str) -> Result<PassSummary, EngineError> {
        loop {
            let token = {
                let mut registry = self.passes.lock().await;
                let token = CancellationToken::new();
                registry
                    .active
                    .insert(account_id.to_string(), token.clone());
                token
            };
            let summary = self.run_pass(account_id, &token).await?;
            let rerun = {
                let mut registry = self.passes.lock().await;
                registry.rerun.remove(account_id)
            };
            if rerun && !summary.aborted_offline && !token.is_cancelled() {
                debug!(account = account_id, "running coalesced follow-up pass");
                continue;
            }
            return Ok(summary);
        }
    }

    async fn run_pass(
        &self,
        account_id: &str,
        token: &CancellationToken,
    ) -> Result<PassSummary, EngineError> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| EngineError::MissingAccount(account_id.to_string()))?;
        let repository = self
            .store
            .ensure_repository(&account.id, &account.repository_id)
            .await?;

        let mut summary = PassSummary::default();
        info!(account = account_id, "sync pass started");

        let roots = self.store.top_level_nodes(account_id).await?;
        for root in roots {
            if token.is_cancelled() || summary.aborted_offline {
                break;
            }
            match self
                .sync_subtree(&account, repository, root.id, token, &mut summary)
                .await
            {
                Ok(false) => {}
                Ok(true) => summary.aborted_offline = true,
                Err(err) if is_offline(&err) => summary.aborted_offline = true,
                Err(err) => return Err(err),
            }
        }

        if !summary.aborted_offline && !token.is_cancelled() {
            match self.reconcile_removals(&account, token).await {
                Ok(()) => {}
                Err(err) if is_offline(&err) => summary.aborted_offline = true,
                Err(err) => return Err(err),
            }
        }
        if summary.aborted_offline {
            warn!(account = account_id, "connectivity lost, pass aborted");
        }

        for record in self.store.list_errors(account_id).await? {
            let node_id = self
                .store
                .get_node(record.node)
                .await?
                .map(|n| n.node_id)
                .unwrap_or_default();
            summary.errors.push(PassError {
                node_id,
                code: record.code,
                description: record.description,
            });
        }

        info!(
            account = account_id,
            synced = summary.synced,
            conflicts = summary.conflicts,
            failed = summary.failed,
            aborted = summary.aborted_offline,
            "sync pass finished"
        );
        Ok(summary)
    }

    /// Walk one top-level subtree. Folder metadata is handled inline so a
    /// parent always exists before its children are scheduled; documents run
    /// on the bounded worker pool and their outcomes are applied here, by the
    /// single writer. Returns true when connectivity was lost.
    async fn sync_subtree(
        &self,
        account: &AccountRecord,
        repository: i64,
        root: i64,
        token: &CancellationToken,
        summary: &mut PassSummary,
    ) -> Result<bool, EngineError> {
        let mut jobs: JoinSet<(i64, SyncState, DocOutcome)> = JoinSet::new();
        let walk = self
            .walk_subtree(account, repository, root, token, summary, &mut jobs)
            .await;

        let mut offline = false;
        while let Some(joined) = jobs.join_next().await {
            let (node, previous, outcome) = joined?;
            if self
                .apply_document_outcome(node, previous, outcome, summary)
                .await?
            {
                offline = true;
                token.cancel();
            }
        }

        match walk {
            Ok(()) => Ok(offline),
            Err(err) if is_offline(&err) => Ok(true),
            Err(err) => Err(err),
        }
    }

    async fn walk_subtree(
        &self,
        account: &AccountRecord,
        repository: i64,
        root: i64,
        token: &CancellationToken,
        summary: &mut PassSummary,
        jobs: &mut JoinSet<(i64, SyncState, DocOutcome)>,
    ) -> Result<(), EngineError> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if token.is_cancelled() {
                break;
            }
            let Some(record) = self.store.get_node(id).await? else {
                continue;
            };
            if record.removed_with_edits {
                continue;
            }

            if record.is_folder {
                if self
                    .sync_folder(account, repository, &record, summary)
                    .await?
                {
                    let children = self.store.children(record.id).await?;
                    for child in children.iter().rev() {
                        stack.push(child.id);
                    }
                }
                continue;
            }

            if record.state == SyncState::Conflict {
                // Conflicted documents wait for an explicit decision.
                summary.conflicts += 1;
                continue;
            }

            let previous = record.state;
            self.store.set_state(record.id, SyncState::Syncing).await?;
            let cancel = token.child_token();
            self.transfers
                .lock()
                .await
                .insert(record.id, cancel.clone());

            let client = self.client.clone();
            let transfer = self.transfer.clone();
            let limit = Arc::clone(&self.worker_limit);
            let content_root = self.content_root.clone();
            let account_id = account.id.clone();
            let node = record.id;
            jobs.spawn(async move {
                let outcome = run_document(
                    client,
                    transfer,
                    limit,
                    content_root,
                    account_id,
                    record,
                    cancel,
                )
                .await;
                (node, previous, outcome)
            });
        }
        Ok(())
    }

    /// Metadata-only sync for a folder. Returns true when the folder's
    /// children may be traversed (fresh metadata, or already known from an
    /// earlier pass).
    async fn sync_folder(
        &self,
        account: &AccountRecord,
        repository: i64,
        record: &NodeRecord,
        summary: &mut PassSummary,
    ) -> Result<bool, EngineError> {
        self.store.set_state(record.id, SyncState::Syncing).await?;

        let remote = match self.client.get_node(&record.node_id).await {
            Ok(remote) => remote,
            Err(err) => return self.folder_fetch_failed(record, err, summary).await,
        };

        if record.version_tag.as_deref() != Some(remote.version_tag.as_str()) {
            let entries = match self.client.list_children_all(&record.node_id, 100).await {
                Ok(entries) => entries,
                Err(err) => return self.folder_fetch_failed(record, err, summary).await,
            };

            for entry in &entries {
                let existing = self.store.node_by_remote_id(repository, &entry.id).await?;
                if let Some(existing) = &existing {
                    if existing.top_level {
                        // Explicitly added roots keep their own traversal.
                        continue;
                    }
                    if existing.removed_with_edits {
                        // Rediscovered under a synced folder: back in scope.
                        self.store.clear_removed_with_edits(existing.id).await?;
                        self.store
                            .set_state(existing.id, SyncState::Unsynced)
                            .await?;
                    }
                }
                let input = node_input_from_entry(entry, Some(record.id))?;
                self.store.upsert_node(repository, &input).await?;
            }

            let remote_ids: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
            for child in self.store.children(record.id).await? {
                if !remote_ids.contains(child.node_id.as_str()) {
                    self.retire_subtree(account, child.id).await?;
                }
            }

            let snapshot = serde_json::to_string(&remote)?;
            let remote_modified = parse_modified(remote.modified.as_deref())?;
            self.store
                .mark_downloaded(
                    record.id,
                    now_unix(),
                    &snapshot,
                    &remote.version_tag,
                    remote_modified,
                )
                .await?;
            debug!(node = %record.node_id, "folder metadata refreshed");
        }

        self.store.clear_error(record.id).await?;
        self.store.set_state(record.id, SyncState::Synced).await?;
        summary.synced += 1;
        Ok(true)
    }

    async fn folder_fetch_failed(
        &self,
        record: &NodeRecord,
        err: HubError,
        summary: &mut PassSummary,
    ) -> Result<bool, EngineError> {
        if err.is_connectivity() {
            self.store.set_state(record.id, record.state).await?;
            return Err(err.into());
        }
        if is_not_found(&err) {
            // The folder is gone remotely; its clean subtree leaves scope.
            self.store.set_state(record.id, record.state).await?;
            let account = self.store.repository_account(record.repository).await?;
            if let Some(account_id) = account {
                self.retire_by_account(&account_id, record.id).await?;
            }
            return Ok(false);
        }
        let (code, permanent) = hub_error_parts(&err);
        self.store
            .record_error(record.id, code, &err.to_string(), permanent)
            .await?;
        self.store.set_state(record.id, SyncState::Errored).await?;
        summary.failed += 1;
        // Children of a previously synced folder are already known and may
        // still transfer; an unknown folder's children cannot.
        Ok(record.last_downloaded.is_some())
    }

    /// Apply one worker outcome. Returns true on connectivity loss.
    async fn apply_document_outcome(
        &self,
        node: i64,
        previous: SyncState,
        outcome: DocOutcome,
        summary: &mut PassSummary,
    ) -> Result<bool, EngineError> {
        self.transfers.lock().await.remove(&node);
        match outcome {
            DocOutcome::UpToDate => {
                self.store.set_state(node, SyncState::Synced).await?;
                summary.synced += 1;
            }
            DocOutcome::Downloaded {
                snapshot,
                content_hash,
            }
            | DocOutcome::Uploaded {
                snapshot,
                content_hash,
            } => {
                self.finish_document(node, &snapshot, &content_hash).await?;
                summary.synced += 1;
                debug!(node = %snapshot.id, "document synced");
            }
            DocOutcome::Conflicted => {
                self.store.set_state(node, SyncState::Conflict).await?;
                summary.conflicts += 1;
            }
            DocOutcome::RemoteMissing => {
                self.store.clear_error(node).await?;
                self.store.delete_node(node).await?;
            }
            DocOutcome::Cancelled => {
                self.store.set_state(node, previous).await?;
            }
            DocOutcome::Offline(description) => {
                self.store.set_state(node, previous).await?;
                warn!(error = %description, "transfer lost connectivity");
                return Ok(true);
            }
            DocOutcome::Failed {
                code,
                description,
                permanent,
            } => {
                self.store
                    .record_error(node, code, &description, permanent)
                    .await?;
                self.store.set_state(node, SyncState::Errored).await?;
                summary.failed += 1;
            }
        }
        Ok(false)
    }

    /// Delete a subtree that left sync scope, bottom-up. Dirty documents are
    /// not lost: a remote deletion over local edits surfaces as a conflict,
    /// and tombstoned records are skipped entirely.
    async fn retire_subtree(&self, account: &AccountRecord, root: i64) -> Result<(), EngineError> {
        self.retire_by_account(&account.id, root).await
    }

    async fn retire_by_account(&self, account_id: &str, root: i64) -> Result<(), EngineError> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            order.push(id);
            for child in self.store.children(id).await? {
                stack.push(child.id);
            }
        }
        for id in order.into_iter().rev() {
            let Some(record) = self.store.get_node(id).await? else {
                continue;
            };
            if record.removed_with_edits {
                continue;
            }
            if record.dirty {
                self.store.set_state(id, SyncState::Conflict).await?;
                continue;
            }
            if self.store.child_count(id).await? > 0 {
                continue;
            }
            self.store.clear_error(id).await?;
            self.store.delete_node(id).await?;
            if let Ok(dir) = node_dir_for(&self.content_root, account_id, &record.node_id) {
                let _ = tokio::fs::remove_dir_all(&dir).await;
            }
        }
        Ok(())
    }

    /// Drain tombstones: upload outstanding edits, then hard-delete records
    /// that are reconciled and childless.
    async fn reconcile_removals(
        &self,
        account: &AccountRecord,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        for record in self.store.nodes_pending_removal(&account.id).await? {
            if token.is_cancelled() {
                break;
            }
            if record.dirty && !record.is_folder {
                self.store.set_state(record.id, SyncState::Syncing).await?;
                match upload_document(
                    &self.client,
                    &self.transfer,
                    &self.content_root,
                    &account.id,
                    &record,
                    token,
                )
                .await
                {
                    Ok((snapshot, content_hash)) => {
                        self.finish_document(record.id, &snapshot, &content_hash)
                            .await?;
                    }
                    Err(err) if is_offline(&err) => return Err(err),
                    Err(err) => {
                        warn!(node = %record.node_id, error = %err, "tombstone upload failed");
                        self.store
                            .set_state(record.id, SyncState::PendingRemoval)
                            .await?;
                        continue;
                    }
                }
            }

            let current = self.store.get_node(record.id).await?;
            if let Some(current) = current
                && !current.dirty
                && self.store.child_count(current.id).await? == 0
            {
                self.store.clear_removed_with_edits(current.id).await?;
                self.store.clear_error(current.id).await?;
                self.store.delete_node(current.id).await?;
                if let Ok(dir) = node_dir_for(&self.content_root, &account.id, &current.node_id) {
                    let _ = tokio::fs::remove_dir_all(&dir).await;
                }
                info!(node = %current.node_id, "reconciled tombstone removed");
            }
        }
        Ok(())
    }

    /// Put a node under sync tracking as a top-level entry.
    pub async fn add_to_sync(
        &self,
        account_id: &str,
        node_id: &str,
    ) -> Result<NodeRecord, EngineError> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| EngineError::MissingAccount(account_id.to_string()))?;
        let repository = self
            .store
            .ensure_repository(&account.id, &account.repository_id)
            .await?;

        let remote = match self.client.get_node(node_id).await {
            Ok(remote) => remote,
            Err(err) if is_not_found(&err) => {
                return Err(EngineError::MissingNode(node_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(existing) = self.store.node_by_remote_id(repository, node_id).await? {
            // Re-adding clears a pending-removal tombstone.
            self.store.clear_removed_with_edits(existing.id).await?;
            self.store
                .set_state(existing.id, SyncState::Unsynced)
                .await?;
            return Ok(self
                .store
                .get_node(existing.id)
                .await?
                .unwrap_or(existing));
        }

        let input = NodeInput {
            node_id: node_id.to_string(),
            parent: None,
            name: remote.name.clone(),
            is_folder: remote.node_type == NodeType::Folder,
            top_level: true,
            snapshot: Some(serde_json::to_string(&remote)?),
            // The tag is recorded at the first successful sync; leaving it
            // unset here makes the first pass fetch content.
            version_tag: None,
        };
        Ok(self.store.upsert_node(repository, &input).await?)
    }

    /// Drop a node (and its subtree) out of sync scope. Records with
    /// unsynced local edits are tombstoned instead of deleted, as are their
    /// ancestors, until reconciliation drains them.
    pub async fn remove_from_sync(&self, node: i64) -> Result<(), EngineError> {
        let record = self
            .store
            .get_node(node)
            .await?
            .ok_or_else(|| EngineError::MissingNode(node.to_string()))?;
        let account_id = self
            .store
            .repository_account(record.repository)
            .await?
            .ok_or(EngineError::Precondition("node has no owning account"))?;

        let mut order = Vec::new();
        let mut stack = vec![record.id];
        while let Some(id) = stack.pop() {
            order.push(id);
            for child in self.store.children(id).await? {
                stack.push(child.id);
            }
        }
        for id in order.into_iter().rev() {
            let Some(current) = self.store.get_node(id).await? else {
                continue;
            };
            if current.dirty || self.store.child_count(id).await? > 0 {
                self.store.mark_removed_with_edits(id).await?;
                continue;
            }
            self.store.clear_error(id).await?;
            self.store.delete_node(id).await?;
            if let Ok(dir) = node_dir_for(&self.content_root, &account_id, &current.node_id) {
                let _ = tokio::fs::remove_dir_all(&dir).await;
            }
        }
        Ok(())
    }

    /// Settle a conflicted document with an explicit user decision.
    pub async fn resolve_conflict(
        &self,
        node: i64,
        choice: ConflictChoice,
    ) -> Result<(), EngineError> {
        let record = self
            .store
            .get_node(node)
            .await?
            .ok_or_else(|| EngineError::MissingNode(node.to_string()))?;
        if record.state != SyncState::Conflict {
            return Err(EngineError::Precondition("node is not in conflict"));
        }
        let account_id = self
            .store
            .repository_account(record.repository)
            .await?
            .ok_or(EngineError::Precondition("node has no owning account"))?;
        let cancel = CancellationToken::new();

        self.store.set_state(record.id, SyncState::Syncing).await?;
        let result = self
            .apply_conflict_choice(&record, &account_id, choice, &cancel)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.store.set_state(record.id, SyncState::Conflict).await?;
                Err(err)
            }
        }
    }

    async fn apply_conflict_choice(
        &self,
        record: &NodeRecord,
        account_id: &str,
        choice: ConflictChoice,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        match choice {
            ConflictChoice::KeepLocal => {
                let (snapshot, content_hash) = upload_document(
                    &self.client,
                    &self.transfer,
                    &self.content_root,
                    account_id,
                    record,
                    cancel,
                )
                .await?;
                self.finish_document(record.id, &snapshot, &content_hash)
                    .await?;
            }
            ConflictChoice::KeepRemote => {
                let remote = self.client.get_node(&record.node_id).await?;
                let content_hash = download_document(
                    &self.client,
                    &self.transfer,
                    &self.content_root,
                    account_id,
                    &remote,
                    record,
                    cancel,
                )
                .await?;
                self.finish_document(record.id, &remote, &content_hash)
                    .await?;
            }
            ConflictChoice::SaveAsCopy => {
                let remote = self.client.get_node(&record.node_id).await?;
                let parent_remote = remote
                    .parent_id
                    .clone()
                    .ok_or(EngineError::Precondition(
                        "conflicted node has no parent folder",
                    ))?;

                // Local edits survive as a sibling copy...
                let copy_name = conflict::copy_name(&record.name, now_unix());
                let copy = self
                    .client
                    .create_node(&parent_remote, &copy_name, false)
                    .await?;
                let source =
                    content_path_for(&self.content_root, account_id, &record.node_id, &record.name)?;
                let link = self.client.get_upload_link(&copy.id).await?;
                self.transfer
                    .upload_from_path(link.href.as_str(), &source, cancel)
                    .await?;
                let copy_remote = self.client.get_node(&copy.id).await?;

                if let Some(parent) = record.parent {
                    let copy_target = content_path_for(
                        &self.content_root,
                        account_id,
                        &copy_remote.id,
                        &copy_remote.name,
                    )?;
                    if let Some(dir) = copy_target.parent() {
                        tokio::fs::create_dir_all(dir).await?;
                    }
                    tokio::fs::copy(&source, &copy_target).await?;
                    let copy_hash = hash_file(&copy_target).await?;
                    let input = NodeInput {
                        node_id: copy_remote.id.clone(),
                        parent: Some(parent),
                        name: copy_remote.name.clone(),
                        is_folder: false,
                        top_level: false,
                        snapshot: Some(serde_json::to_string(&copy_remote)?),
                        version_tag: None,
                    };
                    let copy_record = self.store.upsert_node(record.repository, &input).await?;
                    self.finish_document(copy_record.id, &copy_remote, &copy_hash)
                        .await?;
                }

                // ...and the remote version takes the original's place.
                let content_hash = download_document(
                    &self.client,
                    &self.transfer,
                    &self.content_root,
                    account_id,
                    &remote,
                    record,
                    cancel,
                )
                .await?;
                self.finish_document(record.id, &remote, &content_hash)
                    .await?;
            }
        }
        Ok(())
    }

    async fn finish_document(
        &self,
        node: i64,
        snapshot: &NodeEntry,
        content_hash: &str,
    ) -> Result<(), EngineError> {
        let json = serde_json::to_string(snapshot)?;
        let remote_modified = parse_modified(snapshot.modified.as_deref())?;
        self.store
            .mark_downloaded(
                node,
                now_unix(),
                &json,
                &snapshot.version_tag,
                remote_modified,
            )
            .await?;
        self.store.set_dirty(node, false, Some(content_hash)).await?;
        self.store.clear_error(node).await?;
        self.store.set_state(node, SyncState::Synced).await?;
        Ok(())
    }

    /// Clear a node's error so the next pass retries it.
    pub async fn retry_node(&self, node: i64) -> Result<(), EngineError> {
        self.store.clear_error(node).await?;
        self.store.set_state(node, SyncState::Unsynced).await?;
        Ok(())
    }

    pub async fn sync_status(
        &self,
        node: i64,
    ) -> Result<(SyncState, Option<SyncErrorRecord>), EngineError> {
        let record = self
            .store
            .get_node(node)
            .await?
            .ok_or_else(|| EngineError::MissingNode(node.to_string()))?;
        let error = self.store.get_error(node).await?;
        Ok((record.state, error))
    }

    pub async fn handle_local_event(&self, event: LocalEvent) -> Result<(), EngineError> {
        match event {
            LocalEvent::ContentModified { account, node_id } => {
                self.mark_dirty(&account, &node_id).await?;
            }
            LocalEvent::ContentRemoved { account, node_id } => {
                if let Some(record) = self.lookup(&account, &node_id).await? {
                    // Content evicted locally: re-fetch on the next pass.
                    self.store.set_state(record.id, SyncState::Unsynced).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn mark_dirty_by_path(&self, path: &Path) -> Result<bool, EngineError> {
        let Some((account, node_id)) = parse_content_path(&self.content_root, path) else {
            return Ok(false);
        };
        self.mark_dirty(&account, &node_id).await
    }

    /// Compare the current content fingerprint against the one captured at
    /// the last sync; flag the node dirty when they differ.
    pub async fn mark_dirty(&self, account_id: &str, node_id: &str) -> Result<bool, EngineError> {
        let Some(record) = self.lookup(account_id, node_id).await? else {
            return Ok(false);
        };
        let source = content_path_for(&self.content_root, account_id, node_id, &record.name)?;
        let current = hash_file(&source).await.ok();
        let changed = match (&current, &record.local_hash) {
            (Some(now), Some(then)) => now != then,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if changed && !record.dirty {
            self.store.set_dirty(record.id, true, None).await?;
            debug!(node = node_id, "local edits detected");
        }
        Ok(changed)
    }

    async fn lookup(
        &self,
        account_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeRecord>, EngineError> {
        let Some(account) = self.store.get_account(account_id).await? else {
            return Ok(None);
        };
        let repository = self
            .store
            .ensure_repository(&account.id, &account.repository_id)
            .await?;
        Ok(self.store.node_by_remote_id(repository, node_id).await?)
    }

    pub async fn enqueue_upload(&self, metadata: FileMetadata) -> Result<(), EngineError> {
        self.uploads.lock().await.enqueue(metadata)?;
        Ok(())
    }

    pub async fn pending_uploads(&self) -> usize {
        self.uploads.lock().await.len()
    }

    /// Dispatch the oldest pending upload. `Ok(Some(true))` on success,
    /// `Ok(Some(false))` when the entry failed and went back to pending,
    /// `Ok(None)` when the queue has nothing pending.
    pub async fn process_next_upload(&self) -> Result<Option<bool>, EngineError> {
        Ok(self
            .dispatch_next_upload()
            .await?
            .map(|(accepted, _)| accepted))
    }

    async fn dispatch_next_upload(&self) -> Result<Option<(bool, Option<u64>)>, EngineError> {
        let entry = { self.uploads.lock().await.dequeue_next()? };
        let Some(entry) = entry else {
            return Ok(None);
        };

        match self.process_upload(&entry).await {
            Ok(()) => {
                self.uploads.lock().await.complete(entry.id)?;
                info!(file = %entry.file_url.display(), "upload accepted");
                Ok(Some((true, None)))
            }
            Err(EngineError::Precondition(reason)) => {
                // Malformed entry; keeping it would wedge the queue.
                warn!(file = %entry.file_url.display(), reason, "dropping unusable upload entry");
                self.uploads.lock().await.complete(entry.id)?;
                Ok(Some((true, None)))
            }
            Err(err) if is_offline(&err) => {
                self.uploads.lock().await.fail_and_requeue(entry.id)?;
                Err(err)
            }
            Err(err) => {
                warn!(file = %entry.file_url.display(), error = %err, "upload failed, requeued");
                let retry_after = match &err {
                    EngineError::Api(api) => api.retry_after_secs(),
                    _ => None,
                };
                self.uploads.lock().await.fail_and_requeue(entry.id)?;
                Ok(Some((false, retry_after)))
            }
        }
    }

    /// Push pending uploads until the queue is empty or the consecutive
    /// failure budget is spent. A server-supplied Retry-After takes
    /// precedence over the default backoff.
    pub async fn drain_upload_queue(&self) -> Result<UploadDrain, EngineError> {
        let mut drain = UploadDrain::default();
        let mut failures = 0u32;
        loop {
            match self.dispatch_next_upload().await? {
                None => break,
                Some((true, _)) => {
                    drain.completed += 1;
                    failures = 0;
                }
                Some((false, retry_after)) => {
                    drain.failed += 1;
                    failures += 1;
                    if failures >= self.max_upload_attempts {
                        drain.gave_up = true;
                        break;
                    }
                    let delay = retry_after
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| self.backoff.delay(failures));
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Ok(drain)
    }

    async fn process_upload(&self, entry: &FileMetadata) -> Result<(), EngineError> {
        match entry.source_location {
            SourceLocation::LocalFiles => {
                // A local save has no remote leg; confirm the file landed.
                if !tokio::fs::try_exists(&entry.file_url).await? {
                    return Err(EngineError::Precondition("local save file is missing"));
                }
                Ok(())
            }
            SourceLocation::Repository => {
                let node_ref = entry
                    .repository_node
                    .as_ref()
                    .ok_or(EngineError::Precondition(
                        "repository upload without a target node",
                    ))?;
                let link = self.client.get_upload_link(&node_ref.node_id).await?;
                self.transfer
                    .upload_from_path(
                        link.href.as_str(),
                        &entry.file_url,
                        &CancellationToken::new(),
                    )
                    .await?;

                // Refresh the tracked record, if this node is under sync.
                if let Some(record) =
                    self.lookup(&entry.account_identifier, &node_ref.node_id).await?
                {
                    let remote = self.client.get_node(&node_ref.node_id).await?;
                    let content_hash = hash_file(&entry.file_url).await?;
                    self.finish_document(record.id, &remote, &content_hash)
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Cancel the in-flight transfer for one node, if any.
    pub async fn cancel_node_transfer(&self, node: i64) -> bool {
        match self.transfers.lock().await.get(&node) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running pass and in-flight transfer.
    pub async fn cancel_all(&self) {
        for token in self.passes.lock().await.active.values() {
            token.cancel();
        }
        for token in self.transfers.lock().await.values() {
            token.cancel();
        }
    }
}

async fn run_document(
    client: HubClient,
    transfer: TransferClient,
    limit: Arc<Semaphore>,
    content_root: PathBuf,
    account_id: String,
    record: NodeRecord,
    cancel: CancellationToken,
) -> DocOutcome {
    let Ok(_permit) = limit.acquire_owned().await else {
        return DocOutcome::Cancelled;
    };
    if cancel.is_cancelled() {
        return DocOutcome::Cancelled;
    }

    let remote = match client.get_node(&record.node_id).await {
        Ok(remote) => remote,
        Err(err) => {
            if err.is_connectivity() {
                return DocOutcome::Offline(err.to_string());
            }
            if is_not_found(&err) {
                return if record.dirty {
                    // Deleted remotely over local edits: the user decides.
                    DocOutcome::Conflicted
                } else {
                    DocOutcome::RemoteMissing
                };
            }
            return hub_failure(&err);
        }
    };

    match conflict::classify(
        record.version_tag.as_deref(),
        &remote.version_tag,
        record.dirty,
    ) {
        SyncAction::UpToDate => DocOutcome::UpToDate,
        SyncAction::Conflict => DocOutcome::Conflicted,
        SyncAction::Download => {
            match download_document(
                &client,
                &transfer,
                &content_root,
                &account_id,
                &remote,
                &record,
                &cancel,
            )
            .await
            {
                Ok(content_hash) => DocOutcome::Downloaded {
                    snapshot: remote,
                    content_hash,
                },
                Err(err) => outcome_from_error(err),
            }
        }
        SyncAction::Upload => {
            match upload_document(
                &client,
                &transfer,
                &content_root,
                &account_id,
                &record,
                &cancel,
            )
            .await
            {
                Ok((snapshot, content_hash)) => DocOutcome::Uploaded {
                    snapshot,
                    content_hash,
                },
                Err(err) => outcome_from_error(err),
            }
        }
    }
}

async fn download_document(
    client: &HubClient,
    transfer: &TransferClient,
    content_root: &Path,
    account_id: &str,
    remote: &NodeEntry,
    record: &NodeRecord,
    cancel: &CancellationToken,
) -> Result<String, EngineError> {
    let link = client.get_download_link(&record.node_id).await?;
    let target = content_path_for(content_root, account_id, &record.node_id, &remote.name)?;
    transfer
        .download_to_path(link.href.as_str(), &target, cancel)
        .await?;
    Ok(hash_file(&target).await?)
}

async fn upload_document(
    client: &HubClient,
    transfer: &TransferClient,
    content_root: &Path,
    account_id: &str,
    record: &NodeRecord,
    cancel: &CancellationToken,
) -> Result<(NodeEntry, String), EngineError> {
    let source = content_path_for(content_root, account_id, &record.node_id, &record.name)?;
    let link = client.get_upload_link(&record.node_id).await?;
    transfer
        .upload_from_path(link.href.as_str(), &source, cancel)
        .await?;
    // Re-fetch to capture the post-upload version tag as the new base.
    let remote = client.get_node(&record.node_id).await?;
    let content_hash = hash_file(&source).await?;
    Ok((remote, content_hash))
}

fn parse_modified(value: Option<&str>) -> Result<Option<i64>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some(parsed.unix_timestamp()))
}

async fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn node_input_from_entry(
    entry: &NodeEntry,
    parent: Option<i64>,
) -> Result<NodeInput, serde_json::Error> {
    Ok(NodeInput {
        node_id: entry.id.clone(),
        parent,
        name: entry.name.clone(),
        is_folder: entry.node_type == NodeType::Folder,
        top_level: false,
        snapshot: Some(serde_json::to_string(entry)?),
        version_tag: None,
    })
}

fn is_not_found(err: &HubError) -> bool {
    matches!(err, HubError::Api { status, .. } if *status == reqwest::StatusCode::NOT_FOUND)
}

fn is_offline(err: &EngineError) -> bool {
    match err {
        EngineError::Api(err) => err.is_connectivity(),
        EngineError::Transfer(err) => err.is_connectivity(),
        _ => false,
    }
}

fn hub_error_parts(err: &HubError) -> (&'static str, bool) {
    match err.classification() {
        Some(ApiErrorClass::Auth) => ("permission_denied", true),
        Some(ApiErrorClass::Quota) => ("quota_exceeded", false),
        Some(ApiErrorClass::RateLimit) => ("rate_limited", false),
        Some(ApiErrorClass::Permanent) => ("request_rejected", true),
        Some(ApiErrorClass::Transient) | None => ("transfer_failed", false),
    }
}

fn hub_failure(err: &HubError) -> DocOutcome {
    let (code, permanent) = hub_error_parts(err);
    DocOutcome::Failed {
        code,
        description: err.to_string(),
        permanent,
    }
}

fn outcome_from_error(err: EngineError) -> DocOutcome {
    if is_offline(&err) {
        return DocOutcome::Offline(err.to_string());
    }
    match err {
        EngineError::Transfer(TransferError::Cancelled) => DocOutcome::Cancelled,
        EngineError::Api(api) => hub_failure(&api),
        EngineError::Path(path) => DocOutcome::Failed {
            code: "local_path",
            description: path.to_string(),
            permanent: true,
        },
        other => DocOutcome::Failed {
            code: "transfer_failed",
            description: other.to_string(),
            permanent: false,
        },
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
