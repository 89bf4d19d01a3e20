use std::{
    fs,
    path::{Path, PathBuf},
};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions, sqlite::SqliteRow};
use thiserror::Error;
use uuid::Uuid;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid sync state: {0}")]
    InvalidState(String),
    #[error("node not found after upsert")]
    MissingNode,
    #[error("node {0} does not exist")]
    NotFound(i64),
    #[error("precondition failed: {0}")]
    PreconditionFailed(&'static str),
}

/// Per-node sync state machine value, stored as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Syncing,
    Synced,
    Conflict,
    Errored,
    PendingRemoval,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unsynced => "unsynced",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Conflict => "conflict",
            SyncState::Errored => "errored",
            SyncState::PendingRemoval => "pending_removal",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "unsynced" => Ok(SyncState::Unsynced),
            "syncing" => Ok(SyncState::Syncing),
            "synced" => Ok(SyncState::Synced),
            "conflict" => Ok(SyncState::Conflict),
            "errored" => Ok(SyncState::Errored),
            "pending_removal" => Ok(SyncState::PendingRemoval),
            other => Err(StoreError::InvalidState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: String,
    pub server_url: String,
    pub protocol: String,
    pub username: String,
    pub repository_id: String,
}

#[derive(Debug, Clone)]
pub struct NodeInput {
    pub node_id: String,
    pub parent: Option<i64>,
    pub name: String,
    pub is_folder: bool,
    pub top_level: bool,
    pub snapshot: Option<String>,
    pub version_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: i64,
    pub repository: i64,
    pub node_id: String,
    pub parent: Option<i64>,
    pub name: String,
    pub is_folder: bool,
    pub top_level: bool,
    pub removed_with_edits: bool,
    pub dirty: bool,
    pub local_hash: Option<String>,
    pub version_tag: Option<String>,
    pub remote_modified: Option<i64>,
    pub last_downloaded: Option<i64>,
    pub snapshot: Option<String>,
    pub state: SyncState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncErrorRecord {
    pub node: i64,
    pub error_id: String,
    pub code: String,
    pub description: String,
    pub permanent: bool,
    pub created: i64,
}

const NODE_COLUMNS: &str = "id, repository, node_id, parent, name, is_folder, top_level, removed_with_edits, dirty, local_hash, version_tag, remote_modified, last_downloaded, snapshot, state";

pub struct NodeStore {
    pool: SqlitePool,
}

impl NodeStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_at(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, StoreError> {
        Self::open_at(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn put_account(&self, account: &AccountRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO accounts (id, server_url, protocol, username, repository_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                server_url = excluded.server_url,
                protocol = excluded.protocol,
                username = excluded.username,
                repository_id = excluded.repository_id",
        )
        .bind(&account.id)
        .bind(&account.server_url)
        .bind(&account.protocol)
        .bind(&account.username)
        .bind(&account.repository_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_account(&self, id: &str) -> Result<Option<AccountRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, server_url, protocol, username, repository_id FROM accounts WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(AccountRecord {
            id: row.try_get("id")?,
            server_url: row.try_get("server_url")?,
            protocol: row.try_get("protocol")?,
            username: row.try_get("username")?,
            repository_id: row.try_get("repository_id")?,
        }))
    }

    /// Removing an account cascades to its repositories, node records and
    /// error ledger rows.
    pub async fn delete_account(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn ensure_repository(
        &self,
        account_id: &str,
        repository_id: &str,
    ) -> Result<i64, StoreError> {
        sqlx::query(
            "INSERT INTO repositories (account_id, repository_id) VALUES (?1, ?2)
             ON CONFLICT(account_id, repository_id) DO NOTHING",
        )
        .bind(account_id)
        .bind(repository_id)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id FROM repositories WHERE account_id = ?1 AND repository_id = ?2",
        )
        .bind(account_id)
        .bind(repository_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn repository_account(&self, repository: i64) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT account_id FROM repositories WHERE id = ?1")
            .bind(repository)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| row.try_get::<String, _>("account_id"))
            .transpose()?)
    }

    /// Insert or update by `(repository, node id)`. Updates refresh the
    /// remote-facing columns but preserve local download history: the
    /// `last_downloaded`, `dirty`, `local_hash` and `state` columns change
    /// only through their dedicated calls.
    pub async fn upsert_node(
        &self,
        repository: i64,
        input: &NodeInput,
    ) -> Result<NodeRecord, StoreError> {
        sqlx::query(
            "INSERT INTO nodes (repository, node_id, parent, name, is_folder, top_level, snapshot, version_tag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(repository, node_id) DO UPDATE SET
                parent = excluded.parent,
                name = excluded.name,
                is_folder = excluded.is_folder,
                top_level = excluded.top_level,
                snapshot = COALESCE(excluded.snapshot, nodes.snapshot),
                version_tag = COALESCE(excluded.version_tag, nodes.version_tag)",
        )
        .bind(repository)
        .bind(&input.node_id)
        .bind(input.parent)
        .bind(&input.name)
        .bind(if input.is_folder { 1 } else { 0 })
        .bind(if input.top_level { 1 } else { 0 })
        .bind(&input.snapshot)
        .bind(&input.version_tag)
        .execute(&self.pool)
        .await?;

        self.node_by_remote_id(repository, &input.node_id)
            .await?
            .ok_or(StoreError::MissingNode)
    }

    pub async fn get_node(&self, id: i64) -> Result<Option<NodeRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| node_from_row(&row)).transpose()
    }

    pub async fn node_by_remote_id(
        &self,
        repository: i64,
        node_id: &str,
    ) -> Result<Option<NodeRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE repository = ?1 AND node_id = ?2"
        ))
        .bind(repository)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| node_from_row(&row)).transpose()
    }

    pub async fn children(&self, id: i64) -> Result<Vec<NodeRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE parent = ?1 ORDER BY id ASC"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    pub async fn child_count(&self, id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM nodes WHERE parent = ?1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Top-level sync nodes for an account, in insertion order.
    pub async fn top_level_nodes(&self, account_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM nodes n
             JOIN repositories r ON r.id = n.repository
             WHERE r.account_id = ?1 AND n.top_level = 1
             ORDER BY n.id ASC",
            node_columns_qualified()
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    pub async fn nodes_pending_removal(
        &self,
        account_id: &str,
    ) -> Result<Vec<NodeRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM nodes n
             JOIN repositories r ON r.id = n.repository
             WHERE r.account_id = ?1 AND n.removed_with_edits = 1
             ORDER BY n.id DESC",
            node_columns_qualified()
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    pub async fn set_state(&self, id: i64, state: SyncState) -> Result<(), StoreError> {
        sqlx::query("UPDATE nodes SET state = ?1 WHERE id = ?2")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flip the dirty flag; `local_hash`, when given, replaces the stored
    /// last-synced content fingerprint.
    pub async fn set_dirty(
        &self,
        id: i64,
        dirty: bool,
        local_hash: Option<&str>,
    ) -> Result<(), StoreError> {
        match local_hash {
            Some(hash) => {
                sqlx::query("UPDATE nodes SET dirty = ?1, local_hash = ?2 WHERE id = ?3")
                    .bind(if dirty { 1 } else { 0 })
                    .bind(hash)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("UPDATE nodes SET dirty = ?1 WHERE id = ?2")
                    .bind(if dirty { 1 } else { 0 })
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn mark_downloaded(
        &self,
        id: i64,
        timestamp: i64,
        snapshot: &str,
        version_tag: &str,
        remote_modified: Option<i64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE nodes SET last_downloaded = ?1, snapshot = ?2, version_tag = ?3, remote_modified = ?4 WHERE id = ?5",
        )
        .bind(timestamp)
        .bind(snapshot)
        .bind(version_tag)
        .bind(remote_modified)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_removed_with_edits(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE nodes SET removed_with_edits = 1, top_level = 0, state = ?1 WHERE id = ?2",
        )
        .bind(SyncState::PendingRemoval.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_removed_with_edits(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE nodes SET removed_with_edits = 0 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_parent(
        &self,
        id: i64,
        parent: Option<i64>,
        top_level: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE nodes SET parent = ?1, top_level = ?2 WHERE id = ?3")
            .bind(parent)
            .bind(if top_level { 1 } else { 0 })
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Hard delete. Refused while children still reference the node or while
    /// the node is tombstoned (removed from scope with unsynced edits).
    pub async fn delete_node(&self, id: i64) -> Result<(), StoreError> {
        let record = self.get_node(id).await?.ok_or(StoreError::NotFound(id))?;
        if record.removed_with_edits {
            return Err(StoreError::PreconditionFailed(
                "node has unsynced local edits",
            ));
        }
        if self.child_count(id).await? > 0 {
            return Err(StoreError::PreconditionFailed(
                "node still has child records",
            ));
        }
        sqlx::query("DELETE FROM nodes WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// One live error per node: recording over an existing row replaces it.
    pub async fn record_error(
        &self,
        node: i64,
        code: &str,
        description: &str,
        permanent: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_errors (node, error_id, code, description, permanent, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(node) DO UPDATE SET
                error_id = excluded.error_id,
                code = excluded.code,
                description = excluded.description,
                permanent = excluded.permanent,
                created = excluded.created",
        )
        .bind(node)
        .bind(Uuid::new_v4().to_string())
        .bind(code)
        .bind(description)
        .bind(if permanent { 1 } else { 0 })
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_error(&self, node: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_errors WHERE node = ?1")
            .bind(node)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_error(&self, node: i64) -> Result<Option<SyncErrorRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT node, error_id, code, description, permanent, created
             FROM sync_errors WHERE node = ?1",
        )
        .bind(node)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| error_from_row(&row)).transpose()
    }

    pub async fn list_errors(&self, account_id: &str) -> Result<Vec<SyncErrorRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT e.node, e.error_id, e.code, e.description, e.permanent, e.created
             FROM sync_errors e
             JOIN nodes n ON n.id = e.node
             JOIN repositories r ON r.id = n.repository
             WHERE r.account_id = ?1
             ORDER BY e.node ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(error_from_row).collect()
    }
}

fn node_columns_qualified() -> String {
    NODE_COLUMNS
        .split(", ")
        .map(|col| format!("n.{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn node_from_row(row: &SqliteRow) -> Result<NodeRecord, StoreError> {
    let is_folder: i64 = row.try_get("is_folder")?;
    let top_level: i64 = row.try_get("top_level")?;
    let removed_with_edits: i64 = row.try_get("removed_with_edits")?;
    let dirty: i64 = row.try_get("dirty")?;
    let state: String = row.try_get("state")?;
    Ok(NodeRecord {
        id: row.try_get("id")?,
        repository: row.try_get("repository")?,
        node_id: row.try_get("node_id")?,
        parent: row.try_get("parent")?,
        name: row.try_get("name")?,
        is_folder: is_folder != 0,
        top_level: top_level != 0,
        removed_with_edits: removed_with_edits != 0,
        dirty: dirty != 0,
        local_hash: row.try_get("local_hash")?,
        version_tag: row.try_get("version_tag")?,
        remote_modified: row.try_get("remote_modified")?,
        last_downloaded: row.try_get("last_downloaded")?,
        snapshot: row.try_get("snapshot")?,
        state: SyncState::parse(&state)?,
    })
}

fn error_from_row(row: &SqliteRow) -> Result<SyncErrorRecord, StoreError> {
    let permanent: i64 = row.try_get("permanent")?;
    Ok(SyncErrorRecord {
        node: row.try_get("node")?,
        error_id: row.try_get("error_id")?,
        code: row.try_get("code")?,
        description: row.try_get("description")?,
        permanent: permanent != 0,
        created: row.try_get("created")?,
    })
}

pub(crate) fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("hubsync");
    path.push("sync");
    path.push("nodes.db");
    Ok(path)
}
