use thiserror::Error;

use super::store::{NodeRecord, NodeStore, StoreError};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("node {0} does not exist")]
    NotFound(i64),
    #[error("reparenting {node} under {new_parent} would create a cycle")]
    CycleDetected { node: i64, new_parent: i64 },
}

/// Traversal queries over the account → repository → node hierarchy.
/// Holds no state of its own; everything reads through the record store so
/// concurrent writers are always observed.
pub struct SyncTree<'a> {
    store: &'a NodeStore,
}

impl<'a> SyncTree<'a> {
    pub fn new(store: &'a NodeStore) -> Self {
        Self { store }
    }

    pub async fn top_level_nodes(&self, account_id: &str) -> Result<Vec<NodeRecord>, TreeError> {
        Ok(self.store.top_level_nodes(account_id).await?)
    }

    /// Lazy depth-first walk rooted at `node`, the root included. The walk is
    /// restartable: drop it and build a new one at any point.
    pub fn subtree(&self, node: i64) -> Subtree<'a> {
        Subtree {
            store: self.store,
            stack: vec![node],
        }
    }

    /// Move `node` under `new_parent`. Rejected when the target is the node
    /// itself or one of its descendants; nothing is written on rejection.
    pub async fn reparent(&self, node: i64, new_parent: i64) -> Result<(), TreeError> {
        self.store
            .get_node(node)
            .await?
            .ok_or(TreeError::NotFound(node))?;
        if self.store.get_node(new_parent).await?.is_none() {
            return Err(TreeError::NotFound(new_parent));
        }

        if node == new_parent || self.is_descendant(new_parent, node).await? {
            return Err(TreeError::CycleDetected { node, new_parent });
        }

        self.store.set_parent(node, Some(new_parent), false).await?;
        Ok(())
    }

    /// True when `candidate` sits somewhere below `ancestor`.
    pub async fn is_descendant(&self, candidate: i64, ancestor: i64) -> Result<bool, TreeError> {
        let mut current = candidate;
        loop {
            let record = self
                .store
                .get_node(current)
                .await?
                .ok_or(TreeError::NotFound(current))?;
            match record.parent {
                Some(parent) if parent == ancestor => return Ok(true),
                Some(parent) => current = parent,
                None => return Ok(false),
            }
        }
    }

    /// Walk the parent chain to its root and report whether it ends at a
    /// top-level sync node. Every well-formed record must.
    pub async fn terminates_at_top_level(&self, node: i64) -> Result<bool, TreeError> {
        let mut current = node;
        loop {
            let record = self
                .store
                .get_node(current)
                .await?
                .ok_or(TreeError::NotFound(current))?;
            match record.parent {
                Some(parent) => current = parent,
                None => return Ok(record.top_level || record.removed_with_edits),
            }
        }
    }
}

/// Depth-first iterator over a stored subtree. Children are visited in
/// insertion order; the stack holds record ids only, so the walk stays cheap
/// on deep trees.
pub struct Subtree<'a> {
    store: &'a NodeStore,
    stack: Vec<i64>,
}

impl Subtree<'_> {
    pub async fn next(&mut self) -> Result<Option<NodeRecord>, TreeError> {
        let Some(id) = self.stack.pop() else {
            return Ok(None);
        };
        let record = self
            .store
            .get_node(id)
            .await?
            .ok_or(TreeError::NotFound(id))?;
        let children = self.store.children(id).await?;
        for child in children.iter().rev() {
            self.stack.push(child.id);
        }
        Ok(Some(record))
    }
}
