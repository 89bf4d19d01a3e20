pub mod backoff;
mod conflict;
pub mod engine;
pub mod local_watcher;
pub mod paths;
pub mod queue;
pub mod store;
pub mod transfer;
pub mod tree;

pub use conflict::{ConflictChoice, SyncAction};
