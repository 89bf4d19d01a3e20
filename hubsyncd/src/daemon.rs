use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use hubsync_core::HubClient;

use crate::sync::engine::{PassOutcome, SyncCoordinator};
use crate::sync::local_watcher::start_notify_watcher;
use crate::sync::queue::UploadQueue;
use crate::sync::store::{AccountRecord, NodeStore};
use crate::sync::transfer::{TransferClient, TransferConfig};

const DEFAULT_PASS_INTERVAL_SECS: u64 = 30;
const DEFAULT_UPLOAD_DRAIN_SECS: u64 = 10;
const DEFAULT_TRANSFER_WORKERS: u64 = 3;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub data_root: PathBuf,
    pub content_root: PathBuf,
    pub server_url: String,
    pub token: String,
    pub account_id: String,
    pub username: String,
    pub repository_id: String,
    pub pass_interval: Duration,
    pub upload_drain_interval: Duration,
    pub transfer_workers: usize,
    pub enable_local_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let data_root = std::env::var("HUBSYNC_DATA_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::data_dir().map(|dir| dir.join("hubsync")))
            .context("no data directory is available")?;
        let content_root = std::env::var("HUBSYNC_CONTENT_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join("content"));
        let server_url =
            std::env::var("HUBSYNC_SERVER_URL").context("HUBSYNC_SERVER_URL is required")?;
        let token = std::env::var("HUBSYNC_TOKEN").context("HUBSYNC_TOKEN is required")?;
        let account_id =
            std::env::var("HUBSYNC_ACCOUNT_ID").unwrap_or_else(|_| "default".to_string());
        let username = std::env::var("HUBSYNC_USERNAME").unwrap_or_default();
        let repository_id =
            std::env::var("HUBSYNC_REPOSITORY_ID").unwrap_or_else(|_| "default".to_string());
        let pass_interval = Duration::from_secs(read_u64_env(
            "HUBSYNC_PASS_INTERVAL_SECS",
            DEFAULT_PASS_INTERVAL_SECS,
        ));
        let upload_drain_interval = Duration::from_secs(read_u64_env(
            "HUBSYNC_UPLOAD_DRAIN_SECS",
            DEFAULT_UPLOAD_DRAIN_SECS,
        ));
        let transfer_workers =
            read_u64_env("HUBSYNC_TRANSFER_WORKERS", DEFAULT_TRANSFER_WORKERS) as usize;
        let enable_local_watcher = read_bool_env("HUBSYNC_ENABLE_LOCAL_WATCHER", true);

        Ok(Self {
            data_root,
            content_root,
            server_url,
            token,
            account_id,
            username,
            repository_id,
            pass_interval,
            upload_drain_interval,
            transfer_workers,
            enable_local_watcher,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    coordinator: Arc<SyncCoordinator>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_root)
            .await
            .with_context(|| format!("failed to create data root at {:?}", config.data_root))?;
        tokio::fs::create_dir_all(&config.content_root)
            .await
            .with_context(|| {
                format!("failed to create content root at {:?}", config.content_root)
            })?;

        let client = HubClient::new(&config.server_url, &config.token)
            .context("invalid hub server URL")?;
        let store = NodeStore::open_at(&config.data_root.join("sync/nodes.db"))
            .await
            .context("failed to initialize node store")?;
        let protocol = url::Url::parse(&config.server_url)
            .map(|url| url.scheme().to_string())
            .unwrap_or_else(|_| "https".to_string());
        store
            .put_account(&AccountRecord {
                id: config.account_id.clone(),
                server_url: config.server_url.clone(),
                protocol,
                username: config.username.clone(),
                repository_id: config.repository_id.clone(),
            })
            .await
            .context("failed to register account")?;

        let uploads = UploadQueue::open(&config.data_root.join("queue"))
            .context("failed to open upload queue")?;
        let coordinator = Arc::new(
            SyncCoordinator::new(client, store, uploads, config.content_root.clone())
                .with_transfer(TransferClient::with_config(TransferConfig::default()))
                .with_worker_limit(config.transfer_workers),
        );

        Ok(Self {
            config,
            coordinator,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            account = %self.config.account_id,
            server = %self.config.server_url,
            content_root = %self.config.content_root.display(),
            watcher = self.config.enable_local_watcher,
            "hubsyncd started"
        );

        let (watcher, mut local_rx) = if self.config.enable_local_watcher {
            match start_notify_watcher(&self.config.content_root) {
                Ok((watcher, rx)) => (Some(watcher), Some(rx)),
                Err(err) => {
                    warn!(error = %err, "failed to start local watcher");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let coordinator_for_pass = Arc::clone(&self.coordinator);
        let account_id = self.config.account_id.clone();
        let pass_interval = self.config.pass_interval;
        let pass_handle = tokio::spawn(async move {
            loop {
                match coordinator_for_pass.request_pass(&account_id).await {
                    Ok(PassOutcome::Completed(summary)) => {
                        if summary.synced > 0
                            || summary.conflicts > 0
                            || summary.failed > 0
                            || summary.aborted_offline
                        {
                            info!(
                                synced = summary.synced,
                                conflicts = summary.conflicts,
                                failed = summary.failed,
                                aborted = summary.aborted_offline,
                                "pass summary"
                            );
                        }
                        for error in &summary.errors {
                            warn!(
                                node = %error.node_id,
                                code = %error.code,
                                "outstanding sync error: {}",
                                error.description
                            );
                        }
                    }
                    Ok(PassOutcome::Coalesced) => debug!("pass request coalesced"),
                    Err(err) => error!(error = %err, "sync pass failed"),
                }
                tokio::time::sleep(pass_interval).await;
            }
        });

        let coordinator_for_uploads = Arc::clone(&self.coordinator);
        let drain_interval = self.config.upload_drain_interval;
        let upload_handle = tokio::spawn(async move {
            loop {
                match coordinator_for_uploads.drain_upload_queue().await {
                    Ok(drain) => {
                        if drain.completed > 0 || drain.failed > 0 {
                            info!(
                                completed = drain.completed,
                                failed = drain.failed,
                                gave_up = drain.gave_up,
                                "upload queue drained"
                            );
                        }
                    }
                    Err(err) => warn!(error = %err, "upload drain interrupted"),
                }
                tokio::time::sleep(drain_interval).await;
            }
        });

        let local_handle = local_rx.take().map(|mut rx| {
            let coordinator_for_local = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(err) = coordinator_for_local.handle_local_event(event).await {
                        warn!(error = %err, "local event handling failed");
                    }
                }
            })
        });

        let _watcher = watcher;
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutdown requested");

        self.coordinator.cancel_all().await;
        pass_handle.abort();
        upload_handle.abort();
        if let Some(handle) = local_handle {
            handle.abort();
        }

        Ok(())
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
