use std::{
    env, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("transfer was cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn is_connectivity(&self) -> bool {
        match self {
            TransferError::Request(err) => err.is_connect(),
            _ => false,
        }
    }
}

/// Streams node content against the signed transfer URLs the hub hands out.
/// Downloads land in a `.partial` sibling and are renamed into place only
/// once complete, so a crash or cancellation never leaves a half-written
/// target behind.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: read_limit("HUBSYNC_DOWNLOAD_CONCURRENCY", 4),
            upload_concurrency: read_limit("HUBSYNC_UPLOAD_CONCURRENCY", 2),
        }
    }
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            http: Client::new(),
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    pub async fn download_to_path(
        &self,
        href: &str,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let url = Url::parse(href)?;
        let response = self.http.get(url).send().await?.error_for_status()?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let result = self
            .write_stream(response, &partial, cancel)
            .await;
        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }

        tokio::fs::rename(partial, target).await?;
        Ok(())
    }

    async fn write_stream(
        &self,
        response: reqwest::Response,
        partial: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            };
            let Some(chunk) = chunk else {
                break;
            };
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn upload_from_path(
        &self,
        href: &str,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let url = Url::parse(href)?;
        let file = tokio::fs::File::open(source).await?;
        let stream = ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);
        let send = self.http.put(url).body(body).send();
        let response = tokio::select! {
            response = send => response?,
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        response.error_for_status()?;
        Ok(())
    }

    pub fn with_http(http: Client) -> Self {
        let config = TransferConfig::default();
        Self {
            http,
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
