use std::time::SystemTime;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        retry_after: Option<u64>,
        body: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Quota,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct HubClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl HubClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, HubError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_node(&self, node_id: &str) -> Result<NodeEntry, HubError> {
        let url = self.endpoint(&format!("/api/nodes/{node_id}"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_children(
        &self,
        node_id: &str,
        limit: Option<u32>,
        skip: Option<u32>,
    ) -> Result<NodeList, HubError> {
        let mut url = self.endpoint(&format!("/api/nodes/{node_id}/children"))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(skip) = skip {
                query.append_pair("skip", &skip.to_string());
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_children_all(
        &self,
        node_id: &str,
        page_size: u32,
    ) -> Result<Vec<NodeEntry>, HubError> {
        let page_size = page_size.max(1);
        let mut skip = 0u32;
        let mut entries = Vec::new();
        loop {
            let page = self
                .list_children(node_id, Some(page_size), Some(skip))
                .await?;
            skip = skip.saturating_add(page.entries.len() as u32);
            let total = page.total;
            entries.extend(page.entries);
            if skip >= total {
                break;
            }
        }
        Ok(entries)
    }

    pub async fn get_download_link(&self, node_id: &str) -> Result<TransferLink, HubError> {
        let url = self.endpoint(&format!("/api/nodes/{node_id}/download-link"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_upload_link(&self, node_id: &str) -> Result<TransferLink, HubError> {
        let url = self.endpoint(&format!("/api/nodes/{node_id}/upload-link"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_node(
        &self,
        parent_id: &str,
        name: &str,
        folder: bool,
    ) -> Result<NodeEntry, HubError> {
        let url = self.endpoint(&format!("/api/nodes/{parent_id}/children"))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&CreateNodeBody { name, folder })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_node(&self, node_id: &str) -> Result<(), HubError> {
        let url = self.endpoint(&format!("/api/nodes/{node_id}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT || response.status().is_success() {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, HubError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, HubError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> HubError {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        HubError::Api {
            status,
            retry_after,
            body,
        }
    }
}

impl HubError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            HubError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    /// Connection-level failures, as opposed to a reachable server answering
    /// with an error status. Timeouts are not connectivity loss; a slow
    /// transfer fails on its own without condemning the whole pass.
    pub fn is_connectivity(&self) -> bool {
        match self {
            HubError::Request(err) => err.is_connect(),
            _ => false,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            HubError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if matches!(
        status,
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE
    ) {
        ApiErrorClass::Quota
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(SystemTime::now()).ok().map(|d| d.as_secs())
}

#[derive(Debug, Serialize)]
struct CreateNodeBody<'a> {
    name: &'a str,
    folder: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
    pub version_tag: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Folder,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NodeList {
    pub entries: Vec<NodeEntry>,
    pub limit: u32,
    pub skip: u32,
    pub total: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TransferLink {
    pub href: Url,
    pub method: String,
}
