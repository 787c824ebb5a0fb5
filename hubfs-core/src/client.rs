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
    #[error("hub returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

/// Client for the hub's directory/file endpoints.
///
/// Remote paths are opaque strings chosen by the hub; they may use `/` or `\`
/// separators and the empty string denotes the browse root.
#[derive(Clone)]
pub struct HubClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl HubClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, HubError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            api_key: api_key.into(),
        })
    }

    /// Lists the immediate children of a directory.
    pub async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, HubError> {
        let mut url = self.endpoint("/v1/fs/list")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .get(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await?;
        let payload: ListingResponse = Self::handle_response(response).await?;
        Ok(payload.entries)
    }

    /// Recursive name search below `path`.
    pub async fn search(&self, path: &str, query: &str) -> Result<Vec<RemoteEntry>, HubError> {
        let mut url = self.endpoint("/v1/fs/search")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("query", query);
        let response = self
            .http
            .get(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await?;
        let payload: ListingResponse = Self::handle_response(response).await?;
        Ok(payload.entries)
    }

    /// Reads up to `length` bytes starting at `offset`. The hub returns a
    /// short (possibly empty) body when the file ends before the requested
    /// range does.
    pub async fn read_chunk(
        &self,
        path: &str,
        offset: u64,
        length: u32,
    ) -> Result<Vec<u8>, HubError> {
        let mut url = self.endpoint("/v1/fs/chunk")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("offset", &offset.to_string())
            .append_pair("length", &length.to_string());
        let response = self
            .http
            .get(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.bytes().await?.to_vec())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(HubError::Api { status, body })
        }
    }

    /// Replaces the remote file's content wholesale, creating it if needed.
    pub async fn write(&self, path: &str, content: &str) -> Result<(), HubError> {
        let mut url = self.endpoint("/v1/fs/write")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .put(url)
            .header("x-api-key", &self.api_key)
            .body(content.to_string())
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(HubError::Api { status, body })
        }
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
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(HubError::Api { status, body })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteEntry {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Deserialize, Serialize)]
struct ListingResponse {
    entries: Vec<RemoteEntry>,
}
