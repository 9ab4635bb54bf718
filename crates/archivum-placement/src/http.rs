//! Directory client for a remote daemon

use crate::directory::{CapacityDirectory, DirectorySnapshot, HeartbeatAck, Reservation};
use crate::service::{ErrorBody, ReleaseResponse};
use archivum_common::{Error, NodeId, Result, StorageMode, StorageNodeDescriptor};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// [`CapacityDirectory`] backed by a peer's HTTP directory routes
pub struct HttpDirectory {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("directory client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/directory/{path}", self.base_url)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body: Option<ErrorBody> = response.json().await.ok();
        Err(error_from(status, body))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("directory response: {e}")))
    }
}

fn unavailable(e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::DirectoryUnavailable("request timed out".into())
    } else {
        Error::DirectoryUnavailable(e.to_string())
    }
}

fn error_from(status: StatusCode, body: Option<ErrorBody>) -> Error {
    let message = body
        .as_ref()
        .map_or_else(|| status.to_string(), |b| b.message.clone());
    match (status, body) {
        (StatusCode::CONFLICT, Some(body)) if body.code == "CapacityExhausted" => {
            Error::CapacityExhausted {
                mode: body.mode.unwrap_or(StorageMode::TemporaryCrud),
                size: body.size.unwrap_or(0),
            }
        }
        (StatusCode::NOT_FOUND, _) => {
            let node = message
                .rsplit(": ")
                .next()
                .map_or_else(|| NodeId::new("unknown"), NodeId::new);
            Error::NodeNotFound(node)
        }
        (StatusCode::BAD_REQUEST, _) => Error::InvalidArgument(message),
        (s, _) if s.is_server_error() => Error::DirectoryUnavailable(message),
        _ => Error::internal(format!("directory returned {status}: {message}")),
    }
}

#[async_trait]
impl CapacityDirectory for HttpDirectory {
    fn name(&self) -> &str {
        "http"
    }

    async fn heartbeat(&self, descriptor: StorageNodeDescriptor) -> Result<HeartbeatAck> {
        let response = self
            .http_client
            .post(self.url("heartbeat"))
            .json(&descriptor)
            .send()
            .await
            .map_err(|e| unavailable(&e))?;
        Self::decode(response).await
    }

    async fn snapshot(&self) -> Result<DirectorySnapshot> {
        let response = self
            .http_client
            .get(self.url("nodes"))
            .send()
            .await
            .map_err(|e| unavailable(&e))?;
        Self::decode(response).await
    }

    async fn reserve(&self, reservation: Reservation) -> Result<()> {
        let response = self
            .http_client
            .post(self.url("reservations"))
            .json(&reservation)
            .send()
            .await
            .map_err(|e| unavailable(&e))?;
        Self::check(response).await.map(|_| ())
    }

    async fn release(&self, reservation_id: &str) -> Result<bool> {
        let response = self
            .http_client
            .delete(self.url(&format!("reservations/{reservation_id}")))
            .send()
            .await
            .map_err(|e| unavailable(&e))?;
        let body: ReleaseResponse = Self::decode(response).await?;
        Ok(body.released)
    }
}
