use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::entity::prelude::StreamSet;
use crate::http::{HttpRequest, HttpResponse, HttpTransport};

use super::errors::FeedError;
use super::types::{FeedActivity, FeedEntry, MonthBucket};
use super::{ActivityFeed, Result};

#[derive(Deserialize)]
struct FeedPageBody {
    #[serde(default)]
    entries: Vec<FeedEntry>,
}

#[derive(Deserialize)]
struct BucketBody {
    #[serde(default)]
    activities: Vec<FeedActivity>,
}

/// JSON-over-HTTP feed client.
///
/// Endpoints, relative to `base_url`:
/// - `GET /ping`
/// - `GET /subjects/{id}/feed[?before={cursor}]` -> `{"entries": [{"cursor", "activity"}]}`
/// - `GET /subjects/{id}/activities?year={y}&month={m}` -> `{"activities": [...]}`
/// - `GET /activities/{id}/streams?keys={a,b}` -> `{"watts": [...], ...}`
/// - `GET /activities/{id}/summary` -> `{...}`
#[derive(Clone)]
pub struct HttpFeed {
    base_url: String,
    token: Option<String>,
    transport: Arc<dyn HttpTransport>,
}

impl HttpFeed {
    pub fn new(base_url: impl Into<String>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            transport,
        }
    }

    /// Build a feed over a reqwest transport with the given request timeout.
    #[cfg(feature = "http")]
    pub fn with_reqwest(
        base_url: impl Into<String>,
        timeout: std::time::Duration,
    ) -> std::result::Result<Self, crate::http::HttpError> {
        let transport = crate::http::reqwest_transport::ReqwestTransport::with_timeout(timeout)?;
        Ok(Self::new(base_url, Arc::new(transport)))
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    async fn get(&self, path: &str) -> Result<HttpResponse> {
        let mut request = HttpRequest::get(format!("{}{}", self.base_url, path))
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| FeedError::network(e.to_string()))?;

        if (200..300).contains(&response.status) {
            return Ok(response);
        }

        let retry_after = response
            .header("Retry-After")
            .and_then(|v| v.trim().parse::<u64>().ok());
        Err(FeedError::from_status(response.status, path, retry_after))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.get(path).await?;
        serde_json::from_slice(&response.body)
            .map_err(|e| FeedError::decode(format!("{path}: {e}")))
    }
}

#[async_trait]
impl ActivityFeed for HttpFeed {
    async fn check_connectivity(&self) -> Result<()> {
        self.get("/ping").await.map(|_| ())
    }

    async fn fetch_self_page(&self, subject_id: i64, before: Option<i64>) -> Result<Vec<FeedEntry>> {
        let path = match before {
            Some(cursor) => format!("/subjects/{subject_id}/feed?before={cursor}"),
            None => format!("/subjects/{subject_id}/feed"),
        };
        let body: FeedPageBody = self.get_json(&path).await?;
        Ok(body.entries)
    }

    async fn fetch_peer_bucket(
        &self,
        subject_id: i64,
        bucket: MonthBucket,
    ) -> Result<Vec<FeedActivity>> {
        let path = format!(
            "/subjects/{subject_id}/activities?year={}&month={}",
            bucket.year, bucket.month
        );
        let body: BucketBody = self.get_json(&path).await?;
        Ok(body.activities)
    }

    async fn fetch_streams(&self, activity_id: i64, names: &[String]) -> Result<StreamSet> {
        let path = format!("/activities/{activity_id}/streams?keys={}", names.join(","));
        let value: serde_json::Value = self.get_json(&path).await?;
        let streams = StreamSet::from_json(&value);
        if streams.is_empty() {
            return Err(FeedError::not_found(format!("streams for activity {activity_id}")));
        }
        Ok(streams)
    }

    async fn fetch_summary(&self, activity_id: i64) -> Result<serde_json::Value> {
        self.get_json(&format!("/activities/{activity_id}/summary"))
            .await
    }
}
