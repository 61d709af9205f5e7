//! Chase search index backed by Typesense.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::config::SearchConfig;
use crate::model::Chase;
use crate::{Error, Result};

pub const COLLECTION: &str = "chases";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PER_PAGE: i64 = 20;
const MAX_PER_PAGE: i64 = 50;

/// Keeps the search index in step with the chase store.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or replace the document for `chase`.
    async fn upsert_document(&self, chase: &Chase) -> Result<()>;

    /// Remove a document. Removing a missing document succeeds.
    async fn delete_document(&self, id: Uuid) -> Result<()>;
}

/// The indexed projection of a chase. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaseDocument {
    pub id: String,
    pub title: String,
    pub description: String,
    pub chase_type: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub live: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    pub created_at: i64,
}

impl From<&Chase> for ChaseDocument {
    fn from(chase: &Chase) -> Self {
        ChaseDocument {
            id: chase.id.to_string(),
            title: chase.title.clone(),
            description: chase.description.clone(),
            chase_type: chase.chase_type.as_str().to_string(),
            city: chase.city.clone(),
            state: chase.state.clone(),
            country: chase.country.clone(),
            live: chase.live,
            started_at: chase.started_at.map(|t| t.timestamp()),
            ended_at: chase.ended_at.map(|t| t.timestamp()),
            created_at: chase.created_at.timestamp(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    pub document: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub found: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub hits: Vec<SearchHit>,
}

/// Clamp paging arguments: `page` starts at 1, `per_page` outside `1..=50` becomes 20.
pub fn normalize_paging(page: i64, per_page: i64) -> (i64, i64) {
    let per_page = if (1..=MAX_PER_PAGE).contains(&per_page) {
        per_page
    } else {
        DEFAULT_PER_PAGE
    };
    (page.max(1), per_page)
}

pub struct TypesenseClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl TypesenseClient {
    /// Fails with [`Error::MissingCredential`] when no API key is configured.
    pub fn new(config: &SearchConfig) -> Result<Self> {
        Self::with_base_url(&config.url(), &config.api_key)
    }

    pub fn with_base_url(base_url: &str, api_key: &str) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::MissingCredential("TYPESENSE_API_KEY"));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(TypesenseClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }

    /// Create the `chases` collection unless it already exists.
    pub async fn ensure_collection(&self) -> Result<()> {
        let schema = json!({
            "name": COLLECTION,
            "fields": [
                {"name": "id", "type": "string"},
                {"name": "title", "type": "string"},
                {"name": "description", "type": "string", "optional": true},
                {"name": "chase_type", "type": "string", "facet": true},
                {"name": "city", "type": "string", "optional": true, "facet": true},
                {"name": "state", "type": "string", "optional": true, "facet": true},
                {"name": "country", "type": "string", "optional": true, "facet": true},
                {"name": "live", "type": "bool", "facet": true},
                {"name": "started_at", "type": "int64", "optional": true},
                {"name": "ended_at", "type": "int64", "optional": true},
                {"name": "created_at", "type": "int64"},
            ],
            "default_sorting_field": "created_at",
        });
        match self.send(Method::POST, "/collections", Some(schema)).await {
            Ok(_) => Ok(()),
            Err(Error::Status { status: 409, .. }) => {
                debug!(collection = COLLECTION, "collection already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Full-text search over title and description.
    pub async fn search(&self, query: &str, page: i64, per_page: i64) -> Result<SearchResult> {
        let (page, per_page) = normalize_paging(page, per_page);
        let body = json!({
            "q": query,
            "query_by": "title,description",
            "page": page,
            "per_page": per_page,
        });
        let path = format!("/collections/{COLLECTION}/documents/search");
        let response = self.send(Method::POST, &path, Some(body)).await?;
        Ok(response.json().await?)
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .header("X-TYPESENSE-API-KEY", &self.api_key);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        if status >= 300 {
            return Err(Error::Status { status, url });
        }
        Ok(response)
    }
}

#[async_trait]
impl SearchIndex for TypesenseClient {
    async fn upsert_document(&self, chase: &Chase) -> Result<()> {
        let doc = serde_json::to_value(ChaseDocument::from(chase))?;
        let path = format!("/collections/{COLLECTION}/documents?action=upsert");
        self.send(Method::POST, &path, Some(doc)).await?;
        Ok(())
    }

    async fn delete_document(&self, id: Uuid) -> Result<()> {
        let path = format!("/collections/{COLLECTION}/documents/{id}");
        match self.send(Method::DELETE, &path, None).await {
            Ok(_) => Ok(()),
            Err(Error::Status { status: 404, .. }) => {
                debug!(%id, "document already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::model::ChaseType;

    #[test]
    fn test_document_uses_unix_seconds() {
        let mut chase = Chase::new("Pursuit", ChaseType::Chase);
        chase.created_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        chase.started_at = Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap());
        chase.live = true;

        let doc = serde_json::to_value(ChaseDocument::from(&chase)).unwrap();
        assert_eq!(doc["id"], chase.id.to_string());
        assert_eq!(doc["chase_type"], "chase");
        assert_eq!(doc["created_at"], 1_704_164_645);
        assert_eq!(doc["started_at"], 1_704_164_400);
        assert!(doc.get("ended_at").is_none());
        assert_eq!(doc["live"], true);
    }

    #[test]
    fn test_paging_normalization() {
        assert_eq!(normalize_paging(0, 0), (1, 20));
        assert_eq!(normalize_paging(-3, 51), (1, 20));
        assert_eq!(normalize_paging(2, 50), (2, 50));
        assert_eq!(normalize_paging(5, 1), (5, 1));
    }

    #[test]
    fn test_missing_api_key_is_rejected() {
        assert!(matches!(
            TypesenseClient::new(&SearchConfig::default()),
            Err(Error::MissingCredential(_))
        ));
        assert!(TypesenseClient::new(&SearchConfig::default().with_api_key("k")).is_ok());
    }
}
