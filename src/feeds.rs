//! Third-party data feeds: earthquakes, vessels, launches and weather alerts.
//!
//! Every response is validated as JSON and cached for a short while, so bursts
//! of API traffic hit upstream at most once per TTL.

use std::time::Duration;

use reqwest::{Url, header};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::config::FeedConfig;
use crate::{Error, Result};

pub const SHORT_TTL: Duration = Duration::from_secs(2 * 60);
pub const LONG_TTL: Duration = Duration::from_secs(5 * 60);

const NOAA_USER_AGENT: &str = "chaseapp-api/1.0";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Launches {
    pub upcoming: Value,
    pub recent: Value,
}

pub struct FeedClient {
    config: FeedConfig,
    http: reqwest::Client,
    cache: TtlCache<Value>,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(FeedClient {
            config,
            http,
            cache: TtlCache::new(),
        })
    }

    /// USGS earthquakes of the past hour, as GeoJSON.
    pub async fn quakes(&self) -> Result<Value> {
        let url = format!(
            "{}/earthquakes/feed/v1.0/summary/all_hour.geojson",
            trim(&self.config.usgs_base_url)
        );
        self.fetch_json("quakes:all_hour", &url, SHORT_TTL, &[]).await
    }

    /// Latest AIS vessel positions. Needs an AISHub key.
    pub async fn boats(&self) -> Result<Value> {
        if self.config.aishub_api_key.is_empty() {
            return Err(Error::MissingCredential("AISHUB_API_KEY"));
        }
        let mut url = parse(&self.config.aishub_base_url)?;
        url.query_pairs_mut()
            .append_pair("username", &self.config.aishub_api_key)
            .append_pair("format", "1")
            .append_pair("output", "json")
            .append_pair("compress", "0");
        self.fetch_json("boats:latest", url.as_str(), SHORT_TTL, &[])
            .await
    }

    pub async fn launches(&self) -> Result<Launches> {
        let base = trim(&self.config.launch_library_base_url);
        let upcoming = self
            .fetch_json(
                "launches:upcoming",
                &format!("{base}/launch/upcoming/?limit=20&mode=list"),
                LONG_TTL,
                &[],
            )
            .await?;
        let recent = self
            .fetch_json(
                "launches:recent",
                &format!("{base}/launch/previous/?limit=10&mode=list"),
                LONG_TTL,
                &[],
            )
            .await?;
        Ok(Launches { upcoming, recent })
    }

    /// Active NWS alerts, optionally limited to one state or marine area.
    pub async fn weather_alerts(&self, area: &str) -> Result<Value> {
        let mut url = parse(&format!("{}/alerts/active", trim(&self.config.noaa_base_url)))?;
        let area = area.to_uppercase();
        let mut key = String::from("weather:active");
        if !area.is_empty() {
            url.query_pairs_mut().append_pair("area", &area);
            key = format!("{key}:{area}");
        }
        let headers = [
            (header::ACCEPT, "application/geo+json"),
            (header::USER_AGENT, NOAA_USER_AGENT),
        ];
        self.fetch_json(&key, url.as_str(), SHORT_TTL, &headers).await
    }

    async fn fetch_json(
        &self,
        key: &str,
        url: &str,
        ttl: Duration,
        headers: &[(header::HeaderName, &str)],
    ) -> Result<Value> {
        if let Some(hit) = self.cache.get(key) {
            debug!(key, "feed cache hit");
            return Ok(hit);
        }

        let mut request = self.http.get(url);
        for (name, value) in headers {
            request = request.header(name.clone(), *value);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(Error::Status {
                status,
                url: url.to_string(),
            });
        }

        let body = response.bytes().await?;
        let value: Value = serde_json::from_slice(&body).map_err(|e| {
            warn!(url, "received invalid JSON from external service");
            Error::Decode(e)
        })?;
        self.cache.set(key, value.clone(), ttl);
        Ok(value)
    }
}

fn trim(base: &str) -> &str {
    base.trim_end_matches('/')
}

fn parse(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| Error::Config(format!("invalid feed URL {url}: {e}")))
}
