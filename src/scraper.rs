//! Finds playable stream URLs in news pages.

use std::{
    collections::HashSet,
    sync::LazyLock,
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;

use crate::model::Stream;
use crate::{Error, Result};

pub const USER_AGENT: &str = "chaseapp-stream-extractor/1.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

static M3U8: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"https?://[^"'\s]+\.m3u8"#).ok());
static MP4: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"https?://[^"'\s]+\.mp4"#).ok());

#[async_trait]
pub trait StreamExtractor: Send + Sync {
    /// Fetch `url` and return every stream it links to.
    async fn extract(&self, url: &str) -> Result<Vec<Stream>>;
}

pub struct HttpStreamExtractor {
    http: reqwest::Client,
}

impl HttpStreamExtractor {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(HttpStreamExtractor { http })
    }
}

#[async_trait]
impl StreamExtractor for HttpStreamExtractor {
    async fn extract(&self, url: &str) -> Result<Vec<Stream>> {
        if url.is_empty() {
            return Err(Error::InvalidParameter("target URL is required".into()));
        }
        let target = Url::parse(url)
            .ok()
            .filter(|u| u.has_host())
            .ok_or_else(|| Error::InvalidParameter(format!("invalid URL: {url}")))?;
        let host = target.host_str().unwrap_or_default().to_string();

        let response = self.http.get(target).send().await?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(Error::Status {
                status,
                url: url.to_string(),
            });
        }
        let body = response.text().await?;
        Ok(streams_in_body(&host, &body))
    }
}

/// HLS links first, then MP4 links, each URL once.
pub fn streams_in_body(host: &str, body: &str) -> Vec<Stream> {
    let network = infer_network(host);
    let mut seen = HashSet::new();
    let mut streams = Vec::new();
    for (re, kind) in [(&M3U8, "m3u8"), (&MP4, "mp4")] {
        let Some(re) = re.as_ref() else { continue };
        for m in re.find_iter(body) {
            if seen.insert(m.as_str()) {
                streams.push(Stream {
                    url: m.as_str().to_string(),
                    network: network.clone(),
                    kind: kind.to_string(),
                });
            }
        }
    }
    streams
}

/// Broadcaster name for a page host.
pub fn infer_network(host: &str) -> String {
    let host = host.to_lowercase();
    if host.contains("nbc") {
        "NBC LA".into()
    } else if host.contains("abc") {
        "ABC7".into()
    } else if host.contains("cbs") {
        "CBS News".into()
    } else {
        host
    }
}
