//! Upstream source contracts + the data.gov.in paginated API source.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use nrega_core::RawRecord;
use nrega_storage::{env_parse, BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "nrega-adapters";

pub const DEFAULT_API_URL: &str =
    "https://api.data.gov.in/resource/ee03643a-ee4c-48c2-ac30-9f2ff26ab722";
pub const DEFAULT_PAGE_SIZE: usize = 1_000;

/// One decoded page. `malformed` counts array entries that were not JSON
/// objects and therefore never became records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamPage {
    pub records: Vec<RawRecord>,
    pub malformed: usize,
}

impl UpstreamPage {
    /// Number of entries the upstream returned, usable or not.
    pub fn entries(&self) -> usize {
        self.records.len() + self.malformed
    }

    pub fn is_empty(&self) -> bool {
        self.entries() == 0
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("upstream body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait UpstreamSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<UpstreamPage, SourceError>;
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub http: HttpClientConfig,
}

impl UpstreamConfig {
    pub fn from_env() -> Self {
        let timeout_secs = env_parse("NREGA_HTTP_TIMEOUT_SECS").unwrap_or(30u64);
        Self {
            base_url: std::env::var("DATA_GOV_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            api_key: std::env::var("DATA_GOV_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            http: HttpClientConfig {
                timeout: Duration::from_secs(timeout_secs.max(1)),
                user_agent: Some(format!("nrega-pipeline/{}", env!("CARGO_PKG_VERSION"))),
                backoff: BackoffPolicy {
                    max_retries: env_parse("NREGA_HTTP_RETRIES").unwrap_or(0),
                    ..BackoffPolicy::default()
                },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageEnvelope {
    #[serde(default)]
    records: Option<Vec<JsonValue>>,
}

/// Decodes a `{ "records": [...] }` body.
///
/// A missing or null `records` field is an empty page. Entries are decoded
/// one by one so a single bad entry never discards the rest of the page.
pub fn decode_page(body: &[u8]) -> Result<UpstreamPage, SourceError> {
    let envelope: PageEnvelope = serde_json::from_slice(body)?;
    let mut page = UpstreamPage::default();
    for entry in envelope.records.unwrap_or_default() {
        match entry {
            JsonValue::Object(fields) => page.records.push(RawRecord::new(fields)),
            other => {
                page.malformed += 1;
                debug!(kind = json_kind(&other), "skipping non-object upstream entry");
            }
        }
    }
    Ok(page)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Live data.gov.in resource, paged with `limit` / `offset`.
#[derive(Debug, Clone)]
pub struct DataGovSource {
    http: HttpFetcher,
    base_url: String,
    api_key: String,
}

impl DataGovSource {
    /// Fails without an api key; the resource rejects anonymous requests.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let Some(api_key) = config.api_key.clone() else {
            bail!("DATA_GOV_API_KEY is not set");
        };
        let http = HttpFetcher::new(config.http.clone()).context("building upstream http client")?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            api_key,
        })
    }

    fn query(&self, offset: usize, limit: usize) -> Vec<(&'static str, String)> {
        vec![
            ("format", "json".to_string()),
            ("api-key", self.api_key.clone()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ]
    }
}

#[async_trait]
impl UpstreamSource for DataGovSource {
    fn source_id(&self) -> &'static str {
        "data-gov-in"
    }

    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<UpstreamPage, SourceError> {
        let response = self.http.get(&self.base_url, &self.query(offset, limit)).await?;
        decode_page(&response.body)
    }
}

/// Replays pages recorded to disk as a JSON array of upstream bodies.
/// Offsets past the last recorded page read as empty pages.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    pages: Vec<UpstreamPage>,
}

impl FixtureSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading upstream fixture {}", path.display()))?;
        let bodies: Vec<JsonValue> = serde_json::from_str(&text)
            .with_context(|| format!("parsing upstream fixture {}", path.display()))?;
        let pages = bodies
            .iter()
            .map(|body| {
                let bytes = serde_json::to_vec(body)?;
                decode_page(&bytes)
            })
            .collect::<Result<Vec<_>, SourceError>>()
            .with_context(|| format!("decoding pages in {}", path.display()))?;
        Ok(Self { pages })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[async_trait]
impl UpstreamSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<UpstreamPage, SourceError> {
        let index = offset / limit.max(1);
        Ok(self.pages.get(index).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_records_field_is_an_empty_page() {
        let page = decode_page(br#"{"status":"ok"}"#).expect("decodes");
        assert!(page.is_empty());
        let page = decode_page(br#"{"records":null}"#).expect("decodes");
        assert!(page.is_empty());
    }

    #[test]
    fn non_object_entries_are_counted_as_malformed() {
        let page = decode_page(br#"{"records":[{"fin_year":"2023-24"}, 7, "x", null]}"#)
            .expect("decodes");
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.malformed, 3);
        assert_eq!(page.entries(), 4);
    }

    #[test]
    fn html_error_body_is_a_decode_error() {
        let err = decode_page(b"<html>502 Bad Gateway</html>").expect_err("not json");
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[test]
    fn query_carries_key_and_window() {
        let source = DataGovSource::new(&UpstreamConfig {
            base_url: DEFAULT_API_URL.to_string(),
            api_key: Some("secret".into()),
            http: HttpClientConfig::default(),
        })
        .expect("source");
        let query = source.query(2000, 1000);
        assert_eq!(
            query,
            vec![
                ("format", "json".to_string()),
                ("api-key", "secret".to_string()),
                ("limit", "1000".to_string()),
                ("offset", "2000".to_string()),
            ]
        );
    }

    #[test]
    fn live_source_requires_an_api_key() {
        let err = DataGovSource::new(&UpstreamConfig {
            base_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            http: HttpClientConfig::default(),
        })
        .expect_err("no key");
        assert!(err.to_string().contains("DATA_GOV_API_KEY"));
    }
}
