//! Book search API adapter: credential rotation, page requests and pagination rules.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bcat_core::{FetchedItem, SortOrder};
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_ENDPOINT: &str = "https://openapi.naver.com/v1/search/book.json";
pub const CLIENT_ID_HEADER: &str = "X-Naver-Client-Id";
pub const CLIENT_SECRET_HEADER: &str = "X-Naver-Client-Secret";

/// Largest `display` the API accepts.
pub const MAX_PAGE_SIZE: usize = 100;
/// Largest 1-indexed `start` the API accepts.
pub const MAX_START: usize = 1000;

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ApiCredential {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential pool is empty")]
    Empty,
    #[error("credential pool is not a JSON array of {{client_id, client_secret}}: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("credential #{0} has a blank client_id or client_secret")]
    Blank(usize),
}

/// Uniform random choice from a fixed credential pool. Holds no per-call state.
#[derive(Debug, Clone)]
pub struct CredentialRotator {
    pool: Vec<ApiCredential>,
}

impl CredentialRotator {
    pub fn new(pool: Vec<ApiCredential>) -> Result<Self, CredentialError> {
        if pool.is_empty() {
            return Err(CredentialError::Empty);
        }
        if let Some(index) = pool
            .iter()
            .position(|c| c.client_id.trim().is_empty() || c.client_secret.trim().is_empty())
        {
            return Err(CredentialError::Blank(index));
        }
        Ok(Self { pool })
    }

    pub fn from_json(raw: &str) -> Result<Self, CredentialError> {
        let pool: Vec<ApiCredential> = serde_json::from_str(raw)?;
        Self::new(pool)
    }

    /// Number of credentials in the pool; never zero.
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn pick(&self) -> &ApiCredential {
        self.pick_with(&mut rand::rng())
    }

    pub fn pick_with<R: Rng + ?Sized>(&self, rng: &mut R) -> &ApiCredential {
        &self.pool[rng.random_range(0..self.pool.len())]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub term: String,
    pub sort: SortOrder,
    pub start: usize,
    pub display: usize,
}

impl PageRequest {
    pub fn query_pairs(&self) -> [(&'static str, String); 4] {
        [
            ("query", self.term.clone()),
            ("display", self.display.min(MAX_PAGE_SIZE).to_string()),
            ("start", self.start.to_string()),
            ("sort", self.sort.api_value().to_string()),
        ]
    }
}

/// Offset bookkeeping for one (term, sort) loop.
///
/// Starts at 1 and advances by `page_size` while pages come back full, the next
/// start stays within [`MAX_START`], and the optional page budget is not spent.
#[derive(Debug, Clone)]
pub struct Pagination {
    page_size: usize,
    max_pages: Option<usize>,
    next_start: Option<usize>,
    pages: usize,
}

impl Pagination {
    pub fn new(page_size: usize, max_pages: Option<usize>) -> Self {
        let next_start = if max_pages == Some(0) { None } else { Some(1) };
        Self {
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            max_pages,
            next_start,
            pages: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn next_start(&self) -> Option<usize> {
        self.next_start
    }

    /// Record a page of `returned` items and compute the next start, if any.
    pub fn advance(&mut self, returned: usize) {
        let Some(start) = self.next_start else {
            return;
        };
        self.pages += 1;
        let budget_left = self.max_pages.map(|max| self.pages < max).unwrap_or(true);
        let next = start + self.page_size;
        self.next_start = if returned >= self.page_size && next <= MAX_START && budget_left {
            Some(next)
        } else {
            None
        };
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for term `{term}`")]
    HttpStatus { status: u16, term: String },
    #[error("undecodable search response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 429, .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub items: Option<Vec<FetchedItem>>,
}

pub fn parse_search_response(body: &[u8]) -> Result<Vec<FetchedItem>, FetchError> {
    let response: SearchResponse = serde_json::from_slice(body)?;
    Ok(response.items.unwrap_or_default())
}

/// One page of search results per call.
#[async_trait]
pub trait SearchSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<FetchedItem>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct SearchClientConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for SearchClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct BookSearchClient {
    client: reqwest::Client,
    endpoint: String,
    credentials: CredentialRotator,
}

impl BookSearchClient {
    pub fn new(config: SearchClientConfig, credentials: CredentialRotator) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
            credentials,
        })
    }
}

#[async_trait]
impl SearchSource for BookSearchClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<FetchedItem>, FetchError> {
        let credential = self.credentials.pick();
        let span = info_span!(
            "search_page",
            term = %request.term,
            sort = request.sort.api_value(),
            start = request.start
        );

        async move {
            let resp = self
                .client
                .get(&self.endpoint)
                .header(CLIENT_ID_HEADER, &credential.client_id)
                .header(CLIENT_SECRET_HEADER, &credential.client_secret)
                .query(&request.query_pairs())
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    term: request.term.clone(),
                });
            }

            let body = resp.bytes().await?;
            let items = parse_search_response(&body)?;
            debug!(items = items.len(), "search page fetched");
            Ok(items)
        }
        .instrument(span)
        .await
    }
}
