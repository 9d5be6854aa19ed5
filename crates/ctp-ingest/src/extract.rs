//! Paginated extraction
//!
//! [`PageFetcher`] fetches exactly one page per [`PageFetcher::make_request`]
//! call, following the API's continuation tokens. Each attempt is recorded in
//! the cursor before the request goes out, and a page only counts once its
//! shard is on disk.

use crate::config::{ApiConfig, RateLimitConfig};
use crate::error::{IngestError, Result};
use crate::rate_limit::RateLimiter;
use crate::shard::ShardWriter;
use crate::state::{CursorStore, StateBackend};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Response field carrying the continuation token
pub const NEXT_PAGE_TOKEN_FIELD: &str = "nextPageToken";

const USER_AGENT: &str = "CTP-Ingester/1.0";

/// Result of one successful [`PageFetcher::make_request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// Page persisted and another page follows
    Saved { page: u32, records: usize },
    /// Page persisted and the API reported no further pages
    Exhausted { page: u32, records: usize },
}

impl PageOutcome {
    pub fn page(&self) -> u32 {
        match self {
            PageOutcome::Saved { page, .. } | PageOutcome::Exhausted { page, .. } => *page,
        }
    }
}

/// HTTP client for one extraction run
pub struct PageFetcher {
    client: Client,
    api: ApiConfig,
    limiter: RateLimiter,
    writer: ShardWriter,
    current_page: u32,
    next_url: String,
}

impl PageFetcher {
    /// Create a fetcher positioned after `start_page` persisted pages.
    ///
    /// With no `token` the next request goes to the base URL, which is only
    /// correct for the first page of a run.
    pub fn new(
        api: ApiConfig,
        rate_limit: &RateLimitConfig,
        writer: ShardWriter,
        start_page: u32,
        token: Option<&str>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        let next_url = match token {
            Some(token) => api.page_url(token),
            None => api.base_url.clone(),
        };

        Ok(Self {
            client,
            limiter: RateLimiter::from_config(rate_limit),
            api,
            writer,
            current_page: start_page,
            next_url,
        })
    }

    /// Pages persisted so far in this run
    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    /// URL the next request will be sent to
    pub fn next_url(&self) -> &str {
        &self.next_url
    }

    pub fn writer(&self) -> &ShardWriter {
        &self.writer
    }

    /// Fetch, persist and checkpoint the next page.
    pub async fn make_request<B: StateBackend>(
        &mut self,
        store: &mut CursorStore<B>,
    ) -> Result<PageOutcome> {
        let page = self.current_page + 1;
        let body = self.fetch_with_retry(page, store).await?;

        let records: &[Value] = match body.get(&self.api.records_field) {
            Some(Value::Array(items)) => items,
            Some(_) => {
                warn!(page, field = %self.api.records_field, "Records field is not an array, treating page as empty");
                &[]
            },
            None => {
                warn!(page, field = %self.api.records_field, "Records field missing, treating page as empty");
                &[]
            },
        };
        let record_count = records.len();

        let token = body
            .get(NEXT_PAGE_TOKEN_FIELD)
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty());

        let Some(token) = token else {
            if !self.api.end_on_missing_token {
                store.record_failure(page)?;
                error!(page, records = record_count, "Response carried no next page token");
                return Err(IngestError::NextPageMissing { page });
            }

            self.writer.save_response(page, records, None, store)?;
            store.record_success(page, None)?;
            self.current_page = page;
            info!(page, records = record_count, "No next page token, dataset exhausted");
            return Ok(PageOutcome::Exhausted {
                page,
                records: record_count,
            });
        };

        self.writer.save_response(page, records, Some(token), store)?;
        store.record_success(page, Some(token))?;
        self.current_page = page;
        self.next_url = self.api.page_url(token);

        debug!(page, records = record_count, "Page checkpointed");
        Ok(PageOutcome::Saved {
            page,
            records: record_count,
        })
    }

    async fn fetch_with_retry<B: StateBackend>(
        &mut self,
        page: u32,
        store: &mut CursorStore<B>,
    ) -> Result<Value> {
        let max_retries = self.api.max_retries;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_retries {
            store.record_attempt_start(page)?;
            self.limiter.wait_if_needed().await;

            debug!(page, attempt, url = %self.next_url, "Requesting page");
            match self.fetch_once().await {
                Ok(body) => return Ok(body),
                Err(detail) => {
                    store.record_failure(page)?;
                    warn!(page, attempt, max_retries, error = %detail, "Page request failed");
                    last_error = detail;

                    if attempt < max_retries {
                        let backoff_ms = self
                            .api
                            .retry_backoff_ms
                            .saturating_mul(2u64.saturating_pow(attempt - 1));
                        if backoff_ms > 0 {
                            info!(page, backoff_ms, "Retrying after backoff");
                            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        }
                    }
                },
            }
        }

        error!(page, attempts = max_retries, error = %last_error, "Retries exhausted");
        Err(IngestError::RequestFailed {
            page,
            detail: last_error,
        })
    }

    /// One GET of `next_url`; failures are described, not raised
    async fn fetch_once(&self) -> std::result::Result<Value, String> {
        let response = self.client.get(&self.next_url).send().await.map_err(|e| {
            if e.is_timeout() {
                format!("request timed out after {}s", self.api.timeout_secs)
            } else {
                format!("transport error: {}", e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| format!("invalid JSON body: {}", e))
    }
}
