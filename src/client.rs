//! Async HTTP client for the Dataverse Web API.
//!
//! One `reqwest::Client` is shared for the whole run. A global permit
//! pool caps in-flight requests; every request holds a permit for its
//! full retry span. Retries follow a five-step exponential backoff for
//! rate limiting (429, honoring `Retry-After`), server errors (5xx) and
//! transport failures; 401 fails fast so the caller can re-acquire a
//! token.
//!
//! The `Prefer` header requests formatted-value annotations on every
//! data response. Option-set detection depends on them: without the
//! annotations there is no code-to-label signal in the payload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::SyncError;

/// One OData record: a free-form JSON object. Values are projected into
/// typed columns only at the storage boundary.
pub type JsonRecord = serde_json::Map<String, Value>;

/// Exponential backoff schedule in seconds.
const RETRY_DELAYS: [u64; 5] = [1, 2, 4, 8, 16];

/// Default cap on concurrently in-flight HTTP requests.
pub const DEFAULT_MAX_CONCURRENT: usize = 50;

/// Server-side page size requested via `Prefer: odata.maxpagesize`.
pub const MAX_PAGE_SIZE: u32 = 5000;

/// Annotation that carries option-set labels alongside raw codes.
pub const FORMATTED_VALUE_ANNOTATION: &str = "OData.Community.Display.V1.FormattedValue";

/// The read surface the sync engine needs from Dataverse. Tests
/// substitute a canned implementation.
#[async_trait]
pub trait DataverseFetch: Send + Sync {
    /// Fetch the raw $metadata CSDL document.
    async fn get_metadata(&self) -> Result<String, SyncError>;

    /// Fetch every page of an entity collection, following
    /// `@odata.nextLink` cursors until exhausted.
    async fn fetch_all_pages(
        &self,
        entity: &str,
        orderby: Option<&str>,
        filter: Option<&str>,
        select: Option<&str>,
    ) -> Result<Vec<JsonRecord>, SyncError>;

    /// Record count for an entity via the `/$count` endpoint.
    async fn get_entity_count(&self, entity: &str) -> Result<u64, SyncError>;
}

/// Authenticated Dataverse Web API client.
pub struct DataverseClient {
    api_url: String,
    token: String,
    http: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl DataverseClient {
    pub fn new(config: &Config, token: String) -> Result<Self, SyncError> {
        Self::with_concurrency(config, token, DEFAULT_MAX_CONCURRENT)
    }

    pub fn with_concurrency(
        config: &Config,
        token: String,
        max_concurrent: usize,
    ) -> Result<Self, SyncError> {
        // Generous ceilings: the $metadata document alone is several MB.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
            http,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        })
    }

    fn endpoint_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http") {
            endpoint.to_string()
        } else {
            format!("{}/{}", self.api_url, endpoint)
        }
    }

    /// Send one GET with the retry policy. The returned response is
    /// always 2xx.
    async fn send_with_retry(
        &self,
        url: &str,
        query: &[(String, String)],
        accept: &str,
    ) -> Result<reqwest::Response, SyncError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| SyncError::Transport("request permit pool closed".to_string()))?;

        let mut attempt = 0usize;
        loop {
            let mut request = self
                .http
                .get(url)
                .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", self.token))
                .header(reqwest::header::ACCEPT, accept)
                .header("OData-MaxVersion", "4.0")
                .header("OData-Version", "4.0")
                .header(
                    "Prefer",
                    format!(
                        "odata.maxpagesize={MAX_PAGE_SIZE},odata.include-annotations=\"{FORMATTED_VALUE_ANNOTATION}\""
                    ),
                );
            if !query.is_empty() {
                request = request.query(query);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    if status == StatusCode::UNAUTHORIZED {
                        return Err(SyncError::Auth(
                            "token expired or rejected (HTTP 401)".to_string(),
                        ));
                    }

                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if retryable && attempt < RETRY_DELAYS.len() {
                        let delay = if status == StatusCode::TOO_MANY_REQUESTS {
                            retry_after_seconds(&response).unwrap_or(RETRY_DELAYS[attempt])
                        } else {
                            RETRY_DELAYS[attempt]
                        };
                        warn!(
                            %status,
                            attempt = attempt + 1,
                            delay_s = delay,
                            url,
                            "request failed, backing off"
                        );
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    if retryable {
                        return Err(SyncError::Transport(format!(
                            "retries exhausted: HTTP {status} from {url}: {body}"
                        )));
                    }
                    return Err(SyncError::Server {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err)
                    if attempt < RETRY_DELAYS.len()
                        && (err.is_timeout() || err.is_connect() || err.is_request()) =>
                {
                    warn!(
                        error = %err,
                        attempt = attempt + 1,
                        delay_s = RETRY_DELAYS[attempt],
                        url,
                        "transport error, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(RETRY_DELAYS[attempt])).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn get_page(&self, url: &str, query: &[(String, String)]) -> Result<Value, SyncError> {
        let response = self.send_with_retry(url, query, "application/json").await?;
        Ok(response.json().await?)
    }
}

fn retry_after_seconds(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Heuristic for servers that reject `$orderby` on certain attributes
/// (notably `principal`-derived entities).
fn is_orderby_rejection(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("orderby") || lower.contains("attribute") || lower.contains("principal")
}

fn page_records(page: &Value) -> Result<Vec<JsonRecord>, SyncError> {
    let values = page
        .get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::Transport("response missing 'value' array".to_string()))?;
    Ok(values
        .iter()
        .filter_map(|v| v.as_object().cloned())
        .collect())
}

fn next_link(page: &Value) -> Option<String> {
    page.get("@odata.nextLink")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl DataverseFetch for DataverseClient {
    async fn get_metadata(&self) -> Result<String, SyncError> {
        let url = self.endpoint_url("$metadata");
        let response = self.send_with_retry(&url, &[], "application/xml").await?;
        Ok(response.text().await?)
    }

    async fn fetch_all_pages(
        &self,
        entity: &str,
        orderby: Option<&str>,
        filter: Option<&str>,
        select: Option<&str>,
    ) -> Result<Vec<JsonRecord>, SyncError> {
        let url = self.endpoint_url(entity);

        let mut params: Vec<(String, String)> = Vec::new();
        if let Some(orderby) = orderby {
            params.push(("$orderby".to_string(), orderby.to_string()));
        }
        if let Some(filter) = filter {
            params.push(("$filter".to_string(), filter.to_string()));
        }
        if let Some(select) = select {
            params.push(("$select".to_string(), select.to_string()));
        }

        let first = match self.get_page(&url, &params).await {
            Ok(page) => page,
            Err(SyncError::Server { status: 400, body })
                if orderby.is_some() && is_orderby_rejection(&body) =>
            {
                // Degraded mode: one unordered page, truncated at the
                // server's maximum page size.
                warn!(entity, "server rejected $orderby, retrying without ordering");
                let degraded: Vec<(String, String)> = params
                    .into_iter()
                    .filter(|(k, _)| k != "$orderby")
                    .collect();
                let page = self.get_page(&url, &degraded).await?;
                if next_link(&page).is_some() {
                    warn!(
                        entity,
                        "unordered fetch returned a continuation; accepting truncation at {MAX_PAGE_SIZE} records"
                    );
                }
                return page_records(&page);
            }
            Err(e) => return Err(e),
        };

        let mut records = page_records(&first)?;
        let mut cursor = next_link(&first);
        let mut pages = 1usize;

        // The nextLink already encodes the query parameters; never
        // re-append them.
        while let Some(link) = cursor {
            let page = self.get_page(&link, &[]).await?;
            records.extend(page_records(&page)?);
            cursor = next_link(&page);
            pages += 1;
        }

        debug!(entity, pages, records = records.len(), "fetched all pages");
        Ok(records)
    }

    async fn get_entity_count(&self, entity: &str) -> Result<u64, SyncError> {
        let url = self.endpoint_url(&format!("{entity}/$count"));
        let response = self.send_with_retry(&url, &[], "application/json").await?;
        let text = response.text().await?;
        text.trim()
            .parse::<u64>()
            .map_err(|_| SyncError::Transport(format!("invalid count response: {text}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_are_exponential() {
        assert_eq!(RETRY_DELAYS, [1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_orderby_rejection_detection() {
        assert!(is_orderby_rejection(
            "The orderby attribute is not supported for this entity"
        ));
        assert!(is_orderby_rejection("Attribute ownerid cannot be used"));
        assert!(is_orderby_rejection("principal entities cannot be ordered"));
        assert!(!is_orderby_rejection("something else entirely"));
    }

    #[test]
    fn test_page_records_extracts_objects() {
        let page = serde_json::json!({
            "value": [{"accountid": "a1"}, {"accountid": "a2"}],
            "@odata.nextLink": "https://example/api/accounts?$skiptoken=x"
        });
        let records = page_records(&page).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["accountid"], "a1");
        assert_eq!(
            next_link(&page).as_deref(),
            Some("https://example/api/accounts?$skiptoken=x")
        );
    }

    #[test]
    fn test_page_records_requires_value_array() {
        let page = serde_json::json!({"error": {"message": "nope"}});
        assert!(matches!(
            page_records(&page),
            Err(SyncError::Transport(_))
        ));
    }
}
