//! PocketBase REST client implementation.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{ListOptions, ListResult, PbError, RecordOptions};

/// Default number of retries for transient failures.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Page size used when walking every page of a collection.
const FULL_LIST_BATCH: u32 = 200;

/// Client for the PocketBase record API.
pub struct PocketBaseClient {
    http: Client,
    base_url: String,
    auth_token: Arc<RwLock<Option<String>>>,
    request_timeout: Duration,
    max_retries: u32,
}

/// Builder for [`PocketBaseClient`].
pub struct PocketBaseClientBuilder {
    base_url: String,
    connect_timeout: Duration,
    timeout: Duration,
    max_retries: u32,
    auth_token: Option<String>,
}

impl PocketBaseClientBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of retries for transient failures (0 disables retrying).
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Pre-issued auth token sent in the `Authorization` header.
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn build(self) -> PocketBaseClient {
        // No overall timeout here: realtime streams stay open indefinitely.
        // Per-request timeouts are applied in `request`.
        let http = Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .expect("failed to build HTTP client");

        PocketBaseClient {
            http,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            auth_token: Arc::new(RwLock::new(self.auth_token)),
            request_timeout: self.timeout,
            max_retries: self.max_retries,
        }
    }
}

impl PocketBaseClient {
    /// Create a new client for the given backend URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::builder(base_url).build()
    }

    pub fn builder(base_url: impl Into<String>) -> PocketBaseClientBuilder {
        PocketBaseClientBuilder {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            max_retries: DEFAULT_MAX_RETRIES,
            auth_token: None,
        }
    }

    /// Get the backend URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The underlying HTTP client.
    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Replace the auth token used for subsequent requests.
    pub async fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write().await = token;
    }

    /// Current auth token, if any.
    pub async fn auth_token(&self) -> Option<String> {
        self.auth_token.read().await.clone()
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn records_path(collection: &str) -> String {
        format!("/api/collections/{}/records", collection)
    }

    /// Build a request with the auth header attached.
    pub(crate) async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, self.url(path))
            .timeout(self.request_timeout);
        if let Some(token) = self.auth_token().await {
            builder = builder.header("Authorization", token);
        }
        builder
    }

    /// Fetch one page of records.
    pub async fn get_list<T: DeserializeOwned>(
        &self,
        collection: &str,
        page: u32,
        per_page: u32,
        options: &ListOptions,
    ) -> Result<ListResult<T>, PbError> {
        let path = Self::records_path(collection);
        let mut query: Vec<(&str, String)> = vec![
            ("page", page.to_string()),
            ("perPage", per_page.to_string()),
        ];
        if let Some(filter) = &options.filter {
            query.push(("filter", filter.clone()));
        }
        if let Some(sort) = &options.sort {
            query.push(("sort", sort.clone()));
        }
        if let Some(expand) = &options.expand {
            query.push(("expand", expand.clone()));
        }

        let result: ListResult<T> = self
            .execute(
                "get_list",
                self.request(Method::GET, &path).await.query(&query),
                None,
            )
            .await?;

        debug!(
            collection = %collection,
            page,
            per_page,
            items = result.items.len(),
            total = result.total_items,
            "fetched record list"
        );
        Ok(result)
    }

    /// Fetch every record matching `options` (handles pagination).
    pub async fn get_full_list<T: DeserializeOwned>(
        &self,
        collection: &str,
        options: &ListOptions,
    ) -> Result<Vec<T>, PbError> {
        let mut all_records = Vec::new();
        let mut page = 1;

        loop {
            let result: ListResult<T> = self
                .get_list(collection, page, FULL_LIST_BATCH, options)
                .await?;
            let fetched = result.items.len();
            all_records.extend(result.items);

            if fetched < FULL_LIST_BATCH as usize {
                break;
            }
            page += 1;
        }

        Ok(all_records)
    }

    /// Fetch the first record matching `filter`.
    ///
    /// Returns [`PbError::NotFound`] when nothing matches.
    pub async fn get_first_list_item<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &str,
        options: &ListOptions,
    ) -> Result<T, PbError> {
        let options = ListOptions {
            filter: Some(filter.to_string()),
            ..options.clone()
        };
        let result: ListResult<T> = self.get_list(collection, 1, 1, &options).await?;
        result
            .items
            .into_iter()
            .next()
            .ok_or_else(|| PbError::NotFound {
                collection: collection.to_string(),
                id: filter.to_string(),
            })
    }

    /// Fetch a record by id.
    pub async fn get_one<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
        options: &RecordOptions,
    ) -> Result<T, PbError> {
        let path = format!("{}/{}", Self::records_path(collection), id);
        let mut request = self.request(Method::GET, &path).await;
        if let Some(expand) = &options.expand {
            request = request.query(&[("expand", expand)]);
        }
        self.execute("get_one", request, Some((collection, id))).await
    }

    /// Create a record.
    pub async fn create<T: DeserializeOwned, V: Serialize + ?Sized>(
        &self,
        collection: &str,
        values: &V,
    ) -> Result<T, PbError> {
        let path = Self::records_path(collection);
        let body = serde_json::to_value(values)?;
        debug!(collection = %collection, body = %body, "creating record");

        let request = self.request(Method::POST, &path).await.json(&body);
        self.execute("create", request, None).await
    }

    /// Patch a record. Only the fields present in `values` change.
    pub async fn update<T: DeserializeOwned, V: Serialize + ?Sized>(
        &self,
        collection: &str,
        id: &str,
        values: &V,
    ) -> Result<T, PbError> {
        let path = format!("{}/{}", Self::records_path(collection), id);
        let body = serde_json::to_value(values)?;
        debug!(collection = %collection, id = %id, body = %body, "updating record");

        let request = self.request(Method::PATCH, &path).await.json(&body);
        self.execute("update", request, Some((collection, id))).await
    }

    /// Delete a record.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), PbError> {
        let path = format!("{}/{}", Self::records_path(collection), id);
        debug!(collection = %collection, id = %id, "deleting record");

        let request = self.request(Method::DELETE, &path).await;
        self.send("delete", request, Some((collection, id))).await?;
        Ok(())
    }

    /// Send a request and decode a JSON body, retrying transient failures.
    async fn execute<T: DeserializeOwned>(
        &self,
        op: &'static str,
        request: RequestBuilder,
        target: Option<(&str, &str)>,
    ) -> Result<T, PbError> {
        let response = self.send(op, request, target).await?;
        Ok(response.json().await?)
    }

    /// Send a request, retrying transient failures with exponential backoff
    /// (500ms, 1s, 2s, ...).
    async fn send(
        &self,
        op: &'static str,
        request: RequestBuilder,
        target: Option<(&str, &str)>,
    ) -> Result<reqwest::Response, PbError> {
        let mut attempt = 0;
        loop {
            let attempt_request = request.try_clone().ok_or_else(|| {
                PbError::InvalidResponse(format!("{}: request body cannot be retried", op))
            })?;
            let result = match attempt_request.send().await {
                Ok(response) => Self::check_status(response, target).await,
                Err(e) => Err(PbError::Http(e)),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let backoff_ms = 500 * (1u64 << attempt);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "transient error, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Map non-success statuses to [`PbError`].
    async fn check_status(
        response: reqwest::Response,
        target: Option<(&str, &str)>,
    ) -> Result<reqwest::Response, PbError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::NOT_FOUND {
            if let Some((collection, id)) = target {
                return Err(PbError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(PbError::RateLimited { retry_after_secs });
        }

        let text = response.text().await.map_err(|e| {
            PbError::InvalidResponse(format!(
                "request failed ({}): failed to read response: {}",
                status, e
            ))
        })?;

        if let Ok(api_error) = serde_json::from_str::<ApiErrorBody>(&text) {
            return Err(PbError::Api {
                status: status.as_u16(),
                message: api_error.message,
                data: api_error.data,
            });
        }

        Err(PbError::Api {
            status: status.as_u16(),
            message: text,
            data: serde_json::Value::Null,
        })
    }
}

/// API error response format.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(default)]
    data: serde_json::Value,
}
