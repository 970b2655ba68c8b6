/*!
 * RCRT record-store client.
 *
 * Typed wrapper over the store's HTTP surface: breadcrumb CRUD, selector
 * search, vector search, secrets, token refresh and the SSE stream. Every
 * call carries the current bearer token; a 401 refreshes the token and
 * retries, transient failures retry with jittered backoff.
 */

use crate::backoff;
use crate::config::Config;
use rcrt_runner_core::{Breadcrumb, BreadcrumbCreate, BreadcrumbListItem, RunnerError};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type ClientResult<T> = Result<T, RunnerError>;

#[derive(Debug, Serialize)]
struct TokenRequest {
    owner_id: String,
    agent_id: String,
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

fn default_version() -> i32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateResult {
    pub id: Uuid,
    #[serde(default = "default_version")]
    pub version: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretMeta {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretValue {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    pub value: String,
}

/// Parameters for selector-based listing.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub schema_name: Option<String>,
    pub tags: Vec<String>,
    pub limit: Option<usize>,
    pub include_context: bool,
}

pub struct RcrtClient {
    base_url: String,
    http: reqwest::Client,
    token: Arc<RwLock<String>>,
    owner_id: String,
    agent_id: String,
    max_retries: u32,
    token_refresh_secs: u64,
}

impl RcrtClient {
    pub async fn new(config: &Config) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| RunnerError::Fatal(format!("http client: {e}")))?;

        let client = RcrtClient {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            token: Arc::new(RwLock::new(String::new())),
            owner_id: config.owner_id.clone(),
            agent_id: config.agent_id.clone(),
            max_retries: config.max_retries,
            token_refresh_secs: config.token_refresh_secs,
        };

        client.refresh_token().await?;
        Ok(client)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Client with no token and no connection, for tests of components
    /// that hold a client but do not call the store.
    #[cfg(test)]
    pub(crate) fn unconnected(base_url: &str) -> Self {
        RcrtClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            token: Arc::new(RwLock::new(String::new())),
            owner_id: "test-owner".to_string(),
            agent_id: "test-runner".to_string(),
            max_retries: 0,
            token_refresh_secs: 600,
        }
    }

    pub async fn refresh_token(&self) -> ClientResult<()> {
        let request = TokenRequest {
            owner_id: self.owner_id.clone(),
            agent_id: self.agent_id.clone(),
            roles: vec!["curator".into(), "emitter".into(), "subscriber".into()],
        };

        let url = format!("{}/auth/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RunnerError::Transient(format!("token request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Token request failed: {} - {}", status, body);
            return Err(RunnerError::from_status(status.as_u16(), body));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| RunnerError::Transient(format!("token decode: {e}")))?;
        *self.token.write().await = token_response.token;

        debug!("JWT token refreshed");
        Ok(())
    }

    /// Background task refreshing the token proactively. Exits on shutdown.
    pub fn spawn_token_refresher(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(client.token_refresh_secs);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        if let Err(e) = client.refresh_token().await {
                            warn!("Proactive token refresh failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn bearer(&self) -> String {
        self.token.read().await.clone()
    }

    /// Core request loop: bearer auth, 401 -> refresh + retry, transient ->
    /// jittered backoff, everything else classified and surfaced.
    async fn request(
        &self,
        method: Method,
        url: String,
        body: Option<&JsonValue>,
        headers: &[(&str, String)],
    ) -> ClientResult<reqwest::Response> {
        let mut auth_attempts = 0u32;
        let mut transient_attempts = 0u32;

        loop {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(self.bearer().await);
            for (name, value) in headers {
                req = req.header(*name, value.as_str());
            }
            if let Some(json) = body {
                req = req.json(json);
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    if transient_attempts < self.max_retries {
                        let delay = backoff::delay(transient_attempts);
                        warn!("Request to {} failed ({}), retrying in {:?}", url, e, delay);
                        tokio::time::sleep(delay).await;
                        transient_attempts += 1;
                        continue;
                    }
                    return Err(RunnerError::Transient(format!("{method} {url}: {e}")));
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let body_text = response.text().await.unwrap_or_default();
            let err = RunnerError::from_status(status.as_u16(), body_text);

            if err.is_auth() && auth_attempts < self.max_retries {
                auth_attempts += 1;
                debug!("401 from {}, refreshing token (attempt {})", url, auth_attempts);
                self.refresh_token().await?;
                continue;
            }
            if err.is_retryable() && transient_attempts < self.max_retries {
                let delay = backoff::delay(transient_attempts);
                warn!("{} {} -> {}, retrying in {:?}", method, url, status, delay);
                tokio::time::sleep(delay).await;
                transient_attempts += 1;
                continue;
            }
            return Err(err);
        }
    }

    // -- Breadcrumb CRUD ----------------------------------------------------

    /// Create a breadcrumb. A duplicate idempotency key reported by the
    /// store is treated as success when the store echoes the existing id.
    pub async fn create(
        &self,
        body: &BreadcrumbCreate,
        idempotency_key: Option<&str>,
    ) -> ClientResult<CreateResult> {
        let url = format!("{}/breadcrumbs", self.base_url);
        let json = serde_json::to_value(body)?;
        let headers: Vec<(&str, String)> = idempotency_key
            .map(|k| vec![("Idempotency-Key", k.to_string())])
            .unwrap_or_default();

        match self.request(Method::POST, url, Some(&json), &headers).await {
            Ok(response) => {
                let created: CreateResult = response
                    .json()
                    .await
                    .map_err(|e| RunnerError::Transient(format!("create decode: {e}")))?;
                debug!("Created breadcrumb {} ({})", created.id, body.schema_name);
                Ok(created)
            }
            Err(RunnerError::Conflict(conflict_body)) => {
                // Duplicate idempotency key: the record already exists.
                match serde_json::from_str::<CreateResult>(&conflict_body) {
                    Ok(existing) => {
                        debug!("Idempotent create hit existing {}", existing.id);
                        Ok(existing)
                    }
                    Err(_) => Err(RunnerError::Conflict(conflict_body)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Full record with llm_hints already applied by the store.
    pub async fn get(&self, id: Uuid) -> ClientResult<Breadcrumb> {
        let url = format!("{}/breadcrumbs/{}", self.base_url, id);
        let response = self.request(Method::GET, url, None, &[]).await?;
        response
            .json()
            .await
            .map_err(|e| RunnerError::Validation(format!("breadcrumb decode: {e}")))
    }

    /// PATCH with If-Match. A stale version surfaces as `VersionMismatch`;
    /// callers wanting the refetch-and-retry-once policy use
    /// [`RcrtClient::update_with_refetch`].
    pub async fn update(
        &self,
        id: Uuid,
        expected_version: i32,
        patch: &JsonValue,
    ) -> ClientResult<()> {
        let url = format!("{}/breadcrumbs/{}", self.base_url, id);
        let headers = vec![("If-Match", expected_version.to_string())];
        match self.request(Method::PATCH, url, Some(patch), &headers).await {
            Ok(_) => Ok(()),
            Err(RunnerError::VersionMismatch { .. }) => Err(RunnerError::VersionMismatch {
                id: id.to_string(),
                expected: expected_version,
            }),
            Err(e) => Err(e),
        }
    }

    /// Default optimistic-concurrency policy: on mismatch, refetch the
    /// current version and retry exactly once. A second mismatch surfaces.
    pub async fn update_with_refetch(
        &self,
        id: Uuid,
        expected_version: i32,
        patch: &JsonValue,
    ) -> ClientResult<()> {
        match self.update(id, expected_version, patch).await {
            Err(RunnerError::VersionMismatch { .. }) => {
                let current = self.get(id).await?;
                debug!(
                    "Version mismatch on {} (expected {}, found {}), retrying once",
                    id, expected_version, current.version
                );
                self.update(id, current.version, patch).await
            }
            other => other,
        }
    }

    pub async fn delete(&self, id: Uuid) -> ClientResult<()> {
        let url = format!("{}/breadcrumbs/{}", self.base_url, id);
        self.request(Method::DELETE, url, None, &[]).await?;
        Ok(())
    }

    // -- Search -------------------------------------------------------------

    /// Selector-based listing. The store filters on a single tag plus
    /// schema; remaining tags are filtered client-side.
    pub async fn search(&self, query: &SearchQuery) -> ClientResult<Vec<BreadcrumbListItem>> {
        let mut url = format!("{}/breadcrumbs?", self.base_url);
        if let Some(tag) = query.tags.first() {
            url.push_str(&format!("tag={}&", urlencode(tag)));
        }
        if let Some(schema) = &query.schema_name {
            url.push_str(&format!("schema_name={}&", urlencode(schema)));
        }
        if let Some(limit) = query.limit {
            url.push_str(&format!("limit={limit}&"));
        }
        if query.include_context {
            url.push_str("include_context=true&");
        }
        let url = url.trim_end_matches(['&', '?']).to_string();

        let response = match self.request(Method::GET, url, None, &[]).await {
            Ok(r) => r,
            // Empty result set, not an error.
            Err(RunnerError::NotFound(_)) => return Ok(vec![]),
            Err(e) => return Err(e),
        };

        let all: Vec<BreadcrumbListItem> = response
            .json()
            .await
            .map_err(|e| RunnerError::Validation(format!("search decode: {e}")))?;

        let rest = query.tags.get(1..).unwrap_or(&[]);
        Ok(all
            .into_iter()
            .filter(|item| {
                if let Some(schema) = &query.schema_name {
                    if &item.schema_name != schema {
                        return false;
                    }
                }
                rest.iter().all(|t| item.tags.contains(t))
            })
            .collect())
    }

    /// k-nearest-neighbour search over the store's vector index.
    pub async fn vector_search(
        &self,
        q: &str,
        nn: usize,
        schema_name: Option<&str>,
    ) -> ClientResult<Vec<Breadcrumb>> {
        let mut url = format!(
            "{}/breadcrumbs/search?q={}&nn={}",
            self.base_url,
            urlencode(q),
            nn
        );
        if let Some(schema) = schema_name {
            url.push_str(&format!("&schema_name={}", urlencode(schema)));
        }

        let response = match self.request(Method::GET, url, None, &[]).await {
            Ok(r) => r,
            Err(RunnerError::NotFound(_)) => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        response
            .json()
            .await
            .map_err(|e| RunnerError::Validation(format!("vector search decode: {e}")))
    }

    // -- Secrets ------------------------------------------------------------

    pub async fn list_secrets(&self) -> ClientResult<Vec<SecretMeta>> {
        let url = format!("{}/secrets", self.base_url);
        let response = self.request(Method::GET, url, None, &[]).await?;
        response
            .json()
            .await
            .map_err(|e| RunnerError::Validation(format!("secrets decode: {e}")))
    }

    /// Fetch one secret. The purpose string is recorded by the store for
    /// audit.
    pub async fn get_secret(&self, id: Uuid, purpose: &str) -> ClientResult<SecretValue> {
        let url = format!("{}/secrets/{}?purpose={}", self.base_url, id, urlencode(purpose));
        let response = self.request(Method::GET, url, None, &[]).await?;
        response
            .json()
            .await
            .map_err(|e| RunnerError::Validation(format!("secret decode: {e}")))
    }

    /// Convenience lookup by secret name.
    pub async fn get_secret_by_name(&self, name: &str, purpose: &str) -> ClientResult<SecretValue> {
        let secrets = self.list_secrets().await?;
        let meta = secrets
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| RunnerError::NotFound(format!("secret {name}")))?;
        self.get_secret(meta.id, purpose).await
    }

    // -- SSE ----------------------------------------------------------------

    /// Open the long-lived event stream. The dispatcher owns the read loop;
    /// this returns the raw response to stream bytes from.
    pub async fn connect_sse(
        &self,
        last_event_id: Option<&str>,
    ) -> ClientResult<reqwest::Response> {
        let url = format!("{}/events/stream", self.base_url);
        let mut req = self
            .http
            .get(&url)
            .bearer_auth(self.bearer().await)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        if let Some(id) = last_event_id {
            req = req.header("Last-Event-ID", id.to_string());
        }

        let response = req
            .send()
            .await
            .map_err(|e| RunnerError::Transient(format!("sse connect: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(RunnerError::Unauthorized("sse".into()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RunnerError::from_status(status.as_u16(), body));
        }

        info!("✅ SSE stream connected");
        Ok(response)
    }

    /// Store health probe, used during docker-mode startup.
    pub async fn health(&self) -> ClientResult<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| RunnerError::Transient(format!("health: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RunnerError::Transient(format!("health: {}", response.status())))
        }
    }
}

fn urlencode(s: &str) -> String {
    // Query values here are schema names, tags and short queries; escape
    // the characters that matter in a query string.
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' | ':' => out.push(c),
            ' ' => out.push_str("%20"),
            _ => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{b:02X}"));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_keeps_tags_readable() {
        assert_eq!(urlencode("workspace:tools"), "workspace:tools");
        assert_eq!(urlencode("hello world"), "hello%20world");
        assert_eq!(urlencode("a&b=c"), "a%26b%3Dc");
    }

    #[test]
    fn create_result_defaults_version() {
        let r: CreateResult =
            serde_json::from_str(r#"{"id":"00000000-0000-0000-0000-000000000001"}"#).unwrap();
        assert_eq!(r.version, 1);
    }

    #[test]
    fn search_query_default_is_wildcard() {
        let q = SearchQuery::default();
        assert!(q.schema_name.is_none());
        assert!(q.tags.is_empty());
        assert!(!q.include_context);
    }
}
