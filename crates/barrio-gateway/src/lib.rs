//! HTTP gateway to the marketplace backend, reverse geocoding and bearer-token persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use barrio_core::{
    Category, GeoPoint, NewReview, NewUser, ProfilePatch, Review, Service, ServiceDraft,
    ServiceFilters, ServiceId, ServicePatch, User,
};
use barrio_wire::{
    decode_categories, decode_json, decode_review, decode_reviews, decode_service,
    decode_services, decode_user, error_detail, format_street_address, ReverseGeocodeResponse,
    WireError, WireNewReview, WireNewUser, WireProfilePatch, WireReviewPatch, WireServiceCreate,
    WireServicePatch, WireToken,
};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "barrio-gateway";

pub const ADDRESS_UNAVAILABLE: &str = "Address unavailable";
pub const ADDRESS_LOOKUP_FAILED: &str = "Could not resolve address";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("backend returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
}

impl GatewayError {
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Http { status, .. } => Some(*status),
            GatewayError::Transport(_) => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED.as_u16())
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Transport(format!("request timed out: {err}"))
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

impl From<WireError> for GatewayError {
    fn from(err: WireError) -> Self {
        GatewayError::Transport(format!("unexpected response shape: {err}"))
    }
}

/// Result of a read whose failures are swallowed into a fallback value.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<T> {
    Confirmed(T),
    Degraded { value: T, error: GatewayError },
}

impl<T> ReadOutcome<T> {
    pub fn value(&self) -> &T {
        match self {
            ReadOutcome::Confirmed(value) | ReadOutcome::Degraded { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            ReadOutcome::Confirmed(value) | ReadOutcome::Degraded { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ReadOutcome::Degraded { .. })
    }

    pub fn error(&self) -> Option<&GatewayError> {
        match self {
            ReadOutcome::Confirmed(_) => None,
            ReadOutcome::Degraded { error, .. } => Some(error),
        }
    }
}

fn swallow<T: Default>(what: &str, result: Result<T, GatewayError>) -> ReadOutcome<T> {
    match result {
        Ok(value) => ReadOutcome::Confirmed(value),
        Err(error) => {
            warn!(%error, "{what} failed; substituting an empty result");
            ReadOutcome::Degraded {
                value: T::default(),
                error,
            }
        }
    }
}

/// The backend's REST surface. Gated calls take the bearer token explicitly.
#[async_trait]
pub trait MarketplaceBackend: Send + Sync {
    async fn list_services(&self, filters: &ServiceFilters) -> Result<Vec<Service>, GatewayError>;
    async fn get_service(&self, id: ServiceId) -> Result<Service, GatewayError>;
    async fn create_service(
        &self,
        token: &str,
        draft: &ServiceDraft,
    ) -> Result<Service, GatewayError>;
    async fn update_service(
        &self,
        token: &str,
        id: ServiceId,
        patch: &ServicePatch,
    ) -> Result<Service, GatewayError>;
    /// `Ok(false)` when the backend no longer knows the id.
    async fn delete_service(&self, token: &str, id: ServiceId) -> Result<bool, GatewayError>;
    async fn my_services(&self, token: &str) -> Result<Vec<Service>, GatewayError>;

    async fn list_categories(&self) -> Result<Vec<Category>, GatewayError>;

    async fn list_reviews(&self, service_id: ServiceId) -> Result<Vec<Review>, GatewayError>;
    async fn my_reviews(&self, token: &str) -> Result<Vec<Review>, GatewayError>;
    async fn create_review(&self, token: &str, review: &NewReview)
        -> Result<Review, GatewayError>;
    async fn update_review(
        &self,
        token: &str,
        review_id: i64,
        rating: f64,
    ) -> Result<Review, GatewayError>;
    async fn delete_review(&self, token: &str, review_id: i64) -> Result<bool, GatewayError>;

    /// Exchange credentials for a bearer token.
    async fn login(&self, email: &str, password: &str) -> Result<String, GatewayError>;
    async fn register(&self, user: &NewUser) -> Result<User, GatewayError>;
    async fn current_user(&self, token: &str) -> Result<User, GatewayError>;
    async fn update_profile(&self, token: &str, patch: &ProfilePatch)
        -> Result<User, GatewayError>;
}

pub async fn list_services_or_empty(
    backend: &dyn MarketplaceBackend,
    filters: &ServiceFilters,
) -> ReadOutcome<Vec<Service>> {
    swallow("listing services", backend.list_services(filters).await)
}

pub async fn list_categories_or_empty(
    backend: &dyn MarketplaceBackend,
) -> ReadOutcome<Vec<Category>> {
    swallow("listing categories", backend.list_categories().await)
}

pub async fn list_reviews_or_empty(
    backend: &dyn MarketplaceBackend,
    service_id: ServiceId,
) -> ReadOutcome<Vec<Review>> {
    swallow("listing reviews", backend.list_reviews(service_id).await)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

enum Body {
    Json(Vec<u8>),
    Form(String),
}

struct Call<'a> {
    method: Method,
    url: Url,
    token: Option<&'a str>,
    body: Option<Body>,
}

impl<'a> Call<'a> {
    fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            token: None,
            body: None,
        }
    }

    fn bearer(mut self, token: &'a str) -> Self {
        self.token = Some(token);
        self
    }

    fn json<T: Serialize>(mut self, payload: &T) -> Result<Self, GatewayError> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|err| GatewayError::Transport(format!("encoding request body: {err}")))?;
        self.body = Some(Body::Json(bytes));
        Ok(self)
    }

    fn form(mut self, fields: &[(&str, &str)]) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        self.body = Some(Body::Form(encoded));
        self
    }
}

/// reqwest-backed [`MarketplaceBackend`]. Only GETs are retried.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl HttpGateway {
    pub fn new(base_url: &str, config: HttpClientConfig) -> anyhow::Result<Self> {
        Url::parse(base_url).with_context(|| format!("parsing backend base url {base_url}"))?;
        Ok(Self {
            client: build_client(&config)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        Url::parse(&raw).map_err(|err| GatewayError::Transport(format!("invalid url {raw}: {err}")))
    }

    async fn send(&self, call: Call<'_>) -> Result<Vec<u8>, GatewayError> {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "backend_call",
            %request_id,
            method = %call.method,
            path = call.url.path()
        );
        let retries = if call.method == Method::GET {
            self.backoff.max_retries
        } else {
            0
        };

        self.send_with_retries(&call, retries)
            .instrument(span)
            .await
    }

    async fn send_with_retries(
        &self,
        call: &Call<'_>,
        retries: usize,
    ) -> Result<Vec<u8>, GatewayError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.request(call.method.clone(), call.url.clone());
            if let Some(token) = call.token {
                request = request.bearer_auth(token);
            }
            request = match &call.body {
                Some(Body::Json(bytes)) => request
                    .header(CONTENT_TYPE, "application/json")
                    .body(bytes.clone()),
                Some(Body::Form(encoded)) => request
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(encoded.clone()),
                None => request,
            };

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|err| GatewayError::from_reqwest(&err))?;
                    if status.is_success() {
                        debug!(status = status.as_u16(), bytes = body.len(), "backend call ok");
                        return Ok(body.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying backend call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    let message = error_detail(&body)
                        .unwrap_or_else(|| format!("request failed with status {status}"));
                    return Err(GatewayError::Http {
                        status: status.as_u16(),
                        message,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < retries
                    {
                        warn!(error = %err, attempt, "retrying backend call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(GatewayError::from_reqwest(&err));
                }
            }
        }
    }

    async fn get(&self, path: &str, token: Option<&str>) -> Result<Vec<u8>, GatewayError> {
        let mut call = Call::new(Method::GET, self.endpoint(path)?);
        if let Some(token) = token {
            call = call.bearer(token);
        }
        self.send(call).await
    }

    /// DELETE that maps 404 to `false`.
    async fn delete(&self, path: &str, token: &str) -> Result<bool, GatewayError> {
        let call = Call::new(Method::DELETE, self.endpoint(path)?).bearer(token);
        match self.send(call).await {
            Ok(_) => Ok(true),
            Err(GatewayError::Http { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl MarketplaceBackend for HttpGateway {
    async fn list_services(&self, filters: &ServiceFilters) -> Result<Vec<Service>, GatewayError> {
        let mut url = self.endpoint("services/")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(category) = filters.category.as_deref().filter(|c| !c.is_empty()) {
                query.append_pair("category", category);
            }
            if let Some(search) = filters.search.as_deref().filter(|s| !s.is_empty()) {
                query.append_pair("search", search);
            }
            if let Some(skip) = filters.skip {
                query.append_pair("skip", &skip.to_string());
            }
            if let Some(limit) = filters.limit {
                query.append_pair("limit", &limit.to_string());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        let body = self.send(Call::new(Method::GET, url)).await?;
        Ok(decode_services(&body)?)
    }

    async fn get_service(&self, id: ServiceId) -> Result<Service, GatewayError> {
        let body = self.get(&format!("services/{id}"), None).await?;
        Ok(decode_service(&body)?)
    }

    async fn create_service(
        &self,
        token: &str,
        draft: &ServiceDraft,
    ) -> Result<Service, GatewayError> {
        let payload = WireServiceCreate::from_draft(draft).ok_or_else(|| {
            GatewayError::Transport("service draft has no location to send".to_string())
        })?;
        let call = Call::new(Method::POST, self.endpoint("services/")?)
            .bearer(token)
            .json(&payload)?;
        Ok(decode_service(&self.send(call).await?)?)
    }

    async fn update_service(
        &self,
        token: &str,
        id: ServiceId,
        patch: &ServicePatch,
    ) -> Result<Service, GatewayError> {
        let call = Call::new(Method::PUT, self.endpoint(&format!("services/{id}"))?)
            .bearer(token)
            .json(&WireServicePatch::from(patch))?;
        Ok(decode_service(&self.send(call).await?)?)
    }

    async fn delete_service(&self, token: &str, id: ServiceId) -> Result<bool, GatewayError> {
        self.delete(&format!("services/{id}"), token).await
    }

    async fn my_services(&self, token: &str) -> Result<Vec<Service>, GatewayError> {
        Ok(decode_services(&self.get("services/me", Some(token)).await?)?)
    }

    async fn list_categories(&self) -> Result<Vec<Category>, GatewayError> {
        Ok(decode_categories(&self.get("categories/", None).await?)?)
    }

    async fn list_reviews(&self, service_id: ServiceId) -> Result<Vec<Review>, GatewayError> {
        let body = self.get(&format!("reviews/service/{service_id}"), None).await?;
        Ok(decode_reviews(&body)?)
    }

    async fn my_reviews(&self, token: &str) -> Result<Vec<Review>, GatewayError> {
        Ok(decode_reviews(&self.get("reviews/me", Some(token)).await?)?)
    }

    async fn create_review(
        &self,
        token: &str,
        review: &NewReview,
    ) -> Result<Review, GatewayError> {
        let call = Call::new(Method::POST, self.endpoint("reviews/")?)
            .bearer(token)
            .json(&WireNewReview::from(review))?;
        Ok(decode_review(&self.send(call).await?)?)
    }

    async fn update_review(
        &self,
        token: &str,
        review_id: i64,
        rating: f64,
    ) -> Result<Review, GatewayError> {
        let call = Call::new(Method::PUT, self.endpoint(&format!("reviews/{review_id}"))?)
            .bearer(token)
            .json(&WireReviewPatch { rating })?;
        Ok(decode_review(&self.send(call).await?)?)
    }

    async fn delete_review(&self, token: &str, review_id: i64) -> Result<bool, GatewayError> {
        self.delete(&format!("reviews/{review_id}"), token).await
    }

    async fn login(&self, email: &str, password: &str) -> Result<String, GatewayError> {
        let call = Call::new(Method::POST, self.endpoint("login/access-token")?)
            .form(&[("username", email.trim()), ("password", password)]);
        let token: WireToken = decode_json(&self.send(call).await?)?;
        if token.access_token.trim().is_empty() {
            return Err(GatewayError::Transport(
                "login response carried an empty access token".to_string(),
            ));
        }
        Ok(token.access_token)
    }

    async fn register(&self, user: &NewUser) -> Result<User, GatewayError> {
        let call =
            Call::new(Method::POST, self.endpoint("users/")?).json(&WireNewUser::from(user))?;
        Ok(decode_user(&self.send(call).await?)?)
    }

    async fn current_user(&self, token: &str) -> Result<User, GatewayError> {
        Ok(decode_user(&self.get("users/me", Some(token)).await?)?)
    }

    async fn update_profile(
        &self,
        token: &str,
        patch: &ProfilePatch,
    ) -> Result<User, GatewayError> {
        let call = Call::new(Method::PUT, self.endpoint("users/me")?)
            .bearer(token)
            .json(&WireProfilePatch::from(patch))?;
        Ok(decode_user(&self.send(call).await?)?)
    }
}

/// Reverse geocoding against a Nominatim-style `reverse` endpoint.
#[derive(Debug, Clone)]
pub struct Geocoder {
    client: reqwest::Client,
    endpoint: Url,
}

impl Geocoder {
    pub fn new(endpoint: &str, config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            endpoint: Url::parse(endpoint)
                .with_context(|| format!("parsing geocoder url {endpoint}"))?,
        })
    }

    pub async fn try_reverse(&self, point: GeoPoint) -> Result<Option<String>, GatewayError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("lat", &point.lat.to_string())
            .append_pair("lon", &point.lng.to_string());

        let span = info_span!(
            "reverse_geocode",
            request_id = %Uuid::new_v4(),
            lat = point.lat,
            lng = point.lng
        );
        self.fetch_address(url).instrument(span).await
    }

    async fn fetch_address(&self, url: Url) -> Result<Option<String>, GatewayError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| GatewayError::from_reqwest(&err))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|err| GatewayError::from_reqwest(&err))?;
        if !status.is_success() {
            return Err(GatewayError::Http {
                status: status.as_u16(),
                message: format!("geocoder returned {status}"),
            });
        }
        let parsed: ReverseGeocodeResponse = decode_json(&body)?;
        Ok(parsed.address.as_ref().and_then(format_street_address))
    }

    /// Never fails: lookup problems become a readable fallback string.
    pub async fn reverse(&self, point: GeoPoint) -> String {
        match self.try_reverse(point).await {
            Ok(Some(address)) => address,
            Ok(None) => ADDRESS_UNAVAILABLE.to_string(),
            Err(error) => {
                warn!(%error, "reverse geocoding failed");
                ADDRESS_LOOKUP_FAILED.to_string()
            }
        }
    }
}

/// Where the bearer token survives between runs.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<String>>;
    async fn save(&self, token: &str) -> anyhow::Result<()>;
    async fn clear(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> anyhow::Result<Option<String>> {
        Ok(self.token.lock().await.clone())
    }

    async fn save(&self, token: &str) -> anyhow::Result<()> {
        *self.token.lock().await = Some(token.to_string());
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        *self.token.lock().await = None;
        Ok(())
    }
}

/// One token file per backend, written atomically via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl AsRef<Path>, base_url: &str) -> Self {
        let key = Self::sha256_hex(base_url.trim_end_matches('/').as_bytes());
        Self {
            path: dir.as_ref().join(format!("token-{}", &key[..16])),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> anyhow::Result<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let token = contents.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    async fn save(&self, token: &str) -> anyhow::Result<()> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("token path {} has no parent", self.path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating token directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp token file {}", temp_path.display()))?;
        file.write_all(token.as_bytes())
            .await
            .with_context(|| format!("writing temp token file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp token file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{delete, get, post};
    use axum::{Form, Json, Router};
    use barrio_core::{ContactMethod, PriceModality};
    use tempfile::tempdir;

    fn fixture(name: &str) -> Vec<u8> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/backend")
            .join(name);
        std::fs::read(path).expect("fixture")
    }

    async fn spawn_stub(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("stub server");
        });
        format!("http://{addr}/api/v1")
    }

    fn fast_config() -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("barrio-test".into()),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        }
    }

    async fn unused_base_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/api/v1")
    }

    fn draft() -> ServiceDraft {
        ServiceDraft {
            service_name: "Gasfíter Ñuñoa".into(),
            description: "Reparación de cañerías".into(),
            category: "Gasfíter".into(),
            price: Some(15000.0),
            price_modality: PriceModality::PerService,
            schedule: None,
            address: "Irarrázaval 3000".into(),
            location: Some(GeoPoint::new(-33.4569, -70.5975)),
            contact_method: ContactMethod::Email {
                email: "pedro@example.cl".into(),
            },
        }
    }

    #[tokio::test]
    async fn list_services_sends_filters_and_decodes() {
        let router = Router::new().route(
            "/api/v1/services/",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("category").map(String::as_str), Some("Gasfíter"));
                assert_eq!(params.get("limit").map(String::as_str), Some("20"));
                assert!(!params.contains_key("search"));
                fixture("services.json")
            }),
        );
        let gateway = HttpGateway::new(&spawn_stub(router).await, fast_config()).unwrap();
        let services = gateway
            .list_services(&ServiceFilters {
                category: Some("Gasfíter".into()),
                limit: Some(20),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(services.len(), 4);
        assert_eq!(services[0].id, ServiceId(101));
    }

    #[tokio::test]
    async fn schema_mismatch_is_a_transport_error() {
        let router = Router::new().route(
            "/api/v1/services/",
            get(|| async { r#"[{"id": 1, "service_name": "sin campos"}]"# }),
        );
        let gateway = HttpGateway::new(&spawn_stub(router).await, fast_config()).unwrap();
        let err = gateway
            .list_services(&ServiceFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)), "{err:?}");
    }

    #[tokio::test]
    async fn swallowed_listing_degrades_to_empty_on_transport_failure() {
        let gateway = HttpGateway::new(
            &unused_base_url().await,
            HttpClientConfig {
                backoff: BackoffPolicy::none(),
                ..fast_config()
            },
        )
        .unwrap();
        let outcome = list_services_or_empty(&gateway, &ServiceFilters::default()).await;
        assert!(outcome.is_degraded());
        assert!(matches!(outcome.error(), Some(GatewayError::Transport(_))));
        assert!(outcome.into_value().is_empty());

        let categories = list_categories_or_empty(&gateway).await;
        assert!(categories.value().is_empty());
    }

    #[tokio::test]
    async fn login_posts_form_encoded_credentials() {
        let router = Router::new().route(
            "/api/v1/login/access-token",
            post(
                |headers: HeaderMap, Form(form): Form<HashMap<String, String>>| async move {
                    assert_eq!(
                        headers.get("content-type").and_then(|v| v.to_str().ok()),
                        Some("application/x-www-form-urlencoded")
                    );
                    if form.get("username").map(String::as_str) == Some("ana@example.cl")
                        && form.get("password").map(String::as_str) == Some("s3cret&more")
                    {
                        Json(serde_json::json!({"access_token": "tok-1", "token_type": "bearer"}))
                            .into_response()
                    } else {
                        (
                            AxumStatus::BAD_REQUEST,
                            Json(serde_json::json!({"detail": "Incorrect email or password"})),
                        )
                            .into_response()
                    }
                },
            ),
        );
        let gateway = HttpGateway::new(&spawn_stub(router).await, fast_config()).unwrap();
        assert_eq!(
            gateway.login("ana@example.cl", "s3cret&more").await.unwrap(),
            "tok-1"
        );
        assert_eq!(
            gateway.login("ana@example.cl", "wrong").await.unwrap_err(),
            GatewayError::Http {
                status: 400,
                message: "Incorrect email or password".into()
            }
        );
    }

    #[tokio::test]
    async fn create_service_attaches_bearer_and_flat_payload() {
        let router = Router::new().route(
            "/api/v1/services/",
            post(
                |headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                    if headers.get("authorization").and_then(|v| v.to_str().ok())
                        != Some("Bearer tok-1")
                    {
                        return (
                            AxumStatus::UNAUTHORIZED,
                            Json(serde_json::json!({"detail": "Not authenticated"})),
                        )
                            .into_response();
                    }
                    assert_eq!(body["latitude"], -33.4569);
                    assert_eq!(body["price_modality"], "por_servicio");
                    assert_eq!(body["contact_method"], "email");
                    let mut created = body.clone();
                    created["id"] = 500.into();
                    created["rating"] = 0.0.into();
                    created["total_reviews"] = 0.into();
                    created["user_id"] = 7.into();
                    (AxumStatus::OK, Json(created)).into_response()
                },
            ),
        );
        let gateway = HttpGateway::new(&spawn_stub(router).await, fast_config()).unwrap();
        let created = gateway.create_service("tok-1", &draft()).await.unwrap();
        assert_eq!(created.id, ServiceId(500));
        assert_eq!(created.owner_id, Some(7));

        let err = gateway.create_service("stale", &draft()).await.unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn deleting_a_missing_service_returns_false() {
        let router = Router::new()
            .route("/api/v1/services/{id}", delete(|| async { AxumStatus::NOT_FOUND }))
            .route(
                "/api/v1/reviews/{id}",
                delete(|| async { Json(serde_json::json!({"ok": true})) }),
            );
        let gateway = HttpGateway::new(&spawn_stub(router).await, fast_config()).unwrap();
        assert!(!gateway.delete_service("tok", ServiceId(9)).await.unwrap());
        assert!(gateway.delete_review("tok", 3).await.unwrap());
    }

    #[tokio::test]
    async fn idempotent_reads_retry_on_server_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/api/v1/categories/",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        AxumStatus::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        fixture("categories.json").into_response()
                    }
                }),
            )
            .with_state(hits.clone());
        let gateway = HttpGateway::new(&spawn_stub(router).await, fast_config()).unwrap();
        let categories = gateway.list_categories().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(categories.iter().any(|c| c.name == "Gasfíter"));
    }

    #[tokio::test]
    async fn writes_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/api/v1/reviews/",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::BAD_GATEWAY
                }),
            )
            .with_state(hits.clone());
        let gateway = HttpGateway::new(&spawn_stub(router).await, fast_config()).unwrap();
        let err = gateway
            .create_review(
                "tok",
                &NewReview {
                    service_id: ServiceId(101),
                    rating: 5.0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(502));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hung_requests_time_out_as_transport_errors() {
        let router = Router::new().route(
            "/api/v1/services/{id}",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "{}"
            }),
        );
        let gateway = HttpGateway::new(
            &spawn_stub(router).await,
            HttpClientConfig {
                timeout: Duration::from_millis(100),
                user_agent: None,
                backoff: BackoffPolicy::none(),
            },
        )
        .unwrap();
        let err = gateway.get_service(ServiceId(1)).await.unwrap_err();
        match err {
            GatewayError::Transport(message) => assert!(message.contains("timed out"), "{message}"),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reverse_geocoding_formats_or_falls_back() {
        let router = Router::new().route(
            "/reverse",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("format").map(String::as_str), Some("json"));
                assert!(params.contains_key("lon"));
                Json(serde_json::json!({
                    "address": {
                        "road": "Avenida Providencia",
                        "house_number": "1200",
                        "city": "Santiago"
                    }
                }))
            }),
        );
        let base = spawn_stub(router).await;
        let url = base.replace("/api/v1", "/reverse");
        let geocoder = Geocoder::new(&url, fast_config()).unwrap();
        assert_eq!(
            geocoder.reverse(GeoPoint::new(-33.43, -70.61)).await,
            "Avenida Providencia, 1200, Santiago"
        );

        let broken = Geocoder::new(&unused_base_url().await, fast_config()).unwrap();
        assert_eq!(
            broken.reverse(GeoPoint::new(0.0, 0.0)).await,
            ADDRESS_LOOKUP_FAILED
        );
    }

    #[tokio::test]
    async fn file_token_store_round_trips_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = FileTokenStore::new(dir.path(), "http://127.0.0.1:8000/api/v1/");
        assert_eq!(store.load().await.unwrap(), None);

        store.save("tok-1").await.unwrap();
        store.save("tok-2").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("tok-2"));
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        let same_backend = FileTokenStore::new(dir.path(), "http://127.0.0.1:8000/api/v1");
        assert_eq!(same_backend.path(), store.path());

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_token_store_clears() {
        let store = MemoryTokenStore::new();
        store.save("tok").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("tok"));
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }
}
