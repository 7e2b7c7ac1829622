//! Client engine: service cache, search/filter ranking, session gate and the marketplace facade.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use barrio_core::{
    haversine_km, validate_rating, validate_search_filters, validate_service_draft,
    validate_service_patch, Category, GeoPoint, NewReview, NewUser, ProfilePatch, Review,
    Service, ServiceDraft, ServiceFilters, ServiceId, ServicePatch, Taxonomy, User,
    ValidationError, ValidationErrors, DEFAULT_LOCATION,
};
use barrio_gateway::{
    list_categories_or_empty, list_reviews_or_empty, list_services_or_empty, BackoffPolicy,
    FileTokenStore, GatewayError, Geocoder, HttpClientConfig, HttpGateway, MarketplaceBackend,
    ReadOutcome, TokenStore, ADDRESS_LOOKUP_FAILED,
};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "barrio-engine";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub geocode_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub cache_ttl_secs: u64,
    pub token_dir: PathBuf,
    pub taxonomy_path: Option<PathBuf>,
    pub default_location: GeoPoint,
    pub web_port: u16,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<f64>().ok());
        Self {
            api_base_url: lookup("BARRIO_API_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8000/api/v1".to_string()),
            geocode_url: lookup("BARRIO_GEOCODE_URL")
                .unwrap_or_else(|| "https://nominatim.openstreetmap.org/reverse".to_string()),
            http_timeout_secs: lookup("BARRIO_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            user_agent: lookup("BARRIO_USER_AGENT")
                .unwrap_or_else(|| "barrio-client/0.1".to_string()),
            cache_ttl_secs: lookup("BARRIO_CACHE_TTL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            token_dir: lookup("BARRIO_TOKEN_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./.barrio")),
            taxonomy_path: lookup("BARRIO_TAXONOMY_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            default_location: GeoPoint::new(
                parsed("BARRIO_DEFAULT_LAT").unwrap_or(DEFAULT_LOCATION.lat),
                parsed("BARRIO_DEFAULT_LNG").unwrap_or(DEFAULT_LOCATION.lng),
            ),
            web_port: lookup("BARRIO_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// The YAML override when configured, else the built-in taxonomy.
    pub fn load_taxonomy(&self) -> Result<Taxonomy> {
        match &self.taxonomy_path {
            Some(path) => load_taxonomy_yaml(path),
            None => Ok(Taxonomy::default()),
        }
    }
}

pub fn load_taxonomy_yaml(path: impl AsRef<Path>) -> Result<Taxonomy> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading taxonomy {}", path.display()))?;
    let taxonomy: Taxonomy =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    anyhow::ensure!(
        !taxonomy.is_empty(),
        "taxonomy {} defines no categories",
        path.display()
    );
    Ok(taxonomy)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarketError {
    #[error("{0}")]
    Validation(#[from] ValidationErrors),
    #[error("you must be logged in to {0}")]
    Auth(String),
    #[error("{message}")]
    Http { status: u16, message: String },
    #[error("could not reach the marketplace: {0}")]
    Transport(String),
}

impl From<GatewayError> for MarketError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Http { status, message } => MarketError::Http { status, message },
            GatewayError::Transport(message) => MarketError::Transport(message),
        }
    }
}

impl From<ValidationError> for MarketError {
    fn from(err: ValidationError) -> Self {
        MarketError::Validation(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Empty,
    Loading,
    Populated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Within the freshness window; nothing fetched.
    Fresh,
    /// Another load is in flight; the current snapshot stands.
    AlreadyLoading,
    Loaded { degraded: bool },
}

#[derive(Debug, Default)]
struct CacheInner {
    services: Vec<Service>,
    last_load: Option<Instant>,
    stale: bool,
    reference: Option<GeoPoint>,
}

/// Clears an in-flight flag when the owning future finishes or is dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// In-memory service list with a freshness window and single-entry patching.
pub struct ServiceCache {
    backend: Arc<dyn MarketplaceBackend>,
    ttl: Duration,
    loading: AtomicBool,
    inner: Mutex<CacheInner>,
}

impl ServiceCache {
    pub fn new(backend: Arc<dyn MarketplaceBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            loading: AtomicBool::new(false),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub async fn state(&self) -> CacheState {
        if self.loading.load(Ordering::SeqCst) {
            return CacheState::Loading;
        }
        match self.inner.lock().await.last_load {
            Some(_) => CacheState::Populated,
            None => CacheState::Empty,
        }
    }

    pub async fn ensure_fresh(&self, force: bool) -> Refresh {
        let _guard = {
            let inner = self.inner.lock().await;
            let within_window = inner
                .last_load
                .map(|at| at.elapsed() < self.ttl)
                .unwrap_or(false);
            if !force && !inner.stale && within_window && !inner.services.is_empty() {
                return Refresh::Fresh;
            }
            if self
                .loading
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("service load already in flight");
                return Refresh::AlreadyLoading;
            }
            FlagGuard(&self.loading)
        };

        let outcome = list_services_or_empty(self.backend.as_ref(), &ServiceFilters::default())
            .instrument(info_span!("cache_reload", force))
            .await;
        let degraded = outcome.is_degraded();
        let services = outcome.into_value();

        let mut inner = self.inner.lock().await;
        info!(count = services.len(), degraded, "service cache reloaded");
        inner.services = services;
        inner.last_load = Some(Instant::now());
        inner.stale = false;
        Refresh::Loaded { degraded }
    }

    pub async fn all(&self) -> Vec<Service> {
        self.inner.lock().await.services.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.services.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, id: ServiceId) -> Option<Service> {
        self.inner
            .lock()
            .await
            .services
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Replace the entry with the same id in place, or append.
    pub async fn upsert_one(&self, service: Service) {
        let mut inner = self.inner.lock().await;
        match inner.services.iter_mut().find(|s| s.id == service.id) {
            Some(slot) => *slot = service,
            None => inner.services.push(service),
        }
    }

    /// Swap the entry stored under `old` for `service`, keeping its position.
    pub async fn replace_one(&self, old: ServiceId, service: Service) {
        let mut inner = self.inner.lock().await;
        inner.services.retain(|s| s.id == old || s.id != service.id);
        match inner.services.iter_mut().find(|s| s.id == old) {
            Some(slot) => *slot = service,
            None => inner.services.push(service),
        }
    }

    pub async fn remove_one(&self, id: ServiceId) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.services.len();
        inner.services.retain(|s| s.id != id);
        inner.services.len() != before
    }

    /// Force the next `ensure_fresh` to reload.
    pub async fn invalidate(&self) {
        self.inner.lock().await.stale = true;
    }

    pub async fn set_reference_location(&self, point: Option<GeoPoint>) {
        self.inner.lock().await.reference = point;
    }

    pub async fn reference_location(&self) -> Option<GeoPoint> {
        self.inner.lock().await.reference
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub term: String,
    pub category: Option<String>,
    pub radius_km: Option<f64>,
    pub reference: Option<GeoPoint>,
    /// Filter the current snapshot without a freshness check.
    pub skip_refresh: bool,
}

impl SearchQuery {
    fn category(&self) -> Option<&str> {
        self.category.as_deref().filter(|c| !c.trim().is_empty())
    }

    pub fn validate(&self, taxonomy: &Taxonomy) -> Result<(), ValidationErrors> {
        validate_search_filters(&self.term, self.category(), self.radius_km)?;
        if let Some(category) = self.category() {
            taxonomy.validate_leaf(category)?;
        }
        if let Some(point) = self.reference {
            barrio_core::validate_location(point)?;
        }
        Ok(())
    }
}

/// Text, category and radius filters over a snapshot, ranked by distance when a
/// reference point is known. Without one the snapshot order is kept.
pub fn filter_and_rank(services: &[Service], query: &SearchQuery) -> Vec<Service> {
    let term = query.term.trim().to_lowercase();
    let category = query.category();

    let mut hits = services
        .iter()
        .filter(|s| {
            term.is_empty()
                || s.service_name.to_lowercase().contains(&term)
                || s.description.to_lowercase().contains(&term)
        })
        .filter(|s| category.map_or(true, |c| s.category == c))
        .cloned()
        .map(|mut s| {
            s.distance_km = query
                .reference
                .zip(s.location)
                .map(|(from, to)| haversine_km(from, to));
            s
        })
        .filter(|s| match (query.radius_km, s.distance_km) {
            (Some(radius), Some(distance)) => distance <= radius,
            _ => true,
        })
        .collect::<Vec<_>>();

    if query.reference.is_some() {
        hits.sort_by(|a, b| match (a.distance_km, b.distance_km) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }
    hits
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResults {
    pub sequence: u64,
    pub services: Vec<Service>,
}

/// Runs searches over the cache and numbers them so superseded results can be dropped.
pub struct SearchEngine {
    cache: Arc<ServiceCache>,
    taxonomy: RwLock<Taxonomy>,
    sequence: AtomicU64,
}

impl SearchEngine {
    pub fn new(cache: Arc<ServiceCache>, taxonomy: Taxonomy) -> Self {
        Self {
            cache,
            taxonomy: RwLock::new(taxonomy),
            sequence: AtomicU64::new(0),
        }
    }

    pub async fn taxonomy(&self) -> Taxonomy {
        self.taxonomy.read().await.clone()
    }

    pub async fn set_taxonomy(&self, taxonomy: Taxonomy) {
        *self.taxonomy.write().await = taxonomy;
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResults, ValidationErrors> {
        query.validate(&*self.taxonomy.read().await)?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        if !query.skip_refresh {
            self.cache.ensure_fresh(false).await;
        }
        let snapshot = self.cache.all().await;
        let services = filter_and_rank(&snapshot, query);
        debug!(
            sequence,
            matched = services.len(),
            of = snapshot.len(),
            "search pass"
        );
        Ok(SearchResults { sequence, services })
    }

    pub fn is_current(&self, sequence: u64) -> bool {
        self.sequence.load(Ordering::SeqCst) == sequence
    }

    /// `None` when another search was issued while this one was running.
    pub async fn search_latest(
        &self,
        query: &SearchQuery,
    ) -> Result<Option<SearchResults>, ValidationErrors> {
        let results = self.search(query).await?;
        if self.is_current(results.sequence) {
            Ok(Some(results))
        } else {
            debug!(sequence = results.sequence, "discarding superseded search");
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AuthFailure {
    pub message: String,
}

impl AuthFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<GatewayError> for AuthFailure {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Http { message, .. } => AuthFailure::new(message),
            GatewayError::Transport(detail) => {
                AuthFailure::new(format!("could not reach the marketplace: {detail}"))
            }
        }
    }
}

#[derive(Debug, Default)]
struct SessionInner {
    token: Option<String>,
    user: Option<User>,
}

/// Bearer token and cached profile. The token is mirrored into a [`TokenStore`].
pub struct Session {
    backend: Arc<dyn MarketplaceBackend>,
    tokens: Arc<dyn TokenStore>,
    authenticating: AtomicBool,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(backend: Arc<dyn MarketplaceBackend>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            backend,
            tokens,
            authenticating: AtomicBool::new(false),
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// Pick up a token persisted by an earlier run. The profile is fetched lazily.
    pub async fn restore(&self) -> Result<bool> {
        let token = self.tokens.load().await.context("loading persisted token")?;
        let mut inner = self.inner.lock().await;
        inner.token = token;
        inner.user = None;
        Ok(inner.token.is_some())
    }

    pub async fn state(&self) -> SessionState {
        let inner = self.inner.lock().await;
        if inner.token.is_some() {
            SessionState::Authenticated
        } else if self.authenticating.load(Ordering::SeqCst) {
            SessionState::Authenticating
        } else {
            SessionState::Anonymous
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.lock().await.token.is_some()
    }

    pub async fn token(&self) -> Option<String> {
        self.inner.lock().await.token.clone()
    }

    pub async fn cached_user(&self) -> Option<User> {
        self.inner.lock().await.user.clone()
    }

    /// Fails fast, without touching the network, when there is no token.
    pub async fn require_token(&self, action: &str) -> Result<String, MarketError> {
        self.token()
            .await
            .ok_or_else(|| MarketError::Auth(action.to_string()))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User, AuthFailure> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AuthFailure::new("email and password are required"));
        }
        self.authenticating.store(true, Ordering::SeqCst);
        let _authenticating = FlagGuard(&self.authenticating);

        let result = async {
            let token = self.backend.login(email, password).await?;
            let user = self.backend.current_user(&token).await?;
            Ok::<_, GatewayError>((token, user))
        }
        .instrument(info_span!("login"))
        .await;

        let (token, user) = match result {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "login failed");
                return Err(err.into());
            }
        };

        {
            let mut inner = self.inner.lock().await;
            inner.token = Some(token.clone());
            inner.user = Some(user.clone());
        }
        if let Err(error) = self.tokens.save(&token).await {
            warn!(error = %error, "could not persist bearer token");
        }
        info!(user_id = user.id, "logged in");
        Ok(user)
    }

    /// Create the account, then log straight in with the same credentials.
    pub async fn register(&self, user: &NewUser) -> Result<User, AuthFailure> {
        if !barrio_core::looks_like_email(&user.email) {
            return Err(AuthFailure::new("a valid email address is required"));
        }
        if user.full_name.trim().is_empty() {
            return Err(AuthFailure::new("full name is required"));
        }
        self.backend.register(user).await.map_err(|err| {
            warn!(error = %err, "registration failed");
            AuthFailure::from(err)
        })?;
        self.login(&user.email, &user.password).await
    }

    pub async fn logout(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.token = None;
            inner.user = None;
        }
        if let Err(error) = self.tokens.clear().await {
            warn!(error = %error, "could not drop persisted token");
        }
        info!("logged out");
    }

    /// Cached profile unless `force`; a failed fetch ends the session.
    pub async fn current_user(&self, force: bool) -> Option<User> {
        let (token, cached) = {
            let inner = self.inner.lock().await;
            (inner.token.clone(), inner.user.clone())
        };
        let token = token?;
        if !force {
            if let Some(user) = cached {
                return Some(user);
            }
        }
        match self.backend.current_user(&token).await {
            Ok(user) => {
                self.inner.lock().await.user = Some(user.clone());
                Some(user)
            }
            Err(error) => {
                warn!(%error, "profile fetch failed; treating token as expired");
                self.logout().await;
                None
            }
        }
    }

    async fn set_user(&self, user: User) {
        self.inner.lock().await.user = Some(user);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapMarker {
    pub id: ServiceId,
    pub lat: f64,
    pub lng: f64,
    pub title: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

/// Markers for the map widget; services without a location stay in the list only.
pub fn map_markers(services: &[Service]) -> Vec<MapMarker> {
    services
        .iter()
        .filter_map(|s| {
            let point = s.location?;
            Some(MapMarker {
                id: s.id,
                lat: point.lat,
                lng: point.lng,
                title: s.service_name.clone(),
                category: s.category.clone(),
                distance_km: s.distance_km,
            })
        })
        .collect()
}

/// Average rating per service computed from a review listing.
pub fn average_ratings(reviews: &[Review]) -> HashMap<ServiceId, f64> {
    let mut sums: HashMap<ServiceId, (f64, u32)> = HashMap::new();
    for review in reviews {
        let entry = sums.entry(review.service_id).or_default();
        entry.0 += review.rating;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(id, (sum, n))| (id, sum / f64::from(n)))
        .collect()
}

/// Owns the cache, search engine and session, and routes mutations through all three.
pub struct Marketplace {
    backend: Arc<dyn MarketplaceBackend>,
    cache: Arc<ServiceCache>,
    search: SearchEngine,
    session: Session,
    geocoder: Option<Geocoder>,
}

impl Marketplace {
    pub fn new(
        backend: Arc<dyn MarketplaceBackend>,
        tokens: Arc<dyn TokenStore>,
        cache_ttl: Duration,
        taxonomy: Taxonomy,
    ) -> Self {
        let cache = Arc::new(ServiceCache::new(backend.clone(), cache_ttl));
        Self {
            search: SearchEngine::new(cache.clone(), taxonomy),
            session: Session::new(backend.clone(), tokens),
            backend,
            cache,
            geocoder: None,
        }
    }

    pub fn with_geocoder(mut self, geocoder: Geocoder) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// HTTP backend, file token store and geocoder wired from configuration.
    pub async fn from_config(config: &ClientConfig) -> Result<Self> {
        let http = config.http_client_config();
        let backend = Arc::new(HttpGateway::new(&config.api_base_url, http.clone())?);
        let tokens = Arc::new(FileTokenStore::new(&config.token_dir, &config.api_base_url));
        let geocoder = Geocoder::new(&config.geocode_url, http)?;

        let market = Self::new(backend, tokens, config.cache_ttl(), config.load_taxonomy()?)
            .with_geocoder(geocoder);
        market
            .cache
            .set_reference_location(Some(config.default_location))
            .await;
        if market.session.restore().await? {
            debug!("restored persisted session token");
        }
        Ok(market)
    }

    pub fn cache(&self) -> &ServiceCache {
        &self.cache
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn search_engine(&self) -> &SearchEngine {
        &self.search
    }

    pub async fn set_reference_location(&self, point: Option<GeoPoint>) {
        self.cache.set_reference_location(point).await;
    }

    fn with_reference(&self, mut query: SearchQuery, reference: Option<GeoPoint>) -> SearchQuery {
        if query.reference.is_none() {
            query.reference = reference;
        }
        query
    }

    /// Search, defaulting the reference point to the cache's.
    pub async fn search(&self, query: SearchQuery) -> Result<SearchResults, MarketError> {
        let query = self.with_reference(query, self.cache.reference_location().await);
        Ok(self.search.search(&query).await?)
    }

    pub async fn search_latest(
        &self,
        query: SearchQuery,
    ) -> Result<Option<SearchResults>, MarketError> {
        let query = self.with_reference(query, self.cache.reference_location().await);
        Ok(self.search.search_latest(&query).await?)
    }

    pub async fn service(&self, id: ServiceId) -> Result<Service, MarketError> {
        Ok(self.backend.get_service(id).await?)
    }

    pub async fn categories(&self) -> ReadOutcome<Vec<Category>> {
        list_categories_or_empty(self.backend.as_ref()).await
    }

    /// Adopt the backend's category list as the taxonomy when it is usable.
    pub async fn refresh_taxonomy(&self) -> bool {
        let outcome = self.categories().await;
        if outcome.is_degraded() {
            return false;
        }
        let taxonomy = Taxonomy::from_categories(outcome.value());
        if taxonomy.is_empty() {
            return false;
        }
        self.search.set_taxonomy(taxonomy).await;
        true
    }

    pub async fn reviews(&self, service_id: ServiceId) -> ReadOutcome<Vec<Review>> {
        list_reviews_or_empty(self.backend.as_ref(), service_id).await
    }

    pub async fn reverse_geocode(&self, point: GeoPoint) -> String {
        match &self.geocoder {
            Some(geocoder) => geocoder.reverse(point).await,
            None => ADDRESS_LOOKUP_FAILED.to_string(),
        }
    }

    /// A 401 on a gated call ends the session and marks the cache stale.
    async fn gated<T>(&self, result: Result<T, GatewayError>) -> Result<T, MarketError> {
        if let Err(err) = &result {
            if err.is_unauthorized() {
                warn!(error = %err, "bearer token rejected; logging out");
                self.session.logout().await;
                self.cache.invalidate().await;
            }
        }
        Ok(result?)
    }

    pub async fn publish(&self, draft: &ServiceDraft) -> Result<Service, MarketError> {
        let token = self.session.require_token("publish a service").await?;
        validate_service_draft(draft, &self.search.taxonomy().await)?;

        let now = Utc::now();
        let provisional = ServiceId::provisional(now);
        let owner = self.session.cached_user().await;
        self.cache
            .upsert_one(draft.to_provisional(provisional, owner.as_ref(), now))
            .await;

        match self.backend.create_service(&token, draft).await {
            Ok(service) => {
                info!(id = %service.id, "service published");
                self.cache.replace_one(provisional, service.clone()).await;
                Ok(service)
            }
            Err(err) => {
                self.cache.remove_one(provisional).await;
                self.gated(Err(err)).await
            }
        }
    }

    pub async fn update(
        &self,
        id: ServiceId,
        patch: &ServicePatch,
    ) -> Result<Service, MarketError> {
        let token = self.session.require_token("edit a service").await?;
        validate_service_patch(patch, &self.search.taxonomy().await)?;
        let service = self
            .gated(self.backend.update_service(&token, id, patch).await)
            .await?;
        self.cache.upsert_one(service.clone()).await;
        Ok(service)
    }

    /// `false` when the service was already gone; the cache drops it either way.
    pub async fn delete(&self, id: ServiceId) -> Result<bool, MarketError> {
        let token = self.session.require_token("delete a service").await?;
        let deleted = self
            .gated(self.backend.delete_service(&token, id).await)
            .await?;
        self.cache.remove_one(id).await;
        Ok(deleted)
    }

    pub async fn my_services(&self) -> Result<Vec<Service>, MarketError> {
        let token = self.session.require_token("list your services").await?;
        self.gated(self.backend.my_services(&token).await).await
    }

    pub async fn my_reviews(&self) -> Result<Vec<Review>, MarketError> {
        let token = self.session.require_token("list your reviews").await?;
        self.gated(self.backend.my_reviews(&token).await).await
    }

    /// Review a service and refresh its cached rating.
    pub async fn rate(&self, service_id: ServiceId, rating: f64) -> Result<Review, MarketError> {
        let token = self.session.require_token("review a service").await?;
        validate_rating(rating)?;
        let review = NewReview { service_id, rating };
        let created = self
            .gated(self.backend.create_review(&token, &review).await)
            .await?;
        self.refresh_one(service_id).await;
        Ok(created)
    }

    pub async fn update_review(
        &self,
        review_id: i64,
        rating: f64,
    ) -> Result<Review, MarketError> {
        let token = self.session.require_token("edit a review").await?;
        validate_rating(rating)?;
        let review = self
            .gated(self.backend.update_review(&token, review_id, rating).await)
            .await?;
        self.refresh_one(review.service_id).await;
        Ok(review)
    }

    pub async fn delete_review(&self, review_id: i64) -> Result<bool, MarketError> {
        let token = self.session.require_token("delete a review").await?;
        self.gated(self.backend.delete_review(&token, review_id).await)
            .await
    }

    pub async fn update_profile(&self, patch: &ProfilePatch) -> Result<User, MarketError> {
        let token = self.session.require_token("update your profile").await?;
        if let Some(email) = patch.email.as_deref() {
            if !barrio_core::looks_like_email(email) {
                return Err(ValidationError::Contact(format!(
                    "`{}` is not a valid email address",
                    email.trim()
                ))
                .into());
            }
        }
        let user = self
            .gated(self.backend.update_profile(&token, patch).await)
            .await?;
        self.session.set_user(user.clone()).await;
        Ok(user)
    }

    async fn refresh_one(&self, id: ServiceId) {
        if self.cache.get(id).await.is_none() {
            return;
        }
        match self.backend.get_service(id).await {
            Ok(service) => self.cache.upsert_one(service).await,
            Err(error) => warn!(%error, %id, "could not refresh cached service"),
        }
    }
}
