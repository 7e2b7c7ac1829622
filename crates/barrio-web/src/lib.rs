//! Local JSON API over the marketplace engine, for a map page to consume.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use barrio_core::{
    validate_location, GeoPoint, ProfilePatch, Review, Service, ServiceDraft, ServiceId,
    ServicePatch, Taxonomy,
};
use barrio_engine::{
    average_ratings, map_markers, ClientConfig, MapMarker, MarketError, Marketplace, Refresh,
    SearchQuery,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "barrio-web";

pub struct AppState {
    pub market: Marketplace,
}

impl AppState {
    pub fn new(market: Marketplace) -> Self {
        Self { market }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub radius_km: Option<f64>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub cached: Option<bool>,
}

impl SearchParams {
    fn into_query(self) -> SearchQuery {
        SearchQuery {
            term: self.term.unwrap_or_default(),
            category: self.category.filter(|c| !c.trim().is_empty()),
            radius_km: self.radius_km,
            reference: self.lat.zip(self.lng).map(|(lat, lng)| GeoPoint::new(lat, lng)),
            skip_refresh: self.cached.unwrap_or(false),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    sequence: u64,
    count: usize,
    services: Vec<Service>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceDetail {
    #[serde(flatten)]
    service: Service,
    contact_label: &'static str,
    whatsapp_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewsResponse {
    reviews: Vec<Review>,
    average: Option<f64>,
    degraded: bool,
}

#[derive(Debug, Deserialize)]
struct Credentials {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RatingBody {
    rating: f64,
}

#[derive(Debug, Deserialize)]
struct PointParams {
    lat: f64,
    lng: f64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/services", get(search_handler).post(publish_handler))
        .route("/api/services/mine", get(my_services_handler))
        .route(
            "/api/services/{id}",
            get(service_detail_handler)
                .put(update_handler)
                .delete(delete_handler),
        )
        .route(
            "/api/services/{id}/reviews",
            get(reviews_handler).post(rate_handler),
        )
        .route("/api/reviews/mine", get(my_reviews_handler))
        .route(
            "/api/reviews/{id}",
            axum::routing::put(update_review_handler).delete(delete_review_handler),
        )
        .route("/api/markers", get(markers_handler))
        .route("/api/categories", get(categories_handler))
        .route("/api/taxonomy", get(taxonomy_handler))
        .route("/api/geocode", get(geocode_handler))
        .route("/api/session", get(session_handler).delete(logout_handler))
        .route("/api/session/login", post(login_handler))
        .route("/api/profile", axum::routing::put(profile_handler))
        .route("/api/cache/refresh", post(refresh_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ClientConfig::from_env();
    let market = Marketplace::from_config(&config).await?;
    serve(&config, market).await
}

/// Serve an already wired marketplace on the configured port.
pub async fn serve(config: &ClientConfig, market: Marketplace) -> anyhow::Result<()> {
    if config.taxonomy_path.is_none() && !market.refresh_taxonomy().await {
        debug!("backend categories unavailable; keeping built-in taxonomy");
    }
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, api = %config.api_base_url, "serving marketplace api");
    axum::serve(listener, app(AppState::new(market))).await?;
    Ok(())
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    match state.market.search(params.into_query()).await {
        Ok(results) => Json(SearchResponse {
            sequence: results.sequence,
            count: results.services.len(),
            services: results.services,
        })
        .into_response(),
        Err(err) => market_error(err),
    }
}

async fn markers_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    match state.market.search(params.into_query()).await {
        Ok(results) => Json::<Vec<MapMarker>>(map_markers(&results.services)).into_response(),
        Err(err) => market_error(err),
    }
}

async fn service_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.market.service(ServiceId(id)).await {
        Ok(service) => {
            let whatsapp_url = service.contact_method.whatsapp_url(Some(&format!(
                "Hola, vi tu servicio \"{}\"",
                service.service_name
            )));
            Json(ServiceDetail {
                contact_label: service.contact_method.public_label(),
                whatsapp_url,
                service,
            })
            .into_response()
        }
        Err(err) => market_error(err),
    }
}

async fn reviews_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    let service_id = ServiceId(id);
    let outcome = state.market.reviews(service_id).await;
    let degraded = outcome.is_degraded();
    let reviews = outcome.into_value();
    let average = average_ratings(&reviews).get(&service_id).copied();
    Json(ReviewsResponse {
        reviews,
        average,
        degraded,
    })
    .into_response()
}

async fn categories_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state.market.categories().await;
    let degraded = outcome.is_degraded();
    Json(json!({ "categories": outcome.into_value(), "degraded": degraded })).into_response()
}

async fn taxonomy_handler(State(state): State<Arc<AppState>>) -> Response {
    Json::<Taxonomy>(state.market.search_engine().taxonomy().await).into_response()
}

async fn geocode_handler(
    State(state): State<Arc<AppState>>,
    Query(point): Query<PointParams>,
) -> Response {
    let point = GeoPoint::new(point.lat, point.lng);
    if let Err(errors) = validate_location(point) {
        return market_error(errors.into());
    }
    let address = state.market.reverse_geocode(point).await;
    Json(json!({ "address": address })).into_response()
}

async fn session_handler(State(state): State<Arc<AppState>>) -> Response {
    let session = state.market.session();
    let user = session.current_user(false).await;
    Json(json!({ "authenticated": session.is_authenticated().await, "user": user }))
        .into_response()
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(credentials): Json<Credentials>,
) -> Response {
    match state
        .market
        .session()
        .login(&credentials.email, &credentials.password)
        .await
    {
        Ok(user) => Json(user).into_response(),
        Err(failure) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": failure.message })),
        )
            .into_response(),
    }
}

async fn logout_handler(State(state): State<Arc<AppState>>) -> Response {
    state.market.session().logout().await;
    StatusCode::NO_CONTENT.into_response()
}

async fn profile_handler(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<ProfilePatch>,
) -> Response {
    match state.market.update_profile(&patch).await {
        Ok(user) => Json(user).into_response(),
        Err(err) => market_error(err),
    }
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<ServiceDraft>,
) -> Response {
    match state.market.publish(&draft).await {
        Ok(service) => (StatusCode::CREATED, Json(service)).into_response(),
        Err(err) => market_error(err),
    }
}

async fn update_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(patch): Json<ServicePatch>,
) -> Response {
    match state.market.update(ServiceId(id), &patch).await {
        Ok(service) => Json(service).into_response(),
        Err(err) => market_error(err),
    }
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.market.delete(ServiceId(id)).await {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(err) => market_error(err),
    }
}

async fn my_services_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.market.my_services().await {
        Ok(services) => Json(services).into_response(),
        Err(err) => market_error(err),
    }
}

async fn rate_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<RatingBody>,
) -> Response {
    match state.market.rate(ServiceId(id), body.rating).await {
        Ok(review) => (StatusCode::CREATED, Json(review)).into_response(),
        Err(err) => market_error(err),
    }
}

async fn my_reviews_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.market.my_reviews().await {
        Ok(reviews) => Json(reviews).into_response(),
        Err(err) => market_error(err),
    }
}

async fn update_review_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<RatingBody>,
) -> Response {
    match state.market.update_review(id, body.rating).await {
        Ok(review) => Json(review).into_response(),
        Err(err) => market_error(err),
    }
}

async fn delete_review_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.market.delete_review(id).await {
        Ok(deleted) => Json(json!({ "deleted": deleted })).into_response(),
        Err(err) => market_error(err),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = match state.market.cache().ensure_fresh(true).await {
        Refresh::Fresh => "fresh",
        Refresh::AlreadyLoading => "already_loading",
        Refresh::Loaded { degraded: false } => "loaded",
        Refresh::Loaded { degraded: true } => "degraded",
    };
    Json(json!({ "refresh": outcome, "count": state.market.cache().len().await })).into_response()
}

fn market_error(err: MarketError) -> Response {
    let status = match &err {
        MarketError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        MarketError::Auth(_) => StatusCode::UNAUTHORIZED,
        MarketError::Http { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        MarketError::Transport(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
