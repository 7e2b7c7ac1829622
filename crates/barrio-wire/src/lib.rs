//! Backend wire contracts: snake_case payloads and their translation into the core model.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use barrio_core::{
    Category, ContactMethod, GeoPoint, NewReview, NewUser, PriceModality, ProfilePatch, Review,
    Service, ServiceDraft, ServiceId, ServicePatch, User,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "barrio-wire";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("service {id}: {reason}")]
    Schema { id: i64, reason: String },
    #[error("unknown price modality `{0}`")]
    UnknownPriceModality(String),
    #[error("invalid timestamp `{0}`")]
    Timestamp(String),
}

/// Backend codes for price modalities, paired with the client enum.
const MODALITY_CODES: [(PriceModality, &str); 6] = [
    (PriceModality::PerHour, "por_hora"),
    (PriceModality::PerService, "por_servicio"),
    (PriceModality::PerDay, "por_dia"),
    (PriceModality::PerMonth, "por_mes"),
    (PriceModality::PerProject, "por_proyecto"),
    (PriceModality::Inquire, "consultar"),
];

pub fn modality_code(modality: PriceModality) -> &'static str {
    MODALITY_CODES
        .iter()
        .find(|(m, _)| *m == modality)
        .map(|(_, code)| *code)
        .unwrap_or("consultar")
}

/// Accepts the backend codes and the client's own `per_*` spellings.
pub fn parse_modality(code: &str) -> Result<PriceModality, WireError> {
    let code = code.trim();
    MODALITY_CODES
        .iter()
        .find(|(_, c)| c.eq_ignore_ascii_case(code))
        .map(|(m, _)| *m)
        .or_else(|| PriceModality::parse(&code.to_ascii_lowercase()))
        .ok_or_else(|| WireError::UnknownPriceModality(code.to_string()))
}

/// Timestamps arrive either RFC 3339 or naive (implicitly UTC).
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, WireError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| WireError::Timestamp(value.to_string()))
}

fn parse_optional_timestamp(value: &Option<String>) -> Result<Option<DateTime<Utc>>, WireError> {
    value.as_deref().map(parse_timestamp).transpose()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireOwner {
    pub id: i64,
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireService {
    pub id: i64,
    pub service_name: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub price: Option<f64>,
    pub price_modality: String,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub contact_method: String,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub contact_country_code: Option<String>,
    #[serde(default)]
    pub whatsapp_available: bool,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub total_reviews: u32,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub owner: Option<WireOwner>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl TryFrom<WireService> for Service {
    type Error = WireError;

    fn try_from(wire: WireService) -> Result<Self, Self::Error> {
        let id = wire.id;
        let schema = |reason: &str| WireError::Schema {
            id,
            reason: reason.to_string(),
        };

        let contact_method = match wire.contact_method.trim() {
            "email" => ContactMethod::Email {
                email: non_blank(wire.contact_email)
                    .ok_or_else(|| schema("contact_method is email but contact_email is empty"))?,
            },
            "phone" => ContactMethod::Phone {
                phone: non_blank(wire.contact_phone)
                    .ok_or_else(|| schema("contact_method is phone but contact_phone is empty"))?,
                country_code: non_blank(wire.contact_country_code).unwrap_or_default(),
                whatsapp_available: wire.whatsapp_available,
            },
            other => return Err(schema(&format!("unknown contact_method `{other}`"))),
        };

        let location = match (wire.latitude, wire.longitude) {
            (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
            (None, None) => None,
            _ => return Err(schema("latitude and longitude must be sent together")),
        };

        if let Some(price) = wire.price {
            if !price.is_finite() || price < 0.0 {
                return Err(schema("price must be a non-negative number"));
            }
        }

        Ok(Service {
            id: ServiceId(id),
            service_name: wire.service_name,
            description: wire.description,
            category: wire.category,
            price: wire.price,
            price_modality: parse_modality(&wire.price_modality)?,
            schedule: non_blank(wire.schedule),
            address: wire.address,
            location,
            contact_method,
            rating: wire.rating,
            total_reviews: wire.total_reviews,
            owner_id: wire.owner.as_ref().map(|o| o.id).or(wire.user_id),
            owner_name: wire.owner.map(|o| o.full_name),
            is_active: wire.is_active,
            created_at: parse_optional_timestamp(&wire.created_at)?,
            updated_at: parse_optional_timestamp(&wire.updated_at)?,
            distance_km: None,
        })
    }
}

/// Flat contact columns shared by create and update payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WireContact {
    pub contact_method: String,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_country_code: Option<String>,
    pub whatsapp_available: bool,
}

impl From<&ContactMethod> for WireContact {
    fn from(contact: &ContactMethod) -> Self {
        match contact {
            ContactMethod::Email { email } => WireContact {
                contact_method: "email".into(),
                contact_email: Some(email.trim().to_string()),
                ..Default::default()
            },
            ContactMethod::Phone {
                phone,
                country_code,
                whatsapp_available,
            } => WireContact {
                contact_method: "phone".into(),
                contact_phone: Some(phone.trim().to_string()),
                contact_country_code: Some(country_code.trim().to_string()),
                whatsapp_available: *whatsapp_available,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireServiceCreate {
    pub service_name: String,
    pub description: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub price_modality: &'static str,
    pub schedule: Option<String>,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(flatten)]
    pub contact: WireContact,
}

impl WireServiceCreate {
    /// Drafts without a location never reach the backend; validation rejects them first.
    pub fn from_draft(draft: &ServiceDraft) -> Option<Self> {
        let location = draft.location?;
        Some(Self {
            service_name: draft.service_name.trim().to_string(),
            description: draft.description.trim().to_string(),
            category: draft.category.clone(),
            price: draft.price,
            price_modality: modality_code(draft.price_modality),
            schedule: non_blank(draft.schedule.clone()),
            address: draft.address.trim().to_string(),
            latitude: location.lat,
            longitude: location.lng,
            contact: WireContact::from(&draft.contact_method),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WireServicePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_modality: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whatsapp_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl From<&ServicePatch> for WireServicePatch {
    fn from(patch: &ServicePatch) -> Self {
        let mut wire = WireServicePatch {
            service_name: patch.service_name.clone(),
            description: patch.description.clone(),
            category: patch.category.clone(),
            price: patch.price,
            price_modality: patch.price_modality.map(modality_code),
            schedule: patch.schedule.clone(),
            address: patch.address.clone(),
            latitude: patch.location.map(|l| l.lat),
            longitude: patch.location.map(|l| l.lng),
            is_active: patch.is_active,
            ..Default::default()
        };
        if let Some(contact) = &patch.contact_method {
            let flat = WireContact::from(contact);
            wire.contact_method = Some(flat.contact_method);
            wire.contact_email = flat.contact_email;
            wire.contact_phone = flat.contact_phone;
            wire.contact_country_code = flat.contact_country_code;
            wire.whatsapp_available = Some(flat.whatsapp_available);
        }
        wire
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireUser {
    pub id: i64,
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl TryFrom<WireUser> for User {
    type Error = WireError;

    fn try_from(wire: WireUser) -> Result<Self, Self::Error> {
        Ok(User {
            id: wire.id,
            email: wire.email,
            full_name: wire.full_name,
            phone: non_blank(wire.phone),
            is_active: wire.is_active,
            created_at: parse_optional_timestamp(&wire.created_at)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WireNewUser<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub full_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<&'a str>,
}

impl<'a> From<&'a NewUser> for WireNewUser<'a> {
    fn from(user: &'a NewUser) -> Self {
        Self {
            email: user.email.trim(),
            password: &user.password,
            full_name: user.full_name.trim(),
            phone: user.phone.as_deref().map(str::trim).filter(|p| !p.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WireProfilePatch<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<&'a str>,
}

impl<'a> From<&'a ProfilePatch> for WireProfilePatch<'a> {
    fn from(patch: &'a ProfilePatch) -> Self {
        Self {
            email: patch.email.as_deref(),
            full_name: patch.full_name.as_deref(),
            phone: patch.phone.as_deref(),
            password: patch.password.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireReview {
    pub id: i64,
    pub service_id: i64,
    pub reviewer_user_id: i64,
    pub rating: f64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl TryFrom<WireReview> for Review {
    type Error = WireError;

    fn try_from(wire: WireReview) -> Result<Self, Self::Error> {
        Ok(Review {
            id: wire.id,
            service_id: ServiceId(wire.service_id),
            reviewer_user_id: wire.reviewer_user_id,
            rating: wire.rating,
            created_at: parse_optional_timestamp(&wire.created_at)?,
            updated_at: parse_optional_timestamp(&wire.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WireNewReview {
    pub service_id: i64,
    pub rating: f64,
}

impl From<&NewReview> for WireNewReview {
    fn from(review: &NewReview) -> Self {
        Self {
            service_id: review.service_id.0,
            rating: review.rating,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WireReviewPatch {
    pub rating: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireCategory {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub parent_category: Option<String>,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl From<WireCategory> for Category {
    fn from(wire: WireCategory) -> Self {
        Category {
            id: wire.id,
            name: wire.name,
            parent_category: non_blank(wire.parent_category),
            display_order: wire.display_order,
            is_active: wire.is_active,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// FastAPI error bodies: `{"detail": "..."}` or `{"detail": [{"msg": "..."}, ...]}`.
pub fn error_detail(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Array(items) => {
            let msgs = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect::<Vec<_>>();
            (!msgs.is_empty()).then(|| msgs.join("; "))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReverseGeocodeAddress {
    #[serde(default)]
    pub road: Option<String>,
    #[serde(default)]
    pub house_number: Option<String>,
    #[serde(default)]
    pub suburb: Option<String>,
    #[serde(default)]
    pub quarter: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub town: Option<String>,
    #[serde(default)]
    pub village: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReverseGeocodeResponse {
    #[serde(default)]
    pub address: Option<ReverseGeocodeAddress>,
}

/// `road, house_number, suburb|quarter, city|town|village`, empty parts skipped.
pub fn format_street_address(address: &ReverseGeocodeAddress) -> Option<String> {
    let pick = |fields: &[&Option<String>]| {
        fields
            .iter()
            .find_map(|f| non_blank((*f).clone()))
            .unwrap_or_default()
    };
    let parts = [
        pick(&[&address.road]),
        pick(&[&address.house_number]),
        pick(&[&address.suburb, &address.quarter]),
        pick(&[&address.city, &address.town, &address.village]),
    ];
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    (!joined.is_empty()).then_some(joined)
}

pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn decode_service(bytes: &[u8]) -> Result<Service, WireError> {
    decode_json::<WireService>(bytes)?.try_into()
}

/// Strict: one malformed row rejects the whole page.
pub fn decode_services(bytes: &[u8]) -> Result<Vec<Service>, WireError> {
    decode_json::<Vec<WireService>>(bytes)?
        .into_iter()
        .map(Service::try_from)
        .collect()
}

pub fn decode_user(bytes: &[u8]) -> Result<User, WireError> {
    decode_json::<WireUser>(bytes)?.try_into()
}

pub fn decode_review(bytes: &[u8]) -> Result<Review, WireError> {
    decode_json::<WireReview>(bytes)?.try_into()
}

pub fn decode_reviews(bytes: &[u8]) -> Result<Vec<Review>, WireError> {
    decode_json::<Vec<WireReview>>(bytes)?
        .into_iter()
        .map(Review::try_from)
        .collect()
}

pub fn decode_categories(bytes: &[u8]) -> Result<Vec<Category>, WireError> {
    Ok(decode_json::<Vec<WireCategory>>(bytes)?
        .into_iter()
        .map(Category::from)
        .collect())
}

/// Load a captured `GET /services/` response body and translate it.
pub fn load_services_fixture(path: impl AsRef<Path>) -> Result<Vec<Service>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    decode_services(&bytes).with_context(|| format!("decoding {}", path.display()))
}

pub fn load_categories_fixture(path: impl AsRef<Path>) -> Result<Vec<Category>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    decode_categories(&bytes).with_context(|| format!("decoding {}", path.display()))
}
