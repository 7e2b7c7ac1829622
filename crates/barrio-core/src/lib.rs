//! Core domain model, category taxonomy, geodesic distance and client-side validation for Barrio.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;

pub const CRATE_NAME: &str = "barrio-core";

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Default map centre (Santiago, Chile) used when no reference location is known.
pub const DEFAULT_LOCATION: GeoPoint = GeoPoint {
    lat: -33.4489,
    lng: -70.6693,
};

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_in_range(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Great-circle distance in kilometres (haversine, mean Earth radius).
///
/// Out-of-range coordinates are not rejected; range checks belong to the caller.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlng / 2.0).sin().powi(2);
    // Rounding can push `h` a hair outside [0, 1] for antipodal points.
    let h = h.clamp(0.0, 1.0);

    EARTH_RADIUS_KM * 2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Backend-assigned service id. Negative values are provisional client-side ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub i64);

impl ServiceId {
    /// Temporary id for an entry the server has not confirmed yet.
    pub fn provisional(at: DateTime<Utc>) -> Self {
        Self(-at.timestamp_millis().max(1))
    }

    pub fn is_provisional(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceModality {
    PerHour,
    PerService,
    PerDay,
    PerMonth,
    PerProject,
    Inquire,
}

impl PriceModality {
    pub const ALL: [PriceModality; 6] = [
        PriceModality::PerHour,
        PriceModality::PerService,
        PriceModality::PerDay,
        PriceModality::PerMonth,
        PriceModality::PerProject,
        PriceModality::Inquire,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriceModality::PerHour => "per_hour",
            PriceModality::PerService => "per_service",
            PriceModality::PerDay => "per_day",
            PriceModality::PerMonth => "per_month",
            PriceModality::PerProject => "per_project",
            PriceModality::Inquire => "inquire",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == value)
    }
}

/// How a provider wants to be reached. Exactly one branch is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ContactMethod {
    Email {
        email: String,
    },
    Phone {
        phone: String,
        #[serde(rename = "countryCode")]
        country_code: String,
        #[serde(rename = "whatsappAvailable", default)]
        whatsapp_available: bool,
    },
}

impl ContactMethod {
    /// Label safe to show before the contact value is revealed.
    pub fn public_label(&self) -> &'static str {
        match self {
            ContactMethod::Email { .. } => "Contact by email",
            ContactMethod::Phone {
                whatsapp_available: true,
                ..
            } => "Contact by phone or WhatsApp",
            ContactMethod::Phone { .. } => "Contact by phone",
        }
    }

    /// Country code followed by the digits of the local number, e.g. `+56912345678`.
    pub fn international_number(&self) -> Option<String> {
        match self {
            ContactMethod::Phone {
                phone,
                country_code,
                ..
            } => Some(format!("{}{}", country_code.trim(), digits_only(phone))),
            ContactMethod::Email { .. } => None,
        }
    }

    /// `wa.me` deep link, only for phone contacts that accept WhatsApp.
    pub fn whatsapp_url(&self, message: Option<&str>) -> Option<String> {
        let ContactMethod::Phone {
            whatsapp_available: true,
            ..
        } = self
        else {
            return None;
        };
        let digits = digits_only(&self.international_number()?);
        let mut url = url::Url::parse(&format!("https://wa.me/{digits}")).ok()?;
        if let Some(text) = message.filter(|m| !m.trim().is_empty()) {
            url.query_pairs_mut().append_pair("text", text);
        }
        Some(url.to_string())
    }
}

fn digits_only(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// A published service as the client sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: ServiceId,
    pub service_name: String,
    pub description: String,
    pub category: String,
    pub price: Option<f64>,
    pub price_modality: PriceModality,
    pub schedule: Option<String>,
    pub address: String,
    pub location: Option<GeoPoint>,
    pub contact_method: ContactMethod,
    pub rating: f64,
    pub total_reviews: u32,
    pub owner_id: Option<i64>,
    pub owner_name: Option<String>,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Kilometres from the reference location of the search pass that produced this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

/// Fields a provider submits when publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDraft {
    pub service_name: String,
    pub description: String,
    pub category: String,
    pub price: Option<f64>,
    pub price_modality: PriceModality,
    #[serde(default)]
    pub schedule: Option<String>,
    pub address: String,
    pub location: Option<GeoPoint>,
    pub contact_method: ContactMethod,
}

impl ServiceDraft {
    /// Cache entry shown while the create request is in flight.
    pub fn to_provisional(
        &self,
        id: ServiceId,
        owner: Option<&User>,
        now: DateTime<Utc>,
    ) -> Service {
        Service {
            id,
            service_name: self.service_name.trim().to_string(),
            description: self.description.trim().to_string(),
            category: self.category.clone(),
            price: self.price,
            price_modality: self.price_modality,
            schedule: self.schedule.clone(),
            address: self.address.trim().to_string(),
            location: self.location,
            contact_method: self.contact_method.clone(),
            rating: 0.0,
            total_reviews: 0,
            owner_id: owner.map(|u| u.id),
            owner_name: owner.map(|u| u.full_name.clone()),
            is_active: true,
            created_at: Some(now),
            updated_at: None,
            distance_km: None,
        }
    }
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePatch {
    pub service_name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
    pub price_modality: Option<PriceModality>,
    pub schedule: Option<String>,
    pub address: Option<String>,
    pub location: Option<GeoPoint>,
    pub contact_method: Option<ContactMethod>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFilters {
    pub category: Option<String>,
    pub search: Option<String>,
    pub skip: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub email: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: i64,
    pub service_id: ServiceId,
    pub reviewer_user_id: i64,
    pub rating: f64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReview {
    pub service_id: ServiceId,
    pub rating: f64,
}

/// Category row as served by the backend: a leaf names its group in `parent_category`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub parent_category: Option<String>,
    pub display_order: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryGroup {
    pub name: String,
    pub leaves: Vec<String>,
}

/// Two-level category taxonomy: group -> concrete service names (leaves).
///
/// Services carry a leaf value in `category`; filtering only ever matches leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub groups: Vec<CategoryGroup>,
}

const DEFAULT_TAXONOMY: &[(&str, &[&str])] = &[
    (
        "Servicios del hogar",
        &[
            "Electricista",
            "Gasfíter",
            "Pintor",
            "Jardinero",
            "Aseador de hogar",
            "Carpintero",
            "Cerrajero",
        ],
    ),
    (
        "Construcción y mantenimiento",
        &[
            "Maestro en construcción",
            "Instalador de pisos y cerámicas",
            "Soldador",
            "Técnico en refrigeración",
            "Técnico en lavadoras",
        ],
    ),
    (
        "Tecnología y computación",
        &[
            "Técnico en computación",
            "Reparador de celulares",
            "Programador web",
            "Instalador de cámaras de seguridad",
        ],
    ),
    (
        "Transporte y mudanzas",
        &[
            "Chofer particular",
            "Servicio de mudanza",
            "Repartidor",
            "Moto delivery",
            "Flete local",
        ],
    ),
    (
        "Cuidado personal y bienestar",
        &["Peluquero", "Manicurista", "Barbero", "Esteticista", "Podólogo"],
    ),
    (
        "Cuidado familiar y mascotas",
        &[
            "Niñera",
            "Cuidadores de adultos mayores",
            "Paseador de perros",
            "Entrenador canino",
            "Veterinario a domicilio",
        ],
    ),
];

const SUGGESTION_THRESHOLD: f64 = 0.85;

impl Default for Taxonomy {
    fn default() -> Self {
        Self {
            groups: DEFAULT_TAXONOMY
                .iter()
                .map(|(name, leaves)| CategoryGroup {
                    name: name.to_string(),
                    leaves: leaves.iter().map(|l| l.to_string()).collect(),
                })
                .collect(),
        }
    }
}

impl Taxonomy {
    /// Build from backend category rows. Inactive rows are skipped and groups keep
    /// the order of their first leaf by `display_order`.
    pub fn from_categories(categories: &[Category]) -> Self {
        let mut rows = categories.iter().filter(|c| c.is_active).collect::<Vec<_>>();
        rows.sort_by_key(|c| c.display_order);

        let mut groups: Vec<CategoryGroup> = Vec::new();
        for row in rows {
            let Some(parent) = row.parent_category.as_deref() else {
                continue;
            };
            match groups.iter_mut().find(|g| g.name == parent) {
                Some(group) => group.leaves.push(row.name.clone()),
                None => groups.push(CategoryGroup {
                    name: parent.to_string(),
                    leaves: vec![row.name.clone()],
                }),
            }
        }
        Self { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.leaves.is_empty())
    }

    pub fn leaves(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .flat_map(|g| g.leaves.iter().map(String::as_str))
    }

    pub fn is_leaf(&self, value: &str) -> bool {
        self.leaves().any(|l| l == value)
    }

    pub fn group(&self, name: &str) -> Option<&CategoryGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn group_of(&self, leaf: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|g| g.leaves.iter().any(|l| l == leaf))
            .map(|g| g.name.as_str())
    }

    /// Closest leaf by Jaro-Winkler similarity, if any is close enough to be a typo.
    pub fn suggest_leaf(&self, value: &str) -> Option<&str> {
        let needle = value.to_lowercase();
        self.leaves()
            .map(|leaf| (leaf, jaro_winkler(&needle, &leaf.to_lowercase())))
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(leaf, _)| leaf)
    }

    /// Accept only leaf-level category strings. Group names are rejected explicitly so a
    /// caller never silently filters on a value no service carries.
    pub fn validate_leaf(&self, value: &str) -> Result<(), ValidationError> {
        if self.is_leaf(value) {
            return Ok(());
        }
        if let Some(group) = self.group(value) {
            return Err(ValidationError::CategoryGroup {
                value: value.to_string(),
                leaves: group.leaves.clone(),
            });
        }
        Err(ValidationError::UnknownCategory {
            value: value.to_string(),
            suggestion: self.suggest_leaf(value).map(ToString::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },
    #[error("{field} must be at least {min} characters")]
    TooShort { field: &'static str, min: usize },
    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
    },
    #[error("price must be a non-negative number")]
    InvalidPrice,
    #[error("invalid contact method: {0}")]
    Contact(String),
    #[error("`{value}` is a category group; choose one of: {}", .leaves.join(", "))]
    CategoryGroup { value: String, leaves: Vec<String> },
    #[error("unknown category `{value}`{}", suggestion_suffix(.suggestion))]
    UnknownCategory {
        value: String,
        suggestion: Option<String>,
    },
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean `{s}`?)"),
        None => String::new(),
    }
}

/// Every failure found in one validation pass.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", join_messages(.0))]
pub struct ValidationErrors(pub Vec<ValidationError>);

fn join_messages(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<ValidationError> for ValidationErrors {
    fn from(err: ValidationError) -> Self {
        Self(vec![err])
    }
}

fn check_text(
    errors: &mut Vec<ValidationError>,
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) {
    let len = value.trim().chars().count();
    if len == 0 {
        errors.push(ValidationError::Required { field });
    } else if len < min {
        errors.push(ValidationError::TooShort { field, min });
    } else if len > max {
        errors.push(ValidationError::TooLong { field, max });
    }
}

pub fn validate_service_draft(
    draft: &ServiceDraft,
    taxonomy: &Taxonomy,
) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();

    check_text(&mut errors, "service name", &draft.service_name, 3, 100);
    check_text(&mut errors, "description", &draft.description, 10, 500);

    if draft.category.trim().is_empty() {
        errors.push(ValidationError::Required { field: "category" });
    } else if let Err(err) = taxonomy.validate_leaf(&draft.category) {
        errors.push(err);
    }

    match draft.price {
        Some(price) if !price.is_finite() || price < 0.0 => {
            errors.push(ValidationError::InvalidPrice)
        }
        None if draft.price_modality != PriceModality::Inquire => {
            errors.push(ValidationError::Required { field: "price" })
        }
        _ => {}
    }

    if let Some(schedule) = &draft.schedule {
        if schedule.trim().chars().count() > 100 {
            errors.push(ValidationError::TooLong {
                field: "schedule",
                max: 100,
            });
        }
    }

    match draft.location {
        None => errors.push(ValidationError::Required { field: "location" }),
        Some(point) => {
            if let Err(invalid) = validate_location(point) {
                errors.extend(invalid.0);
            }
        }
    }

    check_text(&mut errors, "address", &draft.address, 1, 200);

    if let Err(contact) = validate_contact_method(&draft.contact_method) {
        errors.extend(contact.0);
    }

    ValidationErrors(errors).into_result()
}

/// Same rules as [`validate_service_draft`], applied only to the fields the patch sets.
pub fn validate_service_patch(
    patch: &ServicePatch,
    taxonomy: &Taxonomy,
) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();

    if let Some(name) = &patch.service_name {
        check_text(&mut errors, "service name", name, 3, 100);
    }
    if let Some(description) = &patch.description {
        check_text(&mut errors, "description", description, 10, 500);
    }
    if let Some(category) = &patch.category {
        if let Err(err) = taxonomy.validate_leaf(category) {
            errors.push(err);
        }
    }
    if let Some(price) = patch.price {
        if !price.is_finite() || price < 0.0 {
            errors.push(ValidationError::InvalidPrice);
        }
    }
    if let Some(schedule) = &patch.schedule {
        if schedule.trim().chars().count() > 100 {
            errors.push(ValidationError::TooLong {
                field: "schedule",
                max: 100,
            });
        }
    }
    if let Some(address) = &patch.address {
        check_text(&mut errors, "address", address, 1, 200);
    }
    if let Some(point) = patch.location {
        if let Err(location) = validate_location(point) {
            errors.extend(location.0);
        }
    }
    if let Some(contact) = &patch.contact_method {
        if let Err(contact) = validate_contact_method(contact) {
            errors.extend(contact.0);
        }
    }

    ValidationErrors(errors).into_result()
}

pub fn validate_location(point: GeoPoint) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();
    if !point.lat.is_finite() || !(-90.0..=90.0).contains(&point.lat) {
        errors.push(ValidationError::OutOfRange {
            field: "latitude",
            min: -90.0,
            max: 90.0,
        });
    }
    if !point.lng.is_finite() || !(-180.0..=180.0).contains(&point.lng) {
        errors.push(ValidationError::OutOfRange {
            field: "longitude",
            min: -180.0,
            max: 180.0,
        });
    }
    ValidationErrors(errors).into_result()
}

pub fn looks_like_email(value: &str) -> bool {
    let value = value.trim();
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain
            .split_once('.')
            .map(|(head, tail)| !head.is_empty() && !tail.is_empty())
            .unwrap_or(false)
}

pub fn validate_contact_method(contact: &ContactMethod) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();
    match contact {
        ContactMethod::Email { email } => {
            if email.trim().is_empty() {
                errors.push(ValidationError::Required { field: "email" });
            } else if !looks_like_email(email) {
                errors.push(ValidationError::Contact(format!(
                    "`{}` is not a valid email address",
                    email.trim()
                )));
            }
        }
        ContactMethod::Phone {
            phone,
            country_code,
            ..
        } => {
            let digits = digits_only(phone);
            let code = country_code.trim();
            if phone.trim().is_empty() {
                errors.push(ValidationError::Required { field: "phone" });
            } else if !code.starts_with('+')
                || code.len() < 2
                || !code[1..].chars().all(|c| c.is_ascii_digit())
            {
                errors.push(ValidationError::Contact(
                    "phone numbers need a country code such as +56".to_string(),
                ));
            } else if digits.len() < 7 {
                errors.push(ValidationError::Contact(
                    "phone number must have at least 7 digits".to_string(),
                ));
            } else if digits.len() > 15 {
                errors.push(ValidationError::Contact(
                    "phone number must have at most 15 digits".to_string(),
                ));
            }
        }
    }
    ValidationErrors(errors).into_result()
}

pub const MAX_SEARCH_TERM_CHARS: usize = 100;
pub const MAX_CATEGORY_CHARS: usize = 50;
pub const MAX_RADIUS_KM: f64 = 100.0;

pub fn validate_search_filters(
    term: &str,
    category: Option<&str>,
    radius_km: Option<f64>,
) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();
    if term.chars().count() > MAX_SEARCH_TERM_CHARS {
        errors.push(ValidationError::TooLong {
            field: "search term",
            max: MAX_SEARCH_TERM_CHARS,
        });
    }
    if let Some(category) = category {
        if category.chars().count() > MAX_CATEGORY_CHARS {
            errors.push(ValidationError::TooLong {
                field: "category",
                max: MAX_CATEGORY_CHARS,
            });
        }
    }
    if let Some(radius) = radius_km {
        if !radius.is_finite() || !(0.0..=MAX_RADIUS_KM).contains(&radius) {
            errors.push(ValidationError::OutOfRange {
                field: "radius",
                min: 0.0,
                max: MAX_RADIUS_KM,
            });
        }
    }
    ValidationErrors(errors).into_result()
}

pub fn validate_rating(rating: f64) -> Result<(), ValidationError> {
    if rating.is_finite() && (1.0..=5.0).contains(&rating) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field: "rating",
            min: 1.0,
            max: 5.0,
        })
    }
}
