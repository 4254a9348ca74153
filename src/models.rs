use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One upstream cookie as captured from the browser session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

/// Ordered cookie set shared across sync runs for one owner.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CookieJar {
    pub cookies: Vec<Cookie>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl CookieJar {
    pub fn from_cookies(cookies: Vec<Cookie>) -> Self {
        Self {
            cookies,
            last_used_at: Some(Utc::now()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// Per-owner upstream credential. `secret` is opaque ciphertext produced by
/// the credential cipher collaborator, carried base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub owner_id: String,
    pub identifier: String,
    pub secret: String,
    pub cookie_jar: CookieJar,
}

/// Which parsing strategy produced a normalized batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsedFrom {
    Json,
    Script,
    Dom,
}

/// Where a reference-currency price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Package,
    RealizedFreight,
    StandardFreight,
    Listed,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedParcel {
    pub external_id: String,
    pub tracking_number: Option<String>,
    pub carrier: String,
    pub weight: f64,
    pub status_raw: String,
    pub total_price: f64,
    pub price_source: PriceSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedProduct {
    pub external_id: String,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub photo_urls: Vec<String>,
    pub price: f64,
    pub price_source: PriceSource,
    pub weight: f64,
    pub parcel_external_id: String,
    pub status_raw: String,
}

/// Strategy-agnostic normalizer output. `source` is `None` only when every
/// strategy was exhausted, in which case both lists are empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedBatch {
    pub source: Option<ParsedFrom>,
    pub parcels: Vec<NormalizedParcel>,
    pub products: Vec<NormalizedProduct>,
}

impl NormalizedBatch {
    pub fn empty() -> Self {
        Self {
            source: None,
            parcels: Vec::new(),
            products: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parcels.is_empty() && self.products.is_empty()
    }
}

/// Canonical shipment status; upstream wording never reaches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanonicalStatus {
    Pending,
    #[serde(rename = "In Transit")]
    InTransit,
    Delivered,
    Returned,
    #[serde(rename = "Cancelled/Lost")]
    CancelledOrLost,
}

impl CanonicalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Pending => "Pending",
            CanonicalStatus::InTransit => "In Transit",
            CanonicalStatus::Delivered => "Delivered",
            CanonicalStatus::Returned => "Returned",
            CanonicalStatus::CancelledOrLost => "Cancelled/Lost",
        }
    }
}

impl std::fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParcelRow {
    pub id: Uuid,
    pub owner_id: String,
    pub external_id: String,
    pub tracking_number: Option<String>,
    pub carrier: String,
    pub weight: f64,
    pub status: CanonicalStatus,
    pub total_price: f64,
    pub price_per_unit: f64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentState {
    #[default]
    None,
    Pending,
    Done,
    Failed,
    Conflict,
}

/// A ranked interpretation attached to a `conflict` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentCandidate {
    pub provisional_id: String,
    pub confidence: f32,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnrichmentRecord {
    pub state: EnrichmentState,
    #[serde(default)]
    pub candidates: Vec<EnrichmentCandidate>,
    pub model: Option<String>,
    pub source: Option<String>,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRow {
    pub id: Uuid,
    pub owner_id: String,
    pub external_id: String,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub photo_urls: Vec<String>,
    pub price: f64,
    pub weight: f64,
    pub parcel_id: Uuid,
    pub status: CanonicalStatus,
    #[serde(default)]
    pub enrichment: EnrichmentRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `totalPrice / weight` when the weight is positive, else zero.
pub fn price_per_unit(total_price: f64, weight: f64) -> f64 {
    if weight > 0.0 {
        (total_price / weight).max(0.0)
    } else {
        0.0
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EnrichmentSummary {
    pub done: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub skipped: usize,
    pub aborted: bool,
}

/// Single verdict for one sync run. Partial enrichment still counts as
/// success; reconciliation is idempotent and resumes on the next run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub owner_id: String,
    pub parcels_count: usize,
    pub orders_count: usize,
    pub message: String,
    pub enrichment: EnrichmentSummary,
    pub stages: Vec<StageReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_per_unit_divides_when_weight_positive() {
        assert!((price_per_unit(11.25, 500.0) - 0.0225).abs() < 1e-9);
    }

    #[test]
    fn price_per_unit_zero_weight_yields_zero() {
        assert_eq!(price_per_unit(42.0, 0.0), 0.0);
    }

    #[test]
    fn price_per_unit_never_negative() {
        assert_eq!(price_per_unit(-5.0, 2.0), 0.0);
    }

    #[test]
    fn cookie_jar_from_cookies_stamps_last_used() {
        let jar = CookieJar::from_cookies(vec![Cookie {
            name: "sid".into(),
            value: "abc".into(),
            domain: ".example.com".into(),
        }]);
        assert!(!jar.is_empty());
        assert!(jar.last_used_at.is_some());
        assert!(CookieJar::default().is_empty());
    }
}
