//! Multi-strategy response normalizer. The upstream platform answers the
//! package-listing endpoint with whatever it feels like that day: a JSON
//! document, a server-rendered page with an inline state payload, or plain
//! HTML. Strategies are tried in order and the first hit wins; every
//! strategy emits the same normalized shape so downstream code never learns
//! which one fired.

use crate::coerce::{field_f64, field_non_empty, field_or, field_positive_f64, field_u32};
use crate::models::{
    NormalizedBatch, NormalizedParcel, NormalizedProduct, ParsedFrom, PriceSource,
};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Currency-origin heuristic constants. Inferred from upstream behaviour,
/// not a documented contract; overridable via env for that reason.
#[derive(Debug, Clone)]
pub struct CurrencyTuning {
    /// A rate above this is read as strong→weak (e.g. USD→CNY), meaning the
    /// raw price is quoted in the weak currency.
    pub strong_weak_threshold: f64,
    /// Divisor applied when only an explicit weak-currency marker is present.
    pub weak_fallback_ratio: f64,
    /// Reference-currency prices above this are discarded as garbage.
    pub price_ceiling: f64,
    pub weak_currency_code: String,
}

impl Default for CurrencyTuning {
    fn default() -> Self {
        Self {
            strong_weak_threshold: 1.5,
            weak_fallback_ratio: 7.2,
            price_ceiling: 100_000.0,
            weak_currency_code: "CNY".into(),
        }
    }
}

impl CurrencyTuning {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |key: &str, fallback: f64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| *v > 0.0)
                .unwrap_or(fallback)
        };
        Self {
            strong_weak_threshold: read("CURRENCY_STRONG_WEAK_THRESHOLD", defaults.strong_weak_threshold),
            weak_fallback_ratio: read("CURRENCY_WEAK_FALLBACK_RATIO", defaults.weak_fallback_ratio),
            price_ceiling: read("PRICE_SANITY_CEILING", defaults.price_ceiling),
            weak_currency_code: std::env::var("CURRENCY_WEAK_CODE")
                .unwrap_or(defaults.weak_currency_code),
        }
    }
}

/// Convert a raw upstream price into the reference currency.
///
/// Priority: an embedded rate above the threshold marks the price as quoted
/// in the weak currency (divide by it); an explicit weak-currency marker
/// divides by the fallback ratio; otherwise the price is taken as base
/// currency and multiplied by the USD→reference rate (embedded when
/// plausible, live otherwise). `None` means the result blew the sanity
/// ceiling and must be discarded.
pub fn price_to_reference(
    raw: f64,
    embedded_rate: Option<f64>,
    currency_marker: Option<&str>,
    live_rate: f64,
    tuning: &CurrencyTuning,
) -> Option<f64> {
    let converted = match embedded_rate {
        Some(rate) if rate > tuning.strong_weak_threshold => raw / rate,
        plausible => {
            let marks_weak = currency_marker
                .map(|code| code.trim().eq_ignore_ascii_case(&tuning.weak_currency_code))
                .unwrap_or(false);
            if marks_weak {
                raw / tuning.weak_fallback_ratio
            } else {
                raw * plausible.filter(|r| *r > 0.0).unwrap_or(live_rate)
            }
        }
    };
    (converted <= tuning.price_ceiling).then_some(converted)
}

/// Run the strategy chain over a raw response body.
pub fn normalize_response(body: &str, live_rate: f64, tuning: &CurrencyTuning) -> NormalizedBatch {
    let strategies: [fn(&str, f64, &CurrencyTuning) -> Option<NormalizedBatch>; 3] =
        [parse_json_body, parse_script_payload, parse_dom];
    for strategy in strategies {
        if let Some(batch) = strategy(body, live_rate, tuning) {
            debug!(
                target = "parcelsync.normalize",
                source = ?batch.source,
                parcels = batch.parcels.len(),
                products = batch.products.len(),
                "strategy matched"
            );
            return batch;
        }
    }
    debug!(target = "parcelsync.normalize", "all strategies exhausted");
    NormalizedBatch::empty()
}

// --- strategy 1: whole-body JSON ---

fn parse_json_body(body: &str, live_rate: f64, tuning: &CurrencyTuning) -> Option<NormalizedBatch> {
    let trimmed = body.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let list = package_list(&value)?;
    Some(extract_from_list(list, live_rate, tuning, ParsedFrom::Json))
}

fn package_list(value: &Value) -> Option<&Vec<Value>> {
    value
        .pointer("/data/package/listResult")
        .and_then(Value::as_array)
        .or_else(|| value.pointer("/packageList").and_then(Value::as_array))
        .or_else(|| value.pointer("/listResult").and_then(Value::as_array))
        .or_else(|| value.as_array())
}

fn extract_from_list(
    list: &[Value],
    live_rate: f64,
    tuning: &CurrencyTuning,
    source: ParsedFrom,
) -> NormalizedBatch {
    let mut seen = HashSet::new();
    let mut parcels = Vec::new();
    let mut products = Vec::new();

    for entry in list {
        let external_id = field_non_empty(entry, "packageNo")
            .or_else(|| field_non_empty(entry, "packageId"));
        let Some(external_id) = external_id else {
            continue;
        };
        // within one response the platform repeats parcels freely
        if !seen.insert(external_id.clone()) {
            continue;
        }

        let info = entry.get("packageInfo").cloned().unwrap_or(Value::Null);
        let package_rate = field_positive_f64(&info, "exchangeRate")
            .or_else(|| field_positive_f64(entry, "exchangeRate"));
        let package_marker = field_non_empty(&info, "currencyCode")
            .or_else(|| field_non_empty(entry, "currencyCode"));

        let (raw_price, mut price_source) = parcel_raw_price(&info);
        let total_price = match price_to_reference(
            raw_price,
            package_rate,
            package_marker.as_deref(),
            live_rate,
            tuning,
        ) {
            Some(price) => price,
            None => {
                price_source = PriceSource::Unknown;
                0.0
            }
        };

        let status_raw = field_or(&info, "packageStatusName", "Pending");
        parcels.push(NormalizedParcel {
            external_id: external_id.clone(),
            tracking_number: field_non_empty(&info, "deliveryNo"),
            carrier: field_or(&info, "expressName", "Unknown"),
            weight: field_f64(&info, "packageRealWeight"),
            status_raw: status_raw.clone(),
            total_price,
            price_source,
        });

        let Some(items) = entry.get("orderItems").and_then(Value::as_array) else {
            continue;
        };
        for item in items {
            let Some(item_id) = field_non_empty(item, "itemBarcode") else {
                continue;
            };
            let item_rate = field_positive_f64(item, "exchangeRate").or(package_rate);
            let item_marker =
                field_non_empty(item, "currency").or_else(|| package_marker.clone());
            let raw_unit = field_f64(item, "unitPrice");
            let (price, item_source) = match price_to_reference(
                raw_unit,
                item_rate,
                item_marker.as_deref(),
                live_rate,
                tuning,
            ) {
                Some(price) => (price, PriceSource::Listed),
                None => (0.0, PriceSource::Unknown),
            };

            let product = NormalizedProduct {
                external_id: item_id,
                name: field_or(item, "goodsName", "Unknown"),
                brand: field_non_empty(item, "brandName"),
                category: field_non_empty(item, "categoryName"),
                photo_urls: item_photos(item),
                price,
                price_source: item_source,
                weight: field_f64(item, "weight"),
                parcel_external_id: external_id.clone(),
                status_raw: status_raw.clone(),
            };

            // legacy duplication: a line with count = n is n identical records
            let count = field_u32(item, "count").max(1);
            for _ in 0..count {
                products.push(product.clone());
            }
        }
    }

    NormalizedBatch {
        source: Some(source),
        parcels,
        products,
    }
}

fn parcel_raw_price(info: &Value) -> (f64, PriceSource) {
    if let Some(price) = field_positive_f64(info, "packagePrice") {
        (price, PriceSource::Package)
    } else if let Some(price) = field_positive_f64(info, "realFreight") {
        (price, PriceSource::RealizedFreight)
    } else if let Some(price) = field_positive_f64(info, "standardFreight") {
        (price, PriceSource::StandardFreight)
    } else {
        (0.0, PriceSource::Unknown)
    }
}

fn item_photos(item: &Value) -> Vec<String> {
    if let Some(list) = item.get("qcPhotos").and_then(Value::as_array) {
        let urls: Vec<String> = list
            .iter()
            .filter_map(|photo| match photo {
                Value::String(url) => Some(url.trim().to_string()),
                Value::Object(_) => field_non_empty(photo, "url"),
                _ => None,
            })
            .filter(|url| !url.is_empty())
            .collect();
        if !urls.is_empty() {
            return urls;
        }
    }
    field_non_empty(item, "goodsPic")
        .map(|url| vec![url])
        .unwrap_or_default()
}

// --- strategy 2: embedded script payload ---

static SCRIPT_PAYLOAD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s)(?:window\.__INIT_STATE__|window\.__PKG_DATA__|var\s+pageData)\s*=\s*(\{.*?\})\s*;",
    )
    .expect("script payload pattern")
});

fn parse_script_payload(
    body: &str,
    live_rate: f64,
    tuning: &CurrencyTuning,
) -> Option<NormalizedBatch> {
    let captured = SCRIPT_PAYLOAD_RE.captures(body)?.get(1)?.as_str();
    let value: Value = serde_json::from_str(captured).ok()?;
    let list = package_list(&value)?;
    Some(extract_from_list(list, live_rate, tuning, ParsedFrom::Script))
}

// --- strategy 3: structural scraping ---

static ROW_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(".package-list .package-item, table.package-table tbody tr")
        .expect("row selector")
});
static ITEM_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".order-item").expect("item selector"));

fn parse_dom(body: &str, live_rate: f64, tuning: &CurrencyTuning) -> Option<NormalizedBatch> {
    let document = Html::parse_document(body);
    let mut seen = HashSet::new();
    let mut parcels = Vec::new();
    let mut products = Vec::new();

    for row in document.select(&ROW_SELECTOR) {
        let Some(external_id) = cell_text(&row, ".package-no") else {
            continue;
        };
        if !seen.insert(external_id.clone()) {
            continue;
        }

        let status_raw = cell_text(&row, ".package-status").unwrap_or_else(|| "Pending".into());
        let raw_price = cell_number(&row, ".package-price");
        let (total_price, price_source) = match raw_price {
            Some(price) => match price_to_reference(price, None, None, live_rate, tuning) {
                Some(converted) => (converted, PriceSource::Package),
                None => (0.0, PriceSource::Unknown),
            },
            None => (0.0, PriceSource::Unknown),
        };

        parcels.push(NormalizedParcel {
            external_id: external_id.clone(),
            tracking_number: cell_text(&row, ".tracking-no"),
            carrier: cell_text(&row, ".carrier").unwrap_or_else(|| "Unknown".into()),
            weight: cell_number(&row, ".package-weight").unwrap_or(0.0),
            status_raw: status_raw.clone(),
            total_price,
            price_source,
        });

        for item in row.select(&ITEM_SELECTOR) {
            let Some(item_id) = cell_text(&item, ".item-barcode") else {
                continue;
            };
            let (price, item_source) = match cell_number(&item, ".item-price")
                .and_then(|raw| price_to_reference(raw, None, None, live_rate, tuning))
            {
                Some(converted) => (converted, PriceSource::Listed),
                None => (0.0, PriceSource::Unknown),
            };
            products.push(NormalizedProduct {
                external_id: item_id,
                name: cell_text(&item, ".item-name").unwrap_or_else(|| "Unknown".into()),
                brand: None,
                category: None,
                photo_urls: item_photo_src(&item),
                price,
                price_source: item_source,
                weight: cell_number(&item, ".item-weight").unwrap_or(0.0),
                parcel_external_id: external_id.clone(),
                status_raw: status_raw.clone(),
            });
        }
    }

    if parcels.is_empty() {
        return None;
    }
    Some(NormalizedBatch {
        source: Some(ParsedFrom::Dom),
        parcels,
        products,
    })
}

fn cell_text(scope: &ElementRef<'_>, selector: &str) -> Option<String> {
    let parsed = Selector::parse(selector).ok()?;
    let text = scope
        .select(&parsed)
        .next()?
        .text()
        .collect::<Vec<_>>()
        .join(" ");
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!cleaned.is_empty()).then_some(cleaned)
}

fn cell_number(scope: &ElementRef<'_>, selector: &str) -> Option<f64> {
    let text = cell_text(scope, selector)?;
    let cleaned: String = text
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '.' || *ch == '-')
        .collect();
    cleaned.parse::<f64>().ok()
}

fn item_photo_src(scope: &ElementRef<'_>) -> Vec<String> {
    let Ok(selector) = Selector::parse("img.item-photo") else {
        return Vec::new();
    };
    scope
        .select(&selector)
        .filter_map(|img| img.value().attr("src"))
        .map(|src| src.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tuning() -> CurrencyTuning {
        CurrencyTuning::default()
    }

    const LISTING_BODY: &str = r#"{"data":{"package":{"listResult":[
        {"packageNo":"PN1","packageInfo":{"packageStatusName":"shipped","packageRealWeight":"500","packagePrice":"12.5"},
         "orderItems":[{"itemBarcode":"B1","goodsName":"Widget","unitPrice":35.9,"count":1,"weight":"100"}]}
    ]}}}"#;

    #[test]
    fn reference_example_normalizes_via_json_strategy() {
        let batch = normalize_response(LISTING_BODY, 0.9, &tuning());
        assert_eq!(batch.source, Some(ParsedFrom::Json));
        assert_eq!(batch.parcels.len(), 1);
        let parcel = &batch.parcels[0];
        assert_eq!(parcel.external_id, "PN1");
        assert_eq!(parcel.status_raw, "shipped");
        assert_eq!(parcel.weight, 500.0);
        assert!((parcel.total_price - 11.25).abs() < 1e-9);
        assert_eq!(parcel.price_source, PriceSource::Package);

        assert_eq!(batch.products.len(), 1);
        let product = &batch.products[0];
        assert_eq!(product.external_id, "B1");
        assert_eq!(product.parcel_external_id, "PN1");
        assert!(product.price > 0.0);
    }

    #[test]
    fn repeated_parcels_deduplicate_within_one_response() {
        let body = json!({"data": {"package": {"listResult": [
            {"packageNo": "PN1", "packageInfo": {"packageStatusName": "shipped"}},
            {"packageNo": "PN1", "packageInfo": {"packageStatusName": "received"}},
            {"packageNo": "PN2", "packageInfo": {}},
        ]}}})
        .to_string();
        let batch = normalize_response(&body, 0.9, &tuning());
        assert_eq!(batch.parcels.len(), 2);
        assert_eq!(batch.parcels[0].status_raw, "shipped");
    }

    #[test]
    fn count_multiplies_into_identical_records() {
        let body = json!({"data": {"package": {"listResult": [
            {"packageNo": "PN1", "packageInfo": {},
             "orderItems": [{"itemBarcode": "B1", "goodsName": "Socks", "unitPrice": 4.0, "count": 3}]},
        ]}}})
        .to_string();
        let batch = normalize_response(&body, 1.0, &tuning());
        assert_eq!(batch.products.len(), 3);
        assert!(batch.products.iter().all(|p| p.external_id == "B1"));
    }

    #[test]
    fn freight_fields_back_up_missing_package_price() {
        let body = json!({"data": {"package": {"listResult": [
            {"packageNo": "A", "packageInfo": {"realFreight": 8.0}},
            {"packageNo": "B", "packageInfo": {"standardFreight": 6.0}},
            {"packageNo": "C", "packageInfo": {}},
        ]}}})
        .to_string();
        let batch = normalize_response(&body, 1.0, &tuning());
        assert_eq!(batch.parcels[0].price_source, PriceSource::RealizedFreight);
        assert_eq!(batch.parcels[1].price_source, PriceSource::StandardFreight);
        assert_eq!(batch.parcels[2].price_source, PriceSource::Unknown);
        assert_eq!(batch.parcels[2].total_price, 0.0);
    }

    #[test]
    fn strong_weak_rate_divides_the_raw_price() {
        // rate 7.2 > 1.5 means the 72.0 is quoted in the weak currency
        let price = price_to_reference(72.0, Some(7.2), None, 0.9, &tuning()).unwrap();
        assert!((price - 10.0).abs() < 1e-9);
    }

    #[test]
    fn weak_currency_marker_uses_fallback_ratio() {
        let price = price_to_reference(72.0, None, Some("CNY"), 0.9, &tuning()).unwrap();
        assert!((price - 10.0).abs() < 1e-9);
    }

    #[test]
    fn plain_price_converts_with_live_rate() {
        let price = price_to_reference(10.0, None, Some("USD"), 0.9, &tuning()).unwrap();
        assert!((price - 9.0).abs() < 1e-9);
    }

    #[test]
    fn embedded_plausible_rate_beats_live_rate() {
        let price = price_to_reference(10.0, Some(0.8), None, 0.9, &tuning()).unwrap();
        assert!((price - 8.0).abs() < 1e-9);
    }

    #[test]
    fn ceiling_breach_discards_to_zero_with_unknown_source() {
        let body = json!({"data": {"package": {"listResult": [
            {"packageNo": "PN1", "packageInfo": {"packagePrice": 900000.0}},
        ]}}})
        .to_string();
        let batch = normalize_response(&body, 1.0, &tuning());
        assert_eq!(batch.parcels[0].total_price, 0.0);
        assert_eq!(batch.parcels[0].price_source, PriceSource::Unknown);
    }

    #[test]
    fn qc_photos_preferred_then_primary_image_then_empty() {
        let body = json!({"data": {"package": {"listResult": [
            {"packageNo": "P", "packageInfo": {}, "orderItems": [
                {"itemBarcode": "A", "qcPhotos": ["u1", {"url": "u2"}], "goodsPic": "primary"},
                {"itemBarcode": "B", "qcPhotos": [], "goodsPic": "primary"},
                {"itemBarcode": "C"},
            ]},
        ]}}})
        .to_string();
        let batch = normalize_response(&body, 1.0, &tuning());
        assert_eq!(batch.products[0].photo_urls, vec!["u1", "u2"]);
        assert_eq!(batch.products[1].photo_urls, vec!["primary"]);
        assert!(batch.products[2].photo_urls.is_empty());
    }

    #[test]
    fn script_payload_strategy_fires_on_html_with_inline_state() {
        let body = format!(
            "<html><head><script>window.__INIT_STATE__ = {} ;</script></head><body></body></html>",
            json!({"data": {"package": {"listResult": [
                {"packageNo": "PN9", "packageInfo": {"packageStatusName": "packing"}},
            ]}}})
        );
        let batch = normalize_response(&body, 0.9, &tuning());
        assert_eq!(batch.source, Some(ParsedFrom::Script));
        assert_eq!(batch.parcels[0].external_id, "PN9");
    }

    #[test]
    fn dom_strategy_scrapes_rows_with_safe_defaults() {
        let body = r#"<html><body><div class="package-list">
            <div class="package-item">
                <span class="package-no">PN7</span>
                <span class="package-weight">350 g</span>
                <div class="order-item">
                    <span class="item-barcode">IT1</span>
                    <img class="item-photo" src="http://img/1.jpg"/>
                </div>
            </div>
        </div></body></html>"#;
        let batch = normalize_response(body, 0.9, &tuning());
        assert_eq!(batch.source, Some(ParsedFrom::Dom));
        let parcel = &batch.parcels[0];
        assert_eq!(parcel.external_id, "PN7");
        assert_eq!(parcel.carrier, "Unknown");
        assert_eq!(parcel.status_raw, "Pending");
        assert_eq!(parcel.weight, 350.0);
        let product = &batch.products[0];
        assert_eq!(product.name, "Unknown");
        assert_eq!(product.photo_urls, vec!["http://img/1.jpg"]);
    }

    #[test]
    fn exhausted_strategies_yield_an_empty_batch_not_an_error() {
        let batch = normalize_response("<html><body>maintenance</body></html>", 0.9, &tuning());
        assert!(batch.is_empty());
        assert_eq!(batch.source, None);
    }
}
