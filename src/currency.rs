//! Process-lifetime cache of the USD→reference spot rate. One instance is
//! constructed at startup and shared by reference; callers racing a stale
//! entry may trigger a duplicate fetch, which is harmless.

use crate::http::build_client;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// Returned instead of a live rate whenever the FX collaborator fails.
pub const STATIC_FALLBACK_RATE: f64 = 0.95;

const CACHE_TTL_HOURS: i64 = 12;

#[derive(Debug, Error)]
pub enum CurrencyError {
    #[error("rate request failed: {0}")]
    Request(String),
    #[error("invalid rate response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait RateFetcher: Send + Sync {
    async fn fetch_rate(&self) -> Result<f64, CurrencyError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    rate: f64,
    fetched_at: DateTime<Utc>,
}

pub struct CurrencyCache {
    fetcher: Box<dyn RateFetcher>,
    clock: Box<dyn Clock>,
    entry: Mutex<Option<CacheEntry>>,
}

impl CurrencyCache {
    pub fn new(fetcher: Box<dyn RateFetcher>) -> Self {
        Self::with_clock(fetcher, Box::new(SystemClock))
    }

    pub fn with_clock(fetcher: Box<dyn RateFetcher>, clock: Box<dyn Clock>) -> Self {
        Self {
            fetcher,
            clock,
            entry: Mutex::new(None),
        }
    }

    /// Cached rate when fresh; otherwise one fetch attempt. A failed fetch
    /// returns the static fallback and leaves the cache untouched so the
    /// next caller retries immediately rather than in twelve hours.
    pub async fn get_rate(&self) -> f64 {
        let now = self.clock.now();
        if let Some(entry) = *self.entry.lock().expect("currency cache poisoned")
            && now - entry.fetched_at < Duration::hours(CACHE_TTL_HOURS)
        {
            return entry.rate;
        }

        match self.fetcher.fetch_rate().await {
            Ok(rate) if rate.is_finite() && rate > 0.0 => {
                *self.entry.lock().expect("currency cache poisoned") = Some(CacheEntry {
                    rate,
                    fetched_at: now,
                });
                rate
            }
            Ok(rate) => {
                warn!(
                    target = "parcelsync.currency",
                    rate, "non-positive rate from collaborator, using fallback"
                );
                STATIC_FALLBACK_RATE
            }
            Err(err) => {
                warn!(
                    target = "parcelsync.currency",
                    error = %err,
                    "rate fetch failed, using fallback"
                );
                STATIC_FALLBACK_RATE
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct FxResponse {
    rates: FxRates,
}

#[derive(Debug, Deserialize)]
struct FxRates {
    #[serde(rename = "EUR")]
    eur: Option<f64>,
}

/// GET against a public USD-base rate endpoint returning `{rates: {EUR: n}}`.
pub struct HttpRateFetcher {
    http: Client,
    endpoint: String,
}

impl HttpRateFetcher {
    pub fn from_env() -> Self {
        let endpoint = std::env::var("FX_RATE_URL")
            .unwrap_or_else(|_| "https://open.er-api.com/v6/latest/USD".into());
        Self {
            http: build_client(),
            endpoint,
        }
    }
}

#[async_trait]
impl RateFetcher for HttpRateFetcher {
    async fn fetch_rate(&self) -> Result<f64, CurrencyError> {
        let response = self
            .http
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|err| CurrencyError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CurrencyError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let payload: FxResponse = response
            .json()
            .await
            .map_err(|err| CurrencyError::InvalidResponse(err.to_string()))?;

        payload
            .rates
            .eur
            .filter(|rate| rate.is_finite() && *rate > 0.0)
            .ok_or_else(|| CurrencyError::InvalidResponse("missing EUR rate".into()))
    }
}
