//! One sync run end to end: session, listing fetch, normalization,
//! reconciliation, enrichment. Each stage is timed and transcribed into the
//! final `SyncReport`; the run fails with a stage-tagged error, never a bare
//! string.

use crate::auth::{AuthCheck, AuthConfig, Authenticator};
use crate::browser::{BrowserDriver, BrowserFactory, BrowserMode};
use crate::classifier::Classifier;
use crate::currency::CurrencyCache;
use crate::enrich::{CancelToken, EnrichmentRunner, ProgressSink};
use crate::models::{CredentialRecord, StageReport, SyncReport};
use crate::normalize::{CurrencyTuning, normalize_response};
use crate::reconcile::{upsert_parcels, upsert_products};
use crate::store::{CredentialStore, SecretCipher, SyncStore};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct SyncError {
    stage: &'static str,
    message: String,
    kind: SyncErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    InvalidInput,
    AuthFailed,
    Internal,
}

impl SyncError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: SyncErrorKind::InvalidInput,
        }
    }

    pub fn auth(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: SyncErrorKind::AuthFailed,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: SyncErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> SyncErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
struct StageOutcome<T> {
    value: T,
    output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub listing_url: String,
    pub auth: AuthConfig,
    pub confidence_threshold: f32,
    pub tuning: CurrencyTuning,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            listing_url: std::env::var("UPSTREAM_LISTING_URL")
                .unwrap_or_else(|_| "https://upstream.example/api/package/list".into()),
            auth: AuthConfig::from_env(),
            confidence_threshold: std::env::var("ENRICH_CONFIDENCE_THRESHOLD")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0.75),
            tuning: CurrencyTuning::from_env(),
        }
    }
}

pub struct SyncService {
    config: SyncConfig,
    store: Arc<dyn SyncStore>,
    credentials: Arc<dyn CredentialStore>,
    cipher: Arc<dyn SecretCipher>,
    browsers: Arc<dyn BrowserFactory>,
    classifier: Arc<dyn Classifier>,
    currency: Arc<CurrencyCache>,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn SyncStore>,
        credentials: Arc<dyn CredentialStore>,
        cipher: Arc<dyn SecretCipher>,
        browsers: Arc<dyn BrowserFactory>,
        classifier: Arc<dyn Classifier>,
        currency: Arc<CurrencyCache>,
    ) -> Self {
        Self {
            config,
            store,
            credentials,
            cipher,
            browsers,
            classifier,
            currency,
        }
    }

    pub async fn run(
        &self,
        owner_id: &str,
        token: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        info!(target = "parcelsync.sync", %run_id, owner_id, "sync run started");

        let credential = self
            .credentials
            .get(owner_id)
            .await
            .map_err(|err| SyncError::internal("load_credentials", err.to_string()))?
            .ok_or_else(|| {
                SyncError::invalid_input("load_credentials", "no credential stored for owner")
            })?;

        let driver = self
            .browsers
            .open(BrowserMode::Silent)
            .await
            .map_err(|err| SyncError::internal("ensure_session", err.to_string()))?;

        let result = self
            .run_with_driver(driver.as_ref(), run_id, owner_id, &credential, token, sink)
            .await;

        if let Err(err) = driver.close().await {
            warn!(target = "parcelsync.sync", error = %err, "driver close failed");
        }
        match result {
            RunControl::Finished(report) => report,
            RunControl::SwitchToObservable(stages) => {
                self.finish_on_observable(run_id, owner_id, &credential, stages, token, sink)
                    .await
            }
        }
    }

    /// Silent-mode attempt. A dead session does not fail the run; it hands
    /// control to the observable fallback with the transcript so far.
    async fn run_with_driver(
        &self,
        driver: &dyn BrowserDriver,
        run_id: Uuid,
        owner_id: &str,
        credential: &CredentialRecord,
        token: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> RunControl {
        let mut stages = Vec::new();
        let auth = Authenticator::new(self.config.auth.clone(), self.credentials.as_ref(), self.cipher.as_ref());

        let check = capture_stage("ensure_session", &mut stages, async {
            if !credential.cookie_jar.is_empty() {
                driver
                    .set_cookies(&credential.cookie_jar.cookies)
                    .await
                    .map_err(|err| SyncError::internal("ensure_session", err.to_string()))?;
            }
            let check = auth
                .ensure_authenticated_session(driver)
                .await
                .map_err(|err| SyncError::internal("ensure_session", err.to_string()))?;
            Ok(StageOutcome::new(
                check,
                json!({
                    "mode": driver.mode().as_str(),
                    "session_valid": check == AuthCheck::Authenticated,
                }),
            ))
        })
        .await;

        match check {
            Ok(AuthCheck::Authenticated) => {
                // session reuse counts as use; keep the jar timestamp current
                let mut refreshed = credential.clone();
                refreshed.cookie_jar.last_used_at = Some(chrono::Utc::now());
                if let Err(err) = self.credentials.put(refreshed).await {
                    warn!(target = "parcelsync.sync", error = %err, "failed to stamp credential last use");
                }
            }
            Ok(AuthCheck::AuthRequired) => {
                info!(target = "parcelsync.sync", owner_id, "session expired, switching to observable mode");
                return RunControl::SwitchToObservable(stages);
            }
            Err(err) => return RunControl::Finished(Err(err)),
        }

        let body = match capture_stage("fetch_listing", &mut stages, self.fetch_listing(driver)).await
        {
            Ok(FetchResult::Body(body)) => body,
            Ok(FetchResult::LoginRedirect) => {
                info!(target = "parcelsync.sync", owner_id, "listing redirected to login, switching to observable mode");
                return RunControl::SwitchToObservable(stages);
            }
            Ok(FetchResult::ChallengeGated) => {
                info!(target = "parcelsync.sync", owner_id, "listing gated by a challenge, switching to observable mode");
                return RunControl::SwitchToObservable(stages);
            }
            Err(err) => return RunControl::Finished(Err(err)),
        };

        RunControl::Finished(
            self.finish_run(run_id, owner_id, &body, stages, token, sink)
                .await,
        )
    }

    /// The headful fallback: fresh observable driver, full re-login with the
    /// stored credential, then the rest of the run on that driver. The silent
    /// driver is never reopened.
    async fn finish_on_observable(
        &self,
        run_id: Uuid,
        owner_id: &str,
        credential: &CredentialRecord,
        mut stages: Vec<StageReport>,
        token: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, SyncError> {
        let secret = self
            .cipher
            .decrypt(&credential.secret)
            .ok_or_else(|| SyncError::internal("relogin", "stored secret failed to decrypt"))?;

        let driver = self
            .browsers
            .open(BrowserMode::Observable)
            .await
            .map_err(|err| SyncError::auth("relogin", err.to_string()))?;
        let auth = Authenticator::new(self.config.auth.clone(), self.credentials.as_ref(), self.cipher.as_ref());

        let result = async {
            let outcome = capture_stage("relogin", &mut stages, async {
                let outcome = auth
                    .connect(driver.as_ref(), owner_id, &credential.identifier, &secret)
                    .await
                    .map_err(|err| SyncError::auth("relogin", err.to_string()))?;
                Ok(StageOutcome::new(
                    outcome.clone(),
                    json!({
                        "mode": driver.mode().as_str(),
                        "ok": outcome.ok,
                        "reason": outcome.reason,
                    }),
                ))
            })
            .await?;
            if !outcome.ok {
                return Err(SyncError::auth("relogin", outcome.reason));
            }

            let body = match capture_stage("fetch_listing", &mut stages, self.fetch_listing(driver.as_ref()))
                .await?
            {
                FetchResult::Body(body) => body,
                FetchResult::LoginRedirect => {
                    return Err(SyncError::auth(
                        "fetch_listing",
                        "still redirected to login after re-login",
                    ));
                }
                FetchResult::ChallengeGated => {
                    return Err(SyncError::auth(
                        "fetch_listing",
                        "listing still gated by a challenge after re-login",
                    ));
                }
            };

            self.finish_run(run_id, owner_id, &body, stages, token, sink)
                .await
        }
        .await;

        if let Err(err) = driver.close().await {
            warn!(target = "parcelsync.sync", error = %err, "driver close failed");
        }
        result
    }

    async fn fetch_listing(
        &self,
        driver: &dyn BrowserDriver,
    ) -> Result<StageOutcome<FetchResult>, SyncError> {
        driver
            .goto(&self.config.listing_url)
            .await
            .map_err(|err| SyncError::internal("fetch_listing", err.to_string()))?;
        let landed = driver
            .current_url()
            .await
            .map_err(|err| SyncError::internal("fetch_listing", err.to_string()))?;
        if landed.starts_with(&self.config.auth.login_url) {
            return Ok(StageOutcome::new(
                FetchResult::LoginRedirect,
                json!({"redirected_to_login": true}),
            ));
        }
        // the platform can also gate the listing behind a challenge overlay
        // without any redirect
        if driver
            .is_visible(&self.config.auth.challenge_selector)
            .await
            .map_err(|err| SyncError::internal("fetch_listing", err.to_string()))?
        {
            return Ok(StageOutcome::new(
                FetchResult::ChallengeGated,
                json!({"challenge_gated": true}),
            ));
        }
        let body = driver
            .body()
            .await
            .map_err(|err| SyncError::internal("fetch_listing", err.to_string()))?;
        let bytes = body.len();
        Ok(StageOutcome::new(
            FetchResult::Body(body),
            json!({"bytes": bytes, "url": landed}),
        ))
    }

    /// Normalize, reconcile, enrich. Shared tail of both the silent and the
    /// observable path.
    async fn finish_run(
        &self,
        run_id: Uuid,
        owner_id: &str,
        body: &str,
        mut stages: Vec<StageReport>,
        token: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, SyncError> {
        let batch = capture_stage("normalize", &mut stages, async {
            let live_rate = self.currency.get_rate().await;
            let batch = normalize_response(body, live_rate, &self.config.tuning);
            Ok(StageOutcome::new(
                batch.clone(),
                json!({
                    "source": batch.source,
                    "parcels": batch.parcels.len(),
                    "products": batch.products.len(),
                    "live_rate": live_rate,
                }),
            ))
        })
        .await?;

        if batch.is_empty() {
            warn!(target = "parcelsync.sync", owner_id, "no records extracted from listing");
        }

        let parcel_tally = capture_stage("reconcile_parcels", &mut stages, async {
            let tally = upsert_parcels(self.store.as_ref(), owner_id, &batch.parcels)
                .await
                .map_err(|err| SyncError::internal("reconcile_parcels", err.to_string()))?;
            Ok(StageOutcome::new(
                tally,
                json!({"inserted": tally.inserted, "updated": tally.updated}),
            ))
        })
        .await?;

        let product_tally = capture_stage("reconcile_products", &mut stages, async {
            let tally = upsert_products(self.store.as_ref(), owner_id, &batch.products)
                .await
                .map_err(|err| SyncError::internal("reconcile_products", err.to_string()))?;
            let output = json!({
                "inserted": tally.inserted,
                "updated": tally.updated,
                "skipped_orphans": tally.skipped_orphans,
                "enrichment_queued": tally.enrichment_queue.len(),
            });
            Ok(StageOutcome::new(tally, output))
        })
        .await?;

        let enrichment = capture_stage("enrich", &mut stages, async {
            let runner = EnrichmentRunner::new(
                self.store.clone(),
                self.classifier.clone(),
                self.config.confidence_threshold,
            );
            let summary = runner
                .run_batch(product_tally.enrichment_queue.clone(), token, sink)
                .await;
            let output = json!({
                "done": summary.done,
                "conflicts": summary.conflicts,
                "failed": summary.failed,
                "skipped": summary.skipped,
                "aborted": summary.aborted,
            });
            Ok(StageOutcome::new(summary, output))
        })
        .await?;

        let message = if enrichment.aborted {
            "sync completed, enrichment truncated by cancellation".to_string()
        } else {
            "sync completed".to_string()
        };
        let report = SyncReport {
            run_id,
            owner_id: owner_id.to_string(),
            parcels_count: parcel_tally.total(),
            orders_count: product_tally.total(),
            message,
            enrichment,
            stages,
        };
        info!(
            target = "parcelsync.sync",
            %run_id,
            parcels = report.parcels_count,
            orders = report.orders_count,
            "sync run finished"
        );
        Ok(report)
    }
}

enum RunControl {
    Finished(Result<SyncReport, SyncError>),
    SwitchToObservable(Vec<StageReport>),
}

enum FetchResult {
    Body(String),
    LoginRedirect,
    ChallengeGated,
}

async fn capture_stage<T, Fut>(
    name: &'static str,
    stages: &mut Vec<StageReport>,
    fut: Fut,
) -> Result<T, SyncError>
where
    Fut: Future<Output = Result<StageOutcome<T>, SyncError>>,
{
    let started = Instant::now();
    let outcome = fut.await?;
    let elapsed_ms = started.elapsed().as_millis();
    stages.push(StageReport::new(name, elapsed_ms, outcome.output));
    Ok(outcome.value)
}
