//! Session authenticator for the upstream storefront. The platform has no
//! stable API: login is a form, sessions are cookies, and a challenge overlay
//! can appear at any point. Everything here drives a `BrowserDriver` so the
//! whole state machine is testable against a scripted fake.

use crate::browser::{BrowserDriver, BrowserError};
use crate::models::{Cookie, CookieJar, CredentialRecord};
use crate::store::{CredentialStore, SecretCipher, StoreError};
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unauthenticated,
    LoggingIn,
    CaptchaPending,
    Solving,
    Verifying,
    Authenticated,
    Failed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Unauthenticated => "unauthenticated",
            SessionPhase::LoggingIn => "logging_in",
            SessionPhase::CaptchaPending => "captcha_pending",
            SessionPhase::Solving => "solving",
            SessionPhase::Verifying => "verifying",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// Credential-level rejection. Never retried.
    #[error("login rejected: {0}")]
    Fatal(String),
    #[error("login did not complete: {0}")]
    Timeout(String),
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCheck {
    Authenticated,
    AuthRequired,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub ok: bool,
    pub reason: String,
}

/// Inline error texts that mean the credentials themselves are bad. Matching
/// is lowercase substring.
const FATAL_PATTERNS: &[&str] = &[
    "account does not exist",
    "no such account",
    "incorrect password",
    "wrong password",
    "account locked",
    "account has been locked",
    "too many attempts",
];

fn is_fatal_error_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    FATAL_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub login_url: String,
    pub probe_url: String,
    pub identifier_selector: String,
    pub secret_selector: String,
    pub submit_selectors: Vec<String>,
    pub error_selector: String,
    pub post_login_marker: String,
    pub challenge_selector: String,
    pub settle_delay: Duration,
    pub race_timeout: Duration,
    pub race_poll: Duration,
    pub challenge_timeout: Duration,
    pub challenge_poll: Duration,
    pub probe_window: Duration,
    pub probe_poll: Duration,
    pub debug_dir: PathBuf,
}

impl AuthConfig {
    pub fn from_env() -> Self {
        Self {
            login_url: std::env::var("UPSTREAM_LOGIN_URL")
                .unwrap_or_else(|_| "https://upstream.example/login".into()),
            probe_url: std::env::var("UPSTREAM_PROBE_URL")
                .unwrap_or_else(|_| "https://upstream.example/api/member/info".into()),
            identifier_selector: "input[name='account']".into(),
            secret_selector: "input[name='password']".into(),
            submit_selectors: vec![
                "button[type='submit']".into(),
                ".login-btn".into(),
                "#loginSubmit".into(),
            ],
            error_selector: ".login-error".into(),
            post_login_marker: ".user-panel".into(),
            challenge_selector: ".captcha-modal".into(),
            settle_delay: env_millis("AUTH_SETTLE_MS", 1200),
            race_timeout: env_millis("AUTH_RACE_TIMEOUT_MS", 10_000),
            race_poll: Duration::from_millis(250),
            challenge_timeout: env_millis("AUTH_CHALLENGE_TIMEOUT_MS", 90_000),
            challenge_poll: Duration::from_millis(1_000),
            probe_window: env_millis("AUTH_PROBE_WINDOW_MS", 30_000),
            probe_poll: Duration::from_millis(2_000),
            debug_dir: std::env::var("AUTH_DEBUG_DIR")
                .unwrap_or_else(|_| "debug".into())
                .into(),
        }
    }
}

fn env_millis(key: &str, default: u64) -> Duration {
    let millis = std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default);
    Duration::from_millis(millis)
}

enum RaceOutcome {
    LeftLoginPage,
    MarkerVisible,
    TimedOut,
}

pub struct Authenticator<'a> {
    config: AuthConfig,
    credentials: &'a dyn CredentialStore,
    cipher: &'a dyn SecretCipher,
    phase: Mutex<SessionPhase>,
}

impl<'a> Authenticator<'a> {
    pub fn new(
        config: AuthConfig,
        credentials: &'a dyn CredentialStore,
        cipher: &'a dyn SecretCipher,
    ) -> Self {
        Self {
            config,
            credentials,
            cipher,
            phase: Mutex::new(SessionPhase::Unauthenticated),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().expect("phase poisoned")
    }

    fn set_phase(&self, next: SessionPhase) {
        let mut phase = self.phase.lock().expect("phase poisoned");
        if *phase != next {
            debug!(
                target = "parcelsync.auth",
                from = phase.as_str(),
                to = next.as_str(),
                "phase transition"
            );
            *phase = next;
        }
    }

    /// Lightweight "who am I" probe. Detects the need to log in, never logs
    /// in itself. A redirect back to the login URL or a structured failure
    /// payload both mean the session is gone.
    pub async fn ensure_authenticated_session(
        &self,
        driver: &dyn BrowserDriver,
    ) -> Result<AuthCheck, AuthError> {
        driver.goto(&self.config.probe_url).await?;
        let landed = driver.current_url().await?;
        if landed.starts_with(&self.config.login_url) {
            debug!(target = "parcelsync.auth", url = %landed, "probe redirected to login");
            return Ok(AuthCheck::AuthRequired);
        }

        let body = driver.body().await?;
        if probe_reports_auth_required(&body) {
            debug!(target = "parcelsync.auth", "probe payload reports no session");
            return Ok(AuthCheck::AuthRequired);
        }
        Ok(AuthCheck::Authenticated)
    }

    /// Full login on an observable driver: form, challenge, verification,
    /// cookie capture, credential persistence. One call per attempt; the
    /// caller owns the driver's lifetime.
    pub async fn connect(
        &self,
        driver: &dyn BrowserDriver,
        owner_id: &str,
        identifier: &str,
        secret: &str,
    ) -> Result<LoginOutcome, AuthError> {
        match self.perform_login(driver, identifier, secret).await {
            Ok(()) => {
                let cookies = driver.cookies().await?;
                self.persist_session(owner_id, identifier, secret, cookies)
                    .await?;
                self.set_phase(SessionPhase::Authenticated);
                info!(target = "parcelsync.auth", owner_id, "session established");
                Ok(LoginOutcome {
                    ok: true,
                    reason: "authenticated".into(),
                })
            }
            Err(AuthError::Fatal(reason)) => {
                self.set_phase(SessionPhase::Failed);
                warn!(target = "parcelsync.auth", owner_id, %reason, "fatal login error");
                Ok(LoginOutcome { ok: false, reason })
            }
            Err(AuthError::Timeout(reason)) => {
                self.set_phase(SessionPhase::Failed);
                self.capture_failure_screenshot(driver).await;
                Ok(LoginOutcome { ok: false, reason })
            }
            Err(other) => {
                self.set_phase(SessionPhase::Failed);
                Err(other)
            }
        }
    }

    async fn persist_session(
        &self,
        owner_id: &str,
        identifier: &str,
        secret: &str,
        cookies: Vec<Cookie>,
    ) -> Result<(), StoreError> {
        self.credentials
            .put(CredentialRecord {
                owner_id: owner_id.to_string(),
                identifier: identifier.to_string(),
                secret: self.cipher.encrypt(secret),
                cookie_jar: CookieJar {
                    cookies,
                    last_used_at: Some(Utc::now()),
                },
            })
            .await
    }

    async fn perform_login(
        &self,
        driver: &dyn BrowserDriver,
        identifier: &str,
        secret: &str,
    ) -> Result<(), AuthError> {
        self.set_phase(SessionPhase::LoggingIn);
        driver.goto(&self.config.login_url).await?;
        driver
            .fill(&self.config.identifier_selector, identifier)
            .await?;
        driver.fill(&self.config.secret_selector, secret).await?;
        self.submit(driver).await?;

        // give a challenge overlay time to render before reading the page
        sleep(self.config.settle_delay).await;

        if let Some(text) = driver.text_of(&self.config.error_selector).await? {
            if is_fatal_error_text(&text) {
                return Err(AuthError::Fatal(text));
            }
        }

        match self
            .race_for_login(driver, self.config.race_timeout, false)
            .await?
        {
            RaceOutcome::LeftLoginPage | RaceOutcome::MarkerVisible => {
                return self.verify(driver).await;
            }
            RaceOutcome::TimedOut => {}
        }

        self.solve_challenge(driver).await?;

        match self
            .race_for_login(driver, self.config.challenge_timeout, true)
            .await?
        {
            RaceOutcome::LeftLoginPage | RaceOutcome::MarkerVisible => {
                return self.verify(driver).await;
            }
            RaceOutcome::TimedOut => {}
        }

        // last resort: the redirect may simply not be observable; ask the
        // probe directly for a bounded window
        self.set_phase(SessionPhase::Verifying);
        let deadline = tokio::time::Instant::now() + self.config.probe_window;
        loop {
            if self.ensure_authenticated_session(driver).await? == AuthCheck::Authenticated {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AuthError::Timeout(
                    "no post-login signal before deadline".into(),
                ));
            }
            sleep(self.config.probe_poll).await;
        }
    }

    /// Try the submit controls in priority order; fall back to the keyboard
    /// when none are visible.
    async fn submit(&self, driver: &dyn BrowserDriver) -> Result<(), AuthError> {
        for selector in &self.config.submit_selectors {
            if driver.click_if_visible(selector).await? {
                return Ok(());
            }
        }
        driver.press_enter().await?;
        Ok(())
    }

    /// Race three outcomes: URL left the login path, the post-login marker
    /// appeared, or the timeout elapsed. With `poll_errors`, an inline error
    /// box appearing mid-race is fatal.
    async fn race_for_login(
        &self,
        driver: &dyn BrowserDriver,
        timeout: Duration,
        poll_errors: bool,
    ) -> Result<RaceOutcome, AuthError> {
        let poll = if poll_errors {
            self.config.challenge_poll
        } else {
            self.config.race_poll
        };
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let url = driver.current_url().await?;
            if !url.starts_with(&self.config.login_url) {
                return Ok(RaceOutcome::LeftLoginPage);
            }
            if driver.is_visible(&self.config.post_login_marker).await? {
                return Ok(RaceOutcome::MarkerVisible);
            }
            if poll_errors {
                if let Some(text) = driver.text_of(&self.config.error_selector).await? {
                    if !text.trim().is_empty() {
                        return Err(AuthError::Fatal(text));
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(RaceOutcome::TimedOut);
            }
            sleep(poll).await;
        }
    }

    /// Wait out the challenge overlay. On an observable driver the operator
    /// solves it; we only watch for the overlay to disappear.
    async fn solve_challenge(&self, driver: &dyn BrowserDriver) -> Result<(), AuthError> {
        if !driver.is_visible(&self.config.challenge_selector).await? {
            return Ok(());
        }
        self.set_phase(SessionPhase::CaptchaPending);
        info!(target = "parcelsync.auth", "challenge overlay detected, waiting for solve");
        self.set_phase(SessionPhase::Solving);
        let deadline = tokio::time::Instant::now() + self.config.challenge_timeout;
        while driver.is_visible(&self.config.challenge_selector).await? {
            if tokio::time::Instant::now() >= deadline {
                return Err(AuthError::Timeout("challenge was not solved".into()));
            }
            sleep(self.config.challenge_poll).await;
        }
        Ok(())
    }

    async fn verify(&self, driver: &dyn BrowserDriver) -> Result<(), AuthError> {
        self.set_phase(SessionPhase::Verifying);
        match self.ensure_authenticated_session(driver).await? {
            AuthCheck::Authenticated => Ok(()),
            AuthCheck::AuthRequired => Err(AuthError::Timeout(
                "probe still reports no session after login".into(),
            )),
        }
    }

    /// Diagnostic only; failure to capture must not mask the login failure.
    async fn capture_failure_screenshot(&self, driver: &dyn BrowserDriver) {
        if let Err(err) = std::fs::create_dir_all(&self.config.debug_dir) {
            warn!(target = "parcelsync.auth", error = %err, "cannot create debug dir");
            return;
        }
        let path = self
            .config
            .debug_dir
            .join(format!("login-failure-{}.png", Utc::now().timestamp()));
        match driver.screenshot(&path).await {
            Ok(()) => info!(target = "parcelsync.auth", path = %path.display(), "failure screenshot written"),
            Err(err) => warn!(target = "parcelsync.auth", error = %err, "screenshot failed"),
        }
    }
}

/// A structured probe payload saying "not logged in". The platform has been
/// seen using several envelope shapes; any explicit negative counts.
fn probe_reports_auth_required(body: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(body.trim()) else {
        return false;
    };
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        return true;
    }
    if value.get("isLogin").and_then(Value::as_bool) == Some(false) {
        return true;
    }
    if let Some(code) = value.get("code") {
        let code = match code {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        };
        if code.eq_ignore_ascii_case("AUTH_REQUIRED") || code == "401" {
            return true;
        }
    }
    false
}
