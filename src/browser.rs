//! Capability seam for driving the upstream site. The authenticator and the
//! listing fetch run against `BrowserDriver`, never a concrete browser, so
//! sync logic is testable with a scripted fake.
//!
//! `HttpBrowser` is the silent-mode implementation: plain HTTP with the
//! owner's cookie jar, good enough for the probe and the listing endpoint.
//! Observable mode (form interaction, challenge solving) is supplied by an
//! attached driver at deployment time; the factory refuses it otherwise.

use crate::http::build_client;
use crate::models::Cookie;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::SET_COOKIE;
use scraper::{Html, Selector};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserMode {
    Silent,
    Observable,
}

impl BrowserMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserMode::Silent => "silent",
            BrowserMode::Observable => "observable",
        }
    }
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("bad selector `{0}`")]
    BadSelector(String),
    #[error("`{0}` is not available in silent mode")]
    Unsupported(&'static str),
    #[error("driver io: {0}")]
    Io(String),
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn mode(&self) -> BrowserMode;
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;
    async fn current_url(&self) -> Result<String, BrowserError>;
    async fn body(&self) -> Result<String, BrowserError>;
    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError>;
    /// Click the first visible match; `Ok(false)` when nothing was visible.
    async fn click_if_visible(&self, selector: &str) -> Result<bool, BrowserError>;
    async fn press_enter(&self) -> Result<(), BrowserError>;
    async fn is_visible(&self, selector: &str) -> Result<bool, BrowserError>;
    async fn text_of(&self, selector: &str) -> Result<Option<String>, BrowserError>;
    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError>;
    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError>;
    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), BrowserError>;
    async fn close(&self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn open(&self, mode: BrowserMode) -> Result<Box<dyn BrowserDriver>, BrowserError>;
}

#[derive(Default)]
struct PageState {
    url: String,
    body: String,
    cookies: Vec<Cookie>,
}

pub struct HttpBrowser {
    http: Client,
    state: Mutex<PageState>,
}

impl HttpBrowser {
    pub fn new() -> Self {
        Self {
            http: build_client(),
            state: Mutex::new(PageState::default()),
        }
    }

    fn select_text(&self, selector: &str) -> Result<Option<String>, BrowserError> {
        let state = self.state.lock().expect("browser state poisoned");
        let document = Html::parse_document(&state.body);
        let parsed = Selector::parse(selector)
            .map_err(|_| BrowserError::BadSelector(selector.to_string()))?;
        Ok(document.select(&parsed).next().map(|el| {
            el.text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        }))
    }

    fn merge_cookie(cookies: &mut Vec<Cookie>, incoming: Cookie) {
        if let Some(existing) = cookies.iter_mut().find(|c| c.name == incoming.name) {
            *existing = incoming;
        } else {
            cookies.push(incoming);
        }
    }
}

impl Default for HttpBrowser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_set_cookie(raw: &str, fallback_domain: &str) -> Option<Cookie> {
    let mut parts = raw.split(';');
    let pair = parts.next()?.trim();
    let (name, value) = pair.split_once('=')?;
    if name.trim().is_empty() {
        return None;
    }
    let domain = parts
        .filter_map(|attr| {
            let (key, val) = attr.trim().split_once('=')?;
            key.eq_ignore_ascii_case("domain").then(|| val.trim().to_string())
        })
        .next()
        .unwrap_or_else(|| fallback_domain.to_string());
    Some(Cookie {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
        domain,
    })
}

#[async_trait]
impl BrowserDriver for HttpBrowser {
    fn mode(&self) -> BrowserMode {
        BrowserMode::Silent
    }

    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        let cookie_header = {
            let state = self.state.lock().expect("browser state poisoned");
            state
                .cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; ")
        };

        let mut request = self.http.get(url);
        if !cookie_header.is_empty() {
            request = request.header(reqwest::header::COOKIE, cookie_header);
        }
        let response = request
            .send()
            .await
            .map_err(|err| BrowserError::Navigation(err.to_string()))?;

        let final_url = response.url().clone();
        let host = final_url.host_str().unwrap_or_default().to_string();
        let set_cookies: Vec<Cookie> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|raw| parse_set_cookie(raw, &host))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|err| BrowserError::Navigation(err.to_string()))?;

        let mut state = self.state.lock().expect("browser state poisoned");
        state.url = final_url.to_string();
        state.body = body;
        for cookie in set_cookies {
            Self::merge_cookie(&mut state.cookies, cookie);
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.state.lock().expect("browser state poisoned").url.clone())
    }

    async fn body(&self) -> Result<String, BrowserError> {
        Ok(self.state.lock().expect("browser state poisoned").body.clone())
    }

    async fn fill(&self, _selector: &str, _value: &str) -> Result<(), BrowserError> {
        Err(BrowserError::Unsupported("fill"))
    }

    async fn click_if_visible(&self, _selector: &str) -> Result<bool, BrowserError> {
        Err(BrowserError::Unsupported("click"))
    }

    async fn press_enter(&self) -> Result<(), BrowserError> {
        Err(BrowserError::Unsupported("press_enter"))
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, BrowserError> {
        Ok(self.select_text(selector)?.is_some())
    }

    async fn text_of(&self, selector: &str) -> Result<Option<String>, BrowserError> {
        self.select_text(selector)
    }

    async fn screenshot(&self, _path: &Path) -> Result<(), BrowserError> {
        Err(BrowserError::Unsupported("screenshot"))
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
        Ok(self.state.lock().expect("browser state poisoned").cookies.clone())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), BrowserError> {
        let mut state = self.state.lock().expect("browser state poisoned");
        for cookie in cookies {
            Self::merge_cookie(&mut state.cookies, cookie.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut state = self.state.lock().expect("browser state poisoned");
        *state = PageState::default();
        Ok(())
    }
}

/// Default factory: silent mode over HTTP, observable mode refused unless a
/// deployment wires in an interactive driver.
pub struct HttpBrowserFactory;

#[async_trait]
impl BrowserFactory for HttpBrowserFactory {
    async fn open(&self, mode: BrowserMode) -> Result<Box<dyn BrowserDriver>, BrowserError> {
        match mode {
            BrowserMode::Silent => Ok(Box::new(HttpBrowser::new())),
            BrowserMode::Observable => Err(BrowserError::Unsupported(
                "observable mode requires an attached interactive driver",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_cookie_parsing_extracts_name_value_domain() {
        let cookie = parse_set_cookie(
            "session=ab12; Path=/; Domain=.upstream.example; HttpOnly",
            "upstream.example",
        )
        .expect("cookie");
        assert_eq!(cookie.name, "session");
        assert_eq!(cookie.value, "ab12");
        assert_eq!(cookie.domain, ".upstream.example");
    }

    #[test]
    fn set_cookie_falls_back_to_response_host() {
        let cookie = parse_set_cookie("token=xyz; Path=/", "upstream.example").expect("cookie");
        assert_eq!(cookie.domain, "upstream.example");
    }

    #[test]
    fn malformed_set_cookie_is_ignored() {
        assert!(parse_set_cookie("garbage-without-equals", "host").is_none());
        assert!(parse_set_cookie("=orphan-value", "host").is_none());
    }

    #[tokio::test]
    async fn silent_driver_refuses_interactive_calls() {
        let driver = HttpBrowser::new();
        assert!(matches!(
            driver.fill("#user", "x").await,
            Err(BrowserError::Unsupported("fill"))
        ));
        assert!(matches!(
            driver.press_enter().await,
            Err(BrowserError::Unsupported("press_enter"))
        ));
    }

    #[tokio::test]
    async fn factory_refuses_observable_mode_without_driver() {
        let factory = HttpBrowserFactory;
        assert!(factory.open(BrowserMode::Observable).await.is_err());
        assert!(factory.open(BrowserMode::Silent).await.is_ok());
    }
}
