//! Session bootstrap, cookie store and request counter.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, SET_COOKIE};

use crate::error::{GeminiError, Result};

pub const SECURE_1PSID: &str = "__Secure-1PSID";
pub const SECURE_1PSIDTS: &str = "__Secure-1PSIDTS";

/// Body the rotation endpoint expects.
const ROTATE_BODY: &str = r#"[000,"-0000000000000000000"]"#;

static SESSION_ID_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""?sessionId"?\s*[:=]\s*["']?([a-zA-Z0-9_-]+)["']?"#)
        .expect("session id regex is valid")
});

static WIZ_GLOBAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(FdrFJe|cfb2h|SNlM0e)"\s*:\s*"([^"]*)""#).expect("WIZ global regex is valid")
});

/// Value of a WIZ global such as `"SNlM0e":"..."`.
fn wiz_value(page: &str, key: &str) -> Option<String> {
    WIZ_GLOBAL
        .captures_iter(page)
        .find(|c| &c[1] == key)
        .map(|c| c[2].to_string())
        .filter(|v| !v.is_empty())
}

/// Cookies sent with every request. Readers share, rotation writes exclusively.
#[derive(Debug, Default)]
pub struct CookieStore {
    cookies: RwLock<BTreeMap<String, String>>,
}

impl CookieStore {
    pub fn new(secure_1psid: &str, secure_1psidts: Option<&str>) -> Self {
        let store = Self::default();
        store.set(SECURE_1PSID, secure_1psid);
        if let Some(ts) = secure_1psidts.filter(|v| !v.is_empty()) {
            store.set(SECURE_1PSIDTS, ts);
        }
        store
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.cookies.read().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: &str) {
        self.cookies.write().insert(name.to_string(), value.to_string());
    }

    /// `Cookie` header value for an outgoing request.
    pub fn header_value(&self) -> String {
        self.cookies
            .read()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Apply every `Set-Cookie` header at once. Returns the names updated.
    pub fn apply_set_cookie_headers(&self, headers: &HeaderMap) -> Vec<String> {
        let updates: Vec<(String, String)> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        if updates.is_empty() {
            return Vec::new();
        }
        let mut cookies = self.cookies.write();
        updates
            .into_iter()
            .map(|(name, value)| {
                cookies.insert(name.clone(), value);
                name
            })
            .collect()
    }
}

/// `name=value` from a `Set-Cookie` header, ignoring attributes.
pub fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// Values scraped from the bootstrap page. All are best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// `FdrFJe`, sent as `f.sid`.
    pub session_id: Option<String>,
    /// `cfb2h`, sent as `bl`.
    pub build_label: Option<String>,
    /// `SNlM0e`, sent as `at`.
    pub access_token: Option<String>,
}

impl Session {
    pub fn from_bootstrap_page(page: &str) -> Self {
        let session_id = wiz_value(page, "FdrFJe").or_else(|| {
            SESSION_ID_MARKER
                .captures(page)?
                .get(1)
                .map(|m| m.as_str().to_string())
        });
        Self {
            session_id,
            build_label: wiz_value(page, "cfb2h"),
            access_token: wiz_value(page, "SNlM0e"),
        }
    }

    /// `at` value for batch envelopes.
    pub fn batch_token(&self) -> &str {
        self.access_token
            .as_deref()
            .or(self.session_id.as_deref())
            .unwrap_or_default()
    }
}

/// Request id source: seeded randomly, advanced by a fixed step.
#[derive(Debug)]
pub struct RequestCounter(AtomicU64);

impl RequestCounter {
    pub const STEP: u64 = 100_000;

    pub fn new() -> Self {
        Self::with_seed(rand::rng().random_range(10_000..100_000))
    }

    pub fn with_seed(seed: u64) -> Self {
        Self(AtomicU64::new(seed))
    }

    /// Advance and return the new value. Unique per counter.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(Self::STEP, Ordering::Relaxed) + Self::STEP
    }
}

impl Default for RequestCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the cookies, the scraped session values and the request counter.
#[derive(Debug)]
pub struct SessionManager {
    cookies: CookieStore,
    session: RwLock<Session>,
    counter: RequestCounter,
}

impl SessionManager {
    pub fn new(cookies: CookieStore, counter: RequestCounter) -> Self {
        Self {
            cookies,
            session: RwLock::new(Session::default()),
            counter,
        }
    }

    pub fn cookies(&self) -> &CookieStore {
        &self.cookies
    }

    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    pub fn next_request_id(&self) -> u64 {
        self.counter.next()
    }

    /// GET the app page with the session cookies and scrape session values.
    ///
    /// Only transport failures fail; a page without markers leaves the
    /// session values unset.
    pub async fn initialize(
        &self,
        http: &reqwest::Client,
        url: &str,
        timeout: Duration,
    ) -> Result<Session> {
        let response = http
            .get(url)
            .header(COOKIE, self.cookies.header_value())
            .timeout(timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| GeminiError::bootstrap("session bootstrap failed", e))?;
        self.cookies.apply_set_cookie_headers(response.headers());
        let page = response
            .text()
            .await
            .map_err(|e| GeminiError::bootstrap("reading bootstrap page failed", e))?;

        let session = Session::from_bootstrap_page(&page);
        if session.session_id.is_none() {
            tracing::debug!("no session id marker on bootstrap page");
        }
        *self.session.write() = session.clone();
        Ok(session)
    }

    /// Refresh the short-lived cookie. Returns the names of updated cookies.
    pub async fn rotate(
        &self,
        http: &reqwest::Client,
        url: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let response = http
            .post(url)
            .header(COOKIE, self.cookies.header_value())
            .header(CONTENT_TYPE, "application/json")
            .body(ROTATE_BODY)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| GeminiError::transport("cookie rotation", e, timeout))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GeminiError::Authentication {
                message: "cookie rotation rejected; __Secure-1PSID is no longer valid".to_string(),
                source: None,
            });
        }
        if !status.is_success() {
            return Err(GeminiError::api_status("cookie rotation failed", status.as_u16()));
        }
        let updated = self.cookies.apply_set_cookie_headers(response.headers());
        tracing::info!(cookies = ?updated, "cookies rotated");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reqwest::header::HeaderValue;
    use std::collections::HashSet;

    #[test]
    fn cookie_header_includes_optional_ts() {
        let store = CookieStore::new("psid", None);
        assert_eq!(store.header_value(), "__Secure-1PSID=psid");
        let store = CookieStore::new("psid", Some("ts"));
        assert_eq!(
            store.header_value(),
            "__Secure-1PSID=psid; __Secure-1PSIDTS=ts"
        );
    }

    #[test]
    fn set_cookie_headers_update_store() {
        let store = CookieStore::new("psid", Some("old"));
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("__Secure-1PSIDTS=new; Domain=.google.com; Secure"),
        );
        headers.append(SET_COOKIE, HeaderValue::from_static("NID=abc; Path=/"));
        let updated = store.apply_set_cookie_headers(&headers);
        assert_eq!(updated, vec!["__Secure-1PSIDTS".to_string(), "NID".to_string()]);
        assert_eq!(store.get(SECURE_1PSIDTS).as_deref(), Some("new"));
        assert_eq!(store.get("NID").as_deref(), Some("abc"));
    }

    #[test]
    fn parse_set_cookie_rejects_garbage() {
        assert_eq!(parse_set_cookie("novalue"), None);
        assert_eq!(parse_set_cookie("=x"), None);
        assert_eq!(
            parse_set_cookie("a=b=c; HttpOnly"),
            Some(("a".to_string(), "b=c".to_string()))
        );
    }

    #[test]
    fn bootstrap_page_extraction() {
        let page = r#"<script>WIZ_global_data = {"cfb2h":"boq_assistant-bard-web-server_20250101.00_p0","FdrFJe":"-123456789","SNlM0e":"AOtoken:1700000000000"};</script>"#;
        let session = Session::from_bootstrap_page(page);
        assert_eq!(session.session_id.as_deref(), Some("-123456789"));
        assert_eq!(
            session.build_label.as_deref(),
            Some("boq_assistant-bard-web-server_20250101.00_p0")
        );
        assert_eq!(session.batch_token(), "AOtoken:1700000000000");
    }

    #[test]
    fn wiz_keys_need_exact_quoted_names() {
        let page = r#"{"xFdrFJe":"wrong","cfb2h":"","FdrFJe":"42"}"#;
        let session = Session::from_bootstrap_page(page);
        assert_eq!(session.session_id.as_deref(), Some("42"));
        assert_eq!(session.build_label, None);
    }

    #[test]
    fn generic_session_marker_is_a_fallback() {
        let session = Session::from_bootstrap_page("var config = {sessionId: 'abc_DEF-1'};");
        assert_eq!(session.session_id.as_deref(), Some("abc_DEF-1"));
        assert_eq!(session.batch_token(), "abc_DEF-1");
    }

    #[test]
    fn missing_markers_leave_session_empty() {
        let session = Session::from_bootstrap_page("<html>nothing here</html>");
        assert_eq!(session, Session::default());
        assert_eq!(session.batch_token(), "");
    }

    #[test]
    fn request_ids_step_and_stay_unique() {
        let counter = RequestCounter::with_seed(12_345);
        assert_eq!(counter.next(), 112_345);
        assert_eq!(counter.next(), 212_345);

        let counter = std::sync::Arc::new(RequestCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..250).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect();
        let ids: HashSet<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 1000);
    }
}
