//! Token persistence.
//!
//! The access token lives in one cookie as a `|`-separated record
//! (`token|openid|expiryMillis|name|nick`), the refresh token in a second
//! cookie. Both names carry the app key so several apps can share a domain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use crossframe_transport::AccessTokenSource;
use crossframe_types::decode_query;
use thiserror::Error;

use crate::config::CookieConfig;

/// Days a stored record claims to be valid, independent of the cookie's own lifetime.
const RECORD_LIFETIME_DAYS: i64 = 7;

const FIELD_SEPARATOR: char = '|';

/// One cookie write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    /// `None` makes a session cookie.
    pub max_age: Option<Duration>,
    pub path: String,
    pub domain: String,
}

/// Cookie persistence supplied by the page.
pub trait CookieJar: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, cookie: SetCookie);
    fn remove(&self, name: &str, path: &str, domain: &str);
}

/// Cookies kept in process memory, honoring `max_age`.
#[derive(Default)]
pub struct MemoryCookieJar {
    cookies: Mutex<HashMap<String, (String, Option<DateTime<Utc>>)>>,
}

impl MemoryCookieJar {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn cookies(&self) -> MutexGuard<'_, HashMap<String, (String, Option<DateTime<Utc>>)>> {
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CookieJar for MemoryCookieJar {
    fn get(&self, name: &str) -> Option<String> {
        let mut cookies = self.cookies();
        let (value, expires) = cookies.get(name).cloned()?;
        if expires.is_some_and(|at| at <= Utc::now()) {
            cookies.remove(name);
            return None;
        }
        Some(value)
    }

    fn set(&self, cookie: SetCookie) {
        let expires = cookie
            .max_age
            .and_then(|age| TimeDelta::from_std(age).ok())
            .map(|age| Utc::now() + age);
        self.cookies().insert(cookie.name, (cookie.value, expires));
    }

    fn remove(&self, name: &str, _path: &str, _domain: &str) {
        self.cookies().remove(name);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenRecordError {
    #[error("token record is empty")]
    Empty,
    #[error("token record has a bad expiry {0:?}")]
    Expiry(String),
}

/// The decoded access token cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub access_token: String,
    pub openid: String,
    pub expires_at: DateTime<Utc>,
    pub name: String,
    pub nick: String,
}

impl TokenRecord {
    #[must_use]
    pub fn encode(&self) -> String {
        let expiry = self.expires_at.timestamp_millis().to_string();
        [
            self.access_token.as_str(),
            self.openid.as_str(),
            expiry.as_str(),
            self.name.as_str(),
            self.nick.as_str(),
        ]
        .join("|")
    }

    pub fn decode(raw: &str) -> Result<Self, TokenRecordError> {
        let mut fields = raw.splitn(5, FIELD_SEPARATOR);
        let access_token = fields.next().unwrap_or_default();
        if access_token.is_empty() {
            return Err(TokenRecordError::Empty);
        }
        let openid = fields.next().unwrap_or_default();
        let expiry = fields.next().unwrap_or_default();
        let expires_at = expiry
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| TokenRecordError::Expiry(expiry.to_string()))?;
        Ok(Self {
            access_token: access_token.to_string(),
            openid: openid.to_string(),
            expires_at,
            name: fields.next().unwrap_or_default().to_string(),
            nick: fields.next().unwrap_or_default().to_string(),
        })
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Who the stored access token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenUser {
    pub openid: String,
    pub name: String,
    pub nick: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStatus {
    pub access_token: String,
    pub name: String,
    pub nick: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFailure {
    pub error: String,
    pub message: String,
}

impl LoginFailure {
    fn new(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            message: error.clone(),
            error,
        }
    }
}

/// A token-bearing server response, decoded from its query-string form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenGrant {
    pub access_token: String,
    pub openid: String,
    /// Cookie lifetime in seconds; `None` keeps it for the session.
    pub expires_in: Option<u64>,
    pub name: Option<String>,
    pub nick: Option<String>,
    pub refresh_token: Option<String>,
}

/// What a server response amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    LoggedIn(LoginStatus),
    /// A token was granted but did not stick, typically third-party cookies being blocked.
    CookieRejected,
    Failed(LoginFailure),
}

pub struct TokenStore {
    jar: Arc<dyn CookieJar>,
    cookie: CookieConfig,
    appkey: RwLock<String>,
}

impl TokenStore {
    pub fn new(jar: Arc<dyn CookieJar>, cookie: CookieConfig, appkey: impl Into<String>) -> Self {
        Self {
            jar,
            cookie,
            appkey: RwLock::new(appkey.into()),
        }
    }

    pub fn set_appkey(&self, appkey: impl Into<String>) {
        *self.appkey.write().unwrap_or_else(PoisonError::into_inner) = appkey.into();
    }

    #[must_use]
    pub fn appkey(&self) -> String {
        self.appkey
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn access_token_name(&self) -> String {
        format!("{}_{}", self.cookie.access_token, self.appkey())
    }

    #[must_use]
    pub fn refresh_token_name(&self) -> String {
        format!("{}_{}", self.cookie.refresh_token, self.appkey())
    }

    /// Store the access token, keeping the previous user's name and nick when
    /// the grant does not carry them.
    pub fn set_access_token(&self, grant: &TokenGrant) {
        let previous = self.token_user().unwrap_or_default();
        let record = TokenRecord {
            access_token: grant.access_token.clone(),
            openid: grant.openid.clone(),
            expires_at: Utc::now() + TimeDelta::days(RECORD_LIFETIME_DAYS),
            name: non_empty(grant.name.as_deref()).unwrap_or(previous.name),
            nick: non_empty(grant.nick.as_deref()).unwrap_or(previous.nick),
        };
        self.jar.set(SetCookie {
            name: self.access_token_name(),
            value: record.encode(),
            max_age: grant.expires_in.filter(|secs| *secs > 0).map(Duration::from_secs),
            path: self.cookie.path.clone(),
            domain: self.cookie.domain.clone(),
        });
    }

    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        let raw = self.jar.get(&self.access_token_name())?;
        let token = raw.split(FIELD_SEPARATOR).next().unwrap_or_default();
        (!token.is_empty()).then(|| token.to_string())
    }

    /// The full record, when one is stored and well formed.
    pub fn record(&self) -> Option<Result<TokenRecord, TokenRecordError>> {
        self.jar
            .get(&self.access_token_name())
            .map(|raw| TokenRecord::decode(&raw))
    }

    #[must_use]
    pub fn token_user(&self) -> Option<TokenUser> {
        let raw = self.jar.get(&self.access_token_name())?;
        let fields: Vec<&str> = raw.splitn(5, FIELD_SEPARATOR).collect();
        let field = |i: usize| fields.get(i).copied().unwrap_or_default().to_string();
        Some(TokenUser {
            openid: field(1),
            name: field(3),
            nick: field(4),
        })
    }

    pub fn clear_access_token(&self) {
        self.remove(&self.access_token_name());
    }

    pub fn set_refresh_token(&self, refresh_token: &str) {
        self.jar.set(SetCookie {
            name: self.refresh_token_name(),
            value: refresh_token.to_string(),
            max_age: self.cookie.refresh_token_expires_secs.map(Duration::from_secs),
            path: self.cookie.path.clone(),
            domain: self.cookie.domain.clone(),
        });
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.jar
            .get(&self.refresh_token_name())
            .filter(|token| !token.is_empty())
    }

    pub fn clear_refresh_token(&self) {
        self.remove(&self.refresh_token_name());
    }

    // Cookies may have been written under the root path by older pages.
    fn remove(&self, name: &str) {
        self.jar.remove(name, &self.cookie.path, &self.cookie.domain);
        self.jar.remove(name, "/", &self.cookie.domain);
    }

    #[must_use]
    pub fn login_status(&self) -> Option<LoginStatus> {
        let access_token = self.access_token()?;
        let user = self.token_user().unwrap_or_default();
        Some(LoginStatus {
            access_token,
            name: user.name,
            nick: user.nick,
        })
    }

    /// Persist whatever a token endpoint or the authorization redirect returned.
    ///
    /// `response` is a query string or URL fragment.
    pub fn resolve_response(&self, response: &str) -> Resolution {
        let fields = decode_query(response);
        tracing::debug!("resolve response {fields:?}");

        if let Some(grant) = TokenGrant::from_fields(&fields) {
            if grant.expires_in.is_none() {
                tracing::info!("token expires_in not retrieved or disabled");
            }
            if grant.name.is_none() {
                tracing::info!("weibo username not retrieved");
            }
            if grant.nick.is_none() {
                tracing::info!("weibo usernick not retrieved");
            }
            self.set_access_token(&grant);
            match &grant.refresh_token {
                Some(refresh_token) => self.set_refresh_token(refresh_token),
                None => tracing::info!("refresh token not retrieved or disabled"),
            }
            return match self.login_status() {
                Some(status) => {
                    tracing::info!("user {} logged in", status.name);
                    Resolution::LoggedIn(status)
                }
                None => {
                    tracing::warn!(
                        "thirdparty cookie needs to be enabled, please set a P3P header"
                    );
                    Resolution::CookieRejected
                }
            };
        }

        let error = non_empty(fields.get("error").map(String::as_str))
            .or_else(|| non_empty(fields.get("errorMsg").map(String::as_str)));
        match error {
            Some(error) => {
                tracing::error!("login error occurred {error}");
                Resolution::Failed(LoginFailure::new(error))
            }
            None => {
                tracing::error!("unexpected result returned from server {response}");
                Resolution::Failed(LoginFailure::new("server error"))
            }
        }
    }
}

impl AccessTokenSource for TokenStore {
    fn access_token(&self) -> Option<String> {
        TokenStore::access_token(self)
    }
}

impl TokenGrant {
    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let get = |key: &str| non_empty(fields.get(key).map(String::as_str));
        let access_token = get("access_token")?;
        Some(Self {
            access_token,
            openid: get("openid").unwrap_or_default(),
            expires_in: get("expires_in").and_then(|secs| secs.parse().ok()),
            name: get("name").or_else(|| get("wb_name")),
            nick: get("nick").or_else(|| get("wb_nick")),
            refresh_token: get("refresh_token"),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (TokenStore, Arc<MemoryCookieJar>) {
        let jar = MemoryCookieJar::new();
        let store = TokenStore::new(
            Arc::clone(&jar) as Arc<dyn CookieJar>,
            CookieConfig::default(),
            "801000",
        );
        (store, jar)
    }

    #[test]
    fn cookie_names_carry_appkey() {
        let (store, _) = store();
        assert_eq!(store.access_token_name(), "QQWBToken_801000");
        assert_eq!(store.refresh_token_name(), "QQWBRefreshToken_801000");
        store.set_appkey("42");
        assert_eq!(store.access_token_name(), "QQWBToken_42");
    }

    #[test]
    fn record_encodes_five_fields() {
        let record = TokenRecord {
            access_token: "abc".to_string(),
            openid: "oid".to_string(),
            expires_at: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            name: "alice".to_string(),
            nick: "Al|ice".to_string(),
        };
        let encoded = record.encode();
        assert_eq!(encoded, "abc|oid|1700000000000|alice|Al|ice");
        assert_eq!(TokenRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn record_decode_errors() {
        assert_eq!(TokenRecord::decode(""), Err(TokenRecordError::Empty));
        assert_eq!(
            TokenRecord::decode("abc|oid|soon"),
            Err(TokenRecordError::Expiry("soon".to_string()))
        );
    }

    #[test]
    fn resolve_response_stores_both_tokens() {
        let (store, jar) = store();
        let resolution = store.resolve_response(
            "#access_token=abc&expires_in=3600&openid=o1&name=alice&nick=Al&refresh_token=r1",
        );

        let expected = LoginStatus {
            access_token: "abc".to_string(),
            name: "alice".to_string(),
            nick: "Al".to_string(),
        };
        assert_eq!(resolution, Resolution::LoggedIn(expected.clone()));
        assert_eq!(store.login_status(), Some(expected));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));

        let record = store.record().unwrap().unwrap();
        assert_eq!(record.openid, "o1");
        assert!(!record.is_expired(Utc::now()));
        assert!(jar.get("QQWBToken_801000").unwrap().starts_with("abc|o1|"));
    }

    #[test]
    fn wb_prefixed_names_are_accepted() {
        let (store, _) = store();
        store.resolve_response("access_token=abc&wb_name=bob&wb_nick=B");
        let user = store.token_user().unwrap();
        assert_eq!((user.name.as_str(), user.nick.as_str()), ("bob", "B"));
    }

    #[test]
    fn missing_name_keeps_previous_user() {
        let (store, _) = store();
        store.resolve_response("access_token=abc&name=alice&nick=Al");
        store.resolve_response("access_token=def");
        let status = store.login_status().unwrap();
        assert_eq!(status.access_token, "def");
        assert_eq!(status.name, "alice");
        assert_eq!(status.nick, "Al");
    }

    #[test]
    fn error_responses_fail() {
        let (store, _) = store();
        assert_eq!(
            store.resolve_response("error=access_denied"),
            Resolution::Failed(LoginFailure {
                error: "access_denied".to_string(),
                message: "access_denied".to_string(),
            })
        );
        assert_eq!(
            store.resolve_response("errorMsg=bad+appkey"),
            Resolution::Failed(LoginFailure::new("bad appkey"))
        );
        assert_eq!(
            store.resolve_response("garbage"),
            Resolution::Failed(LoginFailure::new("server error"))
        );
        assert_eq!(store.login_status(), None);
    }

    #[test]
    fn blocked_cookie_is_reported() {
        struct DeafJar;
        impl CookieJar for DeafJar {
            fn get(&self, _name: &str) -> Option<String> {
                None
            }
            fn set(&self, _cookie: SetCookie) {}
            fn remove(&self, _name: &str, _path: &str, _domain: &str) {}
        }
        let store = TokenStore::new(Arc::new(DeafJar), CookieConfig::default(), "1");
        assert_eq!(
            store.resolve_response("access_token=abc"),
            Resolution::CookieRejected
        );
    }

    #[test]
    fn clearing_removes_tokens() {
        let (store, _) = store();
        store.resolve_response("access_token=abc&refresh_token=r1");
        store.clear_access_token();
        store.clear_refresh_token();
        assert_eq!(store.access_token(), None);
        assert_eq!(store.refresh_token(), None);
    }

    #[test]
    fn memory_jar_without_max_age_is_session_cookie() {
        let jar = MemoryCookieJar::new();
        jar.set(SetCookie {
            name: "a".to_string(),
            value: "1".to_string(),
            max_age: None,
            path: "/".to_string(),
            domain: String::new(),
        });
        assert_eq!(jar.get("a").as_deref(), Some("1"));
        jar.remove("a", "/", "");
        assert_eq!(jar.get("a"), None);
    }

    #[test]
    fn memory_jar_drops_expired_cookies() {
        let jar = MemoryCookieJar::new();
        jar.set(SetCookie {
            name: "a".to_string(),
            value: "1".to_string(),
            max_age: Some(Duration::ZERO),
            path: "/".to_string(),
            domain: String::new(),
        });
        assert_eq!(jar.get("a"), None);
    }
}
