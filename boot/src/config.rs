use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, fs, io};

use crossframe_transport::{BrokerTimeouts, Endpoints};
use crossframe_types::{ApiCatalog, ApiDescriptor, Capabilities};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

// Default value function for serde (bool::default() is false, so only true needs a fn)
pub(crate) const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub cookie: CookieConfig,
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config at {}: {field}: {reason}", path.display())]
    Invalid {
        path: PathBuf,
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::Invalid { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Relay document on the API origin.
    pub relay: String,
    pub flash_bridge: String,
    pub api: String,
    pub auth: String,
    /// Refresh-token exchange.
    pub exchange: String,
    /// Silent token query used when no token is stored.
    pub query: String,
    /// Redirect target of the authorization window. Defaults to the host page.
    pub client_proxy: Option<String>,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            relay: "https://open.t.qq.com/proxy/relay.html".to_string(),
            flash_bridge: "https://open.t.qq.com/proxy/bridge.swf".to_string(),
            api: "https://open.t.qq.com/api".to_string(),
            auth: "https://open.t.qq.com/cgi-bin/oauth2/authorize".to_string(),
            exchange: "https://open.t.qq.com/cgi-bin/oauth2/access_token".to_string(),
            query: "https://open.t.qq.com/cgi-bin/oauth2/query_token".to_string(),
            client_proxy: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub relay_handshake_ms: u64,
    pub flash_load_ms: u64,
    /// Per-request bound for the relay's HTTP calls.
    pub fetch_ms: u64,
    /// Interval between document readiness probes.
    pub document_poll_ms: u64,
    pub auth_window_poll_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            relay_handshake_ms: 1_000,
            flash_load_ms: 10_000,
            fetch_ms: 30_000,
            document_poll_ms: 10,
            auth_window_poll_ms: 100,
        }
    }
}

impl TimeoutsConfig {
    #[must_use]
    pub fn broker(&self) -> BrokerTimeouts {
        BrokerTimeouts {
            relay_handshake: Duration::from_millis(self.relay_handshake_ms),
            flash_load: Duration::from_millis(self.flash_load_ms),
        }
    }

    #[must_use]
    pub fn fetch(&self) -> Duration {
        Duration::from_millis(self.fetch_ms)
    }

    #[must_use]
    pub fn document_poll(&self) -> Duration {
        Duration::from_millis(self.document_poll_ms)
    }

    #[must_use]
    pub fn auth_window_poll(&self) -> Duration {
        Duration::from_millis(self.auth_window_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Prefix of the access token cookie; the app key is appended.
    pub access_token: String,
    pub refresh_token: String,
    pub path: String,
    pub domain: String,
    /// Lifetime of the refresh token cookie. Absent means a session cookie.
    pub refresh_token_expires_secs: Option<u64>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            access_token: "QQWBToken".to_string(),
            refresh_token: "QQWBRefreshToken".to_string(),
            path: "/".to_string(),
            domain: String::new(),
            refresh_token_expires_secs: Some(7 * 24 * 3600),
        }
    }
}

/// Detected host capabilities.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapabilitiesConfig {
    #[serde(default = "default_true")]
    pub postmessage: bool,
    pub flash: bool,
    pub silverlight: bool,
    pub localstorage: bool,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            postmessage: true,
            flash: false,
            silverlight: false,
            localstorage: false,
        }
    }
}

impl From<&CapabilitiesConfig> for Capabilities {
    fn from(config: &CapabilitiesConfig) -> Self {
        Capabilities {
            postmessage: config.postmessage,
            flash: config.flash,
            silverlight: config.silverlight,
            localstorage: config.localstorage,
        }
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub appkey: Option<String>,
    /// Paths allowed in addition to the built-in catalog.
    pub extra: BTreeMap<String, ApiDescriptor>,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("appkey", &self.appkey.as_ref().map(|_| "<set>"))
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BridgeConfig {
    /// Load from the default location. `Ok(None)` when there is no file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        let config: Self = match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };
        config.validate(path)?;
        Ok(config)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Check every URL parses and the relay is served over http(s).
    pub fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let relay = parse_url(path, "endpoints.relay", &self.endpoints.relay)?;
        if !matches!(relay.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                field: "endpoints.relay",
                reason: format!("relay must be served over http(s), got {}", relay.scheme()),
            });
        }
        parse_url(path, "endpoints.flash_bridge", &self.endpoints.flash_bridge)?;
        parse_url(path, "endpoints.api", &self.endpoints.api)?;
        parse_url(path, "endpoints.auth", &self.endpoints.auth)?;
        parse_url(path, "endpoints.exchange", &self.endpoints.exchange)?;
        parse_url(path, "endpoints.query", &self.endpoints.query)?;
        if let Some(client_proxy) = &self.endpoints.client_proxy {
            parse_url(path, "endpoints.client_proxy", client_proxy)?;
        }
        if self.cookie.access_token.is_empty() || self.cookie.refresh_token.is_empty() {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                field: "cookie",
                reason: "cookie names must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Transport endpoints. Call after `validate`, or on the defaults.
    pub fn endpoints(&self) -> Result<Endpoints, ConfigError> {
        let origin = Path::new("<config>");
        Ok(Endpoints {
            relay: parse_url(origin, "endpoints.relay", &self.endpoints.relay)?,
            flash_bridge: parse_url(origin, "endpoints.flash_bridge", &self.endpoints.flash_bridge)?,
            api: parse_url(origin, "endpoints.api", &self.endpoints.api)?,
        })
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from(&self.capabilities)
    }

    /// The built-in allow-list plus `[api.extra]`.
    #[must_use]
    pub fn catalog(&self) -> ApiCatalog {
        let mut catalog = ApiCatalog::builtin();
        for (api, descriptor) in &self.api.extra {
            catalog.insert(api.clone(), descriptor.clone());
        }
        catalog
    }

    #[must_use]
    pub fn appkey(&self) -> &str {
        self.api.appkey.as_deref().unwrap_or_default()
    }
}

fn parse_url(path: &Path, field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::Invalid {
        path: path.to_path_buf(),
        field,
        reason: format!("{raw:?}: {e}"),
    })
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".crossframe").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crossframe_types::TransportKind;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parse_empty_config() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert!(config.capabilities.postmessage);
        assert!(!config.capabilities.flash);
        assert_eq!(config.cookie.access_token, "QQWBToken");
        assert_eq!(config.timeouts.broker(), BrokerTimeouts::default());
        assert!(config.endpoints().is_ok());
        assert_eq!(config.appkey(), "");
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
            [endpoints]
            relay = "https://api.example.com/relay.html"
            api = "https://api.example.com/api"

            [timeouts]
            relay_handshake_ms = 250

            [cookie]
            access_token = "Tok"
            domain = ".example.com"

            [capabilities]
            postmessage = false
            flash = true

            [api]
            appkey = "801000"

            [api.extra."/friends/idollist"]
            category = "关系链"
            method = "GET"
        "#;
        let config: BridgeConfig = toml::from_str(toml_str).unwrap();

        let endpoints = config.endpoints().unwrap();
        assert_eq!(endpoints.relay_origin(), "https://api.example.com");
        assert_eq!(
            config.timeouts.broker().relay_handshake,
            Duration::from_millis(250)
        );
        assert_eq!(config.timeouts.broker().flash_load, Duration::from_secs(10));
        assert_eq!(config.cookie.access_token, "Tok");
        assert_eq!(config.cookie.refresh_token, "QQWBRefreshToken");
        assert_eq!(
            config.capabilities().preferred(),
            Some(TransportKind::FlashBridge)
        );
        assert_eq!(config.appkey(), "801000");

        let catalog = config.catalog();
        assert!(catalog.is_provided("/friends/idollist"));
        assert!(catalog.is_provided("/statuses/home_timeline"));
    }

    #[test]
    fn debug_masks_appkey() {
        let config: BridgeConfig = toml::from_str("[api]\nappkey = \"801000\"").unwrap();
        let debug = format!("{:?}", config.api);
        assert!(!debug.contains("801000"));
        assert!(debug.contains("<set>"));
    }

    #[test]
    fn load_from_reads_and_validates() {
        let file = write_config("[api]\nappkey = \"42\"\n");
        let config = BridgeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.appkey(), "42");
    }

    #[test]
    fn load_from_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = BridgeConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(err.path(), path.as_path());
    }

    #[test]
    fn load_from_bad_toml_is_parse_error() {
        let file = write_config("[endpoints\nrelay = 1");
        let err = BridgeConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn invalid_relay_url_is_rejected() {
        let file = write_config("[endpoints]\nrelay = \"not a url\"\n");
        let err = BridgeConfig::load_from(file.path()).unwrap_err();
        let ConfigError::Invalid { field, .. } = err else {
            panic!("expected Invalid, got {err:?}");
        };
        assert_eq!(field, "endpoints.relay");
    }

    #[test]
    fn relay_must_be_http() {
        let file = write_config("[endpoints]\nrelay = \"file:///tmp/relay.html\"\n");
        let err = BridgeConfig::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("http(s)"));
    }

    #[test]
    fn empty_cookie_name_is_rejected() {
        let file = write_config("[cookie]\naccess_token = \"\"\n");
        let err = BridgeConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "cookie", .. }));
    }
}
