use crate::policy::{Allowlist, ProviderMatcher};
use crate::store::StoreBackend;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Idle lifetime of a browser session in seconds.
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_secure_cookie")]
    pub secure_cookie: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            ttl_secs: default_session_ttl(),
            secure_cookie: default_secure_cookie(),
        }
    }
}

/// Raw configuration as it appears in `config.yaml`.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Public absolute URL of this application, used to build `realm` and `return_to`.
    pub base_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Database holding node registrations.
    pub database_url: String,
    #[serde(default)]
    pub openid_cstore_couchdb: bool,
    #[serde(default)]
    pub couchdb_url: Option<String>,
    #[serde(default)]
    pub openid_cstore_path: Option<String>,
    #[serde(default)]
    pub authorized_openid_identifiers: Option<Vec<String>>,
    /// Entries are `exact:`, `prefix:` or `regex:` prefixed; bare entries are regular expressions.
    #[serde(default)]
    pub authorized_openid_providers: Option<Vec<String>>,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Validated settings the consumer flow is constructed with.
#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    pub base_url: Url,
    pub store: StoreBackend,
    pub authorized_identifiers: Allowlist<String>,
    pub authorized_providers: Allowlist<ProviderMatcher>,
}

impl ConsumerSettings {
    /// Absolute URL of `path` below `base_url`.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.as_str().trim_end_matches('/'))
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_cookie_name() -> String {
    "openid_consumer_session".to_string()
}

fn default_session_ttl() -> u64 {
    86_400
}

fn default_secure_cookie() -> bool {
    true
}

impl AppConfig {
    /// Check cross-field constraints and build the typed consumer settings.
    pub fn consumer_settings(&self) -> Result<ConsumerSettings, ConfigError> {
        let base_url = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::Validation(format!("base_url is not a URL: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(ConfigError::Validation(
                "base_url must be an absolute http(s) URL".into(),
            ));
        }

        let store = if self.openid_cstore_couchdb {
            match self.couchdb_url.as_deref().map(str::trim) {
                Some(raw) if !raw.is_empty() => {
                    let url = Url::parse(raw).map_err(|e| {
                        ConfigError::Validation(format!("couchdb_url is not a URL: {e}"))
                    })?;
                    StoreBackend::CouchDb { url }
                }
                _ => {
                    return Err(ConfigError::Validation(
                        "couchdb_url is required when openid_cstore_couchdb is enabled".into(),
                    ));
                }
            }
        } else {
            match self.openid_cstore_path.as_deref().map(str::trim) {
                Some(path) if !path.is_empty() => StoreBackend::Filesystem {
                    root: PathBuf::from(path),
                },
                _ => {
                    return Err(ConfigError::Validation(
                        "openid_cstore_path is required unless openid_cstore_couchdb is enabled"
                            .into(),
                    ));
                }
            }
        };

        let providers = match &self.authorized_openid_providers {
            Some(entries) => Some(
                entries
                    .iter()
                    .map(|e| e.parse::<ProviderMatcher>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(ConfigError::Validation)?,
            ),
            None => None,
        };

        Ok(ConsumerSettings {
            base_url,
            store,
            authorized_identifiers: Allowlist::from_entries(
                self.authorized_openid_identifiers.clone(),
            ),
            authorized_providers: Allowlist::from_entries(providers),
        })
    }
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any variable matching the key path separated by double underscores
/// (e.g. `SESSION__TTL_SECS`) overrides the file value.
pub fn load_config() -> Result<(AppConfig, ConsumerSettings), ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml"))
        .add_source(
            Environment::default()
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("authorized_openid_identifiers")
                .with_list_parse_key("authorized_openid_providers")
                .try_parsing(true),
        )
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;

    if app.session.ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "session.ttl_secs must be > 0".into(),
        ));
    }
    let settings = app.consumer_settings()?;

    Ok((app, settings))
}

/// Convenience helper for the binary.
pub fn load_config_or_panic() -> (AppConfig, ConsumerSettings) {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AppConfig {
        AppConfig {
            base_url: "https://chef.example.com".into(),
            listen_addr: default_listen_addr(),
            database_url: "sqlite::memory:".into(),
            openid_cstore_couchdb: false,
            couchdb_url: None,
            openid_cstore_path: Some("/var/lib/openid".into()),
            authorized_openid_identifiers: None,
            authorized_openid_providers: None,
            session: SessionConfig::default(),
        }
    }

    #[test]
    fn filesystem_store_selected_by_default() {
        let settings = base().consumer_settings().unwrap();
        assert_eq!(
            settings.store,
            StoreBackend::Filesystem {
                root: PathBuf::from("/var/lib/openid")
            }
        );
        assert!(settings.authorized_identifiers.is_open());
        assert!(settings.authorized_providers.is_open());
    }

    #[test]
    fn couchdb_requires_url() {
        let mut cfg = base();
        cfg.openid_cstore_couchdb = true;
        assert!(matches!(
            cfg.consumer_settings(),
            Err(ConfigError::Validation(_))
        ));

        cfg.couchdb_url = Some("http://localhost:5984/openid".into());
        let settings = cfg.consumer_settings().unwrap();
        assert!(matches!(settings.store, StoreBackend::CouchDb { .. }));
    }

    #[test]
    fn filesystem_requires_path() {
        let mut cfg = base();
        cfg.openid_cstore_path = Some("   ".into());
        assert!(cfg.consumer_settings().is_err());
    }

    #[test]
    fn invalid_provider_pattern_rejected() {
        let mut cfg = base();
        cfg.authorized_openid_providers = Some(vec!["regex:([".into()]);
        assert!(cfg.consumer_settings().is_err());
    }

    #[test]
    fn relative_base_url_rejected() {
        let mut cfg = base();
        cfg.base_url = "/openid".into();
        assert!(cfg.consumer_settings().is_err());
    }
}
