use config::Config;
use openid_consumer::config::{AppConfig, load_config};
use openid_consumer::policy::{Allowlist, ProviderMatcher};
use openid_consumer::store::StoreBackend;
use std::path::PathBuf;

fn parse(yaml: &str) -> AppConfig {
    Config::builder()
        .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
        .build()
        .expect("Failed to build config")
        .try_deserialize()
        .expect("Failed to deserialize app config")
}

#[test]
fn test_minimal_config_uses_defaults() {
    let app = parse(
        r#"
base_url: "https://chef.example.com"
database_url: "sqlite::memory:"
openid_cstore_path: "/var/lib/openid"
"#,
    );
    assert_eq!(app.listen_addr, "0.0.0.0:8080");
    assert!(!app.openid_cstore_couchdb);
    assert_eq!(app.session.cookie_name, "openid_consumer_session");
    assert_eq!(app.session.ttl_secs, 86_400);
    assert!(app.session.secure_cookie);

    let settings = app.consumer_settings().expect("valid settings");
    assert_eq!(
        settings.store,
        StoreBackend::Filesystem {
            root: PathBuf::from("/var/lib/openid")
        }
    );
    assert_eq!(settings.authorized_identifiers, Allowlist::Open);
    assert_eq!(settings.authorized_providers, Allowlist::Open);
}

#[test]
fn test_couchdb_backend_and_allowlists() {
    let app = parse(
        r#"
base_url: "https://chef.example.com/"
database_url: "sqlite::memory:"
openid_cstore_couchdb: true
couchdb_url: "http://couch.internal:5984/openid"
authorized_openid_identifiers:
  - "https://alice.example.com/"
authorized_openid_providers:
  - "prefix:https://login.example.com/"
  - "^https://.*\\.example\\.org/"
session:
  ttl_secs: 600
  secure_cookie: false
"#,
    );
    let settings = app.consumer_settings().expect("valid settings");

    match &settings.store {
        StoreBackend::CouchDb { url } => {
            assert_eq!(url.as_str(), "http://couch.internal:5984/openid")
        }
        other => panic!("expected CouchDB backend, got {other:?}"),
    }
    assert_eq!(
        settings.authorized_identifiers,
        Allowlist::Restricted(vec!["https://alice.example.com/".to_string()])
    );
    let Allowlist::Restricted(providers) = &settings.authorized_providers else {
        panic!("provider allowlist should be restricted");
    };
    assert!(matches!(providers[0], ProviderMatcher::Prefix(_)));
    assert!(matches!(providers[1], ProviderMatcher::Pattern(_)));
    assert_eq!(settings.url_for("/nodes"), "https://chef.example.com/nodes");
    assert_eq!(app.session.ttl_secs, 600);
}

#[test]
fn test_couchdb_without_url_is_rejected() {
    let app = parse(
        r#"
base_url: "https://chef.example.com"
database_url: "sqlite::memory:"
openid_cstore_couchdb: true
"#,
    );
    let err = app.consumer_settings().unwrap_err();
    assert!(err.to_string().contains("couchdb_url"));
}

#[test]
fn test_empty_lists_are_open() {
    let app = parse(
        r#"
base_url: "https://chef.example.com"
database_url: "sqlite::memory:"
openid_cstore_path: "/tmp/cstore"
authorized_openid_identifiers: []
authorized_openid_providers: []
"#,
    );
    let settings = app.consumer_settings().unwrap();
    assert!(settings.authorized_identifiers.is_open());
    assert!(settings.authorized_providers.is_open());
}

#[test]
fn test_load_config_missing_file() {
    // No config.yaml in the crate directory
    assert!(load_config().is_err());
}
