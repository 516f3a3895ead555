//! Test doubles for the OpenID protocol client and the registration source.
#![allow(dead_code)]

use async_trait::async_trait;
use openid_consumer::config::ConsumerSettings;
use openid_consumer::error::{OpenIdError, RegistrationError};
use openid_consumer::openid::{
    AuthRequest, ConsumerFactory, OpenIdClient, PendingDiscovery, ProtocolVersion,
    VerificationOutcome,
};
use openid_consumer::policy::{Allowlist, ProviderMatcher};
use openid_consumer::registration::{Registration, RegistrationSource};
use openid_consumer::store::StoreBackend;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

pub const BASE_URL: &str = "https://chef.example.com";
pub const PROVIDER: &str = "https://op.example.com/server";

pub fn settings(
    identifiers: Allowlist<String>,
    providers: Allowlist<ProviderMatcher>,
) -> Arc<ConsumerSettings> {
    Arc::new(ConsumerSettings {
        base_url: Url::parse(BASE_URL).unwrap(),
        store: StoreBackend::Filesystem {
            root: PathBuf::from("/nonexistent/cstore"),
        },
        authorized_identifiers: identifiers,
        authorized_providers: providers,
    })
}

pub fn open_settings() -> Arc<ConsumerSettings> {
    settings(Allowlist::Open, Allowlist::Open)
}

/// What the stub saw, shared between the test and the client.
#[derive(Debug, Default)]
pub struct Recorded {
    pub begin_calls: AtomicUsize,
    pub complete_calls: AtomicUsize,
    /// `(realm, return_to, immediate)` of every request built.
    pub requests: Mutex<Vec<(String, String, bool)>>,
    pub complete_params: Mutex<Option<BTreeMap<String, String>>>,
    pub complete_url: Mutex<Option<String>>,
}

impl Recorded {
    pub fn begin_calls(&self) -> usize {
        self.begin_calls.load(Ordering::SeqCst)
    }
}

/// Configurable stand-in for [`openid_consumer::openid::HttpConsumer`].
#[derive(Clone, Debug)]
pub struct StubClient {
    pub recorded: Arc<Recorded>,
    pub discovery_error: Option<String>,
    pub use_redirect: bool,
    pub outcome: VerificationOutcome,
}

impl StubClient {
    pub fn returning(outcome: VerificationOutcome) -> Self {
        Self {
            recorded: Arc::new(Recorded::default()),
            discovery_error: None,
            use_redirect: true,
            outcome,
        }
    }

    pub fn success(display_identifier: &str) -> Self {
        Self::returning(VerificationOutcome::Success {
            identity_url: display_identifier.to_string(),
            display_identifier: display_identifier.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct StubRequest {
    recorded: Arc<Recorded>,
    use_redirect: bool,
    identifier: String,
}

impl StubRequest {
    fn record(&self, realm: &str, return_to: &str, immediate: bool) {
        self.recorded.requests.lock().unwrap().push((
            realm.to_string(),
            return_to.to_string(),
            immediate,
        ));
    }
}

impl AuthRequest for StubRequest {
    fn send_redirect(&self, realm: &str, return_to: &str, immediate: bool) -> bool {
        self.record(realm, return_to, immediate);
        self.use_redirect
    }

    fn redirect_url(&self, realm: &str, return_to: &str, immediate: bool) -> String {
        let mode = if immediate {
            "checkid_immediate"
        } else {
            "checkid_setup"
        };
        let mut url = Url::parse(PROVIDER).unwrap();
        url.query_pairs_mut()
            .append_pair("openid.mode", mode)
            .append_pair("openid.realm", realm)
            .append_pair("openid.return_to", return_to);
        url.to_string()
    }

    fn form_markup(
        &self,
        _realm: &str,
        return_to: &str,
        _immediate: bool,
        form_attrs: &[(&str, &str)],
    ) -> String {
        let attrs: String = form_attrs
            .iter()
            .map(|(k, v)| format!(" {k}=\"{v}\""))
            .collect();
        format!(
            "<form action=\"{PROVIDER}\" method=\"post\"{attrs}><input type=\"hidden\" name=\"openid.return_to\" value=\"{return_to}\" /></form>"
        )
    }

    fn pending(&self) -> PendingDiscovery {
        PendingDiscovery {
            server_url: PROVIDER.to_string(),
            claimed_id: Some(self.identifier.clone()),
            local_id: None,
            version: ProtocolVersion::V2,
            op_identifier: false,
        }
    }
}

#[async_trait]
impl OpenIdClient for StubClient {
    type Request = StubRequest;

    async fn begin(&self, identifier: &str) -> Result<StubRequest, OpenIdError> {
        self.recorded.begin_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.discovery_error {
            return Err(OpenIdError::Discovery(message.clone()));
        }
        Ok(StubRequest {
            recorded: self.recorded.clone(),
            use_redirect: self.use_redirect,
            identifier: identifier.to_string(),
        })
    }

    /// No-op verifier, except that it insists on the URL `start` sent out.
    async fn complete(
        &self,
        params: &BTreeMap<String, String>,
        current_url: &str,
        _pending: Option<&PendingDiscovery>,
    ) -> Result<VerificationOutcome, OpenIdError> {
        self.recorded.complete_calls.fetch_add(1, Ordering::SeqCst);
        *self.recorded.complete_params.lock().unwrap() = Some(params.clone());
        *self.recorded.complete_url.lock().unwrap() = Some(current_url.to_string());

        let sent = self.recorded.requests.lock().unwrap().last().cloned();
        if let Some((_, return_to, _)) = sent {
            if return_to != current_url {
                return Ok(VerificationOutcome::Failure {
                    message: format!("return_to {return_to} does not match {current_url}"),
                    display_identifier: None,
                });
            }
        }
        Ok(self.outcome.clone())
    }
}

#[derive(Clone, Debug)]
pub struct StubFactory(pub StubClient);

impl ConsumerFactory for StubFactory {
    type Client = StubClient;

    fn consumer(&self) -> StubClient {
        self.0.clone()
    }
}

/// Registrations held in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistrations(pub HashMap<String, Registration>);

impl MemoryRegistrations {
    pub fn with(registrations: &[(&str, bool)]) -> Arc<Self> {
        Arc::new(Self(
            registrations
                .iter()
                .map(|(name, admin)| {
                    (
                        name.to_string(),
                        Registration {
                            name: name.to_string(),
                            admin: *admin,
                            validated: true,
                        },
                    )
                })
                .collect(),
        ))
    }
}

#[async_trait]
impl RegistrationSource for MemoryRegistrations {
    async fn load(&self, name: &str) -> Result<Registration, RegistrationError> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| RegistrationError::NotFound(name.to_string()))
    }
}
