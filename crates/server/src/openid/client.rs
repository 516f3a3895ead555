//! [`OpenIdClient`] implementation over HTTP.

use crate::error::OpenIdError;
use crate::http::HttpClient;
use crate::openid::discovery::{self, without_fragment};
use crate::openid::{
    AssocType, Association, AuthRequest, ConsumerFactory, IDENTIFIER_SELECT, OPENID1_URL_LIMIT,
    OPENID2_NS, OpenIdClient, PendingDiscovery, ProtocolVersion, VerificationOutcome, kvform,
    nonce,
};
use crate::store::{LazyStore, StoreBackend};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use url::Url;

/// Query parameter carrying the nonce of OpenID 1 requests through `return_to`.
const OPENID1_NONCE: &str = "openid1_nonce";
/// Query parameter carrying the claimed identifier of OpenID 1 requests.
const OPENID1_CLAIMED_ID: &str = "openid1_claimed_id";

/// Fields that must be covered by the signature when present (OpenID 2 §11.4).
const REQUIRED_SIGNED: [&str; 6] = [
    "op_endpoint",
    "return_to",
    "response_nonce",
    "assoc_handle",
    "claimed_id",
    "identity",
];

/// Fields an OpenID 1 signature must cover; `return_to` carries the nonce.
const REQUIRED_SIGNED_V1: [&str; 2] = ["return_to", "identity"];

/// Produces an [`HttpConsumer`] per flow; each consumer opens the store lazily.
#[derive(Clone, Debug)]
pub struct HttpConsumerFactory {
    http: HttpClient,
    backend: StoreBackend,
}

impl HttpConsumerFactory {
    pub fn new(http: HttpClient, backend: StoreBackend) -> Self {
        Self { http, backend }
    }
}

impl ConsumerFactory for HttpConsumerFactory {
    type Client = HttpConsumer;

    fn consumer(&self) -> HttpConsumer {
        HttpConsumer::new(
            self.http.clone(),
            LazyStore::new(self.backend.clone(), self.http.clone()),
        )
    }
}

pub struct HttpConsumer {
    http: HttpClient,
    store: LazyStore,
}

impl HttpConsumer {
    pub fn new(http: HttpClient, store: LazyStore) -> Self {
        Self { http, store }
    }

    /// Reuse a live association with the provider or negotiate a new one.
    ///
    /// Only TLS endpoints get associations; anything else runs stateless.
    async fn association_for(
        &self,
        endpoint: &PendingDiscovery,
    ) -> Result<Option<Association>, OpenIdError> {
        let Ok(server_url) = Url::parse(&endpoint.server_url) else {
            return Ok(None);
        };
        if server_url.scheme() != "https" || endpoint.version != ProtocolVersion::V2 {
            return Ok(None);
        }

        let store = self.store.get().await?;
        if let Some(existing) = store.get_association(&endpoint.server_url, None).await? {
            if !existing.is_expired(nonce::now()) {
                return Ok(Some(existing));
            }
        }

        match self.associate(&server_url).await {
            Ok(Some(association)) => {
                store
                    .store_association(&endpoint.server_url, &association)
                    .await?;
                Ok(Some(association))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(server_url = %endpoint.server_url, "association failed, using stateless mode: {e}");
                Ok(None)
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn associate(&self, server_url: &Url) -> Result<Option<Association>, OpenIdError> {
        let request = vec![
            ("openid.ns".to_string(), OPENID2_NS.to_string()),
            ("openid.mode".to_string(), "associate".to_string()),
            (
                "openid.assoc_type".to_string(),
                AssocType::HmacSha256.as_str().to_string(),
            ),
            ("openid.session_type".to_string(), "no-encryption".to_string()),
        ];
        let response = self.http.post_form(server_url, &request).await?;
        let pairs = kvform::decode(&response.text());

        if let Some(code) = kvform::get(&pairs, "error_code") {
            debug!(code, error = kvform::get(&pairs, "error"), "provider refused association");
            return Ok(None);
        }
        if !response.status.is_success() {
            return Err(OpenIdError::Malformed(format!(
                "associate returned HTTP {}",
                response.status
            )));
        }

        let field = |name: &str| {
            kvform::get(&pairs, name)
                .ok_or_else(|| OpenIdError::Malformed(format!("associate response lacks {name}")))
        };
        let assoc_type = AssocType::parse(field("assoc_type")?)
            .ok_or_else(|| OpenIdError::Malformed("unknown assoc_type".into()))?;
        if field("session_type")? != "no-encryption" {
            return Err(OpenIdError::Malformed("unexpected session_type".into()));
        }
        let lifetime: i64 = field("expires_in")?
            .parse()
            .map_err(|_| OpenIdError::Malformed("expires_in is not a number".into()))?;
        let secret = STANDARD
            .decode(field("mac_key")?)
            .map_err(|e| OpenIdError::Malformed(format!("mac_key: {e}")))?;

        Association::new(
            field("assoc_handle")?.to_string(),
            secret,
            nonce::now(),
            lifetime,
            assoc_type,
        )
        .map(Some)
    }

    /// Check the positive assertion; returns identity and display identifier.
    async fn verify_id_res(
        &self,
        params: &BTreeMap<String, String>,
        current_url: &str,
        pending: Option<&PendingDiscovery>,
    ) -> Result<Result<(String, String), IdResFailure>, OpenIdError> {
        let v2 = params.get("openid.ns").map(String::as_str) == Some(OPENID2_NS);
        if let Some(pending) = pending {
            if (pending.version == ProtocolVersion::V2) != v2 {
                return Ok(Err(IdResFailure::new(
                    format!(
                        "Response protocol version does not match the discovered {:?} endpoint",
                        pending.version
                    ),
                    pending.claimed_id.as_deref().map(|c| without_fragment(c).to_string()),
                )));
            }
        }

        if let Err(message) = check_return_to(params, current_url) {
            return Ok(Err(IdResFailure::new(message, None)));
        }

        let endpoint = if v2 {
            match self.verify_discovery_v2(params, pending).await? {
                Ok(endpoint) => endpoint,
                Err(failure) => return Ok(Err(failure)),
            }
        } else {
            match verify_discovery_v1(params, pending) {
                Ok(endpoint) => endpoint,
                Err(failure) => return Ok(Err(failure)),
            }
        };
        let claimed_id = endpoint
            .claimed_id
            .clone()
            .unwrap_or_default();
        let display = without_fragment(&claimed_id).to_string();

        if let Err(message) = self.check_signature(params, &endpoint, v2).await? {
            return Ok(Err(IdResFailure::new(message, Some(display))));
        }
        if let Err(message) = self.check_nonce(params, &endpoint, v2).await? {
            return Ok(Err(IdResFailure::new(message, Some(display))));
        }

        Ok(Ok((claimed_id, display)))
    }

    async fn verify_discovery_v2(
        &self,
        params: &BTreeMap<String, String>,
        pending: Option<&PendingDiscovery>,
    ) -> Result<Result<PendingDiscovery, IdResFailure>, OpenIdError> {
        let Some(op_endpoint) = params.get("openid.op_endpoint") else {
            return Ok(Err(IdResFailure::new("Missing openid.op_endpoint", None)));
        };
        let (Some(claimed_id), Some(identity)) =
            (params.get("openid.claimed_id"), params.get("openid.identity"))
        else {
            return Ok(Err(IdResFailure::new(
                "Response does not assert an identifier",
                None,
            )));
        };
        let display = without_fragment(claimed_id).to_string();

        let matches = |ep: &PendingDiscovery| {
            ep.version == ProtocolVersion::V2
                && ep.server_url == *op_endpoint
                && !ep.op_identifier
                && ep.claimed_id.as_deref().map(without_fragment) == Some(display.as_str())
                && ep.local_id() == Some(identity.as_str())
        };

        if let Some(ep) = pending.filter(|ep| matches(*ep)) {
            let mut endpoint = ep.clone();
            endpoint.claimed_id = Some(claimed_id.clone());
            return Ok(Ok(endpoint));
        }

        debug!(%claimed_id, "response does not match pending discovery, rediscovering");
        let discovered = match discovery::discover(&self.http, &display).await {
            Ok(eps) => eps,
            Err(OpenIdError::Store(e)) => return Err(OpenIdError::Store(e)),
            Err(e) => {
                return Ok(Err(IdResFailure::new(
                    format!("Discovery of {display} failed: {e}"),
                    Some(display),
                )));
            }
        };
        match discovered.into_iter().find(|ep| matches(ep)) {
            Some(mut endpoint) => {
                endpoint.claimed_id = Some(claimed_id.clone());
                Ok(Ok(endpoint))
            }
            None => Ok(Err(IdResFailure::new(
                format!("No matching endpoint found after discovering {display}"),
                Some(display),
            ))),
        }
    }

    async fn check_signature(
        &self,
        params: &BTreeMap<String, String>,
        endpoint: &PendingDiscovery,
        v2: bool,
    ) -> Result<Result<(), String>, OpenIdError> {
        let Some(signed) = params.get("openid.signed") else {
            return Ok(Err("Missing openid.signed".into()));
        };
        let signed: Vec<&str> = signed.split(',').collect();
        if v2 {
            for field in REQUIRED_SIGNED {
                if params.contains_key(&format!("openid.{field}")) && !signed.contains(&field) {
                    return Ok(Err(format!("openid.{field} is not signed")));
                }
            }
        } else {
            for field in REQUIRED_SIGNED_V1 {
                if !signed.contains(&field) {
                    return Ok(Err(format!("openid.{field} is not signed")));
                }
            }
        }
        let Some(handle) = params.get("openid.assoc_handle") else {
            return Ok(Err("Missing openid.assoc_handle".into()));
        };

        let store = self.store.get().await?;
        let association = store
            .get_association(&endpoint.server_url, Some(handle))
            .await?
            .filter(|a| !a.is_expired(nonce::now()));

        match association {
            Some(association) => match association.check_signature(params) {
                Ok(true) => Ok(Ok(())),
                Ok(false) => Ok(Err("Bad signature".into())),
                Err(e) => Ok(Err(e.to_string())),
            },
            None => self.check_authentication(params, endpoint).await,
        }
    }

    /// Ask the provider to verify its own signature (stateless mode).
    #[tracing::instrument(skip(self, params))]
    async fn check_authentication(
        &self,
        params: &BTreeMap<String, String>,
        endpoint: &PendingDiscovery,
    ) -> Result<Result<(), String>, OpenIdError> {
        let server_url = match Url::parse(&endpoint.server_url) {
            Ok(u) => u,
            Err(e) => return Ok(Err(format!("Bad provider endpoint: {e}"))),
        };
        let request: Vec<(String, String)> = params
            .iter()
            .filter(|(k, _)| k.starts_with("openid."))
            .map(|(k, v)| {
                if k == "openid.mode" {
                    (k.clone(), "check_authentication".to_string())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect();

        let response = match self.http.post_form(&server_url, &request).await {
            Ok(r) => r,
            Err(e) => return Ok(Err(format!("check_authentication failed: {e}"))),
        };
        let pairs = kvform::decode(&response.text());

        if let Some(handle) = kvform::get(&pairs, "invalidate_handle") {
            let store = self.store.get().await?;
            store
                .remove_association(&endpoint.server_url, handle)
                .await?;
        }
        if response.status.is_success() && kvform::get(&pairs, "is_valid") == Some("true") {
            Ok(Ok(()))
        } else {
            Ok(Err("Server denied check_authentication".into()))
        }
    }

    async fn check_nonce(
        &self,
        params: &BTreeMap<String, String>,
        endpoint: &PendingDiscovery,
        v2: bool,
    ) -> Result<Result<(), String>, OpenIdError> {
        let (value, server_url) = if v2 {
            (params.get("openid.response_nonce").cloned(), endpoint.server_url.as_str())
        } else {
            (signed_return_to_param(params, OPENID1_NONCE), "")
        };
        let Some(value) = value else {
            return Ok(Err("Missing response nonce".into()));
        };
        let Some((timestamp, salt)) = nonce::split(&value) else {
            return Ok(Err(format!("Malformed nonce {value}")));
        };
        if !nonce::within_skew(timestamp, nonce::now()) {
            return Ok(Err("Nonce already used or out of range".into()));
        }
        let store = self.store.get().await?;
        if store.use_nonce(server_url, timestamp, salt).await? {
            Ok(Ok(()))
        } else {
            Ok(Err("Nonce already used or out of range".into()))
        }
    }
}

#[derive(Debug)]
struct IdResFailure {
    message: String,
    display_identifier: Option<String>,
}

impl IdResFailure {
    fn new(message: impl Into<String>, display_identifier: Option<String>) -> Self {
        Self {
            message: message.into(),
            display_identifier,
        }
    }
}

fn verify_discovery_v1(
    params: &BTreeMap<String, String>,
    pending: Option<&PendingDiscovery>,
) -> Result<PendingDiscovery, IdResFailure> {
    let Some(pending) = pending else {
        return Err(IdResFailure::new(
            "OpenID 1 response without a pending request",
            None,
        ));
    };
    let claimed =
        signed_return_to_param(params, OPENID1_CLAIMED_ID).or_else(|| pending.claimed_id.clone());
    let display = claimed.as_deref().map(|c| without_fragment(c).to_string());
    let identity = params.get("openid.identity").map(String::as_str);
    if identity.is_none() || identity != pending.local_id() {
        return Err(IdResFailure::new(
            "openid.identity does not match the discovered identifier",
            display,
        ));
    }
    if claimed.as_deref() != pending.claimed_id.as_deref() {
        return Err(IdResFailure::new(
            "Claimed identifier does not match the pending request",
            display,
        ));
    }
    Ok(pending.clone())
}

/// Query parameter of `openid.return_to`, the only place OpenID 1 state is trusted from.
fn signed_return_to_param(params: &BTreeMap<String, String>, name: &str) -> Option<String> {
    let return_to = Url::parse(params.get("openid.return_to")?).ok()?;
    return_to
        .query_pairs()
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.into_owned())
}

/// `openid.return_to` must point at the URL the response arrived at.
fn check_return_to(params: &BTreeMap<String, String>, current_url: &str) -> Result<(), String> {
    let Some(return_to) = params.get("openid.return_to") else {
        return Err("Missing openid.return_to".into());
    };
    let (Ok(expected), Ok(actual)) = (Url::parse(current_url), Url::parse(return_to)) else {
        return Err(format!("Unparseable return_to {return_to}"));
    };
    let same_target = expected.scheme() == actual.scheme()
        && expected.host_str() == actual.host_str()
        && expected.port_or_known_default() == actual.port_or_known_default()
        && expected.path() == actual.path();
    if !same_target {
        return Err(format!(
            "return_to does not match return URL. Expected {current_url}, got {return_to}"
        ));
    }
    for (key, value) in actual.query_pairs() {
        if params.get(key.as_ref()).map(String::as_str) != Some(value.as_ref()) {
            return Err(format!("Parameter {key} value does not match return_to"));
        }
    }
    Ok(())
}

#[async_trait]
impl OpenIdClient for HttpConsumer {
    type Request = CheckIdRequest;

    #[tracing::instrument(skip(self))]
    async fn begin(&self, identifier: &str) -> Result<CheckIdRequest, OpenIdError> {
        let endpoints = discovery::discover(&self.http, identifier).await?;
        let endpoint = endpoints.into_iter().next().ok_or_else(|| {
            OpenIdError::Discovery(format!("No usable OpenID services found for {identifier}"))
        })?;
        info!(server_url = %endpoint.server_url, version = ?endpoint.version, "discovered OpenID provider");

        let assoc_handle = self
            .association_for(&endpoint)
            .await?
            .map(|a| a.handle);
        let openid1_nonce = match endpoint.version {
            ProtocolVersion::V1 => Some(
                nonce::make()
                    .map_err(|e| OpenIdError::Discovery(format!("cannot create nonce: {e}")))?,
            ),
            ProtocolVersion::V2 => None,
        };

        Ok(CheckIdRequest {
            endpoint,
            assoc_handle,
            openid1_nonce,
        })
    }

    #[tracing::instrument(skip(self, params, pending))]
    async fn complete(
        &self,
        params: &BTreeMap<String, String>,
        current_url: &str,
        pending: Option<&PendingDiscovery>,
    ) -> Result<VerificationOutcome, OpenIdError> {
        let mode = params.get("openid.mode").map(String::as_str).unwrap_or("");
        let v2 = params.get("openid.ns").map(String::as_str) == Some(OPENID2_NS);

        let outcome = match mode {
            "cancel" => VerificationOutcome::Cancelled,
            "error" => VerificationOutcome::Failure {
                message: params
                    .get("openid.error")
                    .cloned()
                    .unwrap_or_else(|| "Unknown provider error".into()),
                display_identifier: None,
            },
            "setup_needed" if v2 => VerificationOutcome::SetupNeeded { setup_url: None },
            "id_res" if !v2 && params.contains_key("openid.user_setup_url") => {
                VerificationOutcome::SetupNeeded {
                    setup_url: params.get("openid.user_setup_url").cloned(),
                }
            }
            "id_res" => match self.verify_id_res(params, current_url, pending).await? {
                Ok((identity_url, display_identifier)) => VerificationOutcome::Success {
                    identity_url,
                    display_identifier,
                },
                Err(failure) => VerificationOutcome::Failure {
                    message: failure.message,
                    display_identifier: failure.display_identifier,
                },
            },
            other => VerificationOutcome::Failure {
                message: format!("Invalid openid.mode '{other}'"),
                display_identifier: None,
            },
        };
        Ok(outcome)
    }
}

/// Discovered request for one provider.
#[derive(Clone, Debug)]
pub struct CheckIdRequest {
    endpoint: PendingDiscovery,
    assoc_handle: Option<String>,
    openid1_nonce: Option<String>,
}

impl CheckIdRequest {
    pub fn endpoint(&self) -> &PendingDiscovery {
        &self.endpoint
    }

    pub fn assoc_handle(&self) -> Option<&str> {
        self.assoc_handle.as_deref()
    }

    fn return_to_with_nonce(&self, return_to: &str) -> String {
        let Some(n) = &self.openid1_nonce else {
            return return_to.to_string();
        };
        let Ok(mut url) = Url::parse(return_to) else {
            return return_to.to_string();
        };
        url.query_pairs_mut().append_pair(OPENID1_NONCE, n);
        if let Some(claimed) = &self.endpoint.claimed_id {
            url.query_pairs_mut().append_pair(OPENID1_CLAIMED_ID, claimed);
        }
        url.to_string()
    }

    /// Message fields in the order they are sent.
    pub fn fields(&self, realm: &str, return_to: &str, immediate: bool) -> Vec<(String, String)> {
        let mode = if immediate {
            "checkid_immediate"
        } else {
            "checkid_setup"
        };
        let mut fields = Vec::new();
        let mut push = |k: &str, v: &str| fields.push((k.to_string(), v.to_string()));

        match self.endpoint.version {
            ProtocolVersion::V2 => {
                push("openid.ns", OPENID2_NS);
                push("openid.mode", mode);
                let (claimed, identity) = if self.endpoint.op_identifier {
                    (IDENTIFIER_SELECT, IDENTIFIER_SELECT)
                } else {
                    (
                        self.endpoint.claimed_id.as_deref().unwrap_or(IDENTIFIER_SELECT),
                        self.endpoint.local_id().unwrap_or(IDENTIFIER_SELECT),
                    )
                };
                push("openid.claimed_id", claimed);
                push("openid.identity", identity);
                push("openid.return_to", return_to);
                push("openid.realm", realm);
            }
            ProtocolVersion::V1 => {
                push("openid.mode", mode);
                push("openid.identity", self.endpoint.local_id().unwrap_or_default());
                push("openid.return_to", &self.return_to_with_nonce(return_to));
                push("openid.trust_root", realm);
            }
        }
        if let Some(handle) = &self.assoc_handle {
            push("openid.assoc_handle", handle);
        }
        fields
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

impl AuthRequest for CheckIdRequest {
    fn send_redirect(&self, realm: &str, return_to: &str, immediate: bool) -> bool {
        self.endpoint.version == ProtocolVersion::V1
            || self.redirect_url(realm, return_to, immediate).len() <= OPENID1_URL_LIMIT
    }

    fn redirect_url(&self, realm: &str, return_to: &str, immediate: bool) -> String {
        let fields = self.fields(realm, return_to, immediate);
        match Url::parse(&self.endpoint.server_url) {
            Ok(mut url) => {
                url.query_pairs_mut().extend_pairs(fields.iter());
                url.to_string()
            }
            Err(_) => {
                let query = serde_urlencoded::to_string(&fields).unwrap_or_default();
                format!("{}?{}", self.endpoint.server_url, query)
            }
        }
    }

    fn form_markup(
        &self,
        realm: &str,
        return_to: &str,
        immediate: bool,
        form_attrs: &[(&str, &str)],
    ) -> String {
        let mut html = format!(
            "<form accept-charset=\"UTF-8\" enctype=\"application/x-www-form-urlencoded\" action=\"{}\" method=\"post\"",
            html_escape(&self.endpoint.server_url)
        );
        for (name, value) in form_attrs {
            if matches!(*name, "action" | "method") {
                continue;
            }
            html.push_str(&format!(" {}=\"{}\"", html_escape(name), html_escape(value)));
        }
        html.push_str(">\n");
        for (name, value) in self.fields(realm, return_to, immediate) {
            html.push_str(&format!(
                "<input type=\"hidden\" name=\"{}\" value=\"{}\" />\n",
                html_escape(&name),
                html_escape(&value)
            ));
        }
        html.push_str("<input type=\"submit\" value=\"Continue\" />\n</form>\n");
        html
    }

    fn pending(&self) -> PendingDiscovery {
        self.endpoint.clone()
    }
}
