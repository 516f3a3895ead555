//! The relying-party flow: `start`, `login`, `complete` and `logout`.
//!
//! A [`ConsumerFlow`] is built per request around one [`OpenIdClient`]. It
//! owns the sequencing of protocol calls and is the only place where session
//! state is written. Every failure path returns before the session is
//! touched.

use crate::config::ConsumerSettings;
use crate::error::{ConsumerError, OpenIdError};
use crate::openid::{AuthRequest, OpenIdClient, VerificationOutcome};
use crate::policy::{is_authorized_identifier, is_authorized_provider};
use crate::projection::{self, AuthSession};
use crate::registration::RegistrationSource;
use crate::session::SessionData;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Path of the consumer routes below `base_url`; also the realm.
pub const CONSUMER_PATH: &str = "/openid/consumer";
/// Callback the provider sends the browser back to.
pub const COMPLETE_PATH: &str = "/openid/consumer/complete";
/// Landing page after a successful login.
pub const NODES_PATH: &str = "/nodes";

/// Parameters the router adds that never belong to the provider response.
const ROUTING_PARAMS: [&str; 2] = ["controller", "action"];

/// What `start` hands back to the HTTP layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// Send the browser to the provider with a 302.
    Redirect(String),
    /// Render this auto-submitting form.
    Form(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompleteOutcome {
    Authenticated { redirect_to: String, message: String },
    /// Plain text status; the session was not modified.
    Status(String),
}

pub struct ConsumerFlow<C> {
    settings: Arc<ConsumerSettings>,
    registrations: Arc<dyn RegistrationSource>,
    client: C,
}

impl<C: OpenIdClient> ConsumerFlow<C> {
    pub fn new(
        settings: Arc<ConsumerSettings>,
        registrations: Arc<dyn RegistrationSource>,
        client: C,
    ) -> Self {
        Self {
            settings,
            registrations,
            client,
        }
    }

    fn url_for(&self, path: &str) -> String {
        self.settings.url_for(path)
    }

    /// `openid.realm` sent to providers.
    pub fn realm(&self) -> String {
        self.url_for(CONSUMER_PATH)
    }

    /// `openid.return_to` sent to providers, and the URL `complete` checks against.
    pub fn return_to(&self) -> String {
        self.url_for(COMPLETE_PATH)
    }

    pub fn application_root(&self) -> String {
        self.url_for("/")
    }

    /// Discover the provider and build the request that sends the browser there.
    #[tracing::instrument(skip(self, session))]
    pub async fn start(
        &self,
        identifier: Option<&str>,
        immediate: bool,
        session: &mut SessionData,
    ) -> Result<StartOutcome, ConsumerError> {
        let identifier = identifier
            .filter(|id| !id.trim().is_empty())
            .ok_or(ConsumerError::MissingIdentifier)?;

        let request = self
            .client
            .begin(identifier)
            .await
            .map_err(|e| match e {
                OpenIdError::Store(e) => ConsumerError::Store(e),
                other => ConsumerError::Discovery {
                    identifier: identifier.to_string(),
                    message: other.to_string(),
                },
            })?;

        let realm = self.realm();
        let return_to = self.return_to();
        let outcome = if request.send_redirect(&realm, &return_to, immediate) {
            StartOutcome::Redirect(request.redirect_url(&realm, &return_to, immediate))
        } else {
            StartOutcome::Form(request.form_markup(
                &realm,
                &return_to,
                immediate,
                &[("id", "openid_form")],
            ))
        };

        session.pending = Some(request.pending());
        Ok(outcome)
    }

    /// `start`, gated by both allowlists.
    ///
    /// The provider allowlist is checked against the identifier as typed,
    /// before anything is discovered.
    #[tracing::instrument(skip(self, session))]
    pub async fn login(
        &self,
        identifier: Option<&str>,
        immediate: bool,
        session: &mut SessionData,
    ) -> Result<StartOutcome, ConsumerError> {
        let shown = identifier.unwrap_or_default();
        if !is_authorized_identifier(identifier, &self.settings.authorized_identifiers) {
            warn!(identifier = shown, "identifier not authorized");
            return Err(ConsumerError::Unauthorized(format!(
                "Sorry, {shown} is not an authorized OpenID."
            )));
        }
        if !is_authorized_provider(identifier, &self.settings.authorized_providers) {
            warn!(identifier = shown, "provider not authorized");
            return Err(ConsumerError::Unauthorized(format!(
                "Sorry, {shown} is not an authorized OpenID Provider."
            )));
        }
        self.start(identifier, immediate, session).await
    }

    /// Verify the provider response and, on success, authenticate the session.
    #[tracing::instrument(skip(self, params, session))]
    pub async fn complete(
        &self,
        mut params: BTreeMap<String, String>,
        session: &mut SessionData,
    ) -> Result<CompleteOutcome, ConsumerError> {
        for name in ROUTING_PARAMS {
            params.remove(name);
        }
        let current_url = self.return_to();

        let outcome = self
            .client
            .complete(&params, &current_url, session.pending.as_ref())
            .await
            .map_err(|e| match e {
                OpenIdError::Store(e) => ConsumerError::Store(e),
                other => ConsumerError::VerificationFailed(format!(
                    "Verification failed: {other}"
                )),
            })?;

        match outcome {
            VerificationOutcome::Failure {
                message,
                display_identifier,
            } => {
                let mut text = format!("Verification failed: {message}");
                if let Some(display) = display_identifier {
                    text.push_str(&format!(" for identifier '{display}'"));
                }
                Err(ConsumerError::VerificationFailed(text))
            }
            VerificationOutcome::Success {
                identity_url,
                display_identifier,
            } => {
                let auth = self.project(&identity_url, &display_identifier).await?;
                info!(
                    openid = %auth.openid,
                    level = %auth.level(),
                    node_name = auth.node_name(),
                    "OpenID verification succeeded"
                );
                session.auth = Some(auth);
                session.pending = None;
                let redirect_to = session
                    .return_to
                    .take()
                    .unwrap_or_else(|| self.url_for(NODES_PATH));
                Ok(CompleteOutcome::Authenticated {
                    redirect_to,
                    message: format!("Verification of {display_identifier} succeeded."),
                })
            }
            VerificationOutcome::SetupNeeded { .. } => Ok(CompleteOutcome::Status(
                "Immediate request failed - Setup Needed".into(),
            )),
            VerificationOutcome::Cancelled => Ok(CompleteOutcome::Status(
                "OpenID transaction cancelled.".into(),
            )),
        }
    }

    async fn project(
        &self,
        identity_url: &str,
        display_identifier: &str,
    ) -> Result<AuthSession, ConsumerError> {
        match projection::node_name_from_display_identifier(display_identifier) {
            Some(name) => {
                let registration = self.registrations.load(name).await?;
                info!(
                    node_name = name,
                    admin = registration.admin,
                    "node identity resolved"
                );
                Ok(projection::registered_session(identity_url, &registration))
            }
            None => Ok(projection::admin_session(identity_url)),
        }
    }

    /// Forget the authenticated identity; returns where to send the browser.
    pub fn logout(&self, session: &mut SessionData) -> String {
        session.clear_auth();
        self.application_root()
    }
}
