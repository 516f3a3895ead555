//! OpenID 2.0 relying-party protocol support.
//!
//! The consumer flow talks to the protocol through [`OpenIdClient`] and
//! [`AuthRequest`]. [`HttpConsumer`] is the implementation used in
//! production: HTML and XRDS discovery, `no-encryption` HMAC associations
//! over TLS, and direct verification as the fallback for stateless mode.
//! Diffie-Hellman association sessions are not implemented.

pub mod association;
pub mod client;
pub mod discovery;
pub mod kvform;
pub mod nonce;

use crate::error::OpenIdError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use association::{AssocType, Association};
pub use client::{CheckIdRequest, HttpConsumer, HttpConsumerFactory};

pub const OPENID2_NS: &str = "http://specs.openid.net/auth/2.0";
pub const IDENTIFIER_SELECT: &str = "http://specs.openid.net/auth/2.0/identifier_select";
/// Longest redirect URL sent for OpenID 2 requests; longer requests are form-posted.
pub const OPENID1_URL_LIMIT: usize = 2047;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V1,
    V2,
}

/// A provider endpoint found by discovery.
///
/// Kept in the browser session between `start` and `complete`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDiscovery {
    pub server_url: String,
    pub claimed_id: Option<String>,
    pub local_id: Option<String>,
    pub version: ProtocolVersion,
    /// Discovered from an OP identifier; the provider picks the identity.
    pub op_identifier: bool,
}

impl PendingDiscovery {
    /// Identifier sent as `openid.identity`.
    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref().or(self.claimed_id.as_deref())
    }
}

/// Result of checking a provider response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationOutcome {
    Success {
        identity_url: String,
        display_identifier: String,
    },
    Failure {
        message: String,
        display_identifier: Option<String>,
    },
    SetupNeeded {
        setup_url: Option<String>,
    },
    Cancelled,
}

/// A discovered authentication request ready to be sent to the provider.
pub trait AuthRequest: Send + Sync {
    /// Whether the request fits in a redirect; otherwise it is form-posted.
    fn send_redirect(&self, realm: &str, return_to: &str, immediate: bool) -> bool;

    fn redirect_url(&self, realm: &str, return_to: &str, immediate: bool) -> String;

    /// HTML form posting the request; `form_attrs` are added to the `<form>` tag.
    fn form_markup(
        &self,
        realm: &str,
        return_to: &str,
        immediate: bool,
        form_attrs: &[(&str, &str)],
    ) -> String;

    fn pending(&self) -> PendingDiscovery;
}

#[async_trait]
pub trait OpenIdClient: Send + Sync {
    type Request: AuthRequest;

    /// Discover the provider for `identifier`.
    async fn begin(&self, identifier: &str) -> Result<Self::Request, OpenIdError>;

    /// Check a provider response that arrived at `current_url`.
    async fn complete(
        &self,
        params: &BTreeMap<String, String>,
        current_url: &str,
        pending: Option<&PendingDiscovery>,
    ) -> Result<VerificationOutcome, OpenIdError>;
}

/// Builds one [`OpenIdClient`] per consumer flow.
pub trait ConsumerFactory: Clone + Send + Sync + 'static {
    type Client: OpenIdClient;

    fn consumer(&self) -> Self::Client;
}
