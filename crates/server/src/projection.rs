//! Mapping from a verified OpenID identity to the session's authorization fields.

use crate::registration::Registration;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

static NODE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"openid/server/node/(.+)$").expect("static regex"));

/// The `level` session field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Admin,
    Node,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::Admin => f.write_str("admin"),
            AccessLevel::Node => f.write_str("node"),
        }
    }
}

/// Privilege granted to a session. A node session always names its node.
///
/// Admins that authenticated through a node-shaped identity keep that node name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Privilege {
    Admin { node_name: Option<String> },
    Node { node_name: String },
}

/// Authenticated part of a browser session: `openid`, `level` and `node_name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthSession {
    pub openid: String,
    pub privilege: Privilege,
}

impl AuthSession {
    pub fn level(&self) -> AccessLevel {
        match self.privilege {
            Privilege::Admin { .. } => AccessLevel::Admin,
            Privilege::Node { .. } => AccessLevel::Node,
        }
    }

    pub fn node_name(&self) -> Option<&str> {
        match &self.privilege {
            Privilege::Admin { node_name } => node_name.as_deref(),
            Privilege::Node { node_name } => Some(node_name),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.level() == AccessLevel::Admin
    }
}

/// Extract `<name>` from display identifiers ending in `openid/server/node/<name>`.
pub fn node_name_from_display_identifier(display_identifier: &str) -> Option<&str> {
    NODE_IDENTIFIER
        .captures(display_identifier)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Session for an identity that is not node-shaped.
pub fn admin_session(identity_url: &str) -> AuthSession {
    AuthSession {
        openid: identity_url.to_string(),
        privilege: Privilege::Admin { node_name: None },
    }
}

/// Session for a node-shaped identity whose registration was loaded.
pub fn registered_session(identity_url: &str, registration: &Registration) -> AuthSession {
    let node_name = registration.name.clone();
    let privilege = if registration.admin {
        Privilege::Admin {
            node_name: Some(node_name),
        }
    } else {
        Privilege::Node { node_name }
    };
    AuthSession {
        openid: identity_url.to_string(),
        privilege,
    }
}
