use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Response body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("CouchDB returned HTTP {status}: {context}")]
    CouchDb { status: u16, context: String },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum OpenIdError {
    #[error("{0}")]
    Discovery(String),
    #[error("Unsupported identifier: {0}")]
    UnsupportedIdentifier(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("No registration named {0}")]
    NotFound(String),
    #[error("Registration database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

/// Failures of one authentication attempt, each mapped to a client-facing status.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Discovery failed for {identifier}: {message}")]
    Discovery { identifier: String, message: String },
    #[error("No OpenID identifier given")]
    MissingIdentifier,
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    VerificationFailed(String),
    #[error("No registration for node {0}")]
    UnknownRegistration(String),
    #[error(transparent)]
    Registration(RegistrationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RegistrationError> for ConsumerError {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::NotFound(name) => ConsumerError::UnknownRegistration(name),
            other => ConsumerError::Registration(other),
        }
    }
}

impl ConsumerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ConsumerError::Discovery { .. }
            | ConsumerError::MissingIdentifier
            | ConsumerError::VerificationFailed(_) => StatusCode::BAD_REQUEST,
            ConsumerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ConsumerError::UnknownRegistration(_) => StatusCode::FORBIDDEN,
            ConsumerError::Registration(_) | ConsumerError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ConsumerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "OpenID consumer request failed");
        } else {
            tracing::info!(error = %self, status = %status, "OpenID consumer request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        let discovery = ConsumerError::Discovery {
            identifier: "https://x".into(),
            message: "no endpoint".into(),
        };
        assert_eq!(discovery.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            discovery.to_string(),
            "Discovery failed for https://x: no endpoint"
        );
        assert_eq!(
            ConsumerError::Unauthorized("no".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ConsumerError::UnknownRegistration("web01".into()).status(),
            StatusCode::FORBIDDEN
        );
        let store = ConsumerError::Store(StoreError::CouchDb {
            status: 500,
            context: "boom".into(),
        });
        assert_eq!(store.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn missing_registration_maps_to_unknown() {
        let e: ConsumerError = RegistrationError::NotFound("web01".into()).into();
        assert!(matches!(e, ConsumerError::UnknownRegistration(ref n) if n == "web01"));
    }
}
