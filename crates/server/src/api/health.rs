//! Health check endpoint.

/// Liveness probe; answers GET and HEAD.
#[tracing::instrument()]
pub async fn health() -> &'static str {
    "ok"
}
