//! HTTP surface.
//!
//! - `consumer` - the OpenID routes under `/openid/consumer`
//! - `pages` - application root and the `/nodes` landing page
//! - `health` - health check (`/healthz`)

pub mod consumer;
pub mod health;
pub mod pages;

use crate::config::ConsumerSettings;
use crate::consumer::{CONSUMER_PATH, ConsumerFlow, NODES_PATH};
use crate::openid::ConsumerFactory;
use crate::registration::RegistrationSource;
use crate::session::SessionStore;
use askama::Template;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState<F: ConsumerFactory> {
    pub settings: Arc<ConsumerSettings>,
    pub sessions: SessionStore,
    pub registrations: Arc<dyn RegistrationSource>,
    pub factory: F,
}

impl<F: ConsumerFactory> AppState<F> {
    /// Flow for one request, around a fresh protocol client.
    pub fn flow(&self) -> ConsumerFlow<F::Client> {
        ConsumerFlow::new(
            self.settings.clone(),
            self.registrations.clone(),
            self.factory.consumer(),
        )
    }
}

pub fn router<F: ConsumerFactory>(state: AppState<F>) -> Router {
    Router::new()
        .route("/", get(pages::root::<F>))
        .route(NODES_PATH, get(pages::nodes::<F>))
        .nest(CONSUMER_PATH, consumer::router::<F>())
        .route("/healthz", get(health::health).head(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the application on `listen_addr` until the process stops.
#[tracing::instrument(skip(state))]
pub async fn start_webserver<F: ConsumerFactory>(
    state: AppState<F>,
    listen_addr: &str,
) -> color_eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = listen_addr, "Server running");
    axum::serve(listener, router(state).into_make_service())
        .await
        .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}

pub(crate) fn render<T: Template>(template: &T) -> Response {
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!("Failed to render template: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render page").into_response()
        }
    }
}

pub(crate) fn session_unavailable(e: getrandom::Error) -> Response {
    error!("Cannot create session id: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, "Session unavailable").into_response()
}
