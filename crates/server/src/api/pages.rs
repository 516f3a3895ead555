//! Pages outside the OpenID routes.

use super::consumer::found;
use super::{AppState, render, session_unavailable};
use crate::consumer::{CONSUMER_PATH, NODES_PATH};
use crate::openid::ConsumerFactory;
use crate::projection::AuthSession;
use askama::Template;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;

#[derive(Template)]
#[template(path = "root.html")]
struct RootPage {
    auth: Option<AuthSession>,
    login_url: String,
    logout_url: String,
}

#[derive(Template)]
#[template(path = "nodes.html")]
struct NodesPage {
    auth: AuthSession,
    logout_url: String,
}

#[tracing::instrument(skip_all)]
pub async fn root<F: ConsumerFactory>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
) -> Response {
    let session = match state.sessions.load(&headers) {
        Ok(session) => session,
        Err(e) => return session_unavailable(e),
    };
    let page = RootPage {
        auth: session.data.auth.clone(),
        login_url: state.settings.url_for(CONSUMER_PATH),
        logout_url: state.settings.url_for(&format!("{CONSUMER_PATH}/logout")),
    };
    let response = render(&page);
    state.sessions.commit(session, response)
}

/// Landing page after login. Anonymous visitors are sent to the login form
/// and brought back here once verified.
#[tracing::instrument(skip_all)]
pub async fn nodes<F: ConsumerFactory>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
) -> Response {
    let mut session = match state.sessions.load(&headers) {
        Ok(session) => session,
        Err(e) => return session_unavailable(e),
    };
    let response = match session.data.auth.clone() {
        Some(auth) => render(&NodesPage {
            auth,
            logout_url: state.settings.url_for(&format!("{CONSUMER_PATH}/logout")),
        }),
        None => {
            session.data.return_to = Some(state.settings.url_for(NODES_PATH));
            found(&state.settings.url_for(CONSUMER_PATH))
        }
    };
    state.sessions.commit(session, response)
}
