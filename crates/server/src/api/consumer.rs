//! Routes under `/openid/consumer`.

use super::{AppState, render, session_unavailable};
use crate::consumer::{CONSUMER_PATH, CompleteOutcome, StartOutcome};
use crate::openid::ConsumerFactory;
use askama::Template;
use axum::extract::{Form, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Default, Deserialize)]
pub struct LoginParams {
    pub openid_identifier: Option<String>,
    /// Any value, including an empty one, asks for immediate mode.
    pub immediate: Option<String>,
}

#[derive(Template)]
#[template(path = "login.html")]
struct LoginPage {
    login_url: String,
}

#[derive(Template)]
#[template(path = "login_form.html")]
struct LoginFragment {
    login_url: String,
}

#[derive(Template)]
#[template(path = "form_post.html")]
struct FormPostPage {
    form: String,
}

pub(crate) fn router<F: ConsumerFactory>() -> Router<AppState<F>> {
    Router::new()
        .route("/", get(index::<F>))
        .route("/start", get(start_query::<F>).post(start_form::<F>))
        .route("/login", get(login_query::<F>).post(login_form::<F>))
        .route("/complete", get(complete_query::<F>).post(complete_form::<F>))
        .route("/logout", get(logout::<F>))
}

pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn is_xhr(headers: &HeaderMap) -> bool {
    headers
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
}

/// Login form; only the fragment for XHR requests.
#[tracing::instrument(skip_all)]
async fn index<F: ConsumerFactory>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
) -> Response {
    let login_url = state.settings.url_for(&format!("{CONSUMER_PATH}/login"));
    if is_xhr(&headers) {
        render(&LoginFragment { login_url })
    } else {
        render(&LoginPage { login_url })
    }
}

#[derive(Clone, Copy)]
enum Gate {
    Open,
    Allowlisted,
}

async fn begin<F: ConsumerFactory>(
    state: AppState<F>,
    headers: HeaderMap,
    params: LoginParams,
    gate: Gate,
) -> Response {
    let mut session = match state.sessions.load(&headers) {
        Ok(session) => session,
        Err(e) => return session_unavailable(e),
    };
    let flow = state.flow();
    let identifier = params.openid_identifier.as_deref();
    let immediate = params.immediate.is_some();

    let result = match gate {
        Gate::Open => flow.start(identifier, immediate, &mut session.data).await,
        Gate::Allowlisted => flow.login(identifier, immediate, &mut session.data).await,
    };
    let response = match result {
        Ok(StartOutcome::Redirect(url)) => found(&url),
        Ok(StartOutcome::Form(form)) => render(&FormPostPage { form }),
        Err(e) => e.into_response(),
    };
    state.sessions.commit(session, response)
}

#[tracing::instrument(skip_all)]
async fn start_query<F: ConsumerFactory>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
    Query(params): Query<LoginParams>,
) -> Response {
    begin(state, headers, params, Gate::Open).await
}

#[tracing::instrument(skip_all)]
async fn start_form<F: ConsumerFactory>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
    Form(params): Form<LoginParams>,
) -> Response {
    begin(state, headers, params, Gate::Open).await
}

#[tracing::instrument(skip_all)]
async fn login_query<F: ConsumerFactory>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
    Query(params): Query<LoginParams>,
) -> Response {
    begin(state, headers, params, Gate::Allowlisted).await
}

#[tracing::instrument(skip_all)]
async fn login_form<F: ConsumerFactory>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
    Form(params): Form<LoginParams>,
) -> Response {
    begin(state, headers, params, Gate::Allowlisted).await
}

async fn finish<F: ConsumerFactory>(
    state: AppState<F>,
    headers: HeaderMap,
    params: BTreeMap<String, String>,
) -> Response {
    let mut session = match state.sessions.load(&headers) {
        Ok(session) => session,
        Err(e) => return session_unavailable(e),
    };
    let response = match state.flow().complete(params, &mut session.data).await {
        Ok(CompleteOutcome::Authenticated {
            redirect_to,
            message,
        }) => {
            if let Err(e) = session.rotate() {
                return session_unavailable(e);
            }
            (
                StatusCode::FOUND,
                [(header::LOCATION, redirect_to)],
                message,
            )
                .into_response()
        }
        Ok(CompleteOutcome::Status(text)) => (StatusCode::OK, text).into_response(),
        Err(e) => e.into_response(),
    };
    state.sessions.commit(session, response)
}

#[tracing::instrument(skip_all)]
async fn complete_query<F: ConsumerFactory>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
) -> Response {
    finish(state, headers, params).await
}

/// Providers may POST the response; `return_to` query parameters still arrive in the URL.
#[tracing::instrument(skip_all)]
async fn complete_form<F: ConsumerFactory>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
    Query(mut params): Query<BTreeMap<String, String>>,
    Form(body): Form<BTreeMap<String, String>>,
) -> Response {
    params.extend(body);
    finish(state, headers, params).await
}

#[tracing::instrument(skip_all)]
async fn logout<F: ConsumerFactory>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
) -> Response {
    let mut session = match state.sessions.load(&headers) {
        Ok(session) => session,
        Err(e) => return session_unavailable(e),
    };
    let target = state.flow().logout(&mut session.data);
    state.sessions.commit(session, found(&target))
}
