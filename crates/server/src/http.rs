//! Outbound HTTP used by discovery, direct verification and the CouchDB store.

use crate::error::HttpError;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use once_cell::sync::OnceCell;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tracing::debug;
use url::Url;

pub const NETWORK_TIMEOUT_SECS: u64 = 30;
/// Largest response body accepted from a provider or the store.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_REDIRECTS: usize = 5;
const USER_AGENT: &str = concat!("openid-consumer/", env!("CARGO_PKG_VERSION"));

static TLS_CONFIG: OnceCell<Arc<ClientConfig>> = OnceCell::new();

/// Shared TLS client configuration backed by the webpki roots.
fn shared_tls_config() -> Result<Arc<ClientConfig>, HttpError> {
    TLS_CONFIG
        .get_or_try_init(|| {
            let mut root_cert_store = RootCertStore::empty();
            root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let config = ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map_err(|e| HttpError::Network(format!("TLS setup failed: {e}")))?
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

            Ok(Arc::new(config))
        })
        .cloned()
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// URL the body was served from, after redirects.
    pub final_url: Url,
}

impl HttpResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn new() -> Result<Self, HttpError> {
        let tls = shared_tls_config()?;
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config((*tls).clone())
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self {
            client,
            timeout: Duration::from_secs(NETWORK_TIMEOUT_SECS),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// GET following redirects.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get(&self, url: &Url, accept: Option<&str>) -> Result<HttpResponse, HttpError> {
        let mut current = url.clone();
        for _ in 0..=MAX_REDIRECTS {
            let mut headers = HeaderMap::new();
            if let Some(accept) = accept {
                headers.insert(
                    header::ACCEPT,
                    HeaderValue::from_str(accept)
                        .map_err(|e| HttpError::Network(e.to_string()))?,
                );
            }
            let response = self
                .send(Method::GET, &current, headers, Bytes::new())
                .await?;
            if !response.status.is_redirection() {
                return Ok(response);
            }
            let location = response
                .headers
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    HttpError::Network(format!("redirect without Location from {current}"))
                })?;
            let next = current
                .join(location)
                .map_err(|e| HttpError::InvalidUrl(format!("{location}: {e}")))?;
            debug!(from = %current, to = %next, "following redirect");
            current = next;
        }
        Err(HttpError::Network(format!(
            "too many redirects (limit {MAX_REDIRECTS}) starting at {url}"
        )))
    }

    /// POST an `application/x-www-form-urlencoded` body.
    #[tracing::instrument(level = "debug", skip(self, pairs))]
    pub async fn post_form(
        &self,
        url: &Url,
        pairs: &[(String, String)],
    ) -> Result<HttpResponse, HttpError> {
        let body = serde_urlencoded::to_string(pairs)
            .map_err(|e| HttpError::Network(format!("cannot encode form: {e}")))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        self.send(Method::POST, url, headers, Bytes::from(body)).await
    }

    /// Send a request with an optional JSON body.
    #[tracing::instrument(level = "debug", skip(self, body))]
    pub async fn send_json(
        &self,
        method: Method,
        url: &Url,
        body: Option<&serde_json::Value>,
    ) -> Result<HttpResponse, HttpError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        let payload = match body {
            Some(json) => {
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                Bytes::from(json.to_string())
            }
            None => Bytes::new(),
        };
        self.send(method, url, headers, payload).await
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<HttpResponse, HttpError> {
        let mut builder = Request::builder()
            .method(method)
            .uri(url.as_str())
            .header(header::USER_AGENT, USER_AGENT);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| HttpError::InvalidUrl(format!("{url}: {e}")))?;

        let response = timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| HttpError::Timeout(self.timeout))?
            .map_err(|e| HttpError::Network(e.to_string()))?;

        let (parts, body) = response.into_parts();
        let collected = timeout(self.timeout, Limited::new(body, MAX_BODY_BYTES).collect())
            .await
            .map_err(|_| HttpError::Timeout(self.timeout))?
            .map_err(|e| {
                if e.is::<http_body_util::LengthLimitError>() {
                    HttpError::BodyTooLarge(MAX_BODY_BYTES)
                } else {
                    HttpError::Network(e.to_string())
                }
            })?;

        Ok(HttpResponse {
            status: parts.status,
            headers: parts.headers,
            body: collected.to_bytes(),
            final_url: url.clone(),
        })
    }
}
