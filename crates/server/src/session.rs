//! Cookie-bound browser sessions.
//!
//! Sessions are held in process in a `DashMap` keyed by a random id which the
//! browser carries in an `HttpOnly` cookie. Entries expire after the configured
//! idle time; expired entries are swept lazily.

use crate::config::SessionConfig;
use crate::openid::PendingDiscovery;
use crate::projection::AuthSession;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::Response;
use base64::Engine;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Everything the application keeps per browser.
#[derive(Clone, Debug, Default)]
pub struct SessionData {
    /// Present only after a successful verification.
    pub auth: Option<AuthSession>,
    /// Discovered endpoint of the attempt in flight, between `start` and `complete`.
    pub pending: Option<PendingDiscovery>,
    /// Page requested before the authentication detour.
    pub return_to: Option<String>,
}

impl SessionData {
    /// Drop `openid`, `level` and `node_name`. Absent fields are fine.
    pub fn clear_auth(&mut self) {
        self.auth = None;
    }

    /// Nothing worth keeping; such sessions are never stored.
    pub fn is_empty(&self) -> bool {
        self.auth.is_none() && self.pending.is_none() && self.return_to.is_none()
    }
}

#[derive(Clone)]
struct SessionEntry {
    data: SessionData,
    expires_at: Instant,
}

/// A session loaded for the duration of one request.
#[derive(Debug)]
pub struct BrowserSession {
    id: String,
    is_new: bool,
    /// Id given up by [`BrowserSession::rotate`], dropped on commit.
    replaced: Option<String>,
    pub data: SessionData,
}

impl BrowserSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Move the data to a fresh id; called when the session gains privileges.
    pub fn rotate(&mut self) -> Result<(), getrandom::Error> {
        let fresh = generate_session_id()?;
        let old = std::mem::replace(&mut self.id, fresh);
        if !self.is_new {
            self.replaced = Some(old);
        }
        self.is_new = true;
        Ok(())
    }
}

#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, SessionEntry>>,
    config: Arc<SessionConfig>,
    last_cleanup: Arc<Mutex<Instant>>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config: Arc::new(config),
            last_cleanup: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    fn maybe_cleanup(&self) {
        const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

        if let Ok(mut last_cleanup) = self.last_cleanup.try_lock() {
            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                *last_cleanup = Instant::now();
                drop(last_cleanup);
                let now = Instant::now();
                self.sessions.retain(|_, entry| entry.expires_at > now);
            }
        }
    }

    /// Session named by the request cookie, or a fresh one when absent or expired.
    pub fn load(&self, headers: &HeaderMap) -> Result<BrowserSession, getrandom::Error> {
        self.maybe_cleanup();

        if let Some(id) = session_id_from_headers(headers, &self.config.cookie_name) {
            if let Some(entry) = self.sessions.get(&id) {
                if entry.expires_at > Instant::now() {
                    return Ok(BrowserSession {
                        data: entry.data.clone(),
                        id,
                        is_new: false,
                        replaced: None,
                    });
                }
            }
            self.sessions.remove(&id);
        }

        Ok(BrowserSession {
            id: generate_session_id()?,
            is_new: true,
            replaced: None,
            data: SessionData::default(),
        })
    }

    /// Persist the session and attach the cookie to the response when it was just created.
    ///
    /// Empty sessions are not stored: a new one gets no cookie and an existing
    /// one is removed.
    pub fn commit(&self, session: BrowserSession, mut response: Response) -> Response {
        if let Some(replaced) = &session.replaced {
            self.sessions.remove(replaced);
        }
        if session.data.is_empty() {
            if !session.is_new {
                self.sessions.remove(&session.id);
            }
            return response;
        }
        self.sessions.insert(
            session.id.clone(),
            SessionEntry {
                data: session.data,
                expires_at: Instant::now() + self.ttl(),
            },
        );

        if session.is_new {
            let mut cookie = format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
                self.config.cookie_name, session.id, self.config.ttl_secs
            );
            if self.config.secure_cookie {
                cookie.push_str("; Secure");
            }
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
                Err(e) => tracing::error!("Failed to build session cookie: {e}"),
            }
        }
        response
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn session_id_from_headers(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

fn generate_session_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes)?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}
