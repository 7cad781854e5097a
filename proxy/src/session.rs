//! Server-side sessions keyed by an opaque cookie.
//!
//! The browser only ever holds a random id in the `pp_nvp_session` cookie;
//! the credentials themselves stay in this process, inside a
//! [`SessionContext`] per id.

use std::time::Duration;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use nvp_core::config::{SESSION_COOKIE_NAME, SESSION_IDLE_TIMEOUT};
use nvp_core::SessionContext;

/// Pull the session id out of a `Cookie` header, if any.
pub fn session_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE_NAME)
        .map(|(_, value)| value.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn session_cookie(id: &str) -> String {
    format!("{SESSION_COOKIE_NAME}={id}; Path=/; HttpOnly; SameSite=Lax")
}

/// The session a request is bound to.
#[derive(Debug, Clone)]
pub struct SessionRef {
    pub id: String,
    /// Created by this request; the response must set the cookie.
    pub fresh: bool,
}

impl SessionRef {
    /// Turn a handler result into a response, attaching `Set-Cookie` when
    /// the session is new.
    pub fn respond(&self, body: impl IntoResponse) -> Response {
        let mut response = body.into_response();
        if self.fresh {
            if let Ok(value) = HeaderValue::from_str(&session_cookie(&self.id)) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }
        response
    }
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, SessionContext>,
    idle_timeout: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SESSION_IDLE_TIMEOUT)
    }
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Bind the request to its session, creating one when the cookie is
    /// missing or names a session this process does not know.
    pub fn attach(&self, headers: &HeaderMap) -> SessionRef {
        if let Some(id) = session_id_from(headers) {
            if let Some(mut session) = self.sessions.get_mut(&id) {
                session.touch();
                return SessionRef { id, fresh: false };
            }
        }
        let id = Uuid::new_v4().simple().to_string();
        self.sessions.insert(id.clone(), SessionContext::new());
        tracing::debug!(session = %id, "session created");
        SessionRef { id, fresh: true }
    }

    /// Run `f` against the session's context. A session purged in the
    /// meantime is recreated empty.
    pub fn with<R>(&self, session: &SessionRef, f: impl FnOnce(&mut SessionContext) -> R) -> R {
        let mut entry = self.sessions.entry(session.id.clone()).or_default();
        entry.touch();
        f(entry.value_mut())
    }

    /// Copy of the context behind the request's cookie. Unknown or absent
    /// cookies read as an empty session; nothing is created.
    pub fn snapshot(&self, headers: &HeaderMap) -> SessionContext {
        session_id_from(headers)
            .and_then(|id| {
                self.sessions.get_mut(&id).map(|mut s| {
                    s.touch();
                    s.clone()
                })
            })
            .unwrap_or_default()
    }

    /// Drop sessions idle for longer than the timeout.
    pub fn purge_idle(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.idle_timeout).unwrap_or(chrono::Duration::hours(8));
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.last_seen() >= cutoff);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvp_core::CredentialSet;

    fn cookie_headers(id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {SESSION_COOKIE_NAME}={id}")).unwrap(),
        );
        headers
    }

    #[test]
    fn cookie_parsing() {
        assert_eq!(session_id_from(&cookie_headers("abc")), Some("abc".into()));
        assert_eq!(session_id_from(&HeaderMap::new()), None);
        assert_eq!(session_id_from(&cookie_headers("")), None);
    }

    #[test]
    fn attach_reuses_known_session() {
        let store = SessionStore::default();
        let first = store.attach(&HeaderMap::new());
        assert!(first.fresh);

        let again = store.attach(&cookie_headers(&first.id));
        assert!(!again.fresh);
        assert_eq!(again.id, first.id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unknown_cookie_gets_new_session() {
        let store = SessionStore::default();
        let bound = store.attach(&cookie_headers("forged"));
        assert!(bound.fresh);
        assert_ne!(bound.id, "forged");
    }

    #[test]
    fn sessions_are_isolated() {
        let store = SessionStore::default();
        let a = store.attach(&HeaderMap::new());
        let b = store.attach(&HeaderMap::new());

        store.with(&a, |s| s.set_credentials(CredentialSet::new("u", "p", "s"), None));

        assert!(store.snapshot(&cookie_headers(&a.id)).is_authenticated());
        assert!(!store.snapshot(&cookie_headers(&b.id)).is_authenticated());
        assert!(!store.snapshot(&HeaderMap::new()).is_authenticated());
    }

    #[test]
    fn purge_drops_idle_sessions() {
        let store = SessionStore::new(Duration::ZERO);
        store.attach(&HeaderMap::new());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.purge_idle(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn fresh_session_sets_cookie() {
        let bound = SessionRef { id: "xyz".into(), fresh: true };
        let response = bound.respond("ok");
        let cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.starts_with("pp_nvp_session=xyz;"));
        assert!(cookie.contains("HttpOnly"));
    }
}
