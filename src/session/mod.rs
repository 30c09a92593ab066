//! Cookie sessions with pluggable server-side storage.
//!
//! A request without a usable cookie gets a new session id and a
//! `Set-Cookie` header; a request with a valid cookie resumes the stored bag.
//! Changes live in memory until [`Session::release`] writes them back, which
//! the session middleware schedules right before the response is sent.

pub mod cookie;
mod file;
mod flash;
mod registry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::http::{ClientInfo, Context, Handler};
use crate::util::lock::{rw_read, rw_write};

pub use cookie::{CookieError, DecodeError};
pub use file::FileSessionStore;
pub use flash::{FLASH_KEY, Flash};
pub use registry::{ProviderFactory, SessionProviderRegistry};

const SOURCE: &str = "session";

pub type SessionValues = HashMap<String, Value>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session configuration error: {0}")]
    Config(String),
    #[error("session storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Cookie(#[from] CookieError),
    #[error("invalid session id `{0}`")]
    InvalidId(String),
    #[error("no session is attached to the request")]
    Missing,
    #[error("session: unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("session register `{name}`: {reason}")]
    DuplicateProvider { name: String, reason: &'static str },
}

impl SessionError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Cookie attributes and storage location shared by every provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cookie name.
    pub name: String,
    /// Cookie `Domain`; empty omits the attribute.
    pub domain: String,
    /// Seconds. Drives `Max-Age`, `Expires` and the storage sweep.
    pub max_lifetime: u64,
    /// Secret for the cookie obfuscation stream.
    pub key: String,
    pub http_only: bool,
    pub save_path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "gantry_session".to_string(),
            domain: String::new(),
            max_lifetime: 3600,
            key: String::new(),
            http_only: true,
            save_path: PathBuf::new(),
        }
    }
}

impl SessionConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime)
    }
}

/// Server-side persistence for session bags.
pub trait SessionStore: Send + Sync {
    /// Stored bag for `id`; an unknown id yields an empty bag.
    fn load(&self, id: &str) -> Result<SessionValues, SessionError>;

    fn save(&self, id: &str, values: &SessionValues) -> Result<(), SessionError>;

    /// Drop the stored bag; removing an unknown id succeeds.
    fn remove(&self, id: &str) -> Result<(), SessionError>;

    /// Remove bags idle for longer than the configured lifetime.
    fn sweep(&self) -> Result<usize, SessionError> {
        Ok(0)
    }
}

#[derive(Debug, Default)]
struct SessionState {
    id: Option<String>,
    values: SessionValues,
}

/// One client's session for the duration of a request.
pub struct Session {
    store: Arc<dyn SessionStore>,
    state: RwLock<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = rw_read(&self.state, SOURCE, "debug");
        f.debug_struct("Session")
            .field("id", &state.id)
            .field("keys", &state.values.len())
            .finish()
    }
}

impl Session {
    pub fn new(id: String, values: SessionValues, store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            state: RwLock::new(SessionState {
                id: Some(id),
                values,
            }),
        }
    }

    /// Current id, or `None` once destroyed.
    pub fn id(&self) -> Option<String> {
        rw_read(&self.state, SOURCE, "id").id.clone()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<(), SessionError> {
        let value = serde_json::to_value(value)?;
        rw_write(&self.state, SOURCE, "set")
            .values
            .insert(key.into(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        rw_read(&self.state, SOURCE, "get").values.get(key).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn delete(&self, key: &str) {
        rw_write(&self.state, SOURCE, "delete").values.remove(key);
    }

    /// Remove the stored bag and forget the id so `release` becomes a no-op.
    pub fn destroy(&self) -> Result<(), SessionError> {
        let mut state = rw_write(&self.state, SOURCE, "destroy");
        if let Some(id) = state.id.as_deref() {
            self.store.remove(id)?;
        }
        state.id = None;
        state.values.clear();
        Ok(())
    }

    /// Persist the bag. Skipped after `destroy`.
    pub fn release(&self) -> Result<(), SessionError> {
        let state = rw_read(&self.state, SOURCE, "release");
        match state.id.as_deref() {
            Some(id) => self.store.save(id, &state.values),
            None => Ok(()),
        }
    }
}

/// Result of resolving the session for a request.
#[derive(Debug)]
pub struct SessionStart {
    pub session: Arc<Session>,
    /// `Set-Cookie` value when a new session was issued.
    pub set_cookie: Option<String>,
}

/// Resolves request cookies to sessions backed by one store.
pub struct SessionManager {
    config: SessionConfig,
    store: Arc<dyn SessionStore>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, store: Arc<dyn SessionStore>) -> Result<Self, SessionError> {
        if config.name.is_empty() {
            return Err(SessionError::config("session cookie name must not be empty"));
        }
        if config.key.is_empty() {
            return Err(CookieError::EmptyKey.into());
        }
        Ok(Self { config, store })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Resume the session named by the request cookie, or start a new one.
    pub fn init(&self, client: &ClientInfo, headers: &HeaderMap) -> Result<SessionStart, SessionError> {
        if let Some(raw) = cookie::session_id_from_cookies(headers, &self.config.name) {
            match cookie::decode_cookie_value(
                self.config.key.as_bytes(),
                self.config.lifetime(),
                &raw,
                client,
            ) {
                Ok(id) => match self.store.load(&id) {
                    Ok(values) => {
                        debug!(target = "gantry::session", session_id = %id, "resumed session");
                        return Ok(SessionStart {
                            session: Arc::new(Session::new(id, values, Arc::clone(&self.store))),
                            set_cookie: None,
                        });
                    }
                    Err(SessionError::InvalidId(id)) => {
                        warn!(
                            target = "gantry::session",
                            session_id = %id,
                            "store refused session id from cookie"
                        );
                    }
                    Err(err) => return Err(err),
                },
                Err(err) => {
                    warn!(
                        target = "gantry::session",
                        error = %err,
                        "rejected session cookie"
                    );
                    if let Some(stale) = err.session_id() {
                        if let Err(remove_err) = self.store.remove(stale) {
                            warn!(
                                target = "gantry::session",
                                session_id = stale,
                                error = %remove_err,
                                "failed to destroy session behind rejected cookie"
                            );
                        }
                    }
                }
            }
        }

        self.start(client)
    }

    fn start(&self, client: &ClientInfo) -> Result<SessionStart, SessionError> {
        let id = cookie::new_session_id();
        let encoded = cookie::encode_cookie_value(self.config.key.as_bytes(), &id, client)?;
        let set_cookie = cookie::format_set_cookie(&self.config, &encoded, OffsetDateTime::now_utc());

        metrics::counter!("gantry_session_created_total").increment(1);
        debug!(target = "gantry::session", session_id = %id, "issued new session");

        Ok(SessionStart {
            session: Arc::new(Session::new(id, SessionValues::new(), Arc::clone(&self.store))),
            set_cookie: Some(set_cookie),
        })
    }

    /// Router middleware: attach the session and persist it before sending.
    pub fn middleware(self: &Arc<Self>) -> Handler {
        let manager = Arc::clone(self);
        Arc::new(move |ctx: &mut Context| {
            let start = match manager.init(ctx.client(), ctx.headers()) {
                Ok(start) => start,
                Err(err) => {
                    ctx.fail(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "session::middleware",
                        &err,
                        "Internal error",
                    );
                    return;
                }
            };

            if let Some(set_cookie) = start.set_cookie {
                match HeaderValue::from_str(&set_cookie) {
                    Ok(value) => ctx.append_header(header::SET_COOKIE, value),
                    Err(err) => warn!(
                        target = "gantry::session",
                        error = %err,
                        "session cookie is not a valid header value"
                    ),
                }
            }

            let session = Arc::clone(&start.session);
            ctx.before_send(move |_| {
                if let Err(err) = session.release() {
                    error!(
                        target = "gantry::session",
                        session_id = %session.id().unwrap_or_default(),
                        error = %err,
                        "failed to persist session"
                    );
                }
            });
            ctx.set_session(start.session);
        })
    }

    /// Start the periodic storage sweep; disabled when the lifetime is zero.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        spawn_sweeper(Arc::clone(&self.store), self.config.lifetime())
    }
}

/// Sweep `store` every `interval` on a background task.
pub fn spawn_sweeper(store: Arc<dyn SessionStore>, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        warn!(
            target = "gantry::session::sweep",
            "session max_lifetime is 0; expired sessions will not be swept"
        );
        return None;
    }

    Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let store = Arc::clone(&store);
            match tokio::task::spawn_blocking(move || store.sweep()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => {
                    metrics::counter!("gantry_session_swept_total").increment(removed as u64);
                    info!(target = "gantry::session::sweep", removed, "swept expired sessions");
                }
                Ok(Err(err)) => {
                    warn!(target = "gantry::session::sweep", error = %err, "session sweep aborted");
                }
                Err(err) => {
                    error!(target = "gantry::session::sweep", error = %err, "session sweep task failed");
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::http::HeaderValue;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingStore {
        saved: Mutex<HashMap<String, SessionValues>>,
        removed: Mutex<Vec<String>>,
    }

    impl SessionStore for RecordingStore {
        fn load(&self, id: &str) -> Result<SessionValues, SessionError> {
            Ok(self
                .saved
                .lock()
                .expect("saved lock")
                .get(id)
                .cloned()
                .unwrap_or_default())
        }

        fn save(&self, id: &str, values: &SessionValues) -> Result<(), SessionError> {
            self.saved
                .lock()
                .expect("saved lock")
                .insert(id.to_string(), values.clone());
            Ok(())
        }

        fn remove(&self, id: &str) -> Result<(), SessionError> {
            self.saved.lock().expect("saved lock").remove(id);
            self.removed.lock().expect("removed lock").push(id.to_string());
            Ok(())
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            name: "sid".into(),
            key: "unit-test-key".into(),
            ..SessionConfig::default()
        }
    }

    fn client() -> ClientInfo {
        ClientInfo {
            remote_addr: Some("198.51.100.4:1234".parse().expect("addr")),
            forwarded_for: None,
            user_agent: "tests".into(),
        }
    }

    fn cookie_headers(set_cookie: &str) -> HeaderMap {
        let pair = set_cookie.split(';').next().expect("cookie pair");
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(pair).expect("header"));
        headers
    }

    #[test]
    fn manager_requires_key_and_name() {
        let store: Arc<dyn SessionStore> = Arc::new(RecordingStore::default());
        let no_key = SessionConfig {
            key: String::new(),
            ..config()
        };
        assert!(matches!(
            SessionManager::new(no_key, Arc::clone(&store)),
            Err(SessionError::Cookie(CookieError::EmptyKey))
        ));
        let no_name = SessionConfig {
            name: String::new(),
            ..config()
        };
        assert!(matches!(
            SessionManager::new(no_name, store),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn missing_cookie_starts_new_session() {
        let store = Arc::new(RecordingStore::default());
        let manager = SessionManager::new(config(), store).expect("manager");

        let start = manager.init(&client(), &HeaderMap::new()).expect("init");
        let cookie = start.set_cookie.expect("new cookie");
        assert!(cookie.starts_with("sid="));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(start.session.id().is_some());
    }

    #[test]
    fn valid_cookie_resumes_released_values() {
        let store = Arc::new(RecordingStore::default());
        let manager = SessionManager::new(config(), store).expect("manager");

        let first = manager.init(&client(), &HeaderMap::new()).expect("init");
        first.session.set("user", json!({"id": 7})).expect("set");
        first.session.release().expect("release");

        let headers = cookie_headers(first.set_cookie.as_deref().expect("cookie"));
        let second = manager.init(&client(), &headers).expect("resume");
        assert!(second.set_cookie.is_none());
        assert_eq!(second.session.id(), first.session.id());
        assert_eq!(second.session.get("user"), Some(json!({"id": 7})));
    }

    #[test]
    fn foreign_client_gets_new_session_and_old_one_is_destroyed() {
        let store = Arc::new(RecordingStore::default());
        let manager =
            SessionManager::new(config(), Arc::clone(&store) as Arc<dyn SessionStore>)
                .expect("manager");

        let first = manager.init(&client(), &HeaderMap::new()).expect("init");
        let first_id = first.session.id().expect("id");
        let headers = cookie_headers(first.set_cookie.as_deref().expect("cookie"));

        let mut other = client();
        other.user_agent = "someone else".into();
        let second = manager.init(&other, &headers).expect("init");

        assert!(second.set_cookie.is_some());
        assert_ne!(second.session.id(), Some(first_id.clone()));
        assert_eq!(*store.removed.lock().expect("removed"), vec![first_id]);
    }

    #[test]
    fn destroy_clears_id_and_skips_release() {
        let store = Arc::new(RecordingStore::default());
        let session = Session::new(
            "abc123".into(),
            SessionValues::new(),
            Arc::clone(&store) as Arc<dyn SessionStore>,
        );
        session.set("k", "v").expect("set");
        session.destroy().expect("destroy");
        session.release().expect("release");

        assert!(session.id().is_none());
        assert!(store.saved.lock().expect("saved").is_empty());
        assert_eq!(*store.removed.lock().expect("removed"), vec!["abc123".to_string()]);
    }

    #[test]
    fn typed_values_round_trip_through_the_bag() {
        let store: Arc<dyn SessionStore> = Arc::new(RecordingStore::default());
        let session = Session::new("ab".into(), SessionValues::new(), store);
        session.set("count", 3_u32).expect("set");
        assert_eq!(session.get_as::<u32>("count"), Some(3));
        session.delete("count");
        assert!(session.get("count").is_none());
    }

    #[test]
    fn id_refused_by_the_store_starts_new_session() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let config = SessionConfig {
            save_path: dir.path().to_path_buf(),
            ..config()
        };
        let store: Arc<dyn SessionStore> =
            Arc::new(FileSessionStore::new(&config).expect("store"));
        let manager = SessionManager::new(config.clone(), store).expect("manager");

        let encoded = cookie::encode_cookie_value(config.key.as_bytes(), "../escape", &client())
            .expect("encode");
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("sid={encoded}")).expect("header"),
        );

        let start = manager.init(&client(), &headers).expect("init");
        assert!(start.set_cookie.is_some());
        let id = start.session.id().expect("id");
        assert!(cookie::is_valid_session_id(&id));
    }

    #[tokio::test]
    async fn sweeper_is_disabled_for_zero_lifetime() {
        let store: Arc<dyn SessionStore> = Arc::new(RecordingStore::default());
        assert!(spawn_sweeper(store, Duration::ZERO).is_none());
    }
}
