//! Per-request state handed to every handler.

use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::mem;
use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};

use axum::extract::ConnectInfo;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::warn;
use url::form_urlencoded;

use crate::error::ErrorReport;
use crate::session::{FLASH_KEY, Flash, Session, SessionError};

use super::ClientInfo;
use super::middleware::RequestContext;

/// A request handler or middleware.
pub type Handler = Arc<dyn Fn(&mut Context) + Send + Sync>;

pub(crate) type ErrorHandlers = Arc<HashMap<StatusCode, Handler>>;

type BeforeSend = Box<dyn FnOnce(&mut Context) + Send>;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json; charset=utf-8";

/// Request data plus the response being assembled.
///
/// A handler "responds" by setting a status; once a status is set the router
/// stops running further middleware, handlers and routes.
#[derive(Default)]
pub struct Context {
    request_id: String,
    method: Method,
    uri: Uri,
    path: String,
    headers: HeaderMap,
    body: Bytes,
    client: ClientInfo,
    query: Vec<(String, String)>,
    language: String,

    status: Option<StatusCode>,
    response_headers: HeaderMap,
    response_body: Bytes,
    report: Option<ErrorReport>,

    shared: HashMap<String, Value>,
    meta: BTreeMap<String, String>,
    session: Option<Arc<Session>>,
    before_send: Vec<BeforeSend>,
    error_handlers: Option<ErrorHandlers>,
}

impl Context {
    /// Load a request into an empty (or reset) context.
    pub(crate) fn begin(&mut self, request: Request<Bytes>, error_handlers: ErrorHandlers) {
        let (parts, body) = request.into_parts();
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        self.request_id = parts
            .extensions
            .get::<RequestContext>()
            .map(|ctx| ctx.request_id.clone())
            .unwrap_or_default();
        self.client = ClientInfo::from_parts(remote_addr, &parts.headers);
        self.language = parts
            .headers
            .get(header::ACCEPT_LANGUAGE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|tag| tag.trim().to_string())
            .unwrap_or_default();
        self.query = parts
            .uri
            .query()
            .map(|query| form_urlencoded::parse(query.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        let raw_path = parts.uri.path();
        self.path = match urlencoding::decode(raw_path) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => raw_path.to_string(),
        };
        self.method = parts.method;
        self.uri = parts.uri;
        self.headers = parts.headers;
        self.body = body;
        self.error_handlers = Some(error_handlers);
    }

    /// Run the before-send hooks (last registered first) and build the response.
    pub(crate) fn finish(&mut self) -> Response<Bytes> {
        let hooks = mem::take(&mut self.before_send);
        for hook in hooks.into_iter().rev() {
            hook(self);
        }

        let mut response = Response::new(mem::take(&mut self.response_body));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = mem::take(&mut self.response_headers);
        if let Some(report) = self.report.take() {
            report.attach(&mut response);
        }
        response
    }

    /// Clear everything request-specific, keeping allocations for reuse.
    pub(crate) fn reset(&mut self) {
        self.request_id.clear();
        self.method = Method::GET;
        self.uri = Uri::default();
        self.path.clear();
        self.headers.clear();
        self.body = Bytes::new();
        self.client = ClientInfo::default();
        self.query.clear();
        self.language.clear();
        self.status = None;
        self.response_headers.clear();
        self.response_body = Bytes::new();
        self.report = None;
        self.shared.clear();
        self.meta.clear();
        self.session = None;
        self.before_send.clear();
        self.error_handlers = None;
    }

    /// Throw away any partial response and answer 500. Cookies already issued
    /// are kept so a session started by middleware still reaches the client.
    pub(crate) fn recover_from_panic(&mut self, message: &str) {
        let cookies: Vec<HeaderValue> = self
            .response_headers
            .get_all(header::SET_COOKIE)
            .iter()
            .cloned()
            .collect();
        self.response_headers.clear();
        for cookie in cookies {
            self.response_headers.append(header::SET_COOKIE, cookie);
        }
        self.response_body = Bytes::new();
        self.status = None;
        self.report = Some(ErrorReport::from_message(
            "http::router::dispatch",
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("handler panicked: {message}"),
        ));
        self.write(
            StatusCode::INTERNAL_SERVER_ERROR,
            TEXT_PLAIN,
            Bytes::from_static(b"Internal Server Error"),
        );
    }

    // ---- request ----

    /// Id assigned by the request-context middleware; empty outside axum.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Percent-decoded request path. Falls back to the raw path when the
    /// decoded bytes are not UTF-8.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A request header as text, if present and valid UTF-8.
    pub fn request_header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Deserialize the request body as JSON.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    /// Client IP, honoring the first `X-Forwarded-For` hop.
    pub fn ip(&self) -> Option<String> {
        self.client.ip()
    }

    /// First tag of `Accept-Language`, or empty.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// First query value for `name`. Route placeholders are captured here too.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn query_all(&self, name: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// Value captured by a `:name` route placeholder.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query(name)
    }

    /// Put captured route values in front of the request's own query.
    pub(crate) fn prepend_query(&mut self, params: Vec<(String, String)>) {
        if params.is_empty() {
            return;
        }
        let original = mem::replace(&mut self.query, params);
        self.query.extend(original);
    }

    // ---- response ----

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn response_body(&self) -> &Bytes {
        &self.response_body
    }

    /// Set a response header; an empty value removes it.
    pub fn header(&mut self, name: &str, value: &str) {
        let name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => name,
            Err(err) => {
                warn!(target = "gantry::http::context", header = name, error = %err, "invalid header name");
                return;
            }
        };
        if value.is_empty() {
            self.response_headers.remove(&name);
            return;
        }
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.response_headers.insert(name, value);
            }
            Err(err) => {
                warn!(target = "gantry::http::context", header = %name, error = %err, "invalid header value");
            }
        }
    }

    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.append(name, value);
    }

    /// Respond with `body`, setting `Content-Type` unless a handler already did.
    pub fn write(&mut self, status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) {
        if !self.response_headers.contains_key(header::CONTENT_TYPE) {
            self.response_headers
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        self.response_body = body.into();
        self.status = Some(status);
    }

    pub fn plain(&mut self, status: StatusCode, body: impl Into<String>) {
        self.write(status, TEXT_PLAIN, body.into());
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, status: StatusCode, value: &T) {
        match serde_json::to_vec(value) {
            Ok(mut encoded) => {
                encoded.push(b'\n');
                self.response_headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(APPLICATION_JSON),
                );
                self.write(status, APPLICATION_JSON, encoded);
            }
            Err(err) => self.fail(
                StatusCode::INTERNAL_SERVER_ERROR,
                "http::context::json",
                &err,
                "Internal Server Error",
            ),
        }
    }

    pub fn redirect(&mut self, status: StatusCode, location: &str) {
        self.header(header::LOCATION.as_str(), location);
        self.status = Some(status);
    }

    /// Respond with an error. A handler registered through
    /// `Router::on_error` for `status` renders it, otherwise `message` is sent
    /// as plain text.
    pub fn error(&mut self, status: StatusCode, message: impl Into<String>) {
        let message = message.into();
        self.report = Some(ErrorReport::from_message(
            "http::context::error",
            status,
            message.clone(),
        ));
        self.render_error(status, message);
    }

    /// Like [`error`](Self::error) for an internal failure: the error chain is
    /// reported to the logs and only `public_message` reaches the client.
    pub fn fail(
        &mut self,
        status: StatusCode,
        source: &'static str,
        error: &dyn StdError,
        public_message: &str,
    ) {
        self.report = Some(ErrorReport::from_error(source, status, error));
        self.render_error(status, public_message.to_string());
    }

    pub fn error_report(&self) -> Option<&ErrorReport> {
        self.report.as_ref()
    }

    fn render_error(&mut self, status: StatusCode, message: String) {
        let custom = self
            .error_handlers
            .as_ref()
            .and_then(|handlers| handlers.get(&status))
            .cloned();

        match custom {
            Some(handler) => {
                // Taken for the duration of the call so a handler calling
                // `error` again falls through to plain text.
                let handlers = self.error_handlers.take();
                self.status = Some(status);
                handler(self);
                self.error_handlers = handlers;
                if self.status.is_none() {
                    self.status = Some(status);
                }
            }
            None => self.plain(status, message),
        }
    }

    // ---- request-scoped data ----

    pub fn set_shared(&mut self, key: impl Into<String>, value: Value) {
        self.shared.insert(key.into(), value);
    }

    pub fn shared(&self, key: &str) -> Option<&Value> {
        self.shared.get(key)
    }

    /// Set a meta tag for the page; an empty value removes it.
    pub fn meta(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.meta.remove(key);
        } else {
            self.meta.insert(key.to_string(), value.to_string());
        }
    }

    pub fn meta_tags(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn set_session(&mut self, session: Arc<Session>) {
        self.session = Some(session);
    }

    /// Store `flash` in the session for the next request to pick up.
    pub fn write_flash(&self, flash: &Flash) -> Result<(), SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::Missing)?;
        session.set(FLASH_KEY, flash)
    }

    /// Messages left by [`write_flash`](Self::write_flash), if any.
    pub fn flash(&self) -> Option<Flash> {
        self.session.as_ref()?.get_as(FLASH_KEY)
    }

    /// Like [`flash`](Self::flash) but clears the messages from the session.
    pub fn take_flash(&self) -> Option<Flash> {
        let session = self.session.as_ref()?;
        let flash = session.get_as(FLASH_KEY);
        session.delete(FLASH_KEY);
        flash
    }

    /// Run `hook` just before the response is built. Hooks run in reverse
    /// registration order.
    pub fn before_send<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut Context) + Send + 'static,
    {
        self.before_send.push(Box::new(hook));
    }
}

/// Bounded free list of contexts. Never blocks: an empty pool allocates and
/// a full pool drops the returned context.
pub struct ContextPool {
    sender: SyncSender<Context>,
    receiver: Mutex<Receiver<Context>>,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = sync_channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn get(&self) -> Context {
        let pooled = match self.receiver.lock() {
            Ok(receiver) => receiver.try_recv().ok(),
            Err(poisoned) => poisoned.into_inner().try_recv().ok(),
        };
        pooled.unwrap_or_default()
    }

    pub fn put(&self, mut context: Context) {
        context.reset();
        let _ = self.sender.try_send(context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_for(uri: &str) -> Context {
        let request = Request::builder()
            .uri(uri)
            .header(header::ACCEPT_LANGUAGE, "it-IT, en;q=0.8")
            .body(Bytes::new())
            .expect("request");
        let mut ctx = Context::default();
        ctx.begin(request, ErrorHandlers::default());
        ctx
    }

    #[test]
    fn begin_parses_language_and_query() {
        let ctx = context_for("/search?q=rust+lang&tag=a&tag=b");
        assert_eq!(ctx.language(), "it-IT");
        assert_eq!(ctx.query("q"), Some("rust lang"));
        assert_eq!(ctx.query_all("tag"), vec!["a", "b"]);
        assert_eq!(ctx.path(), "/search");
    }

    #[test]
    fn prepended_params_take_precedence() {
        let mut ctx = context_for("/user/42?id=override");
        ctx.prepend_query(vec![("id".into(), "42".into())]);
        assert_eq!(ctx.param("id"), Some("42"));
        assert_eq!(ctx.query_all("id"), vec!["42", "override"]);
    }

    #[test]
    fn header_with_empty_value_removes_it() {
        let mut ctx = context_for("/");
        ctx.header("x-demo", "1");
        assert_eq!(ctx.response_headers()["x-demo"], "1");
        ctx.header("x-demo", "");
        assert!(ctx.response_headers().get("x-demo").is_none());
    }

    #[test]
    fn json_sets_content_type_and_status() {
        let mut ctx = context_for("/");
        ctx.json(StatusCode::CREATED, &serde_json::json!({"ok": true}));
        let response = ctx.finish();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], APPLICATION_JSON);
        assert_eq!(response.body().as_ref(), b"{\"ok\":true}\n");
    }

    #[test]
    fn error_uses_registered_handler() {
        let mut handlers: HashMap<StatusCode, Handler> = HashMap::new();
        handlers.insert(
            StatusCode::NOT_FOUND,
            Arc::new(|ctx: &mut Context| ctx.plain(StatusCode::NOT_FOUND, "custom missing")),
        );
        let mut ctx = Context::default();
        ctx.begin(
            Request::builder().uri("/x").body(Bytes::new()).expect("request"),
            Arc::new(handlers),
        );

        ctx.error(StatusCode::NOT_FOUND, "404 page /x not found");
        let response = ctx.finish();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body().as_ref(), b"custom missing");
        let report = response.extensions().get::<ErrorReport>().expect("report");
        assert_eq!(report.messages, vec!["404 page /x not found"]);
    }

    #[test]
    fn recursive_error_from_handler_falls_back_to_plain() {
        let mut handlers: HashMap<StatusCode, Handler> = HashMap::new();
        handlers.insert(
            StatusCode::BAD_REQUEST,
            Arc::new(|ctx: &mut Context| ctx.error(StatusCode::BAD_REQUEST, "again")),
        );
        let mut ctx = Context::default();
        ctx.begin(
            Request::builder().uri("/").body(Bytes::new()).expect("request"),
            Arc::new(handlers),
        );

        ctx.error(StatusCode::BAD_REQUEST, "first");
        assert_eq!(ctx.response_body().as_ref(), b"again");
        assert_eq!(ctx.status(), Some(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn before_send_hooks_run_in_reverse_order() {
        let mut ctx = context_for("/");
        ctx.before_send(|ctx| ctx.header("x-order", "first-registered"));
        ctx.before_send(|ctx| ctx.header("x-order", "second-registered"));

        let response = ctx.finish();
        assert_eq!(response.headers()["x-order"], "first-registered");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn path_is_percent_decoded_once() {
        let ctx = context_for("/files/hello%20world.txt?q=a%20b");
        assert_eq!(ctx.path(), "/files/hello world.txt");
        assert_eq!(ctx.uri().path(), "/files/hello%20world.txt");
        assert_eq!(ctx.query("q"), Some("a b"));

        assert_eq!(context_for("/a%2520b").path(), "/a%20b");
        assert_eq!(context_for("/bad%FF").path(), "/bad%FF");
    }

    #[test]
    fn parse_json_reads_the_body() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Login {
            user: String,
            remember: bool,
        }

        let mut ctx = Context::default();
        ctx.begin(
            Request::builder()
                .uri("/login")
                .body(Bytes::from_static(br#"{"user":"ada","remember":true}"#))
                .expect("request"),
            ErrorHandlers::default(),
        );
        assert_eq!(
            ctx.parse_json::<Login>().expect("json body"),
            Login {
                user: "ada".into(),
                remember: true
            }
        );

        let ctx = context_for("/login");
        assert!(ctx.parse_json::<Login>().is_err());
    }

    #[test]
    fn flash_round_trips_through_the_session() {
        struct NullStore;
        impl crate::session::SessionStore for NullStore {
            fn load(&self, _id: &str) -> Result<crate::session::SessionValues, SessionError> {
                Ok(Default::default())
            }
            fn save(
                &self,
                _id: &str,
                _values: &crate::session::SessionValues,
            ) -> Result<(), SessionError> {
                Ok(())
            }
            fn remove(&self, _id: &str) -> Result<(), SessionError> {
                Ok(())
            }
        }

        let mut ctx = context_for("/");
        let mut flash = Flash::new();
        flash.set("success", "This is a success message!");
        assert!(matches!(ctx.write_flash(&flash), Err(SessionError::Missing)));
        assert!(ctx.flash().is_none());

        ctx.set_session(Arc::new(Session::new(
            "abc".into(),
            Default::default(),
            Arc::new(NullStore),
        )));
        ctx.write_flash(&flash).expect("write flash");
        let read = ctx.flash().expect("flash");
        assert_eq!(read.get("success"), Some("This is a success message!"));

        assert_eq!(ctx.take_flash(), Some(flash));
        assert!(ctx.flash().is_none());
    }

    #[test]
    fn panic_recovery_keeps_issued_cookies() {
        let mut ctx = context_for("/");
        ctx.append_header(header::SET_COOKIE, HeaderValue::from_static("sid=abc; Path=/"));
        ctx.append_header(header::SET_COOKIE, HeaderValue::from_static("theme=dark"));
        ctx.header("x-partial", "1");
        ctx.plain(StatusCode::OK, "half written");

        ctx.recover_from_panic("boom");
        let response = ctx.finish();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get("x-partial").is_none());
        let cookies: Vec<_> = response.headers().get_all(header::SET_COOKIE).iter().collect();
        assert_eq!(cookies, vec!["sid=abc; Path=/", "theme=dark"]);
        assert_eq!(response.body().as_ref(), b"Internal Server Error");
    }

    #[test]
    fn pool_reuses_reset_contexts_up_to_capacity() {
        let pool = ContextPool::new(1);
        let mut ctx = pool.get();
        ctx.begin(
            Request::builder().uri("/a?x=1").body(Bytes::new()).expect("request"),
            ErrorHandlers::default(),
        );
        ctx.set_status(StatusCode::ACCEPTED);
        ctx.meta("description", "d");
        pool.put(ctx);
        pool.put(Context::default());

        let reused = pool.get();
        assert!(reused.status().is_none());
        assert!(reused.query("x").is_none());
        assert!(reused.meta_tags().is_empty());
    }
}
