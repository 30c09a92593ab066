use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use axum::http::{Method, Request, Response, StatusCode, header};
use bytes::Bytes;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, error};

use super::context::{Context, ContextPool, ErrorHandlers, Handler};
use super::static_files::StaticFiles;

/// Contexts kept for reuse when no capacity is configured.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },
    #[error("invalid route method `{0}`")]
    InvalidMethod(String),
    #[error("route pattern `{pattern}` does not compile: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

struct Route {
    method: Method,
    regex: Regex,
    params: Vec<String>,
    handlers: Vec<Handler>,
}

impl Route {
    fn compile(pattern: &str, method: &str, handlers: Vec<Handler>) -> Result<Self, RouteError> {
        if pattern.is_empty() {
            return Err(RouteError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty",
            });
        }
        if !pattern.starts_with('/') {
            return Err(RouteError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern must begin with `/`",
            });
        }
        if method.is_empty() {
            return Err(RouteError::InvalidMethod(method.to_string()));
        }
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| RouteError::InvalidMethod(method.to_string()))?;

        let mut params = Vec::new();
        let segments: Vec<String> = pattern
            .split('/')
            .map(|segment| match segment.strip_prefix(':') {
                Some(name) => {
                    params.push(name.to_string());
                    "([^/]+)".to_string()
                }
                None => regex::escape(segment),
            })
            .collect();

        let expression = format!("^{}$", segments.join("/"));
        let regex = Regex::new(&expression).map_err(|source| RouteError::Regex {
            pattern: pattern.to_string(),
            source,
        })?;

        Ok(Self {
            method,
            regex,
            params,
            handlers,
        })
    }

    /// Captured placeholder values, or `None` when the path does not match.
    fn captures(&self, path: &str) -> Option<Vec<(String, String)>> {
        let captures = self.regex.captures(path)?;
        Some(
            self.params
                .iter()
                .zip(captures.iter().skip(1))
                .filter_map(|(name, value)| {
                    value.map(|value| (name.clone(), value.as_str().to_string()))
                })
                .collect(),
        )
    }
}

/// Method + path dispatch behind a chain of global middleware.
///
/// Build it completely, then share it (`Arc<Router>`) for serving.
pub struct Router {
    routes: Vec<Route>,
    middleware: Vec<Handler>,
    error_handlers: ErrorHandlers,
    static_files: Option<StaticFiles>,
    pool: ContextPool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::with_pool_capacity(DEFAULT_POOL_CAPACITY)
    }

    pub fn with_pool_capacity(capacity: usize) -> Self {
        Self {
            routes: Vec::new(),
            middleware: Vec::new(),
            error_handlers: Arc::new(HashMap::new()),
            static_files: None,
            pool: ContextPool::new(capacity),
        }
    }

    /// Register `handlers` for `method` requests matching `pattern`.
    /// Handlers run in the order given.
    pub fn add(
        &mut self,
        pattern: &str,
        method: &str,
        handlers: Vec<Handler>,
    ) -> Result<&mut Self, RouteError> {
        let route = Route::compile(pattern, method, handlers)?;
        debug!(
            target = "gantry::http::router",
            method = %route.method,
            pattern,
            regex = %route.regex,
            "route added"
        );
        self.routes.push(route);
        Ok(self)
    }

    pub fn get<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.add(pattern, "GET", vec![Arc::new(handler)])
    }

    pub fn post<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.add(pattern, "POST", vec![Arc::new(handler)])
    }

    pub fn put<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.add(pattern, "PUT", vec![Arc::new(handler)])
    }

    pub fn delete<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.add(pattern, "DELETE", vec![Arc::new(handler)])
    }

    /// Global middleware, run for every request (static files included) in
    /// registration order.
    pub fn use_middleware(&mut self, handler: Handler) -> &mut Self {
        self.middleware.push(handler);
        self
    }

    /// Render responses produced by `Context::error` for `status`.
    pub fn on_error<F>(&mut self, status: StatusCode, handler: F) -> &mut Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.error_handlers).insert(status, Arc::new(handler));
        self
    }

    pub fn serve_static(&mut self, static_files: StaticFiles) -> &mut Self {
        self.static_files = Some(static_files);
        self
    }

    /// Run one request through middleware, static files and routes.
    ///
    /// Panics raised by handlers are contained here and answered with 500.
    pub fn dispatch(&self, request: Request<Bytes>) -> Response<Bytes> {
        let mut ctx = self.pool.get();
        ctx.begin(request, Arc::clone(&self.error_handlers));

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.run(&mut ctx))) {
            let message = panic_message(payload.as_ref());
            error!(
                target = "gantry::http::router",
                method = %ctx.method(),
                path = %ctx.path(),
                panic = %message,
                "recovered from handler panic"
            );
            ctx.recover_from_panic(&message);
        }

        match panic::catch_unwind(AssertUnwindSafe(|| ctx.finish())) {
            Ok(response) => {
                self.pool.put(ctx);
                response
            }
            Err(payload) => {
                error!(
                    target = "gantry::http::router",
                    panic = %panic_message(payload.as_ref()),
                    "recovered from before-send hook panic"
                );
                internal_error_response()
            }
        }
    }

    fn run(&self, ctx: &mut Context) {
        for middleware in &self.middleware {
            middleware(ctx);
            if ctx.status().is_some() {
                return;
            }
        }

        if let Some(static_files) = &self.static_files {
            if static_files.serve(ctx) {
                return;
            }
        }

        let mut matched = false;
        for route in &self.routes {
            if route.method != *ctx.method() {
                continue;
            }
            let Some(params) = route.captures(ctx.path()) else {
                continue;
            };
            matched = true;
            ctx.prepend_query(params);

            for handler in &route.handlers {
                handler(ctx);
                if ctx.status().is_some() {
                    return;
                }
            }
        }

        if !matched {
            let message = format!("404 page {} not found", ctx.path());
            ctx.error(StatusCode::NOT_FOUND, message);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn internal_error_response() -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(b"Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
