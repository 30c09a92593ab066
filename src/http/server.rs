//! axum adapter: every request enters [`Router::dispatch`] through here.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{self, Body},
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
};
use tokio::net::TcpListener;

use crate::error::ErrorReport;

use super::middleware::{log_responses, set_request_context};
use super::router::Router;

const SOURCE: &str = "http::server::forward";

/// Largest request body buffered for a handler.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Wrap `router` as an axum service with request-id and response logging.
pub fn into_service(router: Arc<Router>) -> axum::Router {
    axum::Router::new()
        .fallback(forward)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
        .with_state(router)
}

/// Serve until `shutdown` resolves. Peer addresses reach handlers through
/// `Context::client`.
pub async fn serve<F>(listener: TcpListener, router: Arc<Router>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        into_service(router).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn forward(State(router): State<Arc<Router>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            let mut response = (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
            ErrorReport::from_error(SOURCE, StatusCode::BAD_REQUEST, &err).attach(&mut response);
            return response;
        }
    };
    let request = axum::http::Request::from_parts(parts, body);

    match tokio::task::spawn_blocking(move || router.dispatch(request)).await {
        Ok(response) => response.map(Body::from),
        Err(err) => {
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            let mut response = (status, "Internal Server Error").into_response();
            ErrorReport::from_error(SOURCE, status, &err).attach(&mut response);
            response
        }
    }
}
