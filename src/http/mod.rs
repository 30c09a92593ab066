//! Request routing: a synchronous [`Router`] of closure handlers behind an
//! axum adapter.

mod client;
mod context;
pub mod middleware;
pub mod minify;
mod router;
pub mod server;
mod static_files;

pub use client::ClientInfo;
pub use context::{Context, ContextPool, Handler};
pub use router::{DEFAULT_POOL_CAPACITY, RouteError, Router};
pub use static_files::{MINIFIED_TTL, StaticFiles};
