//! Gantry: a small web framework core with a regex router, cookie sessions
//! backed by pluggable stores, and TTL caches behind a named registry.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod telemetry;
pub mod util;
