use std::net::SocketAddr;

use axum::http::{HeaderMap, header};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// What the transport and proxy headers say about the requesting client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub remote_addr: Option<SocketAddr>,
    /// Raw `X-Forwarded-For` header, if any.
    pub forwarded_for: Option<String>,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn from_parts(remote_addr: Option<SocketAddr>, headers: &HeaderMap) -> Self {
        let text = |name| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Self {
            remote_addr,
            forwarded_for: text(X_FORWARDED_FOR).filter(|value| !value.is_empty()),
            user_agent: text(header::USER_AGENT.as_str()).unwrap_or_default(),
        }
    }

    /// Client address: first `X-Forwarded-For` element, else the peer IP.
    pub fn ip(&self) -> Option<String> {
        let forwarded = self
            .forwarded_for
            .as_deref()
            .and_then(|list| list.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty());

        match forwarded {
            Some(first) => Some(first.to_string()),
            None => self.remote_addr.map(|addr| addr.ip().to_string()),
        }
    }
}
