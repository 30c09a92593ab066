//! Serves files from a public directory, minifying stylesheets and scripts
//! through the cache when enabled.

use std::fs::{self, Metadata};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{Method, StatusCode, header};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::cache::{Cache, CacheExt};
use crate::util::http_date;

use super::context::Context;
use super::minify::{minify_css, minify_js};

/// Minified assets stay cached for a day.
pub const MINIFIED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const CACHE_CONTROL: &str = "public, max-age=11111111";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Asset {
    Css,
    Js,
}

#[derive(Clone)]
pub struct StaticFiles {
    root: PathBuf,
    cache: Option<Arc<dyn Cache>>,
    compress_css: bool,
    compress_js: bool,
}

impl std::fmt::Debug for StaticFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticFiles")
            .field("root", &self.root)
            .field("cached", &self.cache.is_some())
            .field("compress_css", &self.compress_css)
            .field("compress_js", &self.compress_js)
            .finish()
    }
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: None,
            compress_css: false,
            compress_js: false,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn compress_css(mut self, enabled: bool) -> Self {
        self.compress_css = enabled;
        self
    }

    pub fn compress_js(mut self, enabled: bool) -> Self {
        self.compress_js = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serve the request path if it names a file under the root.
    /// Returns `false` to let routing continue.
    pub fn serve(&self, ctx: &mut Context) -> bool {
        if ctx.method() != Method::GET && ctx.method() != Method::HEAD {
            return false;
        }

        let request_path = ctx.path().to_string();
        let Some(relative) = relative_path(&request_path) else {
            return false;
        };
        let file_path = self.root.join(relative);
        let Ok(metadata) = fs::metadata(&file_path) else {
            return false;
        };
        if metadata.is_dir() {
            return false;
        }

        if let (Some(asset), Some(cache)) = (self.minifiable(&request_path), &self.cache) {
            if let Some(body) = minified(cache.as_ref(), asset, &file_path, &request_path) {
                respond(ctx, &request_path, &metadata, Bytes::from(body));
                return true;
            }
        }

        match fs::read(&file_path) {
            Ok(contents) => {
                respond(ctx, &request_path, &metadata, Bytes::from(contents));
                true
            }
            Err(err) => {
                warn!(
                    target = "gantry::http::static",
                    path = %file_path.display(),
                    error = %err,
                    "failed to read static file"
                );
                false
            }
        }
    }

    fn minifiable(&self, request_path: &str) -> Option<Asset> {
        let extension = Path::new(request_path).extension()?.to_str()?;
        match extension {
            "css" if self.compress_css && !request_path.contains(".min.css") => Some(Asset::Css),
            "js" if self.compress_js && !request_path.contains(".min.js") => Some(Asset::Js),
            _ => None,
        }
    }
}

/// Strip the leading `/`; paths that try to leave the root are refused.
fn relative_path(request_path: &str) -> Option<&str> {
    let relative = request_path.strip_prefix('/')?;
    if relative.is_empty() || relative.contains('\\') {
        return None;
    }
    let inside_root = Path::new(relative)
        .components()
        .all(|part| matches!(part, Component::Normal(_) | Component::CurDir));
    inside_root.then_some(relative)
}

/// Minified body from the cache, minifying and storing it on a miss.
fn minified(cache: &dyn Cache, asset: Asset, file_path: &Path, request_path: &str) -> Option<String> {
    let key = format!("file:{request_path}");
    if let Some(body) = cache.get_as::<String>(&key) {
        return Some(body);
    }

    let source = match fs::read(file_path) {
        Ok(source) => source,
        Err(err) => {
            warn!(
                target = "gantry::http::static",
                path = %file_path.display(),
                error = %err,
                "failed to read asset for minification"
            );
            return None;
        }
    };
    let body = match asset {
        Asset::Css => minify_css(&source),
        Asset::Js => minify_js(&source),
    };

    if let Err(err) = cache.put_as(&key, &body, MINIFIED_TTL) {
        warn!(target = "gantry::http::static", key = %key, error = %err, "failed to cache minified asset");
    } else {
        debug!(target = "gantry::http::static", key = %key, bytes = body.len(), "cached minified asset");
    }
    Some(body)
}

fn respond(ctx: &mut Context, request_path: &str, metadata: &Metadata, body: Bytes) {
    let content_type = mime_guess::from_path(request_path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    let modified = metadata.modified().ok().filter(|at| *at > UNIX_EPOCH);

    ctx.header(header::CACHE_CONTROL.as_str(), CACHE_CONTROL);
    if let Some(modified) = modified {
        ctx.header(
            header::LAST_MODIFIED.as_str(),
            &http_date::format_system_time(modified),
        );
        if not_modified_since(ctx, modified) {
            ctx.set_status(StatusCode::NOT_MODIFIED);
            return;
        }
    }

    ctx.header(header::CONTENT_TYPE.as_str(), &content_type);
    ctx.header(header::CONTENT_LENGTH.as_str(), &body.len().to_string());
    if ctx.method() == Method::HEAD {
        ctx.set_status(StatusCode::OK);
    } else {
        ctx.write(StatusCode::OK, "application/octet-stream", body);
    }
}

fn not_modified_since(ctx: &Context, modified: SystemTime) -> bool {
    let Some(since) = ctx
        .request_header(header::IF_MODIFIED_SINCE)
        .and_then(http_date::parse)
    else {
        return false;
    };
    let modified_secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    i64::try_from(modified_secs).is_ok_and(|secs| secs <= since.unix_timestamp())
}
