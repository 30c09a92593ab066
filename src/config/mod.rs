//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::http::DEFAULT_POOL_CAPACITY;
use crate::session::SessionConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "gantry";
const ENV_PREFIX: &str = "GANTRY";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_ADAPTER: &str = "memory";
const DEFAULT_SESSION_PROVIDER: &str = "file";
const DEFAULT_SESSION_SAVE_PATH: &str = "sessions";
const DEFAULT_STATIC_DIRECTORY: &str = "public";

/// Command-line arguments for the gantry binary.
#[derive(Debug, Parser)]
#[command(name = "gantry", version, about = "Gantry web server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "GANTRY_CONFIG_FILE", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve the public directory with sessions and caching enabled.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout in seconds.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the log level (e.g. info, debug).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long = "log-json", value_name = "BOOL", value_parser = BoolishValueParser::new())]
    pub log_json: Option<bool>,

    /// Cache adapter name (`memory` or `file`).
    #[arg(long = "cache-adapter", value_name = "NAME")]
    pub cache_adapter: Option<String>,

    /// JSON configuration handed to the cache adapter.
    #[arg(long = "cache-config", value_name = "JSON")]
    pub cache_config: Option<String>,

    /// Session provider name.
    #[arg(long = "session-provider", value_name = "NAME")]
    pub session_provider: Option<String>,

    /// Secret used to obfuscate session cookies.
    #[arg(long = "session-key", env = "GANTRY_SESSION_KEY", value_name = "SECRET", hide_env_values = true)]
    pub session_key: Option<String>,

    /// Directory holding session files.
    #[arg(long = "session-save-path", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub session_save_path: Option<PathBuf>,

    /// Session lifetime in seconds.
    #[arg(long = "session-max-lifetime", value_name = "SECONDS")]
    pub session_max_lifetime: Option<u64>,

    /// Directory served as static files.
    #[arg(long = "static-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub static_directory: Option<PathBuf>,

    /// Minify stylesheets through the cache.
    #[arg(long = "static-compress-css", value_name = "BOOL", value_parser = BoolishValueParser::new())]
    pub static_compress_css: Option<bool>,

    /// Minify scripts through the cache.
    #[arg(long = "static-compress-js", value_name = "BOOL", value_parser = BoolishValueParser::new())]
    pub static_compress_js: Option<bool>,

    /// Number of request contexts kept for reuse.
    #[arg(long = "pool-capacity", value_name = "COUNT")]
    pub pool_capacity: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub session: SessionSettings,
    pub static_files: StaticSettings,
    pub pool: PoolSettings,
    /// Every merged key, for values outside the typed sections.
    pub lookup: Lookup,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub adapter: String,
    /// Adapter-specific JSON; empty selects the adapter defaults.
    pub config: String,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub provider: String,
    pub config: SessionConfig,
}

#[derive(Debug, Clone)]
pub struct StaticSettings {
    pub directory: PathBuf,
    pub compress_css: bool,
    pub compress_js: bool,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub capacity: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Untyped access to the merged configuration.
///
/// Absent keys and values of the wrong type read as the zero value.
#[derive(Debug, Clone, Default)]
pub struct Lookup {
    inner: Config,
}

impl Lookup {
    pub fn new(inner: Config) -> Self {
        Self { inner }
    }

    pub fn string(&self, key: &str) -> String {
        self.inner.get_string(key).unwrap_or_default()
    }

    pub fn int(&self, key: &str) -> i64 {
        self.inner.get_int(key).unwrap_or_default()
    }

    pub fn bool(&self, key: &str) -> bool {
        self.inner.get_bool(key).unwrap_or_default()
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let merged = builder.build()?;
    let mut raw: RawSettings = merged.clone().try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    let mut settings = Settings::from_raw(raw)?;
    settings.lookup = Lookup::new(merged);
    Ok(settings)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    session: RawSessionSettings,
    static_files: RawStaticSettings,
    pool: RawPoolSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(adapter) = overrides.cache_adapter.as_ref() {
            self.cache.adapter = Some(adapter.clone());
        }
        if let Some(config) = overrides.cache_config.as_ref() {
            self.cache.config = Some(config.clone());
        }
        if let Some(provider) = overrides.session_provider.as_ref() {
            self.session.provider = Some(provider.clone());
        }
        if let Some(key) = overrides.session_key.as_ref() {
            self.session.key = Some(key.clone());
        }
        if let Some(path) = overrides.session_save_path.as_ref() {
            self.session.save_path = Some(path.clone());
        }
        if let Some(seconds) = overrides.session_max_lifetime {
            self.session.max_lifetime = Some(seconds);
        }
        if let Some(directory) = overrides.static_directory.as_ref() {
            self.static_files.directory = Some(directory.clone());
        }
        if let Some(enabled) = overrides.static_compress_css {
            self.static_files.compress_css = Some(enabled);
        }
        if let Some(enabled) = overrides.static_compress_js {
            self.static_files.compress_js = Some(enabled);
        }
        if let Some(capacity) = overrides.pool_capacity {
            self.pool.capacity = Some(capacity);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            session,
            static_files,
            pool,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            session: build_session_settings(session)?,
            static_files: build_static_settings(static_files)?,
            pool: build_pool_settings(pool)?,
            lookup: Lookup::default(),
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let adapter = non_empty(cache.adapter).unwrap_or_else(|| DEFAULT_CACHE_ADAPTER.to_string());

    let config = cache.config.unwrap_or_default();
    let config = config.trim().to_string();
    if !config.is_empty() {
        serde_json::from_str::<serde_json::Value>(&config).map_err(|err| {
            LoadError::invalid("cache.config", format!("not valid JSON: {err}"))
        })?;
    }

    Ok(CacheSettings { adapter, config })
}

fn build_session_settings(session: RawSessionSettings) -> Result<SessionSettings, LoadError> {
    let defaults = SessionConfig::default();

    let provider =
        non_empty(session.provider).unwrap_or_else(|| DEFAULT_SESSION_PROVIDER.to_string());
    let name = non_empty(session.name).unwrap_or(defaults.name);
    if name.contains([';', '=', ',', ' ']) {
        return Err(LoadError::invalid(
            "session.name",
            "cookie name must not contain separators",
        ));
    }

    let save_path = session
        .save_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_SAVE_PATH));
    if save_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "session.save_path",
            "path must not be empty",
        ));
    }

    Ok(SessionSettings {
        provider,
        config: SessionConfig {
            name,
            domain: session.domain.unwrap_or(defaults.domain),
            max_lifetime: session.max_lifetime.unwrap_or(defaults.max_lifetime),
            key: session.key.unwrap_or(defaults.key),
            http_only: session.http_only.unwrap_or(defaults.http_only),
            save_path,
        },
    })
}

fn build_static_settings(static_files: RawStaticSettings) -> Result<StaticSettings, LoadError> {
    let directory = static_files
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_DIRECTORY));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "static_files.directory",
            "path must not be empty",
        ));
    }

    Ok(StaticSettings {
        directory,
        compress_css: static_files.compress_css.unwrap_or(false),
        compress_js: static_files.compress_js.unwrap_or(false),
    })
}

fn build_pool_settings(pool: RawPoolSettings) -> Result<PoolSettings, LoadError> {
    let capacity = pool.capacity.unwrap_or(DEFAULT_POOL_CAPACITY);
    if capacity == 0 {
        return Err(LoadError::invalid(
            "pool.capacity",
            "must be greater than zero",
        ));
    }
    Ok(PoolSettings { capacity })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    adapter: Option<String>,
    config: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSessionSettings {
    provider: Option<String>,
    name: Option<String>,
    domain: Option<String>,
    max_lifetime: Option<u64>,
    key: Option<String>,
    http_only: Option<bool>,
    save_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStaticSettings {
    directory: Option<PathBuf>,
    compress_css: Option<bool>,
    compress_js: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPoolSettings {
    capacity: Option<usize>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}
