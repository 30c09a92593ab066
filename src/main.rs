use std::{process, sync::Arc, time::Duration};

use axum::http::StatusCode;
use gantry::{
    cache::CacheAdapterRegistry,
    config::{self, Settings},
    error::AppError,
    http::{Router, StaticFiles, server},
    session::{SessionManager, SessionProviderRegistry, cookie},
    telemetry,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(mut settings: Settings) -> Result<(), AppError> {
    let cache = CacheAdapterRegistry::with_defaults()
        .construct(&settings.cache.adapter, &settings.cache.config)?;

    if settings.session.config.key.is_empty() {
        warn!(
            target = "gantry::serve",
            "session.key is not set; generated a random key, sessions will not survive a restart"
        );
        settings.session.config.key = cookie::new_session_id();
    }
    let store = SessionProviderRegistry::with_defaults()
        .construct(&settings.session.provider, &settings.session.config)?;
    let sessions = Arc::new(SessionManager::new(settings.session.config.clone(), store)?);
    let sweeper = sessions.spawn_sweeper();

    let app_name = match settings.lookup.string("app_name") {
        name if name.is_empty() => "gantry".to_string(),
        name => name,
    };

    let mut router = Router::with_pool_capacity(settings.pool.capacity);
    router.use_middleware(sessions.middleware());
    router.get("/_health", move |ctx| {
        ctx.json(StatusCode::OK, &json!({ "status": "ok", "app": app_name }));
    })?;
    router.serve_static(
        StaticFiles::new(&settings.static_files.directory)
            .with_cache(cache)
            .compress_css(settings.static_files.compress_css)
            .compress_js(settings.static_files.compress_js),
    );

    let listener = TcpListener::bind(settings.server.addr).await?;
    info!(
        target = "gantry::serve",
        addr = %settings.server.addr,
        cache = %settings.cache.adapter,
        sessions = %settings.session.provider,
        static_dir = %settings.static_files.directory.display(),
        "listening"
    );

    server::serve(
        listener,
        Arc::new(router),
        shutdown_signal(settings.server.graceful_shutdown),
    )
    .await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!(target = "gantry::serve", "server stopped");
    Ok(())
}

/// Resolves on Ctrl-C. A second timer bounds how long in-flight requests may
/// keep the process alive afterwards.
async fn shutdown_signal(grace: Duration) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target = "gantry::serve", error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!(
        target = "gantry::serve",
        grace_secs = grace.as_secs(),
        "shutdown requested"
    );
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!(target = "gantry::serve", "graceful shutdown timed out");
        process::exit(1);
    });
}
