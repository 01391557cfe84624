mod alerts;
mod auth;
mod bans;
mod config;
mod duplicate;
mod flags;
mod handlers;
mod middleware;
mod notifier;
mod policy;
mod sentinel;
mod serde_store;
mod state;
mod store;
mod upstream;
mod window;

use std::{collections::HashSet, env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use config::Config;
use state::AppState;
use tower_http::trace::TraceLayer;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env files found; configuring heist-sentinel from the process environment.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded heist-sentinel environment files");
    }

    let config = Config::from_env()?;

    if config.jwt_secret.is_none() {
        tracing::warn!(
            "JWT_SECRET is not set. Every caller is treated as anonymous and no request is inspected."
        );
    }
    let identity =
        auth::IdentityVerifier::new(config.jwt_secret.as_deref(), config.jwt_issuer.as_deref());

    let document_store = match &config.store_url {
        Some(url) => Some(store::DocumentStore::new(url.clone())?),
        None => {
            tracing::warn!(
                "STORE_URL is not set. Security flags are kept in memory and bans are not enforced."
            );
            None
        }
    };

    let notifier = notifier::ChatNotifier::from_config(&config)?;
    if notifier.is_none() {
        tracing::warn!(
            "ALERT_BOT_TOKEN or ALERT_CHAT_ID is not set. Operator alerts will only be logged."
        );
    }
    let alerts = Arc::new(alerts::AlertDispatcher::new(notifier));
    alerts.spawn_worker(config.detection.alert_flush_interval);

    let flag_store = match &document_store {
        Some(store) => flags::FlagStore::remote(store.clone()),
        None => flags::FlagStore::in_memory(),
    };

    let sentinel = Arc::new(sentinel::Sentinel::new(
        &config.detection,
        flag_store,
        alerts,
    ));
    sentinel.spawn_maintenance(MAINTENANCE_INTERVAL);

    let bans = bans::BanList::default();
    if let Some(store) = &document_store {
        match bans.refresh(store).await {
            Ok(count) => tracing::info!(bans = count, "Loaded active bans"),
            Err(error) => {
                tracing::error!(
                    error = ?error,
                    store_url = %store.base_url(),
                    "Initial ban list load failed. Continuing without bans until the next refresh."
                );
            }
        }
        bans.spawn_refresh(store.clone(), config.ban_refresh_interval);
    }

    let upstream = upstream::UpstreamClient::new(config.upstream_url.clone())?;
    tracing::info!(upstream = %config.upstream_url, "Forwarding inspected traffic to game API");

    let state = AppState::new(config.clone(), identity, sentinel, bans, upstream);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load gateway TLS certificate/key")?;

        tracing::info!(port = config.port, "Sentinel gateway listening over HTTPS");

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")?;
    } else {
        tracing::info!(port = config.port, "Sentinel gateway listening over HTTP");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")?;
    }

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/internal/flags", post(handlers::report_violation))
        .fallback(upstream::forward)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::intercept,
        ))
        .with_state(state)
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
}

/// Certificate and key for HTTPS, when both are configured and present on
/// disk. Anything less falls back to plain HTTP with an error logged.
fn valid_tls_paths(config: &Config) -> Option<(PathBuf, PathBuf)> {
    match (&config.tls_cert_path, &config.tls_key_path) {
        (None, None) => None,
        (Some(cert), Some(key)) => {
            let missing: Vec<_> = [("certificate", cert), ("key", key)]
                .into_iter()
                .filter(|(_, path)| !path.exists())
                .collect();
            if missing.is_empty() {
                return Some((cert.clone(), key.clone()));
            }
            for (kind, path) in missing {
                tracing::error!(path = %path.display(), "TLS {kind} file not found");
            }
            tracing::error!("Sentinel gateway falls back to plain HTTP.");
            None
        }
        (Some(path), None) | (None, Some(path)) => {
            tracing::error!(
                path = %path.display(),
                "TLS_CERT_PATH and TLS_KEY_PATH must be set together. Sentinel gateway falls back to plain HTTP."
            );
            None
        }
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Loads `.env` then `.env.local` from the working directory, the binary's
/// directory and the crate root, each root at most once. Earlier values win.
fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let executable_dir = env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(PathBuf::from));
    let roots = env::current_dir()
        .ok()
        .into_iter()
        .chain(executable_dir)
        .chain([PathBuf::from(env!("CARGO_MANIFEST_DIR"))]);

    let mut seen = HashSet::new();
    let mut loaded = Vec::new();
    for root in roots {
        if !seen.insert(root.clone()) {
            continue;
        }
        for path in [root.join(".env"), root.join(".env.local")] {
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    Ok(loaded)
}
