//! HTTP server: resolver RPC, streaming proxy, health checks.

pub mod rpc;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{middleware, Json, Router};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::browser::ChromeLauncher;
use crate::config::Config;
use crate::proxy::{self, ProxyService};
use crate::resolver::Resolver;

/// Which components a server instance exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum ServiceRole {
    #[default]
    All,
    Resolver,
    Proxy,
}

impl ServiceRole {
    pub fn serves_resolver(self) -> bool {
        matches!(self, Self::All | Self::Resolver)
    }

    pub fn serves_proxy(self) -> bool {
        matches!(self, Self::All | Self::Proxy)
    }
}

/// Shared application context. Immutable after startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub resolver: Option<Arc<Resolver>>,
    pub proxy: Option<Arc<ProxyService>>,
}

impl AppContext {
    /// Build the components `role` asks for.
    pub fn from_config(config: Config, role: ServiceRole) -> Result<Self> {
        let resolver = role.serves_resolver().then(|| {
            if let Err(e) = ChromeLauncher::new(config.resolver.clone()).executable() {
                warn!("Resolver enabled but no browser available yet: {e}");
            }
            Arc::new(Resolver::new(config.resolver.clone()))
        });
        let proxy = if role.serves_proxy() {
            Some(Arc::new(
                ProxyService::new(&config.proxy).context("Failed to build proxy client")?,
            ))
        } else {
            None
        };

        Ok(Self {
            config: Arc::new(config),
            resolver,
            proxy,
        })
    }
}

/// Create the Axum router with the routes `ctx` has components for
pub fn create_router(ctx: AppContext) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping));

    if let Some(resolver) = ctx.resolver {
        app = app.merge(rpc::router(resolver, ctx.config.auth.clone()));
    }

    if let Some(proxy) = ctx.proxy {
        let proxy_routes = Router::new()
            .route(
                "/proxy",
                get(proxy::handle)
                    .post(proxy::handle)
                    .head(proxy::handle)
                    .options(proxy::handle),
            )
            .layer(middleware::from_fn(proxy::cors_headers))
            .with_state(proxy);
        app = app.merge(proxy_routes);
    }

    app.layer(TraceLayer::new_for_http())
}

/// RFC 3339 UTC, millisecond precision.
fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": timestamp(),
        "version": crate::VERSION,
    }))
}

async fn ping() -> Json<Value> {
    Json(json!({
        "pong": true,
        "timestamp": timestamp(),
    }))
}

/// Start the HTTP server
pub async fn start_server(config: Config, role: ServiceRole) -> Result<()> {
    let addr: SocketAddr = config.server.bind;
    let ctx = AppContext::from_config(config, role)?;
    let app = create_router(ctx);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Starting server on {} (role: {:?})", addr, role);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
