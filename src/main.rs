// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::env;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vault_rust_server::api::router;
use vault_rust_server::bootstrap::build_app;
use vault_rust_server::config::{AppConfig, LOG_FORMAT_ENV};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if env::var(LOG_FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = AppConfig::from_env().expect("Invalid configuration");
    if config.ephemeral_secret {
        tracing::warn!(
            "URL_SIGNING_SECRET not set; using an ephemeral secret, issued links will not survive a restart"
        );
    }

    let app = build_app(&config).expect("Failed to initialize storage");
    let shutdown = CancellationToken::new();

    let sweeper_handle = app
        .sweeper
        .map(|sweeper| tokio::spawn(sweeper.run(shutdown.clone())));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind listener");
    tracing::info!(
        %addr,
        public_base_url = %config.public_base_url,
        "Vault server listening"
    );

    let signal = shutdown.clone();
    axum::serve(listener, router(app.state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            signal.cancel();
        })
        .await
        .expect("HTTP server failed");

    shutdown.cancel();
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }
    tracing::info!("Vault server stopped");
}
