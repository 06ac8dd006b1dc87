/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use townsquare_core::config::{load_config, parse_config_path};
use townsquare_core::Federation;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg_path = parse_config_path(std::env::args().skip(1))?;
    info!("config: {}", cfg_path.display());
    let text = std::fs::read_to_string(&cfg_path)
        .with_context(|| format!("read config: {}", cfg_path.display()))?;
    let cfg = load_config(&text)?;
    let bind = cfg.bind.clone();

    let fed = Federation::open(cfg)?;
    let app = fed.router();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(domain = %fed.registry.domain(), "federation listening on {bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("serve")?;
    Ok(())
}
