/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use townsquare_core::config::{load_config, FederationConfig};
use townsquare_core::Federation;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let handle = args.next().unwrap_or_default();
    if handle.trim().is_empty() {
        anyhow::bail!("usage: dev_resolve_actor <user@domain> [config.json]");
    }
    let cfg = match args.next() {
        Some(path) => load_config(&std::fs::read_to_string(path)?)?,
        None => FederationConfig::minimal("localhost", "http://localhost:8080"),
    };

    let fed = Federation::open(cfg)?;
    let info = fed.resolve(handle.trim()).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
