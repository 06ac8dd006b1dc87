/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

#[derive(Clone, Debug, Deserialize)]
pub struct FederationConfig {
    /// Host part of local handles (`user@domain`).
    pub domain: String,
    /// Public origin actor URLs are minted under, e.g. `https://town.example`.
    pub public_base_url: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    /// RSA modulus size for newly provisioned local actors.
    #[serde(default)]
    pub rsa_bits: Option<usize>,
    /// Scheme used for discovery requests. Only changed for local development.
    #[serde(default)]
    pub discovery_scheme: Option<String>,
    /// How long a cached remote profile is served without refetching.
    #[serde(default)]
    pub remote_cache_ttl_secs: Option<u64>,
    /// Reject inbound inbox POSTs without a valid HTTP signature.
    #[serde(default)]
    pub require_signatures: Option<bool>,
    #[serde(default)]
    pub max_date_skew_secs: Option<u64>,
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct VerificationConfig {
    pub code_length: Option<usize>,
    pub challenge_ttl_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub poll_timeout_ms: Option<u64>,
    pub outbox_item_cap: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeliveryConfig {
    pub retry_attempts: Option<u32>,
    pub max_concurrency: Option<usize>,
}

fn default_bind() -> String {
    "127.0.0.1:8790".to_string()
}

/// Resolved ownership-verification knobs.
#[derive(Clone, Copy, Debug)]
pub struct VerificationSettings {
    pub code_length: usize,
    pub challenge_ttl: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub outbox_item_cap: usize,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            code_length: 6,
            challenge_ttl: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(60),
            outbox_item_cap: 50,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DeliverySettings {
    pub retry_attempts: u32,
    pub max_concurrency: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            max_concurrency: 16,
        }
    }
}

impl FederationConfig {
    pub fn minimal(domain: &str, public_base_url: &str) -> Self {
        Self {
            domain: domain.to_string(),
            public_base_url: public_base_url.to_string(),
            bind: default_bind(),
            data_dir: None,
            http_timeout_secs: None,
            rsa_bits: None,
            discovery_scheme: None,
            remote_cache_ttl_secs: None,
            require_signatures: None,
            max_date_skew_secs: None,
            max_body_bytes: None,
            verification: VerificationConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }

    pub fn base_url(&self) -> &str {
        self.public_base_url.trim_end_matches('/')
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(30).clamp(5, 120))
    }

    pub fn rsa_bits(&self) -> usize {
        self.rsa_bits.unwrap_or(2048).clamp(1024, 4096)
    }

    pub fn discovery_scheme(&self) -> &str {
        match self.discovery_scheme.as_deref().map(str::trim) {
            Some("http") => "http",
            _ => "https",
        }
    }

    pub fn remote_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.remote_cache_ttl_secs.unwrap_or(24 * 3600))
    }

    pub fn require_signatures(&self) -> bool {
        self.require_signatures.unwrap_or(true)
    }

    pub fn max_date_skew(&self) -> Duration {
        Duration::from_secs(self.max_date_skew_secs.unwrap_or(3600))
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
            .unwrap_or(2 * 1024 * 1024)
            .clamp(64 * 1024, 20 * 1024 * 1024)
    }

    pub fn verification_settings(&self) -> VerificationSettings {
        let d = VerificationSettings::default();
        let v = &self.verification;
        VerificationSettings {
            code_length: v.code_length.unwrap_or(d.code_length).clamp(4, 12),
            challenge_ttl: v
                .challenge_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(d.challenge_ttl),
            poll_interval: v
                .poll_interval_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(d.poll_interval),
            poll_timeout: v
                .poll_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.poll_timeout),
            outbox_item_cap: v.outbox_item_cap.unwrap_or(d.outbox_item_cap).clamp(1, 200),
        }
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        let d = DeliverySettings::default();
        DeliverySettings {
            retry_attempts: self.delivery.retry_attempts.unwrap_or(d.retry_attempts).clamp(1, 5),
            max_concurrency: self
                .delivery
                .max_concurrency
                .unwrap_or(d.max_concurrency)
                .clamp(1, 256),
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = self.data_dir.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        default_data_dir()
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("TOWNSQUARE_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "townsquare", "Townsquare")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("net", "townsquare", "Townsquare")
        .context("unable to determine platform config dir")?;
    Ok(proj.config_dir().join("federation.json"))
}

/// `--config <path>`, then `TOWNSQUARE_CONFIG`, then the platform default.
pub fn parse_config_path(mut args: impl Iterator<Item = String>) -> Result<PathBuf> {
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
            anyhow::bail!("--config requires a path");
        }
    }
    if let Ok(path) = std::env::var("TOWNSQUARE_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    default_config_path()
}

pub fn load_config(text: &str) -> Result<FederationConfig> {
    let cfg: FederationConfig = serde_json::from_str(text).context("parse federation config json")?;
    if cfg.domain.trim().is_empty() {
        anyhow::bail!("config: domain must not be empty");
    }
    let base = cfg.public_base_url.trim();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        anyhow::bail!("config: public_base_url must start with http:// or https:// (got: {base})");
    }
    Ok(cfg)
}
