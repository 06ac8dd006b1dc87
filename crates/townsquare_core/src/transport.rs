/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use http::{header, HeaderMap, HeaderValue, Method, Uri};
use std::time::Duration;
use townsquare_protocol::ACTIVITY_JSON;

use crate::http_retry::send_with_retry;
use crate::http_sig::{sign_request_rsa_sha256, POST_SIGNED_HEADERS};
use crate::keys::KeyPair;

const MAX_FETCH_BYTES: usize = 2 * 1024 * 1024;

/// Outbound network seam: everything the core sends or fetches goes through here.
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET a JSON document with the given `Accept` header.
    async fn get_json(&self, url: &str, accept: &str) -> Result<serde_json::Value>;

    /// POST an activity to an inbox, HTTP-signed with `key`.
    async fn post_activity(&self, key: &KeyPair, inbox_url: &str, body: Vec<u8>) -> Result<()>;
}

/// Reads a response body, failing as soon as it exceeds `max` bytes.
async fn read_capped(mut resp: reqwest::Response, max: usize) -> Result<Vec<u8>> {
    if let Some(len) = resp.content_length() {
        if len > max as u64 {
            return Err(anyhow!("response too large ({len} bytes)"));
        }
    }
    let mut buf = Vec::new();
    while let Some(chunk) = resp.chunk().await.context("read response body")? {
        if buf.len() + chunk.len() > max {
            return Err(anyhow!("response too large (over {max} bytes)"));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

pub struct HttpTransport {
    client: reqwest::Client,
    retry_attempts: u32,
}

impl HttpTransport {
    pub fn new(timeout: Duration, retry_attempts: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("townsquare/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            retry_attempts,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_json(&self, url: &str, accept: &str) -> Result<serde_json::Value> {
        let resp = send_with_retry(
            || Ok(self.client.get(url).header(header::ACCEPT, accept)),
            self.retry_attempts,
        )
        .await
        .with_context(|| format!("GET {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("GET {url} failed: {status}"));
        }
        let bytes = read_capped(resp, MAX_FETCH_BYTES)
            .await
            .with_context(|| format!("GET {url}"))?;
        serde_json::from_slice(&bytes).with_context(|| format!("GET {url}: invalid json"))
    }

    async fn post_activity(&self, key: &KeyPair, inbox_url: &str, body: Vec<u8>) -> Result<()> {
        let uri: Uri = inbox_url.parse().with_context(|| format!("invalid inbox url: {inbox_url}"))?;
        let resp = send_with_retry(
            || {
                let mut headers = HeaderMap::new();
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON));
                headers.insert(header::ACCEPT, HeaderValue::from_static(ACTIVITY_JSON));
                sign_request_rsa_sha256(
                    &key.private_key_pem,
                    &key.key_id,
                    &Method::POST,
                    &uri,
                    &mut headers,
                    &body,
                    POST_SIGNED_HEADERS,
                )?;
                Ok(self.client.post(inbox_url).headers(headers).body(body.clone()))
            },
            self.retry_attempts,
        )
        .await
        .with_context(|| format!("POST {inbox_url}"))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        let snippet: String = text.chars().take(200).collect();
        Err(anyhow!("POST {inbox_url} failed: {status} {snippet}"))
    }
}
