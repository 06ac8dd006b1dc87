/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use rand::{thread_rng, Rng};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

/// Sends the request built by `build`, retrying transport errors and 429/5xx answers.
///
/// `build` is called once per attempt because a `RequestBuilder` is consumed by `send`; callers
/// that sign requests must re-sign inside the closure so each attempt carries a fresh `Date`.
pub async fn send_with_retry<F>(mut build: F, attempts: u32) -> Result<Response>
where
    F: FnMut() -> Result<RequestBuilder>,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = Duration::from_millis(200);
    for attempt in 0..max_attempts {
        let last = attempt + 1 >= max_attempts;
        match build()?.send().await {
            Ok(resp) => {
                let status = resp.status();
                if should_retry_status(status) && !last {
                    tracing::debug!(%status, attempt, "retrying request");
                    sleep_with_jitter(backoff).await;
                    backoff = next_backoff(backoff);
                    continue;
                }
                return Ok(resp);
            }
            Err(e) => {
                if last {
                    return Err(e.into());
                }
                tracing::debug!(attempt, "request failed, retrying: {e}");
                sleep_with_jitter(backoff).await;
                backoff = next_backoff(backoff);
            }
        }
    }
    unreachable!("retry loop should return or error");
}

pub(crate) fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(Duration::from_secs(5))
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}
