/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Context;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

use crate::db::{Actor, FederationDb};
use crate::error::{FedResult, Severity};
use crate::registry::ActorRegistry;
use crate::resolver::RemoteActorInfo;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub enum DeliveryTarget {
    /// One actor. Replies such as `Accept` go to the personal inbox (`prefer_shared = false`).
    Actor {
        actor_url: String,
        inbox_url: String,
        shared_inbox_url: Option<String>,
        prefer_shared: bool,
    },
    /// Everyone following the sender, one request per distinct delivery endpoint.
    Followers,
}

impl DeliveryTarget {
    pub fn personal(info: &RemoteActorInfo) -> Self {
        DeliveryTarget::Actor {
            actor_url: info.actor_url.clone(),
            inbox_url: info.inbox_url.clone(),
            shared_inbox_url: info.shared_inbox_url.clone(),
            prefer_shared: false,
        }
    }
}

/// A recipient endpoint that did not take the activity. Never aborts the delivery.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub endpoint: String,
    pub reason: String,
    pub severity: Severity,
}

#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub endpoint: String,
    /// Actor URLs reached through `endpoint`.
    pub recipients: Vec<String>,
    pub result: Result<(), DeliveryFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub activity_id: Option<String>,
    pub outcomes: Vec<DeliveryOutcome>,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeliveryFailure> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }
}

#[derive(Clone)]
pub struct DeliveryEngine {
    registry: ActorRegistry,
    db: FederationDb,
    transport: Arc<dyn Transport>,
    max_concurrency: usize,
}

impl DeliveryEngine {
    pub fn new(
        registry: ActorRegistry,
        db: FederationDb,
        transport: Arc<dyn Transport>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            registry,
            db,
            transport,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Signs `activity` as `from` and posts it to every endpoint `target` expands to.
    ///
    /// Only a missing sender key is an error; per-endpoint problems land in the report.
    pub async fn deliver(&self, from: &Actor, activity: &Value, target: DeliveryTarget) -> FedResult<DeliveryReport> {
        let key = self.registry.key_pair_for(from).await?;
        let body = serde_json::to_vec(activity).context("encode activity")?;
        let activity_id = activity.get("id").and_then(Value::as_str).map(str::to_string);

        let endpoints = self.expand(from, target)?;
        if endpoints.is_empty() {
            tracing::debug!(actor = %from.handle, "nothing to deliver: no recipients");
            return Ok(DeliveryReport {
                activity_id,
                outcomes: Vec::new(),
            });
        }

        let key = &key;
        let body = &body;
        let outcomes: Vec<DeliveryOutcome> = stream::iter(endpoints)
            .map(|(endpoint, recipients)| async move {
                let result = match self.transport.post_activity(key, &endpoint, body.clone()).await {
                    Ok(()) => {
                        tracing::debug!(%endpoint, "delivered");
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(%endpoint, "delivery failed: {e:#}");
                        Err(DeliveryFailure {
                            endpoint: endpoint.clone(),
                            reason: format!("{e:#}"),
                            severity: Severity::Advisory,
                        })
                    }
                };
                DeliveryOutcome {
                    endpoint,
                    recipients,
                    result,
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let report = DeliveryReport {
            activity_id,
            outcomes,
        };
        tracing::info!(
            actor = %from.handle,
            activity = report.activity_id.as_deref().unwrap_or("-"),
            delivered = report.delivered(),
            attempted = report.attempted(),
            "delivery finished"
        );
        Ok(report)
    }

    fn expand(&self, from: &Actor, target: DeliveryTarget) -> FedResult<Vec<(String, Vec<String>)>> {
        match target {
            DeliveryTarget::Actor {
                actor_url,
                inbox_url,
                shared_inbox_url,
                prefer_shared,
            } => {
                let endpoint = match (prefer_shared, shared_inbox_url) {
                    (true, Some(shared)) => shared,
                    _ => inbox_url,
                };
                Ok(vec![(endpoint, vec![actor_url])])
            }
            DeliveryTarget::Followers => {
                let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for follower in self.db.list_follower_actors(from.id)? {
                    grouped
                        .entry(follower.delivery_endpoint().to_string())
                        .or_default()
                        .push(follower.actor_url);
                }
                Ok(grouped.into_iter().collect())
            }
        }
    }
}
