/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde_json::Value;

use crate::activity::{self, activity_type, actor_ref};
use crate::db::{Actor, FederationDb};
use crate::delivery::{DeliveryEngine, DeliveryTarget};
use crate::error::{FedResult, FederationError};
use crate::registry::ActorRegistry;
use crate::resolver::RemoteActorResolver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome {
    /// Follow recorded and an `Accept` sent back.
    Accepted {
        follower: String,
        accept_id: String,
        delivered: bool,
    },
    Unfollowed {
        follower: String,
    },
    Ignored {
        activity_type: Option<String>,
    },
}

#[derive(Clone)]
pub struct InboxHandler {
    db: FederationDb,
    registry: ActorRegistry,
    resolver: RemoteActorResolver,
    delivery: DeliveryEngine,
}

impl InboxHandler {
    pub fn new(
        db: FederationDb,
        registry: ActorRegistry,
        resolver: RemoteActorResolver,
        delivery: DeliveryEngine,
    ) -> Self {
        Self {
            db,
            registry,
            resolver,
            delivery,
        }
    }

    /// Handles an activity posted to the personal inbox of `target_handle`.
    pub async fn handle_activity(&self, target_handle: &str, activity: &Value) -> FedResult<InboxOutcome> {
        let target = self
            .registry
            .find_local(target_handle)?
            .ok_or_else(|| FederationError::ActorNotFound(target_handle.to_string()))?;

        match activity_type(activity) {
            Some("Follow") => self.handle_follow(&target, activity).await,
            Some("Undo") => self.handle_undo(&target, activity),
            other => {
                tracing::debug!(target = %target.handle, ty = ?other, "ignoring inbox activity");
                Ok(InboxOutcome::Ignored {
                    activity_type: other.map(str::to_string),
                })
            }
        }
    }

    /// Handles an activity posted to the shared inbox by locating the local actor it addresses.
    pub async fn handle_shared(&self, activity: &Value) -> FedResult<InboxOutcome> {
        let addressed = match activity_type(activity) {
            Some("Follow") => activity.get("object").and_then(actor_ref),
            Some("Undo") => activity
                .get("object")
                .and_then(|inner| inner.get("object"))
                .and_then(actor_ref),
            _ => None,
        };
        let Some(addressed) = addressed else {
            return Ok(InboxOutcome::Ignored {
                activity_type: activity_type(activity).map(str::to_string),
            });
        };
        let target = self
            .registry
            .find_by_actor_url(addressed)?
            .filter(Actor::is_local)
            .ok_or_else(|| FederationError::ActorNotFound(addressed.to_string()))?;
        self.handle_activity(&target.handle, activity).await
    }

    async fn handle_follow(&self, target: &Actor, follow: &Value) -> FedResult<InboxOutcome> {
        let object = follow.get("object").and_then(actor_ref);
        if object != Some(target.actor_url.as_str()) {
            return Err(FederationError::InvalidActivity(format!(
                "Follow object does not name {}",
                target.actor_url
            )));
        }
        let follower_url = follow
            .get("actor")
            .and_then(actor_ref)
            .ok_or_else(|| FederationError::InvalidActivity("Follow without actor".into()))?;
        let follow_id = follow
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| FederationError::InvalidActivity("Follow without id".into()))?;

        let sender = self.resolver.resolve_actor_url(follower_url).await?;
        self.db
            .add_follower(target.id, sender.actor_id, Some(follow_id))?;
        tracing::info!(target = %target.handle, follower = %sender.actor_url, "accepted follow");

        let accept = activity::accept(&target.actor_url, follow);
        let accept_id = accept
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let report = self
            .delivery
            .deliver(target, &accept, DeliveryTarget::personal(&sender))
            .await?;

        Ok(InboxOutcome::Accepted {
            follower: sender.actor_url,
            accept_id,
            delivered: report.delivered() == 1,
        })
    }

    fn handle_undo(&self, target: &Actor, undo: &Value) -> FedResult<InboxOutcome> {
        let inner = undo.get("object");
        let inner_type = inner.and_then(activity_type);
        if inner_type != Some("Follow") {
            return Ok(InboxOutcome::Ignored {
                activity_type: Some(format!("Undo({})", inner_type.unwrap_or("?"))),
            });
        }
        let actor = undo
            .get("actor")
            .and_then(actor_ref)
            .ok_or_else(|| FederationError::InvalidActivity("Undo without actor".into()))?;
        let inner_actor = inner.and_then(|i| i.get("actor")).and_then(actor_ref);
        if inner_actor.is_some_and(|a| a != actor) {
            return Err(FederationError::InvalidActivity(
                "Undo actor does not match the Follow actor".into(),
            ));
        }

        if let Some(follower) = self.registry.find_by_actor_url(actor)? {
            if self.db.remove_follower(target.id, follower.id)? {
                tracing::info!(target = %target.handle, follower = %actor, "follower removed");
            }
        }
        Ok(InboxOutcome::Unfollowed {
            follower: actor.to_string(),
        })
    }
}
