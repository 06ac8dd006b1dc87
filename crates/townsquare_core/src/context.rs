/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::activity;
use crate::config::FederationConfig;
use crate::db::{Actor, ActorKind, FederationDb};
use crate::delivery::{DeliveryEngine, DeliveryReport, DeliveryTarget};
use crate::error::{FedResult, FederationError};
use crate::fanout::{DistributeOptions, DistributionReport, FanOut, PostContent};
use crate::inbox::InboxHandler;
use crate::registry::{ActorRegistry, ProfileFields};
use crate::resolver::{RemoteActorInfo, RemoteActorResolver};
use crate::transport::{HttpTransport, Transport};
use crate::verification::{ChallengeTicket, OwnershipVerifier, UserDirectory, VerifiedSession};

/// Every federation component, wired once at startup and cheap to clone into handlers.
#[derive(Clone)]
pub struct Federation {
    pub config: Arc<FederationConfig>,
    pub db: FederationDb,
    pub registry: ActorRegistry,
    pub resolver: RemoteActorResolver,
    pub verifier: OwnershipVerifier,
    pub delivery: DeliveryEngine,
    pub inbox: InboxHandler,
    pub fanout: FanOut,
}

impl Federation {
    /// Opens `federation.db` under the configured data dir and talks to the network over HTTP.
    pub fn open(config: FederationConfig) -> Result<Self> {
        let data_dir = config.data_dir()?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir: {}", data_dir.display()))?;
        let db = FederationDb::open(data_dir.join("federation.db"))?;
        let transport = HttpTransport::new(config.http_timeout(), config.delivery_settings().retry_attempts)?;
        Ok(Self::with_transport(config, db, Arc::new(transport)))
    }

    /// Uses the built-in SQLite user table as the user directory.
    pub fn with_transport(config: FederationConfig, db: FederationDb, transport: Arc<dyn Transport>) -> Self {
        let users: Arc<dyn UserDirectory> = Arc::new(db.clone());
        Self::with_collaborators(config, db, transport, users)
    }

    pub fn with_collaborators(
        config: FederationConfig,
        db: FederationDb,
        transport: Arc<dyn Transport>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        let registry = ActorRegistry::new(db.clone(), &config);
        let resolver = RemoteActorResolver::new(
            registry.clone(),
            transport.clone(),
            config.discovery_scheme(),
            config.remote_cache_ttl(),
        );
        let verifier = OwnershipVerifier::new(
            db.clone(),
            registry.clone(),
            resolver.clone(),
            transport.clone(),
            users,
            config.verification_settings(),
        );
        let delivery = DeliveryEngine::new(
            registry.clone(),
            db.clone(),
            transport,
            config.delivery_settings().max_concurrency,
        );
        let inbox = InboxHandler::new(db.clone(), registry.clone(), resolver.clone(), delivery.clone());
        let fanout = FanOut::new(db.clone(), registry.clone(), delivery.clone());
        Self {
            config: Arc::new(config),
            db,
            registry,
            resolver,
            verifier,
            delivery,
            inbox,
            fanout,
        }
    }

    pub fn router(&self) -> axum::Router {
        crate::server::router(self.clone())
    }

    pub async fn resolve(&self, handle: &str) -> FedResult<RemoteActorInfo> {
        self.resolver.resolve(handle).await
    }

    pub async fn request_challenge(&self, handle: &str) -> FedResult<ChallengeTicket> {
        self.verifier.request_challenge(handle).await
    }

    pub async fn verify(&self, handle: &str) -> FedResult<VerifiedSession> {
        self.verifier.verify(handle).await
    }

    pub async fn get_or_create_local_actor(
        &self,
        handle: &str,
        kind: ActorKind,
        profile: &ProfileFields,
    ) -> FedResult<Actor> {
        self.registry.get_or_create_local_actor(handle, kind, profile).await
    }

    pub async fn distribute_post(
        &self,
        host_handle: &str,
        content: &PostContent,
        options: DistributeOptions,
    ) -> FedResult<DistributionReport> {
        let host = self.local_actor(host_handle)?;
        self.fanout.distribute_post(&host, content, options).await
    }

    /// Sends a `Follow` from a local actor to a remote one.
    pub async fn follow_remote(&self, local_handle: &str, remote_handle: &str) -> FedResult<DeliveryReport> {
        let local = self.local_actor(local_handle)?;
        let remote = self.resolver.resolve(remote_handle).await?;
        let follow = activity::follow(&local.actor_url, &remote.actor_url);
        self.delivery
            .deliver(&local, &follow, DeliveryTarget::personal(&remote))
            .await
    }

    /// Sends `Undo(Follow)` from a local actor to a remote one.
    pub async fn unfollow_remote(&self, local_handle: &str, remote_handle: &str) -> FedResult<DeliveryReport> {
        let local = self.local_actor(local_handle)?;
        let remote = self.resolver.resolve(remote_handle).await?;
        let follow = activity::follow(&local.actor_url, &remote.actor_url);
        let undo = activity::undo(&local.actor_url, &follow);
        self.delivery
            .deliver(&local, &undo, DeliveryTarget::personal(&remote))
            .await
    }

    fn local_actor(&self, handle: &str) -> FedResult<Actor> {
        self.registry
            .find_local(handle)?
            .ok_or_else(|| FederationError::ActorNotFound(handle.to_string()))
    }
}
