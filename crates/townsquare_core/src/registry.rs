/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Local and cached-remote actor identities, plus the key lifecycle of local actors.

use crate::config::FederationConfig;
use crate::db::{Actor, ActorKind, FederationDb, GroupRole, NewLocalActor, RemoteActorRecord};
use crate::error::{FedResult, FederationError};
use crate::keys::{generate_rsa_keys_blocking, key_id_for, GeneratedKeys, KeyPair};

/// Local handles with this prefix belong to topic aggregators.
pub const TOPIC_PREFIX: &str = "topic_";
const MAX_HANDLE_LEN: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct ProfileFields {
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub icon_url: Option<String>,
}

#[derive(Clone)]
pub struct ActorRegistry {
    db: FederationDb,
    domain: String,
    base_url: String,
    rsa_bits: usize,
}

impl ActorRegistry {
    pub fn new(db: FederationDb, cfg: &FederationConfig) -> Self {
        Self {
            db,
            domain: cfg.domain.trim().to_ascii_lowercase(),
            base_url: cfg.base_url().to_string(),
            rsa_bits: cfg.rsa_bits(),
        }
    }

    pub fn db(&self) -> &FederationDb {
        &self.db
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn actor_url(&self, handle: &str) -> String {
        format!("{}/actors/{handle}", self.base_url)
    }

    pub fn shared_inbox_url(&self) -> String {
        format!("{}/inbox", self.base_url)
    }

    pub fn post_url(&self, post_id: &str) -> String {
        format!("{}/posts/{post_id}", self.base_url)
    }

    /// Returns the local actor for `handle`, creating it with a fresh key pair if needed.
    ///
    /// Concurrent callers for the same new handle all observe the same row: keys are generated
    /// before the insert, the insert ignores conflicts and everyone re-reads the winner.
    pub async fn get_or_create_local_actor(
        &self,
        handle: &str,
        kind: ActorKind,
        profile: &ProfileFields,
    ) -> FedResult<Actor> {
        validate_local_handle(handle, kind)?;

        if let Some(existing) = self.db.find_local_actor(handle)? {
            ensure_kind(&existing, kind)?;
            self.ensure_keys(&existing).await?;
            return self.reread(handle);
        }

        let keys = self.generate_keys().await?;
        let actor_url = self.actor_url(handle);
        let inbox_url = format!("{actor_url}/inbox");
        let outbox_url = format!("{actor_url}/outbox");
        let followers_url = format!("{actor_url}/followers");
        let following_url = format!("{actor_url}/following");
        let shared_inbox_url = self.shared_inbox_url();
        let inserted = self.db.insert_local_actor(&NewLocalActor {
            handle,
            kind,
            actor_url: &actor_url,
            inbox_url: &inbox_url,
            shared_inbox_url: &shared_inbox_url,
            outbox_url: &outbox_url,
            followers_url: &followers_url,
            following_url: &following_url,
            public_key_pem: &keys.public_key_pem,
            private_key_pem: &keys.private_key_pem,
            domain: &self.domain,
            display_name: profile.display_name.as_deref(),
            summary: profile.summary.as_deref(),
            icon_url: profile.icon_url.as_deref(),
        })?;
        if inserted {
            tracing::info!(handle, kind = kind.as_str(), "created local actor");
        } else {
            tracing::debug!(handle, "local actor created concurrently, using existing row");
        }

        let actor = self.reread(handle)?;
        ensure_kind(&actor, kind)?;
        Ok(actor)
    }

    /// Signing keys for a local actor, provisioned on first use when the row has none.
    pub async fn get_key_pair(&self, handle: &str) -> FedResult<KeyPair> {
        let actor = self
            .db
            .find_local_actor(handle)?
            .ok_or_else(|| FederationError::ActorNotFound(handle.to_string()))?;
        self.key_pair_for(&actor).await
    }

    pub async fn key_pair_for(&self, actor: &Actor) -> FedResult<KeyPair> {
        if !actor.is_local() {
            return Err(FederationError::ActorNotFound(actor.handle.clone()));
        }
        let (public_key_pem, private_key_pem) = self.ensure_keys(actor).await?;
        Ok(KeyPair {
            key_id: key_id_for(&actor.actor_url),
            public_key_pem,
            private_key_pem,
        })
    }

    async fn ensure_keys(&self, actor: &Actor) -> FedResult<(String, String)> {
        if let Some(keys) = self.db.local_actor_keys(actor.id)? {
            return Ok(keys);
        }
        let keys = self.generate_keys().await?;
        if self
            .db
            .set_actor_keys_if_missing(actor.id, &keys.public_key_pem, &keys.private_key_pem)?
        {
            tracing::info!(handle = %actor.handle, "provisioned missing key pair");
        }
        self.db
            .local_actor_keys(actor.id)?
            .ok_or_else(|| FederationError::KeyGeneration(format!("keys for {} were not stored", actor.handle)))
    }

    async fn generate_keys(&self) -> FedResult<GeneratedKeys> {
        generate_rsa_keys_blocking(self.rsa_bits)
            .await
            .map_err(|e| FederationError::KeyGeneration(format!("{e:#}")))
    }

    fn reread(&self, handle: &str) -> FedResult<Actor> {
        self.db
            .find_local_actor(handle)?
            .ok_or_else(|| FederationError::ActorNotFound(handle.to_string()))
    }

    /// Creates a group actor hosted by `host_actor_id`.
    pub async fn create_group(&self, handle: &str, profile: &ProfileFields, host_actor_id: i64) -> FedResult<Actor> {
        let host = self
            .db
            .get_actor(host_actor_id)?
            .filter(Actor::is_local)
            .ok_or_else(|| FederationError::ActorNotFound(format!("actor #{host_actor_id}")))?;
        let group = self
            .get_or_create_local_actor(handle, ActorKind::Group, profile)
            .await?;
        self.db.insert_membership(group.id, host.id, GroupRole::Host)?;
        Ok(group)
    }

    pub fn add_moderator(&self, group_handle: &str, member_actor_id: i64) -> FedResult<()> {
        let group = self.find_group(group_handle)?;
        if self.db.get_actor(member_actor_id)?.is_none() {
            return Err(FederationError::ActorNotFound(format!("actor #{member_actor_id}")));
        }
        self.db
            .insert_membership(group.id, member_actor_id, GroupRole::Moderator)?;
        Ok(())
    }

    pub fn membership_role(&self, group_handle: &str, member_actor_id: i64) -> FedResult<Option<GroupRole>> {
        let group = self.find_group(group_handle)?;
        Ok(self.db.membership_role(group.id, member_actor_id)?)
    }

    fn find_group(&self, handle: &str) -> FedResult<Actor> {
        self.db
            .find_local_actor(handle)?
            .filter(|a| a.kind == ActorKind::Group)
            .ok_or_else(|| FederationError::ActorNotFound(handle.to_string()))
    }

    /// Attaches an actor to a user record. An existing link is kept.
    pub fn link_user(&self, actor_id: i64, user_id: i64) -> FedResult<bool> {
        Ok(self.db.link_actor_user(actor_id, user_id)?)
    }

    pub fn find_local(&self, handle: &str) -> FedResult<Option<Actor>> {
        Ok(self.db.find_local_actor(handle)?)
    }

    pub fn find_remote(&self, handle: &str) -> FedResult<Option<Actor>> {
        Ok(self.db.find_remote_actor(handle)?)
    }

    pub fn find_by_actor_url(&self, actor_url: &str) -> FedResult<Option<Actor>> {
        Ok(self.db.find_actor_by_url(actor_url)?)
    }

    pub fn upsert_remote(&self, record: &RemoteActorRecord) -> FedResult<Actor> {
        if !record.handle.contains('@') {
            return Err(FederationError::InvalidHandle {
                handle: record.handle.clone(),
                reason: "remote handles must be user@domain",
            });
        }
        Ok(self.db.upsert_remote_actor(record)?)
    }
}

fn ensure_kind(actor: &Actor, wanted: ActorKind) -> FedResult<()> {
    if actor.kind != wanted {
        return Err(FederationError::HandleTaken {
            handle: actor.handle.clone(),
            existing: actor.kind.as_str(),
        });
    }
    Ok(())
}

pub fn validate_local_handle(handle: &str, kind: ActorKind) -> FedResult<()> {
    let invalid = |reason| {
        Err(FederationError::InvalidHandle {
            handle: handle.to_string(),
            reason,
        })
    };
    if !kind.is_local() {
        return invalid("remote actors are only created by resolution");
    }
    if handle.is_empty() || handle.len() > MAX_HANDLE_LEN {
        return invalid("local handles must be 1 to 64 characters");
    }
    if !handle
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return invalid("local handles may only contain a-z, 0-9 and _");
    }
    match (kind, handle.starts_with(TOPIC_PREFIX)) {
        (ActorKind::Aggregator, false) => invalid("topic aggregator handles start with topic_"),
        (ActorKind::Aggregator, true) => Ok(()),
        (_, true) => invalid("the topic_ prefix is reserved for topic aggregators"),
        (_, false) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;

    #[test]
    fn handle_rules() {
        assert!(validate_local_handle("ana_1", ActorKind::Individual).is_ok());
        assert!(validate_local_handle("Ana", ActorKind::Individual).is_err());
        assert!(validate_local_handle("ana@town", ActorKind::Individual).is_err());
        assert!(validate_local_handle("", ActorKind::Group).is_err());
        assert!(validate_local_handle("topic_music", ActorKind::Individual).is_err());
        assert!(validate_local_handle("topic_music", ActorKind::Aggregator).is_ok());
        assert!(validate_local_handle("music", ActorKind::Aggregator).is_err());
        assert!(validate_local_handle(&"a".repeat(65), ActorKind::Individual).is_err());
    }

    #[tokio::test]
    async fn create_is_idempotent_and_urls_are_minted_under_base() {
        let env = TestEnv::new();
        let reg = env.registry();
        let profile = ProfileFields {
            display_name: Some("Ana".into()),
            ..Default::default()
        };
        let a = reg
            .get_or_create_local_actor("ana", ActorKind::Individual, &profile)
            .await
            .unwrap();
        assert_eq!(a.actor_url, "https://town.example/actors/ana");
        assert_eq!(a.inbox_url, "https://town.example/actors/ana/inbox");
        assert_eq!(a.shared_inbox_url.as_deref(), Some("https://town.example/inbox"));
        assert_eq!(a.display_name.as_deref(), Some("Ana"));

        let again = reg
            .get_or_create_local_actor("ana", ActorKind::Individual, &ProfileFields::default())
            .await
            .unwrap();
        assert_eq!(a, again);

        let err = reg
            .get_or_create_local_actor("ana", ActorKind::Group, &ProfileFields::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::HandleTaken { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_yields_one_row_and_one_key_pair() {
        let env = TestEnv::new();
        let reg = env.registry();
        let mut tasks = Vec::new();
        for _ in 0..6 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                reg.get_or_create_local_actor("race", ActorKind::Individual, &ProfileFields::default())
                    .await
                    .unwrap()
            }));
        }
        let mut actors = Vec::new();
        for t in tasks {
            actors.push(t.await.unwrap());
        }
        assert!(actors.windows(2).all(|w| w[0].id == w[1].id));
        assert!(actors
            .windows(2)
            .all(|w| w[0].public_key_pem == w[1].public_key_pem));

        let k1 = reg.get_key_pair("race").await.unwrap();
        let k2 = reg.get_key_pair("race").await.unwrap();
        assert_eq!(k1.private_key_pem, k2.private_key_pem);
        assert_eq!(k1.key_id, "https://town.example/actors/race#main-key");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn missing_keys_are_provisioned_once() {
        let env = TestEnv::new();
        let reg = env.registry();
        let a = reg
            .get_or_create_local_actor("ana", ActorKind::Individual, &ProfileFields::default())
            .await
            .unwrap();
        env.raw_conn()
            .execute(
                "UPDATE actors SET public_key_pem=NULL, private_key_pem=NULL WHERE id=?1",
                [a.id],
            )
            .unwrap();

        let (k1, k2) = tokio::join!(reg.get_key_pair("ana"), reg.get_key_pair("ana"));
        let (k1, k2) = (k1.unwrap(), k2.unwrap());
        assert_eq!(k1.private_key_pem, k2.private_key_pem);
        assert_eq!(reg.get_key_pair("ana").await.unwrap().public_key_pem, k1.public_key_pem);
    }

    #[tokio::test]
    async fn unknown_actor_has_no_keys() {
        let env = TestEnv::new();
        let err = env.registry().get_key_pair("nobody").await.unwrap_err();
        assert!(matches!(err, FederationError::ActorNotFound(_)));
    }

    #[tokio::test]
    async fn groups_track_host_and_moderators() {
        let env = TestEnv::new();
        let reg = env.registry();
        let host = reg
            .get_or_create_local_actor("ana", ActorKind::Individual, &ProfileFields::default())
            .await
            .unwrap();
        let mod_actor = reg
            .get_or_create_local_actor("bea", ActorKind::Individual, &ProfileFields::default())
            .await
            .unwrap();
        let group = reg
            .create_group("jazz_club", &ProfileFields::default(), host.id)
            .await
            .unwrap();
        assert_eq!(group.kind, ActorKind::Group);
        assert_eq!(reg.membership_role("jazz_club", host.id).unwrap(), Some(GroupRole::Host));

        reg.add_moderator("jazz_club", mod_actor.id).unwrap();
        reg.add_moderator("jazz_club", host.id).unwrap();
        assert_eq!(reg.membership_role("jazz_club", mod_actor.id).unwrap(), Some(GroupRole::Moderator));
        assert_eq!(reg.membership_role("jazz_club", host.id).unwrap(), Some(GroupRole::Host));
        assert!(reg.add_moderator("ana", mod_actor.id).is_err());
    }
}
