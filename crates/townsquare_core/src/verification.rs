/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Proof of account ownership by publishing a one-time code to the remote outbox.
//!
//! A challenge moves `pending -> verified` or `pending -> expired`, never back. Only the newest
//! challenge for a handle can be matched; older rows stay as an audit trail.

use anyhow::Context;
use async_trait::async_trait;
use rand::{rngs::OsRng, Rng};
use serde::Serialize;
use serde_json::Value;
use std::{sync::Arc, time::Instant};
use townsquare_protocol::{CollectionDocument, FirstPage, ACTIVITY_ACCEPT};

use crate::config::VerificationSettings;
use crate::db::{now_ms, ChallengeStatus, FederationDb};
use crate::error::{FedResult, FederationError};
use crate::html::html_to_text;
use crate::registry::ActorRegistry;
use crate::resolver::{canonical_handle, RemoteActorResolver};
use crate::transport::Transport;

/// User records are owned by the surrounding application; the core only finds or creates them.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Returns the id of the user named `username`, creating it when missing.
    async fn find_or_create_user(&self, username: &str) -> anyhow::Result<i64>;
}

#[async_trait]
impl UserDirectory for FederationDb {
    async fn find_or_create_user(&self, username: &str) -> anyhow::Result<i64> {
        Ok(FederationDb::find_or_create_user(self, username)?.id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeTicket {
    pub handle: String,
    pub code: String,
    pub expires_at_ms: i64,
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifiedSession {
    pub user_id: i64,
    pub actor_id: i64,
    pub handle: String,
    pub actor_url: String,
    pub verified_at_ms: i64,
}

/// Public view of the latest challenge. The code itself is not exposed.
#[derive(Debug, Clone, Serialize)]
pub struct ChallengeState {
    pub handle: String,
    pub status: &'static str,
    pub expires_at_ms: i64,
    pub created_at_ms: i64,
    pub closed_at_ms: Option<i64>,
}

#[derive(Clone)]
pub struct OwnershipVerifier {
    db: FederationDb,
    registry: ActorRegistry,
    resolver: RemoteActorResolver,
    transport: Arc<dyn Transport>,
    users: Arc<dyn UserDirectory>,
    settings: VerificationSettings,
}

pub fn generate_code(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

impl OwnershipVerifier {
    pub fn new(
        db: FederationDb,
        registry: ActorRegistry,
        resolver: RemoteActorResolver,
        transport: Arc<dyn Transport>,
        users: Arc<dyn UserDirectory>,
        settings: VerificationSettings,
    ) -> Self {
        Self {
            db,
            registry,
            resolver,
            transport,
            users,
            settings,
        }
    }

    /// Issues a new code for `handle`. The handle must resolve, otherwise nothing is stored.
    pub async fn request_challenge(&self, handle: &str) -> FedResult<ChallengeTicket> {
        let actor = self.resolver.resolve(handle).await?;
        let code = generate_code(self.settings.code_length);
        let created_at_ms = now_ms();
        let expires_at_ms = created_at_ms + self.settings.challenge_ttl.as_millis() as i64;
        self.db
            .insert_challenge(&actor.handle, &code, created_at_ms, expires_at_ms)?;
        tracing::info!(handle = %actor.handle, "issued ownership challenge");

        let minutes = (self.settings.challenge_ttl.as_secs() / 60).max(1);
        Ok(ChallengeTicket {
            instructions: format!(
                "Publish a public post containing {code} from {}, then confirm within {minutes} minutes.",
                actor.handle
            ),
            handle: actor.handle,
            code,
            expires_at_ms,
        })
    }

    /// Polls the actor's outbox for the pending code and, on a match, binds the actor to a user.
    pub async fn verify(&self, handle: &str) -> FedResult<VerifiedSession> {
        let handle = canonical_handle(handle)?;
        let challenge = self
            .db
            .latest_challenge(&handle)?
            .filter(|c| c.status == ChallengeStatus::Pending)
            .ok_or_else(|| FederationError::ChallengeNotFound {
                handle: handle.clone(),
            })?;

        if now_ms() >= challenge.expires_at_ms {
            self.db
                .transition_challenge(challenge.id, ChallengeStatus::Pending, ChallengeStatus::Expired)?;
            tracing::info!(%handle, "ownership challenge expired");
            return Err(FederationError::ChallengeExpired { handle });
        }

        let actor = self.resolver.resolve(&handle).await?;
        let outbox_url = actor
            .outbox_url
            .clone()
            .ok_or_else(|| FederationError::resolution(&handle, "actor publishes no outbox"))?;

        let started = Instant::now();
        loop {
            match self.outbox_contains(&outbox_url, &challenge.code).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => tracing::warn!(%handle, "outbox poll failed: {e:#}"),
            }
            let elapsed = started.elapsed();
            if elapsed >= self.settings.poll_timeout {
                tracing::info!(%handle, "ownership code not found before timeout");
                return Err(FederationError::VerificationTimeout {
                    handle,
                    waited: self.settings.poll_timeout,
                });
            }
            let remaining = self.settings.poll_timeout - elapsed;
            tokio::time::sleep(self.settings.poll_interval.min(remaining)).await;
        }

        if now_ms() >= challenge.expires_at_ms {
            self.db
                .transition_challenge(challenge.id, ChallengeStatus::Pending, ChallengeStatus::Expired)?;
            return Err(FederationError::ChallengeExpired { handle });
        }
        if !self
            .db
            .transition_challenge(challenge.id, ChallengeStatus::Pending, ChallengeStatus::Verified)?
        {
            return Err(FederationError::ChallengeNotFound { handle });
        }

        let user_id = self
            .users
            .find_or_create_user(&handle)
            .await
            .context("find or create user")?;
        self.registry.link_user(actor.actor_id, user_id)?;
        let user_id = self
            .db
            .get_actor(actor.actor_id)?
            .and_then(|a| a.user_id)
            .unwrap_or(user_id);

        tracing::info!(%handle, user_id, "verified remote account ownership");
        Ok(VerifiedSession {
            user_id,
            actor_id: actor.actor_id,
            handle,
            actor_url: actor.actor_url,
            verified_at_ms: now_ms(),
        })
    }

    pub fn challenge_status(&self, handle: &str) -> FedResult<Option<ChallengeState>> {
        let handle = canonical_handle(handle)?;
        Ok(self.db.latest_challenge(&handle)?.map(|c| ChallengeState {
            handle: c.handle,
            status: c.status.as_str(),
            expires_at_ms: c.expires_at_ms,
            created_at_ms: c.created_at_ms,
            closed_at_ms: c.closed_at_ms,
        }))
    }

    async fn outbox_contains(&self, outbox_url: &str, code: &str) -> anyhow::Result<bool> {
        let items = self.fetch_outbox_items(outbox_url).await?;
        Ok(items
            .iter()
            .take(self.settings.outbox_item_cap)
            .any(|item| item_texts(item).any(|t| html_to_text(t).contains(code))))
    }

    async fn fetch_outbox_items(&self, outbox_url: &str) -> anyhow::Result<Vec<Value>> {
        let root = self.transport.get_json(outbox_url, ACTIVITY_ACCEPT).await?;
        let root: CollectionDocument = serde_json::from_value(root).context("decode outbox")?;
        if let Some(items) = root.inline_items() {
            return Ok(items.to_vec());
        }
        match root.first {
            Some(FirstPage::Page(page)) => Ok(page.inline_items().map(<[Value]>::to_vec).unwrap_or_default()),
            Some(FirstPage::Link(url)) => {
                let page = self.transport.get_json(&url, ACTIVITY_ACCEPT).await?;
                let page: CollectionDocument = serde_json::from_value(page).context("decode outbox page")?;
                Ok(page.inline_items().map(<[Value]>::to_vec).unwrap_or_default())
            }
            None => Ok(Vec::new()),
        }
    }
}

/// Text-bearing fields of an outbox entry: the wrapped object for activities, else the entry.
fn item_texts<'a>(item: &'a Value) -> impl Iterator<Item = &'a str> + 'a {
    let target = match item.get("object") {
        Some(obj) if obj.is_object() => obj,
        _ => item,
    };
    ["content", "summary", "name"]
        .into_iter()
        .filter_map(move |k| target.get(k).and_then(Value::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, TestEnv};
    use std::time::Duration;

    #[test]
    fn codes_are_fixed_length_digits() {
        for len in [4, 6, 12] {
            let code = generate_code(len);
            assert_eq!(code.len(), len);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn item_text_prefers_wrapped_object() {
        let item = serde_json::json!({"type":"Create","object":{"content":"<p>x</p>","name":"n"}});
        assert_eq!(item_texts(&item).collect::<Vec<_>>(), vec!["<p>x</p>", "n"]);
        let bare = serde_json::json!({"type":"Note","summary":"s"});
        assert_eq!(item_texts(&bare).collect::<Vec<_>>(), vec!["s"]);
    }

    #[tokio::test]
    async fn unresolvable_handle_creates_no_challenge() {
        let env = TestEnv::new();
        let err = env.fed.verifier.request_challenge("ghost@nowhere.example").await.unwrap_err();
        assert!(matches!(err, FederationError::Resolution { .. }));
        assert!(env.fed.verifier.challenge_status("ghost@nowhere.example").unwrap().is_none());
    }

    #[tokio::test]
    async fn ticket_expiry_is_creation_plus_ttl() {
        let env = TestEnv::new();
        env.transport.add_remote_actor("bob", "remote.example");
        let ticket = env.fed.verifier.request_challenge("@bob@remote.example").await.unwrap();
        assert_eq!(ticket.handle, "bob@remote.example");
        assert_eq!(ticket.code.len(), 6);
        let state = env.fed.verifier.challenge_status("bob@remote.example").unwrap().unwrap();
        assert_eq!(state.status, "pending");
        assert_eq!(state.expires_at_ms - state.created_at_ms, 15 * 60 * 1000);
        assert_eq!(state.expires_at_ms, ticket.expires_at_ms);
    }

    #[tokio::test]
    async fn verify_matches_code_in_html_content_once() {
        let env = TestEnv::new();
        let actor_url = env.transport.add_remote_actor("bob", "remote.example");
        let ticket = env.fed.verifier.request_challenge("bob@remote.example").await.unwrap();
        let post = format!("<p>logging in: <span>{}</span></p>", ticket.code);
        env.transport.set_outbox(&actor_url, &["<p>hello</p>", post.as_str()]);

        let session = env.fed.verifier.verify("bob@remote.example").await.unwrap();
        assert_eq!(session.handle, "bob@remote.example");
        assert_eq!(session.actor_url, actor_url);
        let actor = env.fed.registry.find_remote("bob@remote.example").unwrap().unwrap();
        assert_eq!(actor.user_id, Some(session.user_id));

        let again = env.fed.verifier.verify("bob@remote.example").await.unwrap_err();
        assert!(matches!(again, FederationError::ChallengeNotFound { .. }));
        let state = env.fed.verifier.challenge_status("bob@remote.example").unwrap().unwrap();
        assert_eq!(state.status, "verified");
    }

    #[tokio::test]
    async fn code_posted_while_polling_is_found() {
        let env = TestEnv::new();
        let actor_url = env.transport.add_remote_actor("bob", "remote.example");
        let ticket = env.fed.verifier.request_challenge("bob@remote.example").await.unwrap();

        let transport = env.transport.clone();
        let code = ticket.code.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            transport.set_outbox(&actor_url, &[code.as_str()]);
        });
        env.fed.verifier.verify("bob@remote.example").await.unwrap();
    }

    #[tokio::test]
    async fn missing_code_times_out_and_stays_pending() {
        let env = TestEnv::new();
        let actor_url = env.transport.add_remote_actor("bob", "remote.example");
        let ticket = env.fed.verifier.request_challenge("bob@remote.example").await.unwrap();
        // Off by one digit: substring match must be exact.
        let wrong: String = ticket
            .code
            .chars()
            .map(|c| if c == '9' { '0' } else { char::from(c as u8 + 1) })
            .collect();
        env.transport.set_outbox(&actor_url, &[wrong.as_str()]);

        let err = env.fed.verifier.verify("bob@remote.example").await.unwrap_err();
        assert!(matches!(err, FederationError::VerificationTimeout { .. }));
        let state = env.fed.verifier.challenge_status("bob@remote.example").unwrap().unwrap();
        assert_eq!(state.status, "pending");
    }

    #[tokio::test]
    async fn expired_challenge_is_closed() {
        let mut cfg = test_config();
        cfg.verification.challenge_ttl_secs = Some(0);
        let env = TestEnv::with_config(cfg);
        env.transport.add_remote_actor("bob", "remote.example");
        env.fed.verifier.request_challenge("bob@remote.example").await.unwrap();

        let err = env.fed.verifier.verify("bob@remote.example").await.unwrap_err();
        assert!(matches!(err, FederationError::ChallengeExpired { .. }));
        let state = env.fed.verifier.challenge_status("bob@remote.example").unwrap().unwrap();
        assert_eq!(state.status, "expired");
    }

    #[tokio::test]
    async fn only_latest_challenge_counts() {
        let env = TestEnv::new();
        let actor_url = env.transport.add_remote_actor("bob", "remote.example");
        let old = env.fed.verifier.request_challenge("bob@remote.example").await.unwrap();
        let new = env.fed.verifier.request_challenge("bob@remote.example").await.unwrap();
        if old.code == new.code {
            return;
        }
        env.transport.set_outbox(&actor_url, &[old.code.as_str()]);
        let err = env.fed.verifier.verify("bob@remote.example").await.unwrap_err();
        assert!(matches!(err, FederationError::VerificationTimeout { .. }));
    }

    #[tokio::test]
    async fn outbox_first_page_link_is_followed() {
        let env = TestEnv::new();
        let actor_url = env.transport.add_remote_actor("bob", "remote.example");
        let ticket = env.fed.verifier.request_challenge("bob@remote.example").await.unwrap();
        let page_url = format!("{actor_url}/outbox?page=true");
        env.transport.serve(
            &format!("{actor_url}/outbox"),
            serde_json::json!({"type":"OrderedCollection","first": page_url}),
        );
        env.transport.serve(
            &page_url,
            serde_json::json!({"type":"OrderedCollectionPage","orderedItems":[
                {"type":"Create","object":{"type":"Note","content": format!("code {}", ticket.code)}}
            ]}),
        );
        env.fed.verifier.verify("bob@remote.example").await.unwrap();
    }

    #[tokio::test]
    async fn foreign_profile_cannot_take_over_a_handle() {
        let env = TestEnv::new();
        let bob_url = env.transport.add_remote_actor("bob", "remote.example");
        env.fed.resolve("bob@remote.example").await.unwrap();
        env.fed
            .get_or_create_local_actor(
                "ana",
                crate::db::ActorKind::Individual,
                &crate::registry::ProfileFields::default(),
            )
            .await
            .unwrap();

        // A profile on another origin claiming bob's id.
        env.transport.serve(
            "https://evil.example/a",
            serde_json::json!({
                "id": bob_url,
                "type": "Person",
                "preferredUsername": "bob",
                "inbox": "https://evil.example/inbox",
                "outbox": "https://evil.example/outbox",
            }),
        );
        let follow = serde_json::json!({
            "id": "https://evil.example/a#follow",
            "type": "Follow",
            "actor": "https://evil.example/a",
            "object": "https://town.example/actors/ana",
        });
        let err = env.fed.inbox.handle_activity("ana", &follow).await.unwrap_err();
        assert!(matches!(err, FederationError::Resolution { .. }), "{err}");

        let cached = env.fed.registry.find_remote("bob@remote.example").unwrap().unwrap();
        assert_eq!(cached.actor_url, bob_url);
        assert_eq!(cached.outbox_url.as_deref(), Some(format!("{bob_url}/outbox").as_str()));
        assert_eq!(cached.inbox_url, format!("{bob_url}/inbox"));

        let ticket = env.fed.verifier.request_challenge("bob@remote.example").await.unwrap();
        env.transport.serve(
            "https://evil.example/outbox",
            serde_json::json!({
                "type": "OrderedCollection",
                "orderedItems": [{"type": "Note", "content": ticket.code}],
            }),
        );
        let err = env.fed.verifier.verify("bob@remote.example").await.unwrap_err();
        assert!(matches!(err, FederationError::VerificationTimeout { .. }), "{err}");
        assert!(env.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn handle_case_does_not_split_challenges() {
        let env = TestEnv::new();
        let actor_url = env.transport.add_remote_actor("bob", "remote.example");
        let ticket = env.fed.verifier.request_challenge("bob@remote.example").await.unwrap();
        env.transport.set_outbox(&actor_url, &[ticket.code.as_str()]);

        let state = env.fed.verifier.challenge_status("Bob@Remote.Example").unwrap().unwrap();
        assert_eq!(state.handle, "bob@remote.example");
        let session = env.fed.verifier.verify("BOB@remote.example").await.unwrap();
        assert_eq!(session.handle, "bob@remote.example");
        assert_eq!(session.actor_url, actor_url);
    }
}
