/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-memory network and temp-dir database used by unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use crate::config::FederationConfig;
use crate::context::Federation;
use crate::db::FederationDb;
use crate::keys::KeyPair;
use crate::registry::ActorRegistry;
use crate::resolver::webfinger_url;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct SentActivity {
    pub inbox: String,
    pub key_id: String,
    pub activity: Value,
}

#[derive(Default)]
pub struct FakeTransport {
    docs: Mutex<HashMap<String, Value>>,
    gets: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    sent: Mutex<Vec<SentActivity>>,
}

impl FakeTransport {
    pub fn serve(&self, url: &str, doc: Value) {
        self.docs.lock().unwrap().insert(url.to_string(), doc);
    }

    pub fn fail_inbox(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn gets(&self, url: &str) -> usize {
        self.gets.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn sent(&self) -> Vec<SentActivity> {
        self.sent.lock().unwrap().clone()
    }

    /// Publishes WebFinger, profile and an empty outbox for `user@domain`; returns the actor URL.
    pub fn add_remote_actor(&self, user: &str, domain: &str) -> String {
        self.add_remote_actor_with(user, domain, true)
    }

    pub fn add_remote_actor_with(&self, user: &str, domain: &str, shared_inbox: bool) -> String {
        let actor_url = format!("https://{domain}/users/{user}");
        self.serve(
            &webfinger_url("https", user, domain),
            json!({
                "subject": format!("acct:{user}@{domain}"),
                "links": [
                    {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": format!("https://{domain}/@{user}")},
                    {"rel": "self", "type": "application/activity+json", "href": actor_url},
                ]
            }),
        );
        let mut profile = json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": actor_url,
            "type": "Person",
            "preferredUsername": user,
            "name": user.to_uppercase(),
            "inbox": format!("{actor_url}/inbox"),
            "outbox": format!("{actor_url}/outbox"),
            "followers": format!("{actor_url}/followers"),
            "icon": [{"type": "Image", "url": format!("https://{domain}/avatars/{user}.png")}],
        });
        if shared_inbox {
            profile["endpoints"] = json!({"sharedInbox": format!("https://{domain}/inbox")});
        }
        self.serve(&actor_url, profile);
        self.set_outbox(&actor_url, &[]);
        actor_url
    }

    pub fn set_public_key(&self, actor_url: &str, public_key_pem: &str) {
        let mut docs = self.docs.lock().unwrap();
        if let Some(profile) = docs.get_mut(actor_url) {
            profile["publicKey"] = json!({
                "id": format!("{actor_url}#main-key"),
                "owner": actor_url,
                "publicKeyPem": public_key_pem,
            });
        }
    }

    /// Replaces the actor's outbox with Create(Note) items carrying the given contents.
    pub fn set_outbox(&self, actor_url: &str, contents: &[&str]) {
        let items: Vec<Value> = contents
            .iter()
            .enumerate()
            .map(|(i, c)| {
                json!({
                    "id": format!("{actor_url}/statuses/{i}/activity"),
                    "type": "Create",
                    "object": {"id": format!("{actor_url}/statuses/{i}"), "type": "Note", "content": c},
                })
            })
            .collect();
        self.serve(
            &format!("{actor_url}/outbox"),
            json!({
                "type": "OrderedCollection",
                "totalItems": items.len(),
                "first": {"type": "OrderedCollectionPage", "orderedItems": items},
            }),
        );
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get_json(&self, url: &str, _accept: &str) -> Result<Value> {
        *self.gets.lock().unwrap().entry(url.to_string()).or_default() += 1;
        self.docs
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("GET {url} failed: 404 Not Found"))
    }

    async fn post_activity(&self, key: &KeyPair, inbox_url: &str, body: Vec<u8>) -> Result<()> {
        if self.failing.lock().unwrap().contains(inbox_url) {
            return Err(anyhow!("POST {inbox_url} failed: 503 Service Unavailable"));
        }
        self.sent.lock().unwrap().push(SentActivity {
            inbox: inbox_url.to_string(),
            key_id: key.key_id.clone(),
            activity: serde_json::from_slice(&body)?,
        });
        Ok(())
    }
}

pub fn test_config() -> FederationConfig {
    let mut cfg = FederationConfig::minimal("town.example", "https://town.example");
    cfg.rsa_bits = Some(1024);
    cfg.verification.poll_interval_ms = Some(20);
    cfg.verification.poll_timeout_ms = Some(300);
    cfg
}

pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub transport: Arc<FakeTransport>,
    pub fed: Federation,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(cfg: FederationConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = FederationDb::open(dir.path().join("federation.db")).unwrap();
        let transport = Arc::new(FakeTransport::default());
        let fed = Federation::with_transport(cfg, db, transport.clone());
        Self { dir, transport, fed }
    }

    pub fn registry(&self) -> ActorRegistry {
        self.fed.registry.clone()
    }

    pub fn raw_conn(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(self.dir.path().join("federation.db")).unwrap()
    }
}
