/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! WebFinger + profile fetch for `user@domain` handles, cached through the registry.

use serde::Serialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use townsquare_protocol::{Jrd, RemoteActorDocument, ACTIVITY_ACCEPT, JRD_JSON};

use crate::db::{now_ms, Actor, RemoteActorRecord};
use crate::error::{FedResult, FederationError};
use crate::registry::ActorRegistry;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteActorInfo {
    pub handle: String,
    pub actor_url: String,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub outbox_url: Option<String>,
    pub followers_url: Option<String>,
    pub display_name: Option<String>,
    pub icon_url: Option<String>,
    pub summary: Option<String>,
    pub public_key_pem: Option<String>,
    /// Registry row id.
    pub actor_id: i64,
}

impl From<&Actor> for RemoteActorInfo {
    fn from(a: &Actor) -> Self {
        Self {
            handle: a.handle.clone(),
            actor_url: a.actor_url.clone(),
            inbox_url: a.inbox_url.clone(),
            shared_inbox_url: a.shared_inbox_url.clone(),
            outbox_url: a.outbox_url.clone(),
            followers_url: a.followers_url.clone(),
            display_name: a.display_name.clone(),
            icon_url: a.icon_url.clone(),
            summary: a.summary.clone(),
            public_key_pem: a.public_key_pem.clone(),
            actor_id: a.id,
        }
    }
}

#[derive(Clone)]
pub struct RemoteActorResolver {
    registry: ActorRegistry,
    transport: Arc<dyn Transport>,
    scheme: String,
    cache_ttl: Duration,
}

/// Splits `[@]user@domain` into `(user, lowercased domain)`.
pub fn parse_handle(handle: &str) -> FedResult<(String, String)> {
    let invalid = |reason: &'static str| FederationError::InvalidHandle {
        handle: handle.to_string(),
        reason,
    };
    let h = handle.trim();
    let h = h.strip_prefix('@').unwrap_or(h);
    let (user, domain) = h.split_once('@').ok_or_else(|| invalid("expected user@domain"))?;
    if user.is_empty() || domain.is_empty() {
        return Err(invalid("user and domain must not be empty"));
    }
    if domain.contains('@') {
        return Err(invalid("expected exactly one @ separator"));
    }
    if h.contains('/') || h.chars().any(char::is_whitespace) {
        return Err(invalid("handles cannot contain '/' or whitespace"));
    }
    Ok((user.to_string(), domain.to_ascii_lowercase()))
}

pub fn webfinger_url(scheme: &str, user: &str, domain: &str) -> String {
    let resource = format!("acct:{user}@{domain}");
    format!(
        "{scheme}://{domain}/.well-known/webfinger?resource={}",
        urlencoding::encode(&resource)
    )
}

/// Cache and challenge key for a handle. Account names are case-insensitive in practice, so the
/// whole handle is folded to lowercase.
pub fn canonical_handle(handle: &str) -> FedResult<String> {
    let (user, domain) = parse_handle(handle)?;
    Ok(format!("{}@{domain}", user.to_lowercase()))
}

impl RemoteActorResolver {
    pub fn new(
        registry: ActorRegistry,
        transport: Arc<dyn Transport>,
        scheme: &str,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            scheme: scheme.to_string(),
            cache_ttl,
        }
    }

    pub async fn resolve(&self, handle: &str) -> FedResult<RemoteActorInfo> {
        let (user, domain) = parse_handle(handle)?;
        let canonical = canonical_handle(handle)?;

        if let Some(cached) = self.registry.find_remote(&canonical)? {
            if self.is_fresh(&cached) {
                tracing::debug!(handle = %canonical, "remote actor served from cache");
                return Ok(RemoteActorInfo::from(&cached));
            }
        }

        let wf = webfinger_url(&self.scheme, &user, &domain);
        let jrd = self
            .transport
            .get_json(&wf, JRD_JSON)
            .await
            .map_err(|e| FederationError::resolution(&canonical, format!("webfinger: {e:#}")))?;
        let jrd: Jrd = serde_json::from_value(jrd)
            .map_err(|e| FederationError::resolution(&canonical, format!("webfinger: {e}")))?;
        let href = jrd
            .activity_profile_href()
            .ok_or_else(|| FederationError::resolution(&canonical, "webfinger has no ActivityPub self link"))?
            .to_string();

        self.fetch_and_store(&canonical, Some(&canonical), &href).await
    }

    /// Resolves an actor by IRI. Known local actors and fresh cache rows are served directly.
    pub async fn resolve_actor_url(&self, actor_url: &str) -> FedResult<RemoteActorInfo> {
        if let Some(known) = self.registry.find_by_actor_url(actor_url)? {
            if known.is_local() || self.is_fresh(&known) {
                return Ok(RemoteActorInfo::from(&known));
            }
        }
        self.fetch_and_store(actor_url, None, actor_url).await
    }

    async fn fetch_and_store(
        &self,
        label: &str,
        handle: Option<&str>,
        profile_url: &str,
    ) -> FedResult<RemoteActorInfo> {
        let value = self
            .transport
            .get_json(profile_url, ACTIVITY_ACCEPT)
            .await
            .map_err(|e| FederationError::resolution(label, format!("profile: {e:#}")))?;
        let doc: RemoteActorDocument = serde_json::from_value(value.clone())
            .map_err(|e| FederationError::resolution(label, format!("profile: {e}")))?;

        let record = record_from_document(label, handle, profile_url, &doc, &value)?;
        if handle.is_none() {
            // A by-URL fetch only names the handle indirectly; it may refresh that handle's row
            // but never rebind it to a different actor.
            if let Some(existing) = self.registry.find_remote(&record.handle)? {
                if existing.actor_url != record.actor_url {
                    tracing::warn!(
                        handle = %record.handle,
                        cached = %existing.actor_url,
                        fetched = %record.actor_url,
                        "refusing to rebind cached handle"
                    );
                    return Err(FederationError::resolution(
                        label,
                        format!("{} is already bound to {}", record.handle, existing.actor_url),
                    ));
                }
            }
        }
        let actor = self.registry.upsert_remote(&record)?;
        tracing::info!(handle = %actor.handle, actor = %actor.actor_url, "resolved remote actor");
        Ok(RemoteActorInfo::from(&actor))
    }

    fn is_fresh(&self, actor: &Actor) -> bool {
        let Some(fetched) = actor.fetched_at_ms else {
            return false;
        };
        let age = now_ms().saturating_sub(fetched);
        age >= 0 && (age as u128) < self.cache_ttl.as_millis()
    }
}

fn record_from_document(
    label: &str,
    handle: Option<&str>,
    fetched_url: &str,
    doc: &RemoteActorDocument,
    raw: &Value,
) -> FedResult<RemoteActorRecord> {
    let non_empty = |s: &Option<String>| s.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    let actor_url = non_empty(&doc.id)
        .ok_or_else(|| FederationError::resolution(label, "profile has no id"))?;
    let inbox_url = non_empty(&doc.inbox)
        .ok_or_else(|| FederationError::resolution(label, "profile has no inbox"))?;
    let id = reqwest::Url::parse(&actor_url)
        .map_err(|_| FederationError::resolution(label, "profile id is not an absolute url"))?;
    let fetched = reqwest::Url::parse(fetched_url)
        .map_err(|_| FederationError::resolution(label, "profile url is not an absolute url"))?;
    // The document only speaks for its own origin.
    if id.origin() != fetched.origin() {
        return Err(FederationError::resolution(
            label,
            format!("profile id {actor_url} is not served by {fetched_url}"),
        ));
    }
    let host = id
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| FederationError::resolution(label, "profile id has no host"))?;

    let handle = match handle {
        Some(h) => h.to_string(),
        None => {
            let user = non_empty(&doc.preferred_username)
                .or_else(|| {
                    actor_url
                        .trim_end_matches('/')
                        .rsplit('/')
                        .next()
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                })
                .ok_or_else(|| FederationError::resolution(label, "cannot derive a handle"))?;
            canonical_handle(&format!("{user}@{host}"))
                .map_err(|e| FederationError::resolution(label, e))?
        }
    };
    let domain = handle
        .split_once('@')
        .map(|(_, d)| d.to_string())
        .unwrap_or(host);

    Ok(RemoteActorRecord {
        handle,
        actor_url,
        inbox_url,
        shared_inbox_url: doc.shared_inbox().map(str::to_string),
        outbox_url: non_empty(&doc.outbox),
        followers_url: non_empty(&doc.followers),
        following_url: non_empty(&doc.following),
        public_key_pem: doc.public_key_pem().map(str::to_string),
        domain,
        display_name: non_empty(&doc.name),
        summary: non_empty(&doc.summary),
        icon_url: doc.icon_url().map(str::to_string),
        profile_json: raw.to_string(),
    })
}
