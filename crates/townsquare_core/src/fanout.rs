/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Two-tier broadcast: host actor to its followers, then the topic aggregator to its own.

use serde_json::Value;

use crate::activity::{self, NoteFields};
use crate::db::{Actor, ActorKind, FederationDb, PostRow};
use crate::delivery::{DeliveryEngine, DeliveryReport, DeliveryTarget};
use crate::error::{FedResult, FederationError};
use crate::html::{escape_with_breaks, text_to_html};
use crate::registry::{ActorRegistry, ProfileFields, TOPIC_PREFIX};

const MAX_SLUG_LEN: usize = 64 - TOPIC_PREFIX.len();

#[derive(Debug, Clone, Default)]
pub struct PostContent {
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub place: Option<String>,
    pub starts_at: Option<String>,
    pub image_url: Option<String>,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DistributeOptions {
    /// Stop after the host's own followers.
    pub skip_second_tier: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    HostFollowers,
    TopicAggregator,
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub actor_url: String,
    pub report: DeliveryReport,
}

#[derive(Debug, Clone)]
pub struct DistributionReport {
    pub post: PostRow,
    pub note_id: String,
    pub stages: Vec<StageReport>,
}

#[derive(Clone)]
pub struct FanOut {
    db: FederationDb,
    registry: ActorRegistry,
    delivery: DeliveryEngine,
}

/// `"Live Music!"` becomes `live_music`. Returns `None` when nothing usable is left.
pub fn topic_slug(topic: &str) -> Option<String> {
    let mut slug = String::with_capacity(topic.len());
    for ch in topic.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            slug.push(ch);
        } else if (ch.is_whitespace() || ch == '-' || ch == '_') && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    let slug: String = slug.chars().take(MAX_SLUG_LEN).collect();
    let slug = slug.trim_end_matches('_');
    (!slug.is_empty()).then(|| slug.to_string())
}

pub fn render_content(content: &PostContent) -> String {
    let mut html = String::new();
    let title = content.title.trim();
    if !title.is_empty() {
        html.push_str(&format!("<p><strong>{}</strong></p>", escape_with_breaks(title)));
    }
    html.push_str(&text_to_html(&content.body));
    if let Some(starts_at) = non_blank(&content.starts_at) {
        html.push_str(&format!("<p>When: {}</p>", escape_with_breaks(starts_at)));
    }
    if let Some(place) = non_blank(&content.place) {
        html.push_str(&format!("<p>Where: {}</p>", escape_with_breaks(place)));
    }
    if let Some(link) = non_blank(&content.link) {
        let link = escape_with_breaks(link);
        html.push_str(&format!("<p><a href=\"{link}\" rel=\"nofollow noopener\">{link}</a></p>"));
    }
    html
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl FanOut {
    pub fn new(db: FederationDb, registry: ActorRegistry, delivery: DeliveryEngine) -> Self {
        Self {
            db,
            registry,
            delivery,
        }
    }

    /// Returns the aggregator for `topic`, creating `topic_<slug>` on first use.
    pub async fn ensure_topic_aggregator(&self, topic: &str) -> FedResult<Actor> {
        let slug = topic_slug(topic).ok_or_else(|| FederationError::InvalidHandle {
            handle: topic.to_string(),
            reason: "topic has no usable characters",
        })?;
        let profile = ProfileFields {
            display_name: Some(format!("#{slug}")),
            summary: Some(format!("Posts about {slug}")),
            icon_url: None,
        };
        self.registry
            .get_or_create_local_actor(&format!("{TOPIC_PREFIX}{slug}"), ActorKind::Aggregator, &profile)
            .await
    }

    /// Note object for a stored post, as served in outboxes and permalinks.
    pub fn post_note(&self, author: &Actor, post: &PostRow) -> Value {
        let note_id = self.registry.post_url(&post.id);
        let followers_url = followers_of(author);
        activity::note(&NoteFields {
            id: &note_id,
            actor_url: &author.actor_url,
            followers_url: &followers_url,
            content_html: &post.content,
            published_ms: post.published_at_ms,
            summary: None,
            image_url: post.image_url.as_deref(),
            topic: post.topic.as_deref(),
        })
    }

    /// Stores the post once, then runs the delivery stages in order.
    ///
    /// Delivery problems are reported per stage; the stored post is never rolled back.
    pub async fn distribute_post(
        &self,
        host: &Actor,
        content: &PostContent,
        options: DistributeOptions,
    ) -> FedResult<DistributionReport> {
        if !matches!(host.kind, ActorKind::Individual | ActorKind::Group) {
            return Err(FederationError::ActorNotFound(format!(
                "{} cannot author posts",
                host.handle
            )));
        }
        let topic = content.topic.as_deref().and_then(topic_slug);
        let html = render_content(content);
        let image_url = content.image_url.as_deref().map(str::trim).filter(|u| !u.is_empty());
        let post = self.db.insert_post(host.id, &html, topic.as_deref(), image_url)?;
        let note_id = self.registry.post_url(&post.id);
        tracing::info!(actor = %host.handle, post = %post.id, topic = ?topic, "post stored");

        let mut plan = vec![Stage::HostFollowers];
        if !options.skip_second_tier && topic.is_some() {
            plan.push(Stage::TopicAggregator);
        }

        let mut stages = Vec::with_capacity(plan.len());
        for stage in plan {
            let (sender, activity) = match stage {
                Stage::HostFollowers => {
                    let note = self.post_note(host, &post);
                    let create = activity::create(&host.actor_url, &followers_of(host), note);
                    (host.clone(), create)
                }
                Stage::TopicAggregator => {
                    let Some(topic) = topic.as_deref() else { continue };
                    let aggregator = self.ensure_topic_aggregator(topic).await?;
                    let announce = activity::announce(
                        &aggregator.actor_url,
                        &followers_of(&aggregator),
                        &note_id,
                        post.published_at_ms,
                    );
                    (aggregator, announce)
                }
            };
            let report = self
                .delivery
                .deliver(&sender, &activity, DeliveryTarget::Followers)
                .await?;
            stages.push(StageReport {
                stage,
                actor_url: sender.actor_url,
                report,
            });
        }

        Ok(DistributionReport {
            post,
            note_id,
            stages,
        })
    }
}

fn followers_of(actor: &Actor) -> String {
    actor
        .followers_url
        .clone()
        .unwrap_or_else(|| format!("{}/followers", actor.actor_url))
}
