/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! ActivityStreams payloads the core emits.

use serde_json::{json, Value};
use townsquare_protocol::{AS_CONTEXT, AS_PUBLIC};

use crate::db::random_hex_id;

pub fn new_activity_id(actor_url: &str) -> String {
    format!("{actor_url}/activities/{}", random_hex_id())
}

pub fn rfc3339_ms(ms: i64) -> String {
    let nanos = i128::from(ms) * 1_000_000;
    time::OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
}

pub fn follow(actor_url: &str, target_actor_url: &str) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": new_activity_id(actor_url),
        "type": "Follow",
        "actor": actor_url,
        "object": target_actor_url,
    })
}

/// Accept carrying the original Follow as its object, addressed to the follower.
pub fn accept(actor_url: &str, follow: &Value) -> Value {
    let follower = follow.get("actor").and_then(actor_ref).unwrap_or_default();
    json!({
        "@context": AS_CONTEXT,
        "id": new_activity_id(actor_url),
        "type": "Accept",
        "actor": actor_url,
        "object": follow,
        "to": [follower],
    })
}

pub fn undo(actor_url: &str, inner: &Value) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": new_activity_id(actor_url),
        "type": "Undo",
        "actor": actor_url,
        "object": inner,
    })
}

pub struct NoteFields<'a> {
    pub id: &'a str,
    pub actor_url: &'a str,
    pub followers_url: &'a str,
    pub content_html: &'a str,
    pub published_ms: i64,
    pub summary: Option<&'a str>,
    pub image_url: Option<&'a str>,
    pub topic: Option<&'a str>,
}

pub fn note(n: &NoteFields<'_>) -> Value {
    let mut note = json!({
        "id": n.id,
        "type": "Note",
        "attributedTo": n.actor_url,
        "content": n.content_html,
        "published": rfc3339_ms(n.published_ms),
        "to": [AS_PUBLIC],
        "cc": [n.followers_url],
    });
    if let Some(summary) = n.summary {
        note["summary"] = Value::String(summary.to_string());
    }
    if let Some(url) = n.image_url {
        note["attachment"] = json!([{ "type": "Image", "url": url }]);
    }
    if let Some(topic) = n.topic {
        note["tag"] = json!([{ "type": "Hashtag", "name": format!("#{topic}") }]);
    }
    note
}

/// Create wrapping `object`. Its id is derived from the object id so outbox listings and the
/// delivered activity agree.
pub fn create(actor_url: &str, followers_url: &str, object: Value) -> Value {
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .map(|oid| format!("{oid}/activity"))
        .unwrap_or_else(|| new_activity_id(actor_url));
    json!({
        "@context": AS_CONTEXT,
        "id": id,
        "type": "Create",
        "actor": actor_url,
        "published": object.get("published").cloned().unwrap_or(Value::Null),
        "to": [AS_PUBLIC],
        "cc": [followers_url],
        "object": object,
    })
}

/// Announce of an existing object, referenced by id only.
pub fn announce(actor_url: &str, followers_url: &str, object_id: &str, published_ms: i64) -> Value {
    json!({
        "@context": AS_CONTEXT,
        "id": new_activity_id(actor_url),
        "type": "Announce",
        "actor": actor_url,
        "published": rfc3339_ms(published_ms),
        "to": [AS_PUBLIC],
        "cc": [followers_url],
        "object": object_id,
    })
}

/// An `actor`/`object` reference may be a bare IRI or an embedded object with an `id`.
pub fn actor_ref(v: &Value) -> Option<&str> {
    v.as_str()
        .or_else(|| v.get("id").and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn activity_type(v: &Value) -> Option<&str> {
    v.get("type").and_then(Value::as_str)
}
