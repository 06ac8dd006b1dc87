/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire-level documents shared by the federation core and its tools.
//!
//! Inbound documents are decoded into structs whose fields are all optional so that partial
//! remote profiles degrade gracefully; callers decide which fields are mandatory.

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};

pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

pub const ACTIVITY_JSON: &str = "application/activity+json";
pub const LD_JSON_AS: &str = "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
pub const JRD_JSON: &str = "application/jrd+json";
/// Accept header used when fetching actors and collections.
pub const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// WebFinger JSON Resource Descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jrd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub links: Vec<JrdLink>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JrdLink {
    #[serde(default)]
    pub rel: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl JrdLink {
    /// True for a `self` link that points at an ActivityStreams actor document.
    pub fn is_activity_profile(&self) -> bool {
        if self.rel != "self" {
            return false;
        }
        let Some(ty) = self.ty.as_deref() else {
            return false;
        };
        let ty = ty.to_ascii_lowercase();
        ty.starts_with(ACTIVITY_JSON)
            || (ty.starts_with("application/ld+json") && ty.contains("activitystreams"))
    }
}

impl Jrd {
    pub fn activity_profile_href(&self) -> Option<&str> {
        self.links
            .iter()
            .filter(|l| l.is_activity_profile())
            .filter_map(|l| l.href.as_deref())
            .map(str::trim)
            .find(|h| !h.is_empty())
    }
}

/// Decodes a field if it has the expected shape and yields `None` otherwise, so one odd property
/// does not sink the whole document.
fn lenient<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Option::<serde_json::Value>::deserialize(d)?;
    Ok(raw.and_then(|v| serde_json::from_value(v).ok()))
}

/// A remote actor document as fetched from another server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteActorDocument {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    pub ty: Option<String>,
    #[serde(rename = "preferredUsername", default, deserialize_with = "lenient")]
    pub preferred_username: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub summary: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub icon: Option<OneOrMany<ImageRef>>,
    #[serde(default, deserialize_with = "lenient")]
    pub inbox: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub outbox: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub followers: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub following: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub endpoints: Option<RemoteEndpoints>,
    /// Some servers publish several keys.
    #[serde(rename = "publicKey", default, deserialize_with = "lenient")]
    pub public_key: Option<OneOrMany<RemotePublicKey>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteEndpoints {
    #[serde(rename = "sharedInbox", default, deserialize_with = "lenient")]
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemotePublicKey {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub owner: Option<String>,
    #[serde(rename = "publicKeyPem", default, deserialize_with = "lenient")]
    pub public_key_pem: Option<String>,
}

impl RemotePublicKey {
    fn pem(&self) -> Option<&str> {
        self.public_key_pem.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// A JSON-LD property that may be a single value or an array of values.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn first(&self) -> Option<&T> {
        match self {
            OneOrMany::One(v) => Some(v),
            OneOrMany::Many(v) => v.first(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrMany::One(v) => std::slice::from_ref(v).iter(),
            OneOrMany::Many(v) => v.iter(),
        }
    }
}

/// `icon`/`image` values: either a bare URL or an `Image` object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImageRef {
    Url(String),
    Object {
        #[serde(default)]
        url: Option<OneOrMany<LinkOrUrl>>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LinkOrUrl {
    Url(String),
    Link {
        #[serde(default)]
        href: Option<String>,
    },
}

impl ImageRef {
    pub fn url(&self) -> Option<&str> {
        let raw = match self {
            ImageRef::Url(u) => Some(u.as_str()),
            ImageRef::Object { url } => url.as_ref().and_then(|u| u.first()).and_then(|l| match l {
                LinkOrUrl::Url(u) => Some(u.as_str()),
                LinkOrUrl::Link { href } => href.as_deref(),
            }),
        };
        raw.map(str::trim).filter(|s| !s.is_empty())
    }
}

impl RemoteActorDocument {
    /// First usable icon URL, whatever shape the remote used.
    pub fn icon_url(&self) -> Option<&str> {
        match self.icon.as_ref()? {
            OneOrMany::One(img) => img.url(),
            OneOrMany::Many(list) => list.iter().find_map(ImageRef::url),
        }
    }

    pub fn shared_inbox(&self) -> Option<&str> {
        self.endpoints
            .as_ref()
            .and_then(|e| e.shared_inbox.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// PEM of the key owned by this actor, else the first key that carries one.
    pub fn public_key_pem(&self) -> Option<&str> {
        let keys = self.public_key.as_ref()?;
        let owned = keys
            .iter()
            .filter(|k| k.owner.is_some() && k.owner == self.id)
            .find_map(RemotePublicKey::pem);
        owned.or_else(|| keys.iter().find_map(RemotePublicKey::pem))
    }
}

/// Outbox/collection root, possibly with items inlined.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionDocument {
    #[serde(default)]
    pub first: Option<FirstPage>,
    #[serde(rename = "orderedItems", default)]
    pub ordered_items: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub items: Option<Vec<serde_json::Value>>,
}

/// `first` may be a link or an embedded page.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FirstPage {
    Link(String),
    Page(Box<CollectionDocument>),
}

impl CollectionDocument {
    pub fn inline_items(&self) -> Option<&[serde_json::Value]> {
        self.ordered_items
            .as_deref()
            .or(self.items.as_deref())
    }
}

#[derive(Debug, Clone, Serialize)]
#[allow(non_snake_case)]
pub struct OrderedCollection {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub totalItems: u64,
    pub first: String,
}

#[derive(Debug, Clone, Serialize)]
#[allow(non_snake_case)]
pub struct OrderedCollectionPage<T> {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub partOf: String,
    pub orderedItems: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icon_accepts_object_list_and_string() {
        let doc: RemoteActorDocument = serde_json::from_str(
            r#"{"id":"https://a.example/u/x","icon":{"type":"Image","url":"https://a.example/i.png"}}"#,
        )
        .unwrap();
        assert_eq!(doc.icon_url(), Some("https://a.example/i.png"));

        let doc: RemoteActorDocument = serde_json::from_str(
            r#"{"icon":[{"type":"Image"},{"type":"Image","url":"https://a.example/second.png"}]}"#,
        )
        .unwrap();
        assert_eq!(doc.icon_url(), Some("https://a.example/second.png"));

        let doc: RemoteActorDocument =
            serde_json::from_str(r#"{"icon":"https://a.example/plain.png"}"#).unwrap();
        assert_eq!(doc.icon_url(), Some("https://a.example/plain.png"));

        let doc: RemoteActorDocument = serde_json::from_str(r#"{"name":"no icon"}"#).unwrap();
        assert_eq!(doc.icon_url(), None);
    }

    #[test]
    fn odd_fields_degrade_instead_of_failing() {
        let doc: RemoteActorDocument = serde_json::from_str(
            r#"{
                "id":"https://a.example/u/x",
                "inbox":"https://a.example/u/x/inbox",
                "name":{"en":"X"},
                "summary":null,
                "icon":42,
                "endpoints":"https://a.example/endpoints",
                "publicKey":[
                    {"id":"https://a.example/u/other#k","owner":"https://a.example/u/other","publicKeyPem":"OTHER"},
                    {"id":"https://a.example/u/x#main-key","owner":"https://a.example/u/x","publicKeyPem":"MINE"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(doc.id.as_deref(), Some("https://a.example/u/x"));
        assert_eq!(doc.inbox.as_deref(), Some("https://a.example/u/x/inbox"));
        assert_eq!(doc.name, None);
        assert_eq!(doc.summary, None);
        assert_eq!(doc.icon_url(), None);
        assert_eq!(doc.shared_inbox(), None);
        assert_eq!(doc.public_key_pem(), Some("MINE"));

        let single: RemoteActorDocument =
            serde_json::from_str(r#"{"publicKey":{"publicKeyPem":"ONLY"}}"#).unwrap();
        assert_eq!(single.public_key_pem(), Some("ONLY"));
    }

    #[test]
    fn jrd_picks_activity_self_link() {
        let jrd: Jrd = serde_json::from_str(
            r#"{"subject":"acct:a@b","links":[
                {"rel":"http://webfinger.net/rel/profile-page","type":"text/html","href":"https://b/@a"},
                {"rel":"self","type":"text/html","href":"https://b/html"},
                {"rel":"self","type":"application/activity+json","href":"https://b/users/a"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(jrd.activity_profile_href(), Some("https://b/users/a"));

        let ld: Jrd = serde_json::from_str(
            r#"{"links":[{"rel":"self","type":"application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"","href":"https://b/ld"}]}"#,
        )
        .unwrap();
        assert_eq!(ld.activity_profile_href(), Some("https://b/ld"));
    }

    #[test]
    fn collection_first_may_be_embedded() {
        let col: CollectionDocument = serde_json::from_str(
            r#"{"type":"OrderedCollection","first":{"type":"OrderedCollectionPage","orderedItems":[{"type":"Create"}]}}"#,
        )
        .unwrap();
        match col.first {
            Some(FirstPage::Page(page)) => assert_eq!(page.inline_items().map(|i| i.len()), Some(1)),
            other => panic!("unexpected first: {other:?}"),
        }
    }
}
