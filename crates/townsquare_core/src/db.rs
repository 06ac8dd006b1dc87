/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, OptionalExtension};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// SQLite store for the federation core. Every call opens its own short-lived connection.
#[derive(Clone)]
pub struct FederationDb {
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorKind {
    Individual,
    RemoteCache,
    Group,
    Aggregator,
}

impl ActorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorKind::Individual => "individual",
            ActorKind::RemoteCache => "remote",
            ActorKind::Group => "group",
            ActorKind::Aggregator => "aggregator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "individual" => Some(ActorKind::Individual),
            "remote" => Some(ActorKind::RemoteCache),
            "group" => Some(ActorKind::Group),
            "aggregator" => Some(ActorKind::Aggregator),
            _ => None,
        }
    }

    pub fn is_local(self) -> bool {
        !matches!(self, ActorKind::RemoteCache)
    }

    /// ActivityStreams actor type published for this kind.
    pub fn as_type(self) -> &'static str {
        match self {
            ActorKind::Individual | ActorKind::RemoteCache => "Person",
            ActorKind::Group => "Group",
            ActorKind::Aggregator => "Service",
        }
    }
}

/// Actor row without private key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: i64,
    pub handle: String,
    pub kind: ActorKind,
    pub actor_url: String,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub outbox_url: Option<String>,
    pub followers_url: Option<String>,
    pub following_url: Option<String>,
    pub public_key_pem: Option<String>,
    pub domain: String,
    pub user_id: Option<i64>,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub icon_url: Option<String>,
    pub remote_profile_json: Option<String>,
    pub fetched_at_ms: Option<i64>,
    pub created_at_ms: i64,
}

impl Actor {
    pub fn is_local(&self) -> bool {
        self.kind.is_local()
    }

    /// Shared inbox when the actor advertises one, personal inbox otherwise.
    pub fn delivery_endpoint(&self) -> &str {
        self.shared_inbox_url.as_deref().unwrap_or(&self.inbox_url)
    }
}

pub struct NewLocalActor<'a> {
    pub handle: &'a str,
    pub kind: ActorKind,
    pub actor_url: &'a str,
    pub inbox_url: &'a str,
    pub shared_inbox_url: &'a str,
    pub outbox_url: &'a str,
    pub followers_url: &'a str,
    pub following_url: &'a str,
    pub public_key_pem: &'a str,
    pub private_key_pem: &'a str,
    pub domain: &'a str,
    pub display_name: Option<&'a str>,
    pub summary: Option<&'a str>,
    pub icon_url: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct RemoteActorRecord {
    pub handle: String,
    pub actor_url: String,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub outbox_url: Option<String>,
    pub followers_url: Option<String>,
    pub following_url: Option<String>,
    pub public_key_pem: Option<String>,
    pub domain: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub icon_url: Option<String>,
    pub profile_json: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Verified,
    Expired,
}

impl ChallengeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Verified => "verified",
            ChallengeStatus::Expired => "expired",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ChallengeStatus::Pending),
            "verified" => Ok(ChallengeStatus::Verified),
            "expired" => Ok(ChallengeStatus::Expired),
            other => Err(anyhow!("unknown challenge status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRow {
    pub id: i64,
    pub handle: String,
    pub code: String,
    pub status: ChallengeStatus,
    pub expires_at_ms: i64,
    pub created_at_ms: i64,
    pub closed_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRole {
    Host,
    Moderator,
}

impl GroupRole {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupRole::Host => "host",
            GroupRole::Moderator => "moderator",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(GroupRole::Host),
            "moderator" => Ok(GroupRole::Moderator),
            other => Err(anyhow!("unknown group role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRow {
    pub id: String,
    pub actor_id: i64,
    pub content: String,
    pub topic: Option<String>,
    pub image_url: Option<String>,
    pub published_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct CollectionPage<T> {
    pub total: u64,
    pub items: Vec<T>,
    pub next: Option<String>,
}

const ACTOR_COLUMNS: &str = "id, handle, kind, actor_url, inbox_url, shared_inbox_url, outbox_url, \
     followers_url, following_url, public_key_pem, domain, user_id, display_name, summary, \
     icon_url, remote_profile_json, fetched_at_ms, created_at_ms";

impl FederationDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS users (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT NOT NULL UNIQUE,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS actors (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              handle TEXT NOT NULL,
              kind TEXT NOT NULL,
              is_local INTEGER NOT NULL,
              actor_url TEXT NOT NULL,
              inbox_url TEXT NOT NULL,
              shared_inbox_url TEXT NULL,
              outbox_url TEXT NULL,
              followers_url TEXT NULL,
              following_url TEXT NULL,
              public_key_pem TEXT NULL,
              private_key_pem TEXT NULL,
              domain TEXT NOT NULL,
              user_id INTEGER NULL REFERENCES users(id),
              display_name TEXT NULL,
              summary TEXT NULL,
              icon_url TEXT NULL,
              remote_profile_json TEXT NULL,
              fetched_at_ms INTEGER NULL,
              created_at_ms INTEGER NOT NULL,
              UNIQUE(handle, is_local),
              CHECK(is_local = 1 OR private_key_pem IS NULL),
              CHECK((kind = 'remote') = (is_local = 0))
            );
            CREATE INDEX IF NOT EXISTS idx_actors_url ON actors(actor_url);

            CREATE TABLE IF NOT EXISTS ownership_challenges (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              handle TEXT NOT NULL,
              code TEXT NOT NULL,
              status TEXT NOT NULL,
              expires_at_ms INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              closed_at_ms INTEGER NULL
            );
            CREATE INDEX IF NOT EXISTS idx_challenges_handle
              ON ownership_challenges(handle, created_at_ms DESC, id DESC);

            CREATE TABLE IF NOT EXISTS delivered_posts (
              id TEXT PRIMARY KEY,
              actor_id INTEGER NOT NULL REFERENCES actors(id),
              content TEXT NOT NULL,
              topic TEXT NULL,
              image_url TEXT NULL,
              published_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_posts_actor ON delivered_posts(actor_id, published_at_ms DESC);

            CREATE TABLE IF NOT EXISTS group_memberships (
              group_actor_id INTEGER NOT NULL REFERENCES actors(id),
              member_actor_id INTEGER NOT NULL REFERENCES actors(id),
              role TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(group_actor_id, member_actor_id)
            );

            CREATE TABLE IF NOT EXISTS followers (
              actor_id INTEGER NOT NULL REFERENCES actors(id),
              follower_actor_id INTEGER NOT NULL REFERENCES actors(id),
              follow_activity_id TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(actor_id, follower_actor_id)
            );
            CREATE INDEX IF NOT EXISTS idx_followers_created ON followers(actor_id, created_at_ms DESC);
            "#,
        )
        .context("init schema")?;
        ensure_columns(&conn, "delivered_posts", &[("image_url", "TEXT NULL")])
            .context("migrate delivered_posts")?;
        Ok(Self { path })
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ---- actors ----

    pub fn find_local_actor(&self, handle: &str) -> Result<Option<Actor>> {
        self.find_actor_where("handle=?1 AND is_local=1", params![handle])
    }

    pub fn find_remote_actor(&self, handle: &str) -> Result<Option<Actor>> {
        self.find_actor_where("handle=?1 AND is_local=0", params![handle])
    }

    pub fn get_actor(&self, id: i64) -> Result<Option<Actor>> {
        self.find_actor_where("id=?1", params![id])
    }

    /// Local rows win when a URL is known both ways.
    pub fn find_actor_by_url(&self, actor_url: &str) -> Result<Option<Actor>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {ACTOR_COLUMNS} FROM actors WHERE actor_url=?1 ORDER BY is_local DESC, id ASC LIMIT 1"
            ),
            params![actor_url],
            map_actor,
        )
        .optional()
        .context("find actor by url")
    }

    fn find_actor_where(&self, clause: &str, args: impl rusqlite::Params) -> Result<Option<Actor>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ACTOR_COLUMNS} FROM actors WHERE {clause}"),
            args,
            map_actor,
        )
        .optional()
        .context("find actor")
    }

    /// Returns `false` when a local actor with this handle already existed.
    pub fn insert_local_actor(&self, a: &NewLocalActor<'_>) -> Result<bool> {
        if !a.kind.is_local() {
            return Err(anyhow!("insert_local_actor called with kind {}", a.kind.as_str()));
        }
        let conn = self.conn()?;
        let n = conn
            .execute(
                r#"
                INSERT INTO actors(
                  handle, kind, is_local, actor_url, inbox_url, shared_inbox_url, outbox_url,
                  followers_url, following_url, public_key_pem, private_key_pem, domain,
                  display_name, summary, icon_url, created_at_ms
                )
                VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                ON CONFLICT(handle, is_local) DO NOTHING
                "#,
                params![
                    a.handle,
                    a.kind.as_str(),
                    a.actor_url,
                    a.inbox_url,
                    a.shared_inbox_url,
                    a.outbox_url,
                    a.followers_url,
                    a.following_url,
                    a.public_key_pem,
                    a.private_key_pem,
                    a.domain,
                    a.display_name,
                    a.summary,
                    a.icon_url,
                    now_ms(),
                ],
            )
            .context("insert local actor")?;
        Ok(n > 0)
    }

    /// Returns `(public_pem, private_pem)` for a local actor that has keys.
    pub fn local_actor_keys(&self, actor_id: i64) -> Result<Option<(String, String)>> {
        let conn = self.conn()?;
        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT public_key_pem, private_key_pem FROM actors WHERE id=?1 AND is_local=1",
                params![actor_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((Some(public), Some(private))) => Some((public, private)),
            _ => None,
        })
    }

    /// Stores keys only if the actor has none yet. Returns whether this call wrote them.
    pub fn set_actor_keys_if_missing(&self, actor_id: i64, public_pem: &str, private_pem: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE actors SET public_key_pem=?2, private_key_pem=?3 WHERE id=?1 AND is_local=1 AND private_key_pem IS NULL",
            params![actor_id, public_pem, private_pem],
        )?;
        Ok(n > 0)
    }

    pub fn upsert_remote_actor(&self, r: &RemoteActorRecord) -> Result<Actor> {
        let conn = self.conn()?;
        let now = now_ms();
        conn.execute(
            r#"
            INSERT INTO actors(
              handle, kind, is_local, actor_url, inbox_url, shared_inbox_url, outbox_url,
              followers_url, following_url, public_key_pem, private_key_pem, domain,
              display_name, summary, icon_url, remote_profile_json, fetched_at_ms, created_at_ms
            )
            VALUES (?1, 'remote', 0, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
            ON CONFLICT(handle, is_local) DO UPDATE SET
              actor_url=excluded.actor_url,
              inbox_url=excluded.inbox_url,
              shared_inbox_url=excluded.shared_inbox_url,
              outbox_url=excluded.outbox_url,
              followers_url=excluded.followers_url,
              following_url=excluded.following_url,
              public_key_pem=excluded.public_key_pem,
              domain=excluded.domain,
              display_name=excluded.display_name,
              summary=excluded.summary,
              icon_url=excluded.icon_url,
              remote_profile_json=excluded.remote_profile_json,
              fetched_at_ms=excluded.fetched_at_ms
            "#,
            params![
                r.handle,
                r.actor_url,
                r.inbox_url,
                r.shared_inbox_url,
                r.outbox_url,
                r.followers_url,
                r.following_url,
                r.public_key_pem,
                r.domain,
                r.display_name,
                r.summary,
                r.icon_url,
                r.profile_json,
                now,
            ],
        )
        .context("upsert remote actor")?;
        drop(conn);
        self.find_remote_actor(&r.handle)?
            .ok_or_else(|| anyhow!("remote actor vanished after upsert: {}", r.handle))
    }

    /// Links an actor to a user unless it is already linked. Returns whether the link was written.
    pub fn link_actor_user(&self, actor_id: i64, user_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE actors SET user_id=?2 WHERE id=?1 AND user_id IS NULL",
            params![actor_id, user_id],
        )?;
        Ok(n > 0)
    }

    // ---- users ----

    pub fn find_user(&self, username: &str) -> Result<Option<UserRow>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, username, created_at_ms FROM users WHERE username=?1",
            params![username],
            |r| {
                Ok(UserRow {
                    id: r.get(0)?,
                    username: r.get(1)?,
                    created_at_ms: r.get(2)?,
                })
            },
        )
        .optional()
        .context("find user")
    }

    pub fn find_or_create_user(&self, username: &str) -> Result<UserRow> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users(username, created_at_ms) VALUES (?1, ?2) ON CONFLICT(username) DO NOTHING",
            params![username, now_ms()],
        )
        .context("insert user")?;
        drop(conn);
        self.find_user(username)?
            .ok_or_else(|| anyhow!("user vanished after insert: {username}"))
    }

    // ---- ownership challenges ----

    pub fn insert_challenge(&self, handle: &str, code: &str, created_at_ms: i64, expires_at_ms: i64) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ownership_challenges(handle, code, status, expires_at_ms, created_at_ms) VALUES (?1, ?2, 'pending', ?3, ?4)",
            params![handle, code, expires_at_ms, created_at_ms],
        )
        .context("insert challenge")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn latest_challenge(&self, handle: &str) -> Result<Option<ChallengeRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, handle, code, status, expires_at_ms, created_at_ms, closed_at_ms
                FROM ownership_challenges
                WHERE handle=?1
                ORDER BY created_at_ms DESC, id DESC
                LIMIT 1
                "#,
                params![handle],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, i64>(4)?,
                        r.get::<_, i64>(5)?,
                        r.get::<_, Option<i64>>(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, handle, code, status, expires_at_ms, created_at_ms, closed_at_ms)) = row else {
            return Ok(None);
        };
        Ok(Some(ChallengeRow {
            id,
            handle,
            code,
            status: ChallengeStatus::parse(&status)?,
            expires_at_ms,
            created_at_ms,
            closed_at_ms,
        }))
    }

    /// Compare-and-set on the challenge status. Only one caller can win a given transition.
    pub fn transition_challenge(&self, id: i64, from: ChallengeStatus, to: ChallengeStatus) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE ownership_challenges SET status=?3, closed_at_ms=?4 WHERE id=?1 AND status=?2",
            params![id, from.as_str(), to.as_str(), now_ms()],
        )?;
        Ok(n > 0)
    }

    // ---- group memberships ----

    /// Existing memberships are left untouched, so a host is never downgraded.
    pub fn insert_membership(&self, group_actor_id: i64, member_actor_id: i64, role: GroupRole) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO group_memberships(group_actor_id, member_actor_id, role, created_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(group_actor_id, member_actor_id) DO NOTHING
            "#,
            params![group_actor_id, member_actor_id, role.as_str(), now_ms()],
        )?;
        Ok(())
    }

    pub fn membership_role(&self, group_actor_id: i64, member_actor_id: i64) -> Result<Option<GroupRole>> {
        let conn = self.conn()?;
        let role: Option<String> = conn
            .query_row(
                "SELECT role FROM group_memberships WHERE group_actor_id=?1 AND member_actor_id=?2",
                params![group_actor_id, member_actor_id],
                |r| r.get(0),
            )
            .optional()?;
        role.as_deref().map(GroupRole::parse).transpose()
    }

    // ---- followers ----

    pub fn add_follower(&self, actor_id: i64, follower_actor_id: i64, follow_activity_id: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO followers(actor_id, follower_actor_id, follow_activity_id, created_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(actor_id, follower_actor_id) DO UPDATE SET follow_activity_id=excluded.follow_activity_id
            "#,
            params![actor_id, follower_actor_id, follow_activity_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn remove_follower(&self, actor_id: i64, follower_actor_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM followers WHERE actor_id=?1 AND follower_actor_id=?2",
            params![actor_id, follower_actor_id],
        )?;
        Ok(n > 0)
    }

    pub fn count_followers(&self, actor_id: i64) -> Result<u64> {
        let conn = self.conn()?;
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM followers WHERE actor_id=?1",
            params![actor_id],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    /// All follower actors, for delivery expansion.
    pub fn list_follower_actors(&self, actor_id: i64) -> Result<Vec<Actor>> {
        let conn = self.conn()?;
        let cols = ACTOR_COLUMNS
            .split(", ")
            .map(|c| format!("a.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols} FROM followers f JOIN actors a ON a.id = f.follower_actor_id WHERE f.actor_id=?1 ORDER BY f.created_at_ms ASC"
        ))?;
        let rows = stmt
            .query_map(params![actor_id], map_actor)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Follower actor URLs, newest first, for the public followers collection.
    pub fn list_followers(&self, actor_id: i64, limit: u32, cursor: Option<i64>) -> Result<CollectionPage<String>> {
        let conn = self.conn()?;
        let total = self.count_followers(actor_id)?;
        let limit = limit.clamp(1, 200);
        let mut stmt = conn.prepare(
            r#"
            SELECT a.actor_url, f.created_at_ms
            FROM followers f JOIN actors a ON a.id = f.follower_actor_id
            WHERE f.actor_id=?1 AND (?2 IS NULL OR f.created_at_ms < ?2)
            ORDER BY f.created_at_ms DESC
            LIMIT ?3
            "#,
        )?;
        let mut rows = stmt.query(params![actor_id, cursor, limit as i64])?;
        let mut items = Vec::new();
        let mut last_created: Option<i64> = None;
        while let Some(row) = rows.next()? {
            let url: String = row.get(0)?;
            last_created = Some(row.get(1)?);
            items.push(url);
        }
        let next = if items.len() as u32 == limit {
            last_created.map(|v| v.to_string())
        } else {
            None
        };
        Ok(CollectionPage { total, items, next })
    }

    // ---- delivered posts ----

    pub fn insert_post(
        &self,
        actor_id: i64,
        content: &str,
        topic: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<PostRow> {
        let post = PostRow {
            id: random_hex_id(),
            actor_id,
            content: content.to_string(),
            topic: topic.map(str::to_string),
            image_url: image_url.map(str::to_string),
            published_at_ms: now_ms(),
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO delivered_posts(id, actor_id, content, topic, image_url, published_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![post.id, post.actor_id, post.content, post.topic, post.image_url, post.published_at_ms],
        )
        .context("insert delivered post")?;
        Ok(post)
    }

    pub fn get_post(&self, id: &str) -> Result<Option<PostRow>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, actor_id, content, topic, image_url, published_at_ms FROM delivered_posts WHERE id=?1",
            params![id],
            map_post,
        )
        .optional()
        .context("get post")
    }

    pub fn count_posts(&self, actor_id: i64) -> Result<u64> {
        let conn = self.conn()?;
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM delivered_posts WHERE actor_id=?1",
            params![actor_id],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    /// Posts by an actor, newest first; `cursor` is the `published_at_ms` of the last item seen.
    pub fn list_posts(&self, actor_id: i64, limit: u32, cursor: Option<i64>) -> Result<CollectionPage<PostRow>> {
        let total = self.count_posts(actor_id)?;
        let conn = self.conn()?;
        let limit = limit.clamp(1, 200);
        let mut stmt = conn.prepare(
            r#"
            SELECT id, actor_id, content, topic, image_url, published_at_ms
            FROM delivered_posts
            WHERE actor_id=?1 AND (?2 IS NULL OR published_at_ms < ?2)
            ORDER BY published_at_ms DESC, id DESC
            LIMIT ?3
            "#,
        )?;
        let items = stmt
            .query_map(params![actor_id, cursor, limit as i64], map_post)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let next = if items.len() as u32 == limit {
            items.last().map(|p| p.published_at_ms.to_string())
        } else {
            None
        };
        Ok(CollectionPage { total, items, next })
    }
}

fn map_actor(r: &rusqlite::Row<'_>) -> rusqlite::Result<Actor> {
    let kind: String = r.get(2)?;
    let kind = ActorKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, format!("bad actor kind: {kind}").into())
    })?;
    Ok(Actor {
        id: r.get(0)?,
        handle: r.get(1)?,
        kind,
        actor_url: r.get(3)?,
        inbox_url: r.get(4)?,
        shared_inbox_url: r.get(5)?,
        outbox_url: r.get(6)?,
        followers_url: r.get(7)?,
        following_url: r.get(8)?,
        public_key_pem: r.get(9)?,
        domain: r.get(10)?,
        user_id: r.get(11)?,
        display_name: r.get(12)?,
        summary: r.get(13)?,
        icon_url: r.get(14)?,
        remote_profile_json: r.get(15)?,
        fetched_at_ms: r.get(16)?,
        created_at_ms: r.get(17)?,
    })
}

fn map_post(r: &rusqlite::Row<'_>) -> rusqlite::Result<PostRow> {
    Ok(PostRow {
        id: r.get(0)?,
        actor_id: r.get(1)?,
        content: r.get(2)?,
        topic: r.get(3)?,
        image_url: r.get(4)?,
        published_at_ms: r.get(5)?,
    })
}

fn ensure_columns(conn: &Connection, table: &str, cols: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<std::collections::HashSet<_>>>()?;
    for (name, ty) in cols {
        if !existing.contains(*name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {ty}"), [])?;
        }
    }
    Ok(())
}

pub(crate) fn random_hex_id() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
