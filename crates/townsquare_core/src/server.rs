/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Public ActivityPub surface: discovery, actor documents, collections, inboxes.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tower_http::trace::TraceLayer;
use townsquare_protocol::{OrderedCollection, OrderedCollectionPage, AS_CONTEXT, SECURITY_CONTEXT};

use crate::activity::{self, actor_ref};
use crate::context::Federation;
use crate::db::Actor;
use crate::error::FederationError;
use crate::http_sig::{
    build_signing_string, parse_signature_header, verify_date, verify_digest_if_present,
    verify_signature_rsa_sha256,
};

const PAGE_SIZE: u32 = 20;

pub fn router(fed: Federation) -> Router {
    let max_body_bytes = fed.config.max_body_bytes();
    Router::new()
        .route("/healthz", get(healthz))
        .route("/.well-known/webfinger", get(webfinger))
        .route("/actors/:handle", get(actor_document))
        .route("/actors/:handle/inbox", post(actor_inbox))
        .route("/actors/:handle/outbox", get(outbox))
        .route("/actors/:handle/followers", get(followers))
        .route("/posts/:id", get(post_object))
        .route("/inbox", post(shared_inbox))
        .route("/api/verification/challenge", post(request_challenge))
        .route("/api/verification/verify", post(verify_challenge))
        .route("/api/verification/status", get(challenge_status))
        .with_state(fed)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

fn json_activity<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/activity+json; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}

fn jrd<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/jrd+json; charset=utf-8"),
    );
    resp
}

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.to_string()));
    *resp.status_mut() = status;
    resp
}

async fn healthz(State(fed): State<Federation>) -> Response<Body> {
    match fed.db.health_check() {
        Ok(()) => simple(StatusCode::OK, "ok"),
        Err(e) => FederationError::from(e).into_response(),
    }
}

async fn webfinger(State(fed): State<Federation>, Query(q): Query<HashMap<String, String>>) -> Response<Body> {
    let Some(resource) = q.get("resource").map(|r| r.trim()).filter(|r| !r.is_empty()) else {
        return simple(StatusCode::BAD_REQUEST, "missing resource");
    };

    let handle = if let Some(acct) = resource.strip_prefix("acct:") {
        match acct.split_once('@') {
            Some((user, domain)) if domain.eq_ignore_ascii_case(fed.registry.domain()) => user.to_string(),
            _ => return simple(StatusCode::NOT_FOUND, "not found"),
        }
    } else {
        match fed.registry.find_by_actor_url(resource) {
            Ok(Some(a)) if a.is_local() => a.handle,
            Ok(_) => return simple(StatusCode::NOT_FOUND, "not found"),
            Err(e) => return e.into_response(),
        }
    };

    let actor = match fed.registry.find_local(&handle) {
        Ok(Some(a)) => a,
        Ok(None) => return simple(StatusCode::NOT_FOUND, "not found"),
        Err(e) => return e.into_response(),
    };
    let body = json!({
        "subject": format!("acct:{}@{}", actor.handle, fed.registry.domain()),
        "aliases": [actor.actor_url],
        "links": [{
            "rel": "self",
            "type": "application/activity+json",
            "href": actor.actor_url,
        }],
    });
    jrd(StatusCode::OK, &body)
}

fn load_local(fed: &Federation, handle: &str) -> Result<Actor, Response<Body>> {
    match fed.registry.find_local(handle) {
        Ok(Some(a)) => Ok(a),
        Ok(None) => Err(FederationError::ActorNotFound(handle.to_string()).into_response()),
        Err(e) => Err(e.into_response()),
    }
}

async fn actor_document(State(fed): State<Federation>, Path(handle): Path<String>) -> Response<Body> {
    let actor = match load_local(&fed, &handle) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let key = match fed.registry.key_pair_for(&actor).await {
        Ok(k) => k,
        Err(e) => return e.into_response(),
    };

    let mut doc = json!({
        "@context": [AS_CONTEXT, SECURITY_CONTEXT],
        "id": actor.actor_url,
        "type": actor.kind.as_type(),
        "preferredUsername": actor.handle,
        "name": actor.display_name.clone().unwrap_or_else(|| actor.handle.clone()),
        "summary": actor.summary.clone().unwrap_or_default(),
        "inbox": actor.inbox_url,
        "outbox": actor.outbox_url,
        "followers": actor.followers_url,
        "following": actor.following_url,
        "endpoints": { "sharedInbox": actor.shared_inbox_url },
        "publicKey": {
            "id": key.key_id,
            "owner": actor.actor_url,
            "publicKeyPem": key.public_key_pem,
        },
        "published": activity::rfc3339_ms(actor.created_at_ms),
    });
    if let Some(icon) = actor.icon_url.as_deref().filter(|s| !s.trim().is_empty()) {
        doc["icon"] = json!({ "type": "Image", "url": icon });
    }
    json_activity(StatusCode::OK, &doc)
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<String>,
    cursor: Option<i64>,
}

impl PageQuery {
    fn wants_page(&self) -> bool {
        matches!(self.page.as_deref(), Some("true") | Some("1"))
    }
}

async fn outbox(
    State(fed): State<Federation>,
    Path(handle): Path<String>,
    Query(q): Query<PageQuery>,
) -> Response<Body> {
    let actor = match load_local(&fed, &handle) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let outbox_url = actor
        .outbox_url
        .clone()
        .unwrap_or_else(|| format!("{}/outbox", actor.actor_url));

    let page = match fed.db.list_posts(actor.id, PAGE_SIZE, q.cursor) {
        Ok(p) => p,
        Err(e) => return FederationError::from(e).into_response(),
    };
    if !q.wants_page() {
        return json_activity(
            StatusCode::OK,
            &OrderedCollection {
                context: AS_CONTEXT.to_string(),
                id: outbox_url.clone(),
                ty: "OrderedCollection".to_string(),
                totalItems: page.total,
                first: format!("{outbox_url}?page=true"),
            },
        );
    }

    let followers_url = actor
        .followers_url
        .clone()
        .unwrap_or_else(|| format!("{}/followers", actor.actor_url));
    let items: Vec<Value> = page
        .items
        .iter()
        .map(|post| {
            let note = fed.fanout.post_note(&actor, post);
            activity::create(&actor.actor_url, &followers_url, note)
        })
        .collect();
    let id = match q.cursor {
        Some(c) => format!("{outbox_url}?page=true&cursor={c}"),
        None => format!("{outbox_url}?page=true"),
    };
    json_activity(
        StatusCode::OK,
        &OrderedCollectionPage {
            context: AS_CONTEXT.to_string(),
            id,
            ty: "OrderedCollectionPage".to_string(),
            partOf: outbox_url.clone(),
            orderedItems: items,
            next: page.next.map(|c| format!("{outbox_url}?page=true&cursor={c}")),
        },
    )
}

async fn followers(
    State(fed): State<Federation>,
    Path(handle): Path<String>,
    Query(q): Query<PageQuery>,
) -> Response<Body> {
    let actor = match load_local(&fed, &handle) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let followers_url = actor
        .followers_url
        .clone()
        .unwrap_or_else(|| format!("{}/followers", actor.actor_url));
    let page = match fed.db.list_followers(actor.id, PAGE_SIZE, q.cursor) {
        Ok(p) => p,
        Err(e) => return FederationError::from(e).into_response(),
    };
    if !q.wants_page() {
        return json_activity(
            StatusCode::OK,
            &OrderedCollection {
                context: AS_CONTEXT.to_string(),
                id: followers_url.clone(),
                ty: "OrderedCollection".to_string(),
                totalItems: page.total,
                first: format!("{followers_url}?page=true"),
            },
        );
    }
    json_activity(
        StatusCode::OK,
        &OrderedCollectionPage {
            context: AS_CONTEXT.to_string(),
            id: format!("{followers_url}?page=true"),
            ty: "OrderedCollectionPage".to_string(),
            partOf: followers_url.clone(),
            orderedItems: page.items,
            next: page.next.map(|c| format!("{followers_url}?page=true&cursor={c}")),
        },
    )
}

async fn post_object(State(fed): State<Federation>, Path(id): Path<String>) -> Response<Body> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return simple(StatusCode::NOT_FOUND, "not found");
    }
    let post = match fed.db.get_post(&id) {
        Ok(Some(p)) => p,
        Ok(None) => return simple(StatusCode::NOT_FOUND, "not found"),
        Err(e) => return FederationError::from(e).into_response(),
    };
    let author = match fed.db.get_actor(post.actor_id) {
        Ok(Some(a)) => a,
        Ok(None) => return simple(StatusCode::NOT_FOUND, "not found"),
        Err(e) => return FederationError::from(e).into_response(),
    };
    let mut note = fed.fanout.post_note(&author, &post);
    note["@context"] = Value::String(AS_CONTEXT.to_string());
    json_activity(StatusCode::OK, &note)
}

async fn actor_inbox(
    State(fed): State<Federation>,
    Path(handle): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    let activity = match authenticate_inbound(&fed, &method, &uri, &headers, &body).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match fed.inbox.handle_activity(&handle, &activity).await {
        Ok(_) => simple(StatusCode::ACCEPTED, ""),
        Err(e) => e.into_response(),
    }
}

async fn shared_inbox(
    State(fed): State<Federation>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    let activity = match authenticate_inbound(&fed, &method, &uri, &headers, &body).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match fed.inbox.handle_shared(&activity).await {
        Ok(_) => simple(StatusCode::ACCEPTED, ""),
        Err(e) => e.into_response(),
    }
}

/// Parses the body and, when signatures are required, checks digest, date and signature and
/// that the signing key belongs to the activity's actor.
async fn authenticate_inbound(
    fed: &Federation,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Value, Response<Body>> {
    let activity: Value = serde_json::from_slice(body)
        .map_err(|e| simple(StatusCode::BAD_REQUEST, &format!("invalid json: {e}")))?;
    if !fed.config.require_signatures() {
        return Ok(activity);
    }

    if let Err(e) = verify_digest_if_present(headers, body) {
        return Err(simple(StatusCode::UNAUTHORIZED, &format!("digest invalid: {e}")));
    }
    if let Err(e) = verify_date(headers, fed.config.max_date_skew()) {
        return Err(simple(StatusCode::UNAUTHORIZED, &format!("date invalid: {e}")));
    }
    let Some(sig_header) = headers.get("Signature").and_then(|v| v.to_str().ok()) else {
        return Err(simple(StatusCode::UNAUTHORIZED, "missing Signature"));
    };
    let sig = parse_signature_header(sig_header)
        .map_err(|e| simple(StatusCode::UNAUTHORIZED, &format!("bad Signature: {e}")))?;
    if !body.is_empty() && !sig.headers.iter().any(|h| h == "digest") {
        return Err(simple(StatusCode::UNAUTHORIZED, "digest must be signed"));
    }
    let signing_string = build_signing_string(method, uri, headers, &sig.headers)
        .map_err(|e| simple(StatusCode::UNAUTHORIZED, &format!("bad signed headers: {e}")))?;

    let key_owner = sig.key_id.split('#').next().unwrap_or_default();
    let signer = fed
        .resolver
        .resolve_actor_url(key_owner)
        .await
        .map_err(|e| simple(StatusCode::UNAUTHORIZED, &format!("key resolve failed: {e}")))?;
    let Some(public_key_pem) = signer.public_key_pem.as_deref() else {
        return Err(simple(StatusCode::UNAUTHORIZED, "signer publishes no public key"));
    };
    if let Err(e) = verify_signature_rsa_sha256(public_key_pem, &signing_string, &sig.signature) {
        return Err(simple(StatusCode::UNAUTHORIZED, &format!("signature invalid: {e}")));
    }

    if activity.get("actor").and_then(actor_ref) != Some(signer.actor_url.as_str()) {
        return Err(simple(StatusCode::UNAUTHORIZED, "signer is not the activity actor"));
    }
    Ok(activity)
}

#[derive(Debug, Deserialize)]
struct HandleBody {
    handle: String,
}

async fn request_challenge(State(fed): State<Federation>, Json(req): Json<HandleBody>) -> Response<Body> {
    match fed.verifier.request_challenge(&req.handle).await {
        Ok(ticket) => (StatusCode::CREATED, Json(ticket)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn verify_challenge(State(fed): State<Federation>, Json(req): Json<HandleBody>) -> Response<Body> {
    match fed.verifier.verify(&req.handle).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn challenge_status(State(fed): State<Federation>, Query(req): Query<HandleBody>) -> Response<Body> {
    match fed.verifier.challenge_status(&req.handle) {
        Ok(Some(state)) => Json(state).into_response(),
        Ok(None) => FederationError::ChallengeNotFound { handle: req.handle }.into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ActorKind;
    use crate::fanout::{DistributeOptions, PostContent};
    use crate::http_sig::{sign_request_rsa_sha256, POST_SIGNED_HEADERS};
    use crate::keys::generate_rsa_keys;
    use crate::registry::ProfileFields;
    use crate::testing::TestEnv;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn call(env: &TestEnv, req: Request<Body>) -> (StatusCode, Value) {
        let resp = env.fed.router().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn ana(env: &TestEnv) -> Actor {
        env.fed
            .get_or_create_local_actor("ana", ActorKind::Individual, &ProfileFields::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn webfinger_and_actor_document() {
        let env = TestEnv::new();
        ana(&env).await;

        let resp = env.fed.router().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let (status, jrd) = call(&env, get("/.well-known/webfinger?resource=acct%3Aana%40town.example")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(jrd["subject"], "acct:ana@town.example");
        assert_eq!(jrd["links"][0]["href"], "https://town.example/actors/ana");

        let (status, _) = call(&env, get("/.well-known/webfinger?resource=acct%3Aana%40elsewhere.example")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, doc) = call(&env, get("/actors/ana")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(doc["type"], "Person");
        assert_eq!(doc["endpoints"]["sharedInbox"], "https://town.example/inbox");
        assert_eq!(doc["publicKey"]["id"], "https://town.example/actors/ana#main-key");
        assert!(doc["publicKey"]["publicKeyPem"]
            .as_str()
            .unwrap()
            .starts_with("-----BEGIN PUBLIC KEY-----"));

        let (status, err) = call(&env, get("/actors/nobody")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"], "actor_not_found");
    }

    fn follow_body(actor: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": format!("{actor}#follow-1"),
            "type": "Follow",
            "actor": actor,
            "object": "https://town.example/actors/ana",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unsigned_inbox_post_is_rejected() {
        let env = TestEnv::new();
        ana(&env).await;
        let bob = env.transport.add_remote_actor("bob", "remote.example");
        let req = Request::builder()
            .method("POST")
            .uri("/actors/ana/inbox")
            .header("Content-Type", "application/activity+json")
            .body(Body::from(follow_body(&bob)))
            .unwrap();
        let (status, _) = call(&env, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(env.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn signed_follow_is_accepted() {
        let env = TestEnv::new();
        ana(&env).await;
        let bob = env.transport.add_remote_actor("bob", "remote.example");
        let bob_keys = generate_rsa_keys(1024).unwrap();
        env.transport.set_public_key(&bob, &bob_keys.public_key_pem);

        let body = follow_body(&bob);
        let target: Uri = "https://town.example/actors/ana/inbox".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/activity+json"));
        sign_request_rsa_sha256(
            &bob_keys.private_key_pem,
            &format!("{bob}#main-key"),
            &Method::POST,
            &target,
            &mut headers,
            &body,
            POST_SIGNED_HEADERS,
        )
        .unwrap();

        let mut req = Request::builder()
            .method("POST")
            .uri("/actors/ana/inbox")
            .body(Body::from(body.clone()))
            .unwrap();
        *req.headers_mut() = headers.clone();
        let (status, _) = call(&env, req).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let sent = env.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].activity["type"], "Accept");

        // Same signature replayed against another path does not verify.
        let mut req = Request::builder()
            .method("POST")
            .uri("/inbox")
            .body(Body::from(body))
            .unwrap();
        *req.headers_mut() = headers;
        let (status, _) = call(&env, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn outbox_pages_and_permalinks() {
        let mut cfg = crate::testing::test_config();
        cfg.require_signatures = Some(false);
        let env = TestEnv::with_config(cfg);
        ana(&env).await;
        for title in ["one", "two"] {
            env.fed
                .distribute_post(
                    "ana",
                    &PostContent {
                        title: title.into(),
                        ..Default::default()
                    },
                    DistributeOptions::default(),
                )
                .await
                .unwrap();
        }

        let (status, root) = call(&env, get("/actors/ana/outbox")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(root["totalItems"], 2);
        assert_eq!(root["first"], "https://town.example/actors/ana/outbox?page=true");

        let (_, page) = call(&env, get("/actors/ana/outbox?page=true")).await;
        let items = page["orderedItems"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["type"], "Create");
        let note_id = items[0]["object"]["id"].as_str().unwrap().to_string();
        assert_eq!(items[0]["id"], format!("{note_id}/activity").as_str());

        let post_path = note_id.strip_prefix("https://town.example").unwrap().to_string();
        let (status, note) = call(&env, get(&post_path)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(note["attributedTo"], "https://town.example/actors/ana");

        let (status, _) = call(&env, get("/posts/not-a-post")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn permalink_keeps_the_delivered_image() {
        let env = TestEnv::new();
        ana(&env).await;
        let report = env
            .fed
            .distribute_post(
                "ana",
                &PostContent {
                    title: "gig".into(),
                    image_url: Some("https://cdn.town.example/poster.jpg".into()),
                    ..Default::default()
                },
                DistributeOptions::default(),
            )
            .await
            .unwrap();

        let post_path = format!("/posts/{}", report.post.id);
        let (status, note) = call(&env, get(&post_path)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(note["attachment"][0]["url"], "https://cdn.town.example/poster.jpg");

        let (_, page) = call(&env, get("/actors/ana/outbox?page=true")).await;
        assert_eq!(
            page["orderedItems"][0]["object"]["attachment"][0]["url"],
            "https://cdn.town.example/poster.jpg"
        );
    }

    #[tokio::test]
    async fn verification_endpoints() {
        let env = TestEnv::new();
        env.transport.add_remote_actor("bob", "remote.example");
        let req = Request::builder()
            .method("POST")
            .uri("/api/verification/challenge")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"handle":"bob@remote.example"}"#))
            .unwrap();
        let (status, ticket) = call(&env, req).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(ticket["code"].as_str().unwrap().len(), 6);

        let (status, state) = call(&env, get("/api/verification/status?handle=bob%40remote.example")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state["status"], "pending");
        assert!(state.get("code").is_none());

        let req = Request::builder()
            .method("POST")
            .uri("/api/verification/challenge")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"handle":"ghost@nowhere.example"}"#))
            .unwrap();
        let (status, err) = call(&env, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"], "resolution_failed");
    }
}
