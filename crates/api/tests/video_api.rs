mod common;

use axum::http::{header, StatusCode};
use serde_json::json;

use common::{
    body_bytes, body_json, build_test_app, get, get_authed, put_json, register_video, token_for,
    TestApp,
};
use cuepoint_core::identity::Identity;
use cuepoint_events::Connection;

async fn connect(app: &TestApp, video_id: &str, who: &str) -> Connection {
    app.service
        .connect_as(
            video_id,
            Identity {
                id: who.to_string(),
                display_name: Some(who.to_string()),
            },
            None,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn register_video_creates_then_replaces() {
    let app = build_test_app();
    let token = token_for("pipeline");
    let body = json!({ "url": "https://cdn.example.com/v1.mp4", "duration_ms": 60000 });

    let response = put_json(app.router.clone(), "/api/v1/videos/v1", &token, body.clone()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["data"]["video_id"], "v1");
    assert_eq!(json["data"]["duration_ms"], 60000);

    let response = put_json(app.router.clone(), "/api/v1/videos/v1", &token, body).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.videos.len(), 1);
}

#[tokio::test]
async fn register_video_rejects_bad_frame_rate() {
    let app = build_test_app();
    let body = json!({ "url": "https://cdn.example.com/v1.mp4", "frame_rate": -1.0 });

    let response = put_json(app.router, "/api/v1/videos/v1", &token_for("pipeline"), body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn routes_require_identity_token() {
    let app = build_test_app();
    register_video(&app, "v1");

    let response = get(app.router.clone(), "/api/v1/videos/v1/annotations").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["code"], "UNAUTHORIZED");

    let response = get_authed(app.router, "/api/v1/videos/v1/annotations", "garbage").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn list_annotations_pages_by_order_key() {
    let app = build_test_app();
    register_video(&app, "v1");
    let alice = connect(&app, "v1", "alice").await;
    for (i, body) in ["first", "second", "third"].iter().enumerate() {
        app.service
            .submit_annotation(alice.session.session_id, 1000 * i as i64, body, None)
            .await
            .unwrap();
    }
    let token = token_for("bob");

    let response = get_authed(app.router.clone(), "/api/v1/videos/v1/annotations", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let keys: Vec<i64> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["order_key"].as_i64().unwrap())
        .collect();
    assert_eq!(keys, vec![1, 2, 3]);

    let response = get_authed(
        app.router.clone(),
        "/api/v1/videos/v1/annotations?after=1&limit=1",
        &token,
    )
    .await;
    let json = body_json(response).await;
    let page = json["data"].as_array().unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["order_key"], 2);
    assert_eq!(page[0]["body"], "second");

    let response =
        get_authed(app.router, "/api/v1/videos/v1/annotations?after=-4", &token).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_video_is_404() {
    let app = build_test_app();
    let token = token_for("bob");

    for uri in [
        "/api/v1/videos/missing/annotations",
        "/api/v1/videos/missing/presence",
        "/api/v1/videos/missing/report",
    ] {
        let response = get_authed(app.router.clone(), uri, &token).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        let json = body_json(response).await;
        assert_eq!(json["code"], "NOT_FOUND");
    }
}

#[tokio::test]
async fn presence_lists_connected_sessions() {
    let app = build_test_app();
    register_video(&app, "v1");
    let alice = connect(&app, "v1", "alice").await;
    let _bob = connect(&app, "v1", "bob").await;

    let response =
        get_authed(app.router.clone(), "/api/v1/videos/v1/presence", &token_for("carol")).await;
    let json = body_json(response).await;
    let mut identities: Vec<&str> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["identity"].as_str().unwrap())
        .collect();
    identities.sort_unstable();
    assert_eq!(identities, vec!["alice", "bob"]);

    app.service.disconnect(alice.session.session_id).await.unwrap();
    let response =
        get_authed(app.router, "/api/v1/videos/v1/presence", &token_for("carol")).await;
    let json = body_json(response).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn report_renders_json_and_markdown() {
    let app = build_test_app();
    register_video(&app, "v1");
    let alice = connect(&app, "v1", "alice").await;
    let root = app
        .service
        .submit_annotation(alice.session.session_id, 5000, "Color shift here", None)
        .await
        .unwrap();
    app.service
        .submit_annotation(alice.session.session_id, 5200, "Fixed in v2", Some(root.id))
        .await
        .unwrap();
    let token = token_for("producer");

    let response = get_authed(app.router.clone(), "/api/v1/videos/v1/report", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let thread = &json["data"]["buckets"][0]["threads"][0];
    assert_eq!(thread["timecode"], "00:00:05:00");
    assert_eq!(thread["replies"][0]["body"], "Fixed in v2");
    assert_eq!(json["data"]["annotation_count"], 2);

    let response = get_authed(
        app.router.clone(),
        "/api/v1/videos/v1/report?format=markdown",
        &token,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/markdown"));
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("# Review report: v1"));
    assert!(text.contains("Color shift here"));

    let response =
        get_authed(app.router, "/api/v1/videos/v1/report?format=pdf", &token).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
