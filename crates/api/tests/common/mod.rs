#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use cuepoint_api::auth::jwt::{generate_access_token, JwtConfig, JwtIdentityVerifier};
use cuepoint_api::config::ServerConfig;
use cuepoint_api::routes;
use cuepoint_api::state::AppState;
use cuepoint_core::config::TimelineConfig;
use cuepoint_core::video::{InMemoryVideoDirectory, VideoDescriptor};
use cuepoint_db::InMemoryBackend;
use cuepoint_events::FeedbackService;

/// Test `JwtConfig` with a fixed secret.
pub fn test_jwt_config() -> JwtConfig {
    JwtConfig {
        secret: "test-secret-that-is-long-enough-for-hmac".to_string(),
        access_token_expiry_mins: 15,
    }
}

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config(timeline: TimelineConfig) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        database_url: None,
        jwt: test_jwt_config(),
        timeline,
    }
}

/// A router plus handles on the engine behind it.
pub struct TestApp {
    pub router: Router,
    pub service: Arc<FeedbackService>,
    pub videos: Arc<InMemoryVideoDirectory>,
}

/// Build the full application router with all middleware layers over an
/// in-memory backend.
///
/// This mirrors the router construction in `main.rs` so integration tests
/// exercise the same middleware stack that production uses.
pub fn build_test_app() -> TestApp {
    build_test_app_with(TimelineConfig::default())
}

pub fn build_test_app_with(timeline: TimelineConfig) -> TestApp {
    let config = test_config(timeline);
    let videos = Arc::new(InMemoryVideoDirectory::new());
    let service = Arc::new(FeedbackService::new(
        Arc::new(InMemoryBackend::new()),
        Arc::new(JwtIdentityVerifier::new(config.jwt.clone())),
        videos.clone(),
        config.timeline.clone(),
    ));

    let state = AppState {
        config: Arc::new(config),
        service: Arc::clone(&service),
        videos: Arc::clone(&videos),
    };

    let cors = CorsLayer::new()
        .allow_origin(["http://localhost:5173".parse().unwrap()])
        .allow_methods([Method::GET, Method::PUT])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600));

    let request_id_header = HeaderName::from_static("x-request-id");

    let router = Router::new()
        .merge(routes::health::router())
        .nest("/api/v1", routes::api_routes())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(cors)
        .with_state(state);

    TestApp {
        router,
        service,
        videos,
    }
}

/// Register a video with a known duration and frame rate.
pub fn register_video(app: &TestApp, video_id: &str) {
    app.videos
        .register(VideoDescriptor {
            video_id: video_id.to_string(),
            url: format!("https://cdn.example.com/{video_id}.mp4"),
            duration_ms: Some(120_000),
            frame_rate: Some(25.0),
        })
        .unwrap();
}

/// A valid identity token for `identity`.
pub fn token_for(identity: &str) -> String {
    generate_access_token(identity, Some(identity), &test_jwt_config()).unwrap()
}

/// Send a GET request with a bearer token.
pub async fn get_authed(app: Router, uri: &str, token: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Send a GET request without credentials.
pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Send a PUT request with a JSON body and a bearer token.
pub async fn put_json(
    app: Router,
    uri: &str,
    token: &str,
    body: serde_json::Value,
) -> Response {
    let request = Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Collect a response body as bytes.
pub async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
