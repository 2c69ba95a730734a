use std::time::Duration;

use axum::http::StatusCode;
use futures::future::join_all;

use tempo_core::config::GatewayConfig;
use tempo_core::error::AppError;
use tempo_core::queue::QueueConfig;
use tempo_core::testutil::{StubBackend, subject_id};

use crate::integration::common::{ARTIST_ID, TRACK_ID, get_json, setup_test_app, setup_test_app_with};

#[tokio::test]
async fn monthly_listeners_returns_digits() {
    let app = setup_test_app(StubBackend::with_page_text("1,234,567 monthly listeners"));

    let (status, json) = get_json(
        &app.router,
        &format!("/scrape/monthly-listeners/{ARTIST_ID}"),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["artistId"], ARTIST_ID);
    assert_eq!(json["monthlyListeners"], "1234567");
    assert!(json["responseTimeMs"].is_u64());
    assert!(json["timestamp"].is_string());

    app.gateway.shutdown().await;
}

#[tokio::test]
async fn missing_playcount_returns_not_available() {
    let app = setup_test_app(StubBackend::new());

    let (status, json) = get_json(&app.router, &format!("/scrape/playcount/{TRACK_ID}")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["trackId"], TRACK_ID);
    assert_eq!(json["playCount"], "N/A");

    app.gateway.shutdown().await;
}

#[tokio::test]
async fn repeated_requests_hit_the_cache() {
    let app = setup_test_app(StubBackend::with_page_text("3,210"));
    let uri = format!("/scrape/playcount/{TRACK_ID}");

    for _ in 0..3 {
        let (status, json) = get_json(&app.router, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["playCount"], "3,210");
    }
    assert_eq!(app.backend.navigations().len(), 1);

    app.gateway.shutdown().await;
}

#[tokio::test]
async fn malformed_id_returns_400() {
    let app = setup_test_app(StubBackend::with_page_text("1"));

    for uri in [
        "/scrape/monthly-listeners/short",
        "/scrape/playcount/..%2F..%2F..%2Fetc%2Fpasswd",
        "/scrape/playcount/1301WleyT98MSxVHPZCA6M%0A",
    ] {
        let (status, json) = get_json(&app.router, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(json["error"], "invalid_identifier");
    }
    assert_eq!(app.backend.contexts_opened(), 0);

    app.gateway.shutdown().await;
}

#[tokio::test]
async fn scrape_failure_returns_500() {
    let backend = StubBackend::with_page_text("1");
    backend.set_navigation_error(Some(AppError::NavigationFailure(
        "net::ERR_CONNECTION_RESET\nat line 2".into(),
    )));
    let app = setup_test_app(backend);

    let (status, json) = get_json(&app.router, &format!("/scrape/playcount/{TRACK_ID}")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "Failed to scrape play count");
    let message = json["message"].as_str().unwrap();
    assert!(message.contains("ERR_CONNECTION_RESET"));
    assert!(!message.contains('\n'));

    app.gateway.shutdown().await;
}

#[tokio::test]
async fn full_queue_returns_503() {
    let backend = StubBackend::with_page_text("7").with_navigation_latency(Duration::from_millis(300));
    let config = GatewayConfig {
        queue: QueueConfig {
            max_concurrent: 1,
            capacity: 1,
        },
        ..Default::default()
    };
    let app = setup_test_app_with(backend, config);

    let uris: Vec<String> = (0..3)
        .map(|n| format!("/scrape/monthly-listeners/{}", subject_id(n)))
        .collect();
    let responses = join_all(uris.iter().map(|uri| get_json(&app.router, uri))).await;

    let rejected: Vec<_> = responses
        .iter()
        .filter(|(status, _)| *status == StatusCode::SERVICE_UNAVAILABLE)
        .collect();
    assert!(!rejected.is_empty());
    assert!(rejected.iter().all(|(_, json)| json["error"] == "queue_full"));
    assert!(responses.iter().any(|(status, _)| *status == StatusCode::OK));

    app.gateway.shutdown().await;
}

#[tokio::test]
async fn health_reports_browser_and_queue() {
    let app = setup_test_app(StubBackend::with_page_text("9 monthly listeners"));
    get_json(&app.router, &format!("/scrape/monthly-listeners/{ARTIST_ID}")).await;

    let (status, json) = get_json(&app.router, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["browserStatus"], "running");
    assert_eq!(json["browserGeneration"], 1);
    assert!(json["browserUptime"].is_u64());
    assert!(json["serverUptime"].is_u64());
    assert_eq!(json["queueLength"], 0);
    assert_eq!(json["activePages"], 0);
    assert!(json["cachedResults"].is_u64());

    app.gateway.shutdown().await;
}

#[tokio::test]
async fn health_without_browser() {
    let backend = StubBackend::new();
    backend.fail_next_launches(usize::MAX);
    let app = setup_test_app(backend);

    let (status, json) = get_json(&app.router, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["browserStatus"], "not running");
    assert!(json["browserUptime"].is_null());

    app.gateway.shutdown().await;
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = setup_test_app(StubBackend::new());

    let (status, json) = get_json(&app.router, "/scrape/album-saves/x").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");

    app.gateway.shutdown().await;
}

#[tokio::test]
async fn openapi_document_lists_routes() {
    let app = setup_test_app(StubBackend::new());

    let (status, json) = get_json(&app.router, "/api-docs/openapi.json").await;

    assert_eq!(status, StatusCode::OK);
    let paths = json["paths"].as_object().unwrap();
    assert!(paths.contains_key("/scrape/monthly-listeners/{artistId}"));
    assert!(paths.contains_key("/scrape/playcount/{trackId}"));
    assert!(paths.contains_key("/health"));

    app.gateway.shutdown().await;
}
