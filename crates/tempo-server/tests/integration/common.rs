use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use tempo_core::config::GatewayConfig;
use tempo_core::gateway::ScrapeGateway;
use tempo_core::testutil::{RecordingReporter, StubBackend};
use tempo_server::routes;
use tempo_server::state::AppState;

pub const ARTIST_ID: &str = "4iHNK0tOyZPYnBU7nGAgpQ";
pub const TRACK_ID: &str = "1301WleyT98MSxVHPZCA6M";

pub struct TestApp {
    pub router: Router,
    pub backend: StubBackend,
    pub gateway: Arc<ScrapeGateway<StubBackend>>,
}

/// Router backed by a stub browser with the default configuration.
pub fn setup_test_app(backend: StubBackend) -> TestApp {
    setup_test_app_with(backend, GatewayConfig::default())
}

pub fn setup_test_app_with(backend: StubBackend, config: GatewayConfig) -> TestApp {
    let gateway = Arc::new(ScrapeGateway::start_with_reporter(
        backend.clone(),
        &config,
        Arc::new(RecordingReporter::new()),
    ));
    let state = Arc::new(AppState {
        gateway: gateway.clone(),
    });

    TestApp {
        router: routes::router(state),
        backend,
        gateway,
    }
}

/// Sends a GET and returns the status with the parsed JSON body.
pub async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}
