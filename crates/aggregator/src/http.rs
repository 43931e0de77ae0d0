// Operational HTTP surface: liveness, Prometheus metrics and start/stop
// control.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use crate::control::{ControlError, Controller};
use crate::metrics::EngineMetrics;
use crate::rest::ChannelEnumerator;

pub struct AppState<C> {
    metrics: Arc<EngineMetrics>,
    controller: Arc<Controller<C>>,
}

impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self { metrics: Arc::clone(&self.metrics), controller: Arc::clone(&self.controller) }
    }
}

pub fn build_router<C: ChannelEnumerator>(
    metrics: Arc<EngineMetrics>,
    controller: Arc<Controller<C>>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics::<C>))
        .route("/control", get(control_state::<C>))
        .route("/control/start", post(control_start::<C>))
        .route("/control/stop", post(control_stop::<C>))
        .with_state(AppState { metrics, controller })
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics<C: ChannelEnumerator>(
    State(state): State<AppState<C>>,
) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

async fn control_state<C: ChannelEnumerator>(State(state): State<AppState<C>>) -> Response {
    Json(state.controller.state()).into_response()
}

async fn control_start<C: ChannelEnumerator>(State(state): State<AppState<C>>) -> Response {
    match state.controller.start().await {
        Ok(report) => Json(report).into_response(),
        Err(error) => {
            let status = match error {
                ControlError::Enumerate(_) => StatusCode::BAD_GATEWAY,
                ControlError::Engine(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            let body = json!({ "state": state.controller.state().state, "error": error.to_string() });
            (status, Json(body)).into_response()
        }
    }
}

async fn control_stop<C: ChannelEnumerator>(State(state): State<AppState<C>>) -> Response {
    Json(state.controller.stop()).into_response()
}

/// Serve the router on `addr` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind operations listener on {addr}"))?;
    info!(listen_addr = %addr, "serving health, metrics and control");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("operations server exited unexpectedly")
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::NamespaceFilter;
    use crate::control::{RunState, RunSwitch};
    use crate::engine::test_support::{engine_with, FixedChannels, ScriptedSource};
    use crate::error::RestError;

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request should build")
    }

    fn post_request(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).expect("request should build")
    }

    fn router_with(
        metrics: Arc<EngineMetrics>,
        switch: RunSwitch,
        channels: Result<Vec<String>, RestError>,
    ) -> Router {
        let (engine, handle) = engine_with(Arc::new(ScriptedSource::default()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        tokio::spawn(async move {
            let _shutdown_tx = shutdown_tx;
            engine.run(shutdown_rx).await;
        });
        let controller = Controller::new(
            switch,
            handle,
            Arc::new(FixedChannels::new(channels)),
            NamespaceFilter::new("^presence:.*").unwrap(),
        );
        build_router(metrics, Arc::new(controller))
    }

    fn router(metrics: Arc<EngineMetrics>) -> Router {
        router_with(metrics, RunSwitch::default(), Ok(Vec::new()))
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let response = router(Arc::new(EngineMetrics::default()))
            .oneshot(get_request("/healthz"))
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn metrics_render_current_counters() {
        let metrics = Arc::new(EngineMetrics::default());
        metrics.record_drift();
        metrics.set_store_size(4, 9);

        let response = router(Arc::clone(&metrics))
            .oneshot(get_request("/metrics"))
            .await
            .expect("metrics request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("presence_drift_detected_total 1"));
        assert!(text.contains("presence_channels 4"));
        assert!(text.contains("presence_members 9"));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let response = router(Arc::new(EngineMetrics::default()))
            .oneshot(get_request("/nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_then_start_toggles_run_state() {
        let switch = RunSwitch::default();
        let app = router_with(
            Arc::new(EngineMetrics::default()),
            switch.clone(),
            Ok(vec!["presence:a".into(), "chat:b".into()]),
        );

        let response = app.clone().oneshot(post_request("/control/stop")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["state"], "stopped");
        assert!(!switch.is_running());

        let response = app.clone().oneshot(get_request("/control")).await.unwrap();
        assert_eq!(json_body(response).await["state"], "stopped");

        let response = app.oneshot(post_request("/control/start")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["state"], "running");
        assert_eq!(body["resyncChannels"], 1);
        assert_eq!(switch.state(), RunState::Running);
    }

    #[tokio::test]
    async fn start_reports_enumeration_failure_as_bad_gateway() {
        let app = router_with(
            Arc::new(EngineMetrics::default()),
            RunSwitch::new(RunState::Stopped),
            Err(RestError::Status { status: 500, body: String::new() }),
        );

        let response = app.oneshot(post_request("/control/start")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["state"], "running");
        assert!(body["error"].as_str().unwrap().contains("enumeration failed"));
    }

    #[tokio::test]
    async fn control_start_requires_post() {
        let response = router(Arc::new(EngineMetrics::default()))
            .oneshot(get_request("/control/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
