//! HTTP API: Prometheus metrics and trainer status.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use tokio::sync::watch;

use crate::errors::{Reraise, TrainerError};
use crate::pipeline::evaluation::PolicySummary;
use crate::pipeline::stats::TrainerStatus;

pub struct ApiState {
    pub registry: Registry,
    pub status: watch::Receiver<Option<TrainerStatus>>,
    pub evaluation: Option<watch::Receiver<BTreeMap<String, PolicySummary>>>,
}

#[derive(Serialize)]
struct StatusBody {
    trainer: TrainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    evaluation: Option<BTreeMap<String, PolicySummary>>,
}

fn app(state: ApiState) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/status", get(get_status))
        .layer(Extension(Arc::new(state)))
}

/// Serve until `shutdown` resolves.
pub async fn run_webserver(
    port: u16,
    state: ApiState,
    shutdown: impl Future<Output = ()>,
) -> Result<(), TrainerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting trainer API server on {addr:?}");

    axum::Server::try_bind(&addr)
        .reraise(&format!("Unable to bind trainer API server to port {port}"))?
        .serve(app(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .reraise("Trainer API server failed")
}

async fn get_metrics(Extension(state): Extension<Arc<ApiState>>) -> Response {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&state.registry.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", encoder.format_type().to_owned())],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Unable to encode metrics: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_status(Extension(state): Extension<Arc<ApiState>>) -> Response {
    let trainer = state.status.borrow().clone();
    match trainer {
        Some(trainer) => Json(StatusBody {
            trainer,
            evaluation: state
                .evaluation
                .as_ref()
                .map(|summaries| summaries.borrow().clone()),
        })
        .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "trainer is starting").into_response(),
    }
}

#[cfg(test)]
fn test_state(
    status: Option<TrainerStatus>,
) -> (Arc<ApiState>, watch::Sender<Option<TrainerStatus>>) {
    let (tx, rx) = watch::channel(status);
    let state = ApiState {
        registry: Registry::new(),
        status: rx,
        evaluation: None,
    };
    (Arc::new(state), tx)
}

#[tokio::test]
async fn status_unavailable_until_reported() {
    use crate::learner::LearnerPhase;

    let (state, tx) = test_state(None);
    let res = get_status(Extension(state.clone())).await;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    tx.send_replace(Some(TrainerStatus {
        phase: LearnerPhase::Learning,
        examples_learned: 3,
        learn_failures: 0,
        pending_trackback: 3,
        checkpoints_created: 0,
        last_checkpoint: None,
        model_id: None,
        model_name: None,
        partition_offsets: BTreeMap::new(),
    }));
    let res = get_status(Extension(state)).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_are_text() {
    let (state, _tx) = test_state(None);
    let counter = prometheus::IntCounter::new("examples_learned", "help").unwrap();
    state.registry.register(Box::new(counter.clone())).unwrap();
    counter.inc();

    let res = get_metrics(Extension(state)).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
}
