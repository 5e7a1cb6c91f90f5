use crate::{pipeline::PipelineState, server::SharedState};
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
    pipeline: PipelineState,
    model_loaded: bool,
    live_connections: usize,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    Json(Health {
        status: "Available",
        pipeline: state.pipeline.state(),
        model_loaded: state.inference.model_info().is_loaded,
        live_connections: state.broadcaster.active_connections(),
    })
}
