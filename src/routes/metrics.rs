use super::ApiError;
use crate::server::SharedState;
use axum::extract::State;

pub async fn metrics_handler(State(state): State<SharedState>) -> Result<String, ApiError> {
    state
        .metrics
        .record_live_connections(state.broadcaster.active_connections());
    state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))
}
