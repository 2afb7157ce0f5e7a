use crate::{server::SharedState, telemetry::MetricsError};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

impl IntoResponse for MetricsError {
    fn into_response(self) -> Response {
        tracing::error!("Failed to render metrics: {}", self);
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

pub async fn metrics_handler(State(state): State<SharedState>) -> Result<String, MetricsError> {
    state.metrics.render()
}
