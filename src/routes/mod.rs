mod health;
mod metrics;

use crate::server::SharedState;
use axum::{routing::get, Router};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Metrics;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get_path(path: &str) -> String {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.record_cycle(1_500, "ok");
        let router = api_routes().with_state(SharedState { metrics });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_route() {
        let response = get_path("/health").await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""status":"Available""#));
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let response = get_path("/metrics").await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("cycles_total"));
    }
}
