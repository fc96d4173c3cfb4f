//! HTTP server for the status API

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{handlers, websocket};
use crate::config::UiConfig;
use crate::error::{Error, Result};
use crate::server::ServerContext;

/// Status API bound to one relay
pub struct WebServer {
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: &UiConfig, ctx: Arc<ServerContext>) -> Result<Self> {
        let addr = format!("{}:{}", config.bind_address, config.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid ui address: {}", e)))?;
        Ok(Self { ctx, addr })
    }

    pub fn router(ctx: Arc<ServerContext>) -> Router {
        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/clients", get(handlers::list_clients))
            .route("/api/clients/:id", get(handlers::get_client))
            .route("/ws/events", get(websocket::ws_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(ctx)
    }

    /// Serve until the relay shuts down.
    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("Status API listening on http://{}", listener.local_addr()?);

        let shutdown = Arc::clone(&self.ctx.shutdown);
        axum::serve(listener, Self::router(self.ctx))
            .with_graceful_shutdown(async move {
                while !shutdown.is_triggered() {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::util::Shutdown;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn router() -> Router {
        let ctx = Arc::new(ServerContext::new(&AppConfig::default(), Shutdown::new()));
        WebServer::router(ctx)
    }

    async fn get(uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_route() {
        let (status, json) = get("/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["connected_clients"], 0);
    }

    #[tokio::test]
    async fn test_missing_client_route() {
        let (status, json) = get("/api/clients/9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);
    }

    #[test]
    fn test_rejects_bad_address() {
        let ctx = Arc::new(ServerContext::new(&AppConfig::default(), Shutdown::new()));
        let config = UiConfig {
            enabled: true,
            bind_address: "not an address".into(),
            http_port: 8080,
        };
        assert!(WebServer::new(&config, ctx).is_err());
    }
}
