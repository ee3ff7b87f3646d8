//! # HTTP Server
//!
//! Health check at the root plus the backup API under `/backup`.

use std::future::Future;
use std::sync::Arc;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::backup_routes::{backup_routes, BackupState};
use super::config::HttpServerConfig;
use crate::observability::{log_event, Event};

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

pub fn health_routes() -> Router {
    Router::new().route("/health", get(health_handler))
}

async fn health_handler() -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (StatusCode::OK, Json(response))
}

pub struct HttpServer {
    config: HttpServerConfig,
    router: Router,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, state: BackupState) -> Self {
        let router = Self::build_router(&config, Arc::new(state));
        Self { config, router }
    }

    fn build_router(config: &HttpServerConfig, state: Arc<BackupState>) -> Router {
        let cors = if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();

            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        };

        Router::new()
            .merge(health_routes())
            .nest("/backup", backup_routes(state))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }

    pub fn socket_addr(&self) -> String {
        self.config.socket_addr()
    }

    /// Get the router (for testing)
    pub fn router(self) -> Router {
        self.router
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr).await?;
        log_event(Event::ServerStart, &[("addr", &addr.to_string())]);
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use crate::database::MemoryDatabase;
    use crate::records::BackupRecord;
    use crate::schedule::{BackupSchedule, ScheduleManager, ScheduleRunner};
    use crate::service::BackupService;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn server(temp: &TempDir, config: HttpServerConfig) -> HttpServer {
        let service = BackupService::new(
            BackupConfig::with_dirs(
                temp.path().join("backups"),
                temp.path().join("uploads"),
                temp.path().join("data"),
            ),
            Arc::new(MemoryDatabase::new()),
            Arc::new(MemoryStore::<BackupRecord>::new()),
        )
        .unwrap();
        let runner = ScheduleRunner::new(
            service.clone(),
            ScheduleManager::new(Arc::new(MemoryStore::<BackupSchedule>::new())),
        );
        HttpServer::new(config, BackupState::new(service, runner))
    }

    #[test]
    fn test_socket_addr_from_config() {
        let temp = TempDir::new().unwrap();
        let server = server(&temp, HttpServerConfig::with_port(8080));
        assert_eq!(server.socket_addr(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_health() {
        let temp = TempDir::new().unwrap();
        let router = server(&temp, HttpServerConfig::default()).router();

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_backup_api_is_nested() {
        let temp = TempDir::new().unwrap();
        let router = server(&temp, HttpServerConfig::default()).router();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/backup/disk-files")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
