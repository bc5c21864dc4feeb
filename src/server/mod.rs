//! HTTP surface: the tracker webhook receiver and a small operational API.

pub mod api;

pub use api::{ApiError, AppState, SharedState, api_router};

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerSection;
use crate::engine::Engine;

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api_router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the engine's background loops and serve until Ctrl+C.
pub async fn start_server(server: &ServerSection, mut engine: Engine) -> Result<()> {
    let handles = engine.start(true).await?;

    let state = Arc::new(AppState {
        db: engine.services.db.clone(),
        router: engine.router.clone(),
        runtime: engine.runtime.clone(),
    });
    let app = build_router(state);

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "forgeflow listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    for handle in handles {
        handle.abort();
    }
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::FeatureFlags;
    use crate::test_support::TestHarness;

    #[tokio::test]
    async fn test_full_router_serves_health_and_api() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        let app = build_router(Arc::new(AppState {
            db: h.db.clone(),
            router: h.router.clone(),
            runtime: h.runtime.clone(),
        }));

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::builder().uri("/api/questions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let h = TestHarness::with_flags(FeatureFlags::none()).await;
        let app = build_router(Arc::new(AppState {
            db: h.db.clone(),
            router: h.router.clone(),
            runtime: h.runtime.clone(),
        }));
        let resp = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
