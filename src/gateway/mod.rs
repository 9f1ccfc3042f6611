//! HTTP surface of the billing payments service

pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;
pub mod webhooks;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use state::AppState;

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let payment_routes = Router::new()
        .route(
            "/",
            post(handlers::create_payment).get(handlers::list_payments),
        )
        .route("/{id}", get(handlers::get_payment))
        .route("/{id}/refund", post(handlers::refund_payment))
        .route("/query/{payment_no}", get(handlers::query_payment))
        .route("/notify/{method}", post(webhooks::handle_notify))
        .route("/sagas/{saga_id}", get(handlers::get_saga))
        .route("/providers/{method}/config", get(handlers::provider_config));

    Router::new()
        .route("/api/billing/health", get(handlers::health_check))
        .nest("/api/billing/payments", payment_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
}

/// Serve the router on an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

/// Start HTTP server
pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> std::io::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;

    info!(addr = %addr, "Billing gateway listening");
    info!("API docs: http://{}/docs", addr);

    serve(listener, state).await
}
