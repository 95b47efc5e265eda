use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::http::header;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::errors::FlowException;
use crate::errors::TrackedError;
use crate::metrics::encode_metrics;

struct State {
    options_json: String,
}

/// Serve `/metrics` in the Prometheus text format and `/options`
/// with the running pipeline's options.
pub(crate) async fn run_webserver(port: u16, options_json: String) -> Result<(), TrackedError> {
    let shared_state = Arc::new(State { options_json });

    let app = Router::new()
        .route("/metrics", get(get_metrics))
        .route("/options", get(get_options))
        .layer(Extension(shared_state));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting metrics server on {addr:?}");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .reraise_with(|| format!("Unable to create local webserver at port {port}"))
}

async fn get_metrics() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(err) => {
            tracing::error!("{}", err.stacktrace());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                err.to_string(),
            )
        }
    }
}

async fn get_options(Extension(state): Extension<Arc<State>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        state.options_json.clone(),
    )
}
