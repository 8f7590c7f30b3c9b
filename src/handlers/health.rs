use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::AppState;

/// Liveness probe: round-trips a trivial statement through the pool.
pub async fn probe(State(state): State<AppState>, method: Method) -> Response {
    match sqlx::query_scalar::<_, i32>("SELECT 1 AS healthcheck")
        .fetch_one(&state.pool)
        .await
    {
        Ok(_) => {
            if method == Method::HEAD {
                StatusCode::NO_CONTENT.into_response()
            } else {
                (StatusCode::OK, "ALIVE").into_response()
            }
        }
        Err(err) => {
            tracing::error!("healthcheck failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
