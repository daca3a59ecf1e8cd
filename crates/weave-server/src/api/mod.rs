pub mod agents;
pub mod context;
pub mod events;
pub mod tools;
pub mod workflows;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all sub-routes.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/workflows", workflows::router())
        .nest("/agents", agents::router())
        .nest("/events", events::router())
        .nest("/context", context::router())
        .nest("/tools", tools::router())
}

/// Parse a JSON body that clients may omit entirely.
pub(crate) fn optional_body<T>(body: &[u8]) -> Result<T, crate::error::ServerError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| crate::error::ServerError::BadRequest(format!("Invalid request body: {}", e)))
}
