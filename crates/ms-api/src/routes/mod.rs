pub mod events;
pub mod plans;
pub mod servers;
pub mod versions;

use axum::Router;
use axum::routing::{get, post};

use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    Router::new()
        // Provisioning
        .route("/servers", post(servers::create_server))
        .route("/servers/recommended-plans", get(plans::recommended_plans))
        // Progress streams
        .route("/servers/{server_id}/events", get(events::server_events))
        .route("/events", get(events::all_events))
        // Versions
        .route("/versions/{server_type}", get(versions::list_versions))
        .with_state(state)
}
