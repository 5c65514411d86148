//! Axum router configuration.

use axum::{
    http::HeaderValue,
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

use crate::services::Services;

use super::{
    agents, applications, catalog, events, health, metrics, microservices, routes,
};

/// API version header value.
const API_VERSION: &str = "application/vnd.fogplane.v1+json";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

/// Create the API router with all routes.
pub fn create_router(services: Services) -> Router {
    let state = AppState { services };

    Router::new()
        // Health and metrics
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics))
        // Applications
        .route(
            "/applications",
            post(applications::create_application).get(applications::list_applications),
        )
        .route(
            "/applications/{name}",
            get(applications::get_application)
                .put(applications::update_application)
                .patch(applications::patch_application)
                .delete(applications::delete_application),
        )
        // Microservices
        .route(
            "/microservices",
            post(microservices::create_microservice).get(microservices::list_microservices),
        )
        .route(
            "/microservices/{uuid}",
            get(microservices::get_microservice)
                .patch(microservices::update_microservice)
                .delete(microservices::delete_microservice),
        )
        .route(
            "/microservices/{uuid}/receivers",
            get(microservices::list_receivers),
        )
        .route(
            "/microservices/{uuid}/status",
            put(microservices::report_status),
        )
        // Routes
        .route(
            "/routes",
            post(routes::create_route).get(routes::list_routes),
        )
        .route(
            "/routes/{application}/{name}",
            get(routes::get_route)
                .patch(routes::update_route)
                .delete(routes::delete_route),
        )
        // Agents
        .route(
            "/agents",
            post(agents::register_agent).get(agents::list_agents),
        )
        .route(
            "/agents/{uuid}",
            get(agents::get_agent).patch(agents::update_agent),
        )
        .route(
            "/agents/{uuid}/changes",
            get(agents::get_changes).delete(agents::acknowledge_changes),
        )
        // Catalog
        .route("/catalog", post(catalog::add_catalog_item))
        .route("/catalog/{id}", get(catalog::get_catalog_item))
        .route("/registries", post(catalog::add_registry))
        // Audit trail
        .route("/events", get(events::list_events))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        // API versioning: set Content-Type to versioned media type for JSON responses
        .layer(SetResponseHeaderLayer::if_not_present(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static(API_VERSION),
        ))
        .with_state(state)
}
