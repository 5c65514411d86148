//! REST API handlers for the control plane.
//!
//! Every REST caller is unprivileged ([`Caller::Api`](crate::services::Caller)).

mod agents;
mod applications;
mod catalog;
mod events;
mod health;
mod metrics;
mod microservices;
mod router;
mod routes;

pub use router::{create_router, AppState};

#[cfg(test)]
mod tests;
