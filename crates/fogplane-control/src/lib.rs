//! fogplane control plane.
//!
//! Orchestrates containerized microservices across a fleet of edge agents:
//! placement, port mappings, extra-host resolution, routes and pub/sub tags.
//! Every mutation advances per-agent change flags that agents poll to learn
//! what to re-fetch.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod server;
pub mod services;
