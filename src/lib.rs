//! Library crate for cardroom-core, exposing the realtime coordination
//! components for the server binary and integration tests.

/// Startup configuration.
pub mod config;
/// Coordination store seam and its records.
pub mod dao;
/// Wire payloads and events.
pub mod dto;
/// Service and HTTP error types.
pub mod error;
/// HTTP routes.
pub mod routes;
/// Realtime components.
pub mod services;
/// Shared application state and domain values.
pub mod state;
