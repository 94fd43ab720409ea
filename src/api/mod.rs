//! HTTP API Layer
//!
//! Thin REST surface over a running [`FlowProcessor`](crate::runtime::FlowProcessor):
//! - Listing registered flows
//! - Starting runs with parameters and an optional delay
//! - Inspecting a run and its task runs
//! - Reporting processor load

// Flow listing and run endpoints
pub mod runs;

// Re-export router builder
pub use runs::{create_flow_routes, AppState};
