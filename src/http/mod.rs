//! HTTP frontend: the MCP entry point plus the dashboard REST/SSE surface.
//!

pub mod app;
pub mod dashboard;
pub mod mcp;
pub mod sse;

pub use app::{build_router, AppState};
