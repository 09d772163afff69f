//! HTTP and WebSocket surface of the Tidepool server.

pub mod app;
pub mod config;
pub mod telemetry;
mod websocket;

pub use app::{router, AppState};
pub use config::{Cli, ServerConfig, ServerMode};
