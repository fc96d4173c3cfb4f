//! Read-only status API
//!
//! HTTP endpoints over the live session registry plus a WebSocket that
//! forwards session lifecycle events as JSON.

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::WebServer;
