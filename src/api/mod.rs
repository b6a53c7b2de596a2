//! HTTP and WebSocket surface
//!
//! Public reads, the admin control surface and the real-time channel.

pub mod admin;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod security;
pub mod server;
pub mod websocket;

pub use handlers::AppState;
pub use server::{create_app, ApiServer};
