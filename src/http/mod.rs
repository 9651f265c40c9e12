//! HTTP API server for external control and listeners
//!
//! - POST /capture/start - Start capturing a device
//! - POST /capture/stop - Stop capturing a device
//! - GET /capture/status - Sessions, roles and listeners
//! - GET /listen - WebSocket push of live PCM plus status frames
//! - GET /events - WebSocket feed of lifecycle events
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
