// Declare modules
pub mod app_state;
pub mod config;
pub mod handlers;
pub mod models;
pub mod protocol;
pub mod services;
pub mod utils;

// Public re-exports
pub use app_state::AppState;
pub use config::Settings;
pub use models::connection::{ConnId, Connection, Role, SessionError, SetupState};
pub use models::grid::GridCoordinate;
pub use models::registry::ConnectionRegistry;
pub use models::timemap::TimeMap;
pub use protocol::{compose, parse, Decoded, MessageBuilder, Param, ProtocolError, WireMessage};
pub use services::clock_service::ClockScheduler;
pub use services::session_service::{
    CloseOutcome, Disconnect, Outbound, PeerHandle, SessionService, SessionState,
};

// Re-export handlers
pub use handlers::health_handler;
pub use handlers::logs_handler;
pub use handlers::ws_handler::ws_route;
