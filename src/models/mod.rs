pub mod connection;
pub mod grid;
pub mod registry;
pub mod timemap;

pub use connection::{ConnId, Connection, Role, SetupState};
pub use grid::GridCoordinate;
pub use registry::ConnectionRegistry;
pub use timemap::TimeMap;
