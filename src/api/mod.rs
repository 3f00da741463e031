// API module
//
// This module contains the HTTP/JSON surface of the node

pub mod handlers;
pub mod routes;
pub mod schema;

// Re-export main components for easier access
pub use handlers::{AppState, NodeData};
pub use routes::configure_routes;
