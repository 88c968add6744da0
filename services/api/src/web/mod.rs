pub mod auth;
pub mod library_task;
pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod ws_handler;

// Re-export the main WebSocket handler to make it easily accessible
// to the binary that will build the web server router.
pub use middleware::require_auth;
pub use rest::{analyze_verse_handler, explain_word_handler, scan_verse_handler};
pub use ws_handler::ws_handler;
