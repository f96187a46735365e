// src/lib.rs

// Import the top-level `core` module.
pub mod core;

// Re-exporting key items for easier external access.
pub use core::client_wrapper::{ClientWrapper, Message, Role};
pub use core::dispatcher::Dispatcher;
pub use core::gateway::Gateway;
