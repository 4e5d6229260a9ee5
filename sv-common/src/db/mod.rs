//! Database layer: pool initialization, versioned migrations, settings KV.

pub mod init;
pub mod migrations;
pub mod settings;

pub use init::{init_memory_pool, init_pool};
pub use migrations::run_migrations;
