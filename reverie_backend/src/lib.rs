pub mod agent;
pub mod config;
pub mod error;
pub mod llm_client;
pub mod memory;
pub mod prompt;
pub mod runtime;
pub mod server;
