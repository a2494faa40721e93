pub mod api;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod sweeper;
pub mod trigger;
