pub mod classifier;
pub mod config;
pub mod health;
pub mod metrics;
pub mod policy;
pub mod report;
pub mod retry;
pub mod rules;
pub mod store;
