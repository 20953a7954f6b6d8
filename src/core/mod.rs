pub mod config;
pub mod durable;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod reconciler;
pub mod session;
pub mod settings;
pub mod status;
pub mod telemetry;
