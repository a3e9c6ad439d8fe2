pub mod error;
pub mod metrics;
pub mod net;
pub mod proxy;
pub mod replicator;
pub mod rules;
pub mod server;
pub mod settings;
pub mod telemetry;
