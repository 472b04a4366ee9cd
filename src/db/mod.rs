pub mod config_db;
pub mod migrations;
pub mod telemetry_store;

pub use config_db::ConfigDb;
pub use telemetry_store::TelemetryStore;
