pub mod alert;
pub mod device;
pub mod escalation;
pub mod oncall;
pub mod rule;
pub mod telemetry;
pub mod tenant;
pub mod user;
