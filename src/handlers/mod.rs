pub mod alerts;
pub mod auth;
pub mod channels;
pub mod devices;
pub mod escalation_policies;
pub mod health;
pub mod oncall;
pub mod rules;
pub mod tenants;
