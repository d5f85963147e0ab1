//! Supervisor of backend server fleets.
//!
//! Loads a deployment description, renders the reverse-proxy gateway
//! config, launches every configured server instance, waits for each to
//! become healthy, launches the gateway, and exposes the lifecycle
//! commands (`start`, `stop`, `status`, `restart`, `gen-gateway-config`)
//! over a small CLI.

pub mod config;
pub mod gateway;
pub mod health;
pub mod orchestrator;
pub mod ports;
pub mod supervisor;
