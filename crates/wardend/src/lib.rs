//! wardend - compliance appliance daemon
//!
//! Detects drift on managed hosts, heals it inside the maintenance window,
//! seals every remediation into the evidence chain and serves the agent API.

pub mod central;
pub mod config;
pub mod daemon;
pub mod pipeline;
pub mod routes;
pub mod scheduler;
pub mod server;
pub mod tls;
