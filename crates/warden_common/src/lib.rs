//! Warden Common - compliance healing core shared by the daemon and its tests
//!
//! Detector → cooldown gate → healing engine → evidence chain → learning,
//! with the trust fabric and time verifier as services and the fleet
//! registry as the entry point for agent-reported drift.

pub mod canonical;
pub mod cooldown;
pub mod drift;
pub mod error;
pub mod evidence;
pub mod fleet;
pub mod healing;
pub mod learning;
pub mod timesync;
pub mod trust;
pub mod types;

pub use cooldown::{CooldownGate, GateDecision};
pub use error::{Result, WardenError};
pub use types::*;
