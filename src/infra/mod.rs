//! Usage: Persistence and background queues (spending ledger, telemetry, transaction capture).

pub mod inspector;
pub mod spending;
pub mod telemetry;
