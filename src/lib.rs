//! Host-side acquisition for wireless IMU devices.
//!
//! Discovers registry devices over BLE, connects to them concurrently,
//! records their notifications on a shared host-relative timeline and
//! exports one aligned table per session.

pub mod bluetooth;
pub mod config;
pub mod decoder;
pub mod error;
pub mod export;
pub mod models;
pub mod session;
pub mod store;
pub mod sync;
pub mod utils;

pub use config::{Registry, SessionConfig};
pub use session::{RunOutcome, SessionController, StartOutcome, StopOutcome};
