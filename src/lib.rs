//! X1 Bridge firmware library.
//!
//! Exposes the bridge engines and their adapters for integration testing.
//! All ESP-IDF-specific code is guarded by `#[cfg(target_os = "espidf")]`
//! within each module; host builds get the simulation adapters.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod logging;
pub mod ota;
pub mod power;
pub mod protocol;
pub mod session;
