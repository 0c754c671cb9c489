//! Integration test driver for the `tests/integration/` submodules.
//!
//! Each `mod` below exercises one side of the bridge against the host
//! simulations of the radio, flash and power adapters. Nothing here needs
//! real hardware.

#![cfg(not(target_os = "espidf"))]

mod link_tests;
mod mock_ports;
mod ota_flow_tests;
mod service_tests;
