//! Application core: the bridge service and the runtime around it.
//!
//! [`service::BridgeService`] holds every engine and turns stack events into
//! notifications and [`commands::Job`]s. [`runtime::Runtime`] runs those jobs
//! on their own tasks and drives the periodic work. Everything outside the
//! chip goes through the **port traits** in [`ports`].

pub mod commands;
pub mod ports;
pub mod runtime;
pub mod service;
pub mod tasks;
