//! Check-dispatch pipeline of the Uppe uptime monitor.
//!
//! Checks are fired by the scheduler, routed over the broker to regional
//! worker pools, executed, collected into storage and finally analysed for
//! status changes. Each stage runs as its own process role, see
//! [`orchestrator::Role`].

pub mod broker;
pub mod config;
pub mod database;
pub mod error;
pub mod monitoring;
pub mod orchestrator;
pub mod pool;

pub use error::{Error, Result};
