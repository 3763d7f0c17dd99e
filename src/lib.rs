//! Library crate for ban-scan-rs exposing reusable modules.
pub mod config;
pub mod error;
pub mod extract;
pub mod monitor;
pub mod ports;
pub mod queue;
pub mod scanner;
pub mod state;
pub mod tail;
pub mod tools;
pub mod types;
