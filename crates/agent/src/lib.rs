#![forbid(unsafe_code)]

//! Relay agent: polls the daemon for work and runs it against local appliances.

pub mod client;
pub mod config;
pub mod deploy;
pub mod executor;
pub mod runtime;
pub mod ssh;
