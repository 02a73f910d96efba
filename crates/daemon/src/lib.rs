#![forbid(unsafe_code)]

//! Relay daemon: owns the task store and hands claimed work to agents.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod http;
pub mod reconciler;
pub mod secrets;
pub mod service;
pub mod store;
