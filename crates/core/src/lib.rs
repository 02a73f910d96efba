#![forbid(unsafe_code)]

//! Shared task model and wire contract for the relay daemon and its agents.

pub mod api;
pub mod model;

mod util;

pub use util::{new_id, now_ms};
