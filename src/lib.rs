//! Capture node: short-lived browser sandboxes, a live stream relay into them,
//! and hash-verifiable page captures.

pub mod capture;
pub mod config;
pub mod error;
pub mod event_log;
pub mod http_server;
pub mod orchestrator;
pub mod readiness;
pub mod relay;
pub mod sandbox;
pub mod state;
pub mod storage;
pub mod validation;

pub use error::{Error, Result};
