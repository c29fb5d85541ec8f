//! MoxApp core: a bidirectional HTTP traffic generator.
//!
//! The outgoing half schedules rate-limited requests against configured
//! endpoints and captures per-phase connection timings; the incoming half
//! serves simulated routes with weighted status codes and artificial
//! latency. A management REST API exposes live CRUD and scheduler control.

pub mod app_state;
pub mod client;
pub mod config;
pub mod envfile;
pub mod error;
pub mod http;
pub mod metrics;
pub mod scheduler;
pub mod telemetry;
pub mod template;

pub type Result<T> = anyhow::Result<T>;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent sent on every outgoing request.
pub const USER_AGENT: &str = "moxapp/1.0";
