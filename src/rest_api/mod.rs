//! HTTP endpoints served next to the controller
//!
//! Exposes liveness, Prometheus metrics and a read-only summary of the
//! RedisSentinel resources the controller manages.

mod server;

pub use server::run_server;
