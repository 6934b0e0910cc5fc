//! Kubernetes operator for Sentinel-monitored Redis
//!
//! Reconciles `RedisSentinel` resources into a Redis leader tier and a
//! Sentinel tier, follows the master Sentinel elects, and rolls
//! configuration changes out one pod at a time.

pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;

pub use error::{Error, Result};
