//! Custom Resource Definitions for the Redis Sentinel operator
//!
//! This module defines the Kubernetes CRD describing the desired Redis and
//! Sentinel topology.

mod redis_sentinel;
mod types;

pub use redis_sentinel::{
    master_name_for, RedisSentinel, RedisSentinelSpec, RedisSentinelStatus, UNKNOWN_MASTER_NAME,
};
pub use types::*;
