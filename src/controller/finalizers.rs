//! Finalizer names used by the operator

/// Finalizer guarding cleanup of the resources owned by a RedisSentinel
pub const REDIS_SENTINEL_FINALIZER: &str = "redis.opstreelabs.in/redis-sentinel-finalizer";
