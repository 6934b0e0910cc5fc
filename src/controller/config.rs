//! Effective configuration for a RedisSentinel
//!
//! Layers the operator defaults under the user's overrides and validates the
//! result. Everything here is pure: the same resource always resolves to the
//! same [`EffectiveConfig`], and an invalid resource resolves to a
//! [`Error::ConfigurationError`] from which no plan may be derived.

use kube::ResourceExt;
use serde::Serialize;

use crate::crd::{
    master_name_for, Probe, RedisSentinel, RedisSentinelSpec, ResourceRequirements, Tier,
    TlsConfig,
};
use crate::error::{Error, Result};

use super::resources;

pub const DEFAULT_LEADER_REPLICAS: i32 = 3;
pub const DEFAULT_SENTINEL_REPLICAS: i32 = 3;
pub const MIN_SENTINEL_REPLICAS: i32 = 3;
pub const DEFAULT_REDIS_PORT: i32 = 6379;
pub const SENTINEL_PORT: i32 = 26379;
pub const DEFAULT_PARALLEL_SYNCS: i32 = 1;
pub const DEFAULT_FAILOVER_TIMEOUT_MS: i64 = 180_000;
pub const DEFAULT_DOWN_AFTER_MS: i64 = 30_000;

/// Fully defaulted liveness or readiness probe parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbePolicy {
    pub initial_delay_seconds: i32,
    pub timeout_seconds: i32,
    pub period_seconds: i32,
    pub success_threshold: i32,
    pub failure_threshold: i32,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            initial_delay_seconds: 1,
            timeout_seconds: 1,
            period_seconds: 10,
            success_threshold: 1,
            failure_threshold: 3,
        }
    }
}

impl ProbePolicy {
    /// Overlay the fields present in `probe`
    pub fn merge(self, probe: Option<&Probe>) -> Self {
        let Some(probe) = probe else {
            return self;
        };
        Self {
            initial_delay_seconds: probe
                .initial_delay_seconds
                .unwrap_or(self.initial_delay_seconds),
            timeout_seconds: probe.timeout_seconds.unwrap_or(self.timeout_seconds),
            period_seconds: probe.period_seconds.unwrap_or(self.period_seconds),
            success_threshold: probe.success_threshold.unwrap_or(self.success_threshold),
            failure_threshold: probe.failure_threshold.unwrap_or(self.failure_threshold),
        }
    }

    fn validate(&self, field: &str) -> Result<()> {
        let values = [
            ("initialDelaySeconds", self.initial_delay_seconds, 0),
            ("timeoutSeconds", self.timeout_seconds, 1),
            ("periodSeconds", self.period_seconds, 1),
            ("successThreshold", self.success_threshold, 1),
            ("failureThreshold", self.failure_threshold, 1),
        ];
        for (name, value, min) in values {
            if value < min {
                return Err(Error::ConfigurationError(format!(
                    "{}.{} must be at least {}, got {}",
                    field, name, min, value
                )));
            }
        }
        Ok(())
    }
}

/// Liveness and readiness policy of one tier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct TierProbes {
    pub liveness: ProbePolicy,
    pub readiness: ProbePolicy,
}

/// Resolved settings of one tier
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierConfig {
    pub tier: Tier,
    /// 0 means the tier is disabled
    pub replicas: i32,
    pub image: String,
    pub image_pull_policy: Option<String>,
    pub resources: Option<ResourceRequirements>,
    pub probes: TierProbes,
    /// Digest of the rendered pod template, filled in after defaulting
    pub template_hash: String,
    /// Digest of the pod template with container images blanked
    pub shape_hash: String,
}

impl TierConfig {
    pub fn enabled(&self) -> bool {
        self.replicas > 0
    }
}

/// Values rendered into each sentinel's monitor configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentinelSettings {
    pub master_group_name: String,
    pub redis_port: i32,
    pub quorum: i32,
    pub parallel_syncs: i32,
    pub failover_timeout: i64,
    pub down_after_milliseconds: i64,
}

/// Operational parameters derived from a RedisSentinel
#[derive(Clone, Debug, PartialEq)]
pub struct EffectiveConfig {
    pub name: String,
    pub namespace: String,
    /// `{name}-master`, stable across failovers
    pub master_name: String,
    /// The resource had no name; `master_name` is a placeholder
    pub identity_unset: bool,
    pub leader: TierConfig,
    pub sentinel: TierConfig,
    pub sentinel_settings: SentinelSettings,
    pub tls: Option<TlsConfig>,
    /// Source spec for fields passed through to the pod templates
    pub spec: RedisSentinelSpec,
    /// Non-fatal findings, e.g. an even sentinel count
    pub warnings: Vec<String>,
}

impl EffectiveConfig {
    pub fn tier(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Leader => &self.leader,
            Tier::Sentinel => &self.sentinel,
        }
    }

    pub fn persistent_storage(&self) -> bool {
        self.spec.storage.is_some()
    }
}

/// Resolve the effective configuration of a RedisSentinel resource
pub fn resolve(resource: &RedisSentinel) -> Result<EffectiveConfig> {
    let namespace = resource.namespace().unwrap_or_else(|| "default".to_string());
    resolve_spec(&resource.name_any(), &namespace, &resource.spec)
}

/// Resolve from the raw parts of a resource
pub fn resolve_spec(name: &str, namespace: &str, spec: &RedisSentinelSpec) -> Result<EffectiveConfig> {
    spec.validate().map_err(Error::ConfigurationError)?;

    let mut warnings = Vec::new();
    let master_name = master_name_for(name);
    let identity_unset = name.is_empty();
    if identity_unset {
        warnings.push(format!(
            "resource has no name; using placeholder master name {}",
            master_name
        ));
    }

    let leader_replicas = resolve_replicas(spec.redis.replicas, Some(DEFAULT_LEADER_REPLICAS))
        .map_err(|e| field_error("redis.replicas", e))?;

    let sentinel_replicas = if spec.sentinel_disabled() {
        0
    } else {
        let count = resolve_replicas(spec.sentinel.replicas, Some(DEFAULT_SENTINEL_REPLICAS))
            .map_err(|e| field_error("sentinel.replicas", e))?;
        if count < MIN_SENTINEL_REPLICAS {
            return Err(Error::ConfigurationError(format!(
                "sentinel.replicas must be at least {} for a usable quorum, got {}",
                MIN_SENTINEL_REPLICAS, count
            )));
        }
        if count % 2 == 0 {
            warnings.push(format!(
                "sentinel.replicas is {}; an odd count tolerates the same failures with one less pod",
                count
            ));
        }
        count
    };

    let leader_probes = TierProbes {
        liveness: ProbePolicy::default().merge(spec.redis.liveness_probe.as_ref()),
        readiness: ProbePolicy::default().merge(spec.redis.readiness_probe.as_ref()),
    };
    leader_probes.liveness.validate("redis.livenessProbe")?;
    leader_probes.readiness.validate("redis.readinessProbe")?;

    let sentinel_probes = TierProbes {
        liveness: ProbePolicy::default().merge(spec.sentinel.liveness_probe.as_ref()),
        readiness: ProbePolicy::default().merge(spec.sentinel.readiness_probe.as_ref()),
    };
    sentinel_probes.liveness.validate("sentinel.livenessProbe")?;
    sentinel_probes.readiness.validate("sentinel.readinessProbe")?;

    let leader_image = spec
        .redis
        .image
        .clone()
        .filter(|image| !image.trim().is_empty())
        .unwrap_or_else(|| spec.kubernetes_config.image.clone());

    let leader = TierConfig {
        tier: Tier::Leader,
        replicas: leader_replicas,
        image: leader_image,
        image_pull_policy: spec.kubernetes_config.image_pull_policy.clone(),
        resources: spec
            .redis
            .resources
            .clone()
            .or_else(|| spec.kubernetes_config.resources.clone())
            .or_else(|| spec.resources.clone()),
        probes: leader_probes,
        template_hash: String::new(),
        shape_hash: String::new(),
    };

    let sentinel = TierConfig {
        tier: Tier::Sentinel,
        replicas: sentinel_replicas,
        image: spec.sentinel.image.clone(),
        image_pull_policy: spec
            .sentinel
            .image_pull_policy
            .clone()
            .or_else(|| spec.kubernetes_config.image_pull_policy.clone()),
        resources: spec
            .sentinel
            .resources
            .clone()
            .or_else(|| spec.resources.clone()),
        probes: sentinel_probes,
        template_hash: String::new(),
        shape_hash: String::new(),
    };

    let sentinel_settings = resolve_sentinel_settings(spec, &master_name, sentinel_replicas)?;

    if let Some(tls) = &spec.tls {
        validate_tls(tls)?;
    }

    let mut config = EffectiveConfig {
        name: name.to_string(),
        namespace: namespace.to_string(),
        master_name,
        identity_unset,
        leader,
        sentinel,
        sentinel_settings,
        tls: spec.tls.clone(),
        spec: spec.clone(),
        warnings,
    };

    for tier in Tier::ALL {
        let template = resources::build_pod_template(&config, tier);
        let template_hash = resources::template_hash(&template);
        let shape_hash = resources::shape_hash(&template);
        let tier_cfg = match tier {
            Tier::Leader => &mut config.leader,
            Tier::Sentinel => &mut config.sentinel,
        };
        tier_cfg.template_hash = template_hash;
        tier_cfg.shape_hash = shape_hash;
    }

    Ok(config)
}

/// Override if present, else the schema default, else 0 (tier disabled)
pub fn resolve_replicas(override_count: Option<i32>, default: Option<i32>) -> Result<i32> {
    let count = override_count.or(default).unwrap_or(0);
    if count < 0 {
        return Err(Error::ConfigurationError(format!(
            "replica count must not be negative, got {}",
            count
        )));
    }
    Ok(count)
}

fn field_error(field: &str, err: Error) -> Error {
    match err {
        Error::ConfigurationError(msg) => Error::ConfigurationError(format!("{}: {}", field, msg)),
        other => other,
    }
}

fn resolve_sentinel_settings(
    spec: &RedisSentinelSpec,
    master_name: &str,
    sentinel_replicas: i32,
) -> Result<SentinelSettings> {
    let cfg = spec.sentinel.sentinel_config.clone().unwrap_or_default();

    let majority = sentinel_replicas / 2 + 1;
    let quorum = cfg.quorum.unwrap_or(majority);
    if sentinel_replicas > 0 && !(1..=sentinel_replicas).contains(&quorum) {
        return Err(Error::ConfigurationError(format!(
            "sentinel.sentinelConfig.quorum must be between 1 and {}, got {}",
            sentinel_replicas, quorum
        )));
    }

    let redis_port = cfg.redis_port.unwrap_or(DEFAULT_REDIS_PORT);
    if !(1..=65535).contains(&redis_port) {
        return Err(Error::ConfigurationError(format!(
            "sentinel.sentinelConfig.redisPort must be between 1 and 65535, got {}",
            redis_port
        )));
    }

    let settings = SentinelSettings {
        master_group_name: cfg
            .master_group_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| master_name.to_string()),
        redis_port,
        quorum,
        parallel_syncs: cfg.parallel_syncs.unwrap_or(DEFAULT_PARALLEL_SYNCS),
        failover_timeout: cfg.failover_timeout.unwrap_or(DEFAULT_FAILOVER_TIMEOUT_MS),
        down_after_milliseconds: cfg
            .down_after_milliseconds
            .unwrap_or(DEFAULT_DOWN_AFTER_MS),
    };

    if settings.parallel_syncs < 1 {
        return Err(Error::ConfigurationError(
            "sentinel.sentinelConfig.parallelSyncs must be at least 1".to_string(),
        ));
    }
    if settings.failover_timeout <= 0 || settings.down_after_milliseconds <= 0 {
        return Err(Error::ConfigurationError(
            "sentinel.sentinelConfig timeouts must be positive".to_string(),
        ));
    }

    Ok(settings)
}

fn validate_tls(tls: &TlsConfig) -> Result<()> {
    if !is_dns_subdomain(&tls.secret_name) {
        return Err(Error::ConfigurationError(format!(
            "TLS.secretName {:?} is not a valid Secret name",
            tls.secret_name
        )));
    }
    for (field, key) in [("ca", &tls.ca), ("cert", &tls.cert), ("key", &tls.key)] {
        if key.trim().is_empty() {
            return Err(Error::ConfigurationError(format!(
                "TLS.{} must name a key in the Secret",
                field
            )));
        }
    }
    Ok(())
}

/// RFC 1123 subdomain, as required for Secret names
fn is_dns_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    edge_ok(name.chars().next())
        && edge_ok(name.chars().last())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KubernetesConfig, Probe, RedisLeader, Sentinel, SentinelConfig};

    fn spec(leader: Option<i32>, sentinel: Option<i32>) -> RedisSentinelSpec {
        RedisSentinelSpec {
            kubernetes_config: KubernetesConfig {
                image: "quay.io/opstree/redis:v7.0.12".to_string(),
                ..Default::default()
            },
            redis: RedisLeader {
                replicas: leader,
                ..Default::default()
            },
            sentinel: Sentinel {
                replicas: sentinel,
                image: "quay.io/opstree/redis-sentinel:v7.0.12".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_sentinel_counts_pass_through_unchanged() {
        for count in [3, 5, 7] {
            let cfg = resolve_spec("cache1", "default", &spec(Some(3), Some(count))).unwrap();
            assert_eq!(cfg.sentinel.replicas, count);
            assert!(cfg.warnings.is_empty());
        }
    }

    #[test]
    fn test_small_sentinel_tier_is_rejected() {
        for count in [0, 1, 2] {
            let err = resolve_spec("cache1", "default", &spec(Some(3), Some(count))).unwrap_err();
            assert!(matches!(err, Error::ConfigurationError(_)), "count {}", count);
        }
    }

    #[test]
    fn test_disabled_sentinel_tier_resolves_to_zero() {
        let mut s = spec(Some(1), Some(1));
        s.sentinel.enabled = Some(false);
        let cfg = resolve_spec("cache1", "default", &s).unwrap();
        assert_eq!(cfg.sentinel.replicas, 0);
        assert!(!cfg.sentinel.enabled());
        assert!(cfg.leader.enabled());
    }

    #[test]
    fn test_even_sentinel_count_warns() {
        let cfg = resolve_spec("cache1", "default", &spec(Some(3), Some(4))).unwrap();
        assert_eq!(cfg.sentinel.replicas, 4);
        assert_eq!(cfg.warnings.len(), 1);
    }

    #[test]
    fn test_replica_defaults() {
        let cfg = resolve_spec("cache1", "default", &spec(None, None)).unwrap();
        assert_eq!(cfg.leader.replicas, DEFAULT_LEADER_REPLICAS);
        assert_eq!(cfg.sentinel.replicas, DEFAULT_SENTINEL_REPLICAS);
    }

    #[test]
    fn test_resolve_replicas_without_default_is_zero() {
        assert_eq!(resolve_replicas(None, None).unwrap(), 0);
        assert_eq!(resolve_replicas(Some(2), Some(5)).unwrap(), 2);
        assert_eq!(resolve_replicas(None, Some(5)).unwrap(), 5);
        assert!(resolve_replicas(Some(-1), None).is_err());
    }

    #[test]
    fn test_negative_leader_count_is_rejected() {
        let err = resolve_spec("cache1", "default", &spec(Some(-2), Some(3))).unwrap_err();
        match err {
            Error::ConfigurationError(msg) => assert!(msg.starts_with("redis.replicas")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_default_probes_for_both_tiers() {
        let cfg = resolve_spec("cache1", "default", &spec(Some(3), Some(3))).unwrap();
        let expected = ProbePolicy {
            initial_delay_seconds: 1,
            timeout_seconds: 1,
            period_seconds: 10,
            success_threshold: 1,
            failure_threshold: 3,
        };
        for tier in Tier::ALL {
            assert_eq!(cfg.tier(tier).probes.liveness, expected);
            assert_eq!(cfg.tier(tier).probes.readiness, expected);
        }
    }

    #[test]
    fn test_partial_probe_override_keeps_other_defaults() {
        let mut s = spec(Some(3), Some(3));
        s.redis.liveness_probe = Some(Probe {
            period_seconds: Some(30),
            ..Default::default()
        });
        let cfg = resolve_spec("cache1", "default", &s).unwrap();
        assert_eq!(cfg.leader.probes.liveness.period_seconds, 30);
        assert_eq!(cfg.leader.probes.liveness.failure_threshold, 3);
        assert_eq!(cfg.leader.probes.readiness, ProbePolicy::default());
        assert_eq!(cfg.sentinel.probes.liveness, ProbePolicy::default());
    }

    #[test]
    fn test_invalid_probe_is_rejected() {
        let mut s = spec(Some(3), Some(3));
        s.sentinel.readiness_probe = Some(Probe {
            timeout_seconds: Some(0),
            ..Default::default()
        });
        assert!(resolve_spec("cache1", "default", &s).is_err());
    }

    #[test]
    fn test_master_name() {
        let cfg = resolve_spec("cache1", "default", &spec(Some(3), Some(3))).unwrap();
        assert_eq!(cfg.master_name, "cache1-master");
        assert!(!cfg.identity_unset);

        let cfg = resolve_spec("", "default", &spec(Some(3), Some(3))).unwrap();
        assert_eq!(cfg.master_name, "unknown-name-master");
        assert!(cfg.identity_unset);
    }

    #[test]
    fn test_sentinel_settings_defaults() {
        let cfg = resolve_spec("cache1", "default", &spec(Some(3), Some(5))).unwrap();
        assert_eq!(cfg.sentinel_settings.master_group_name, "cache1-master");
        assert_eq!(cfg.sentinel_settings.quorum, 3);
        assert_eq!(cfg.sentinel_settings.redis_port, 6379);
    }

    #[test]
    fn test_quorum_out_of_range_is_rejected() {
        let mut s = spec(Some(3), Some(3));
        s.sentinel.sentinel_config = Some(SentinelConfig {
            quorum: Some(4),
            ..Default::default()
        });
        assert!(resolve_spec("cache1", "default", &s).is_err());
    }

    #[test]
    fn test_malformed_tls_reference_is_rejected() {
        let mut s = spec(Some(3), Some(3));
        s.tls = Some(TlsConfig {
            secret_name: "Not_A_Secret".to_string(),
            ca: "ca.crt".to_string(),
            cert: "tls.crt".to_string(),
            key: "tls.key".to_string(),
        });
        assert!(matches!(
            resolve_spec("cache1", "default", &s),
            Err(Error::ConfigurationError(_))
        ));

        s.tls.as_mut().unwrap().secret_name = "redis-tls".to_string();
        assert!(resolve_spec("cache1", "default", &s).is_ok());
    }

    #[test]
    fn test_leader_image_and_resources_fallback() {
        let mut s = spec(Some(3), Some(3));
        s.resources = Some(ResourceRequirements::default());
        let cfg = resolve_spec("cache1", "default", &s).unwrap();
        assert_eq!(cfg.leader.image, "quay.io/opstree/redis:v7.0.12");
        assert_eq!(cfg.leader.resources, Some(ResourceRequirements::default()));
        assert_eq!(cfg.sentinel.resources, Some(ResourceRequirements::default()));

        s.redis.image = Some("redis:7.2".to_string());
        let cfg = resolve_spec("cache1", "default", &s).unwrap();
        assert_eq!(cfg.leader.image, "redis:7.2");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let s = spec(Some(3), Some(3));
        let a = resolve_spec("cache1", "default", &s).unwrap();
        let b = resolve_spec("cache1", "default", &s).unwrap();
        assert_eq!(a, b);
        assert!(!a.leader.template_hash.is_empty());
        assert_ne!(a.leader.template_hash, a.sentinel.template_hash);
    }
}
