//! RedisSentinel Custom Resource Definition
//!
//! The RedisSentinel CRD describes a Redis leader tier monitored by a
//! Sentinel tier. Sentinel elects the master; the operator keeps the
//! Kubernetes objects and role labels consistent with that election.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, KubernetesConfig, RedisExporter, RedisLeader, ResourceRequirements, Scheduling,
    Sentinel, Sidecar, Storage, Tier, TlsConfig,
};

/// Master group name used when the resource has no name
pub const UNKNOWN_MASTER_NAME: &str = "unknown-name-master";

/// The RedisSentinel CRD represents a Sentinel-monitored Redis deployment.
///
/// # Example
///
/// ```yaml
/// apiVersion: redis.redis.opstreelabs.in/v1beta1
/// kind: RedisSentinel
/// metadata:
///   name: cache1
/// spec:
///   kubernetesConfig:
///     image: quay.io/opstree/redis:v7.0.12
///   redis:
///     replicas: 3
///   sentinel:
///     replicas: 3
///     image: quay.io/opstree/redis-sentinel:v7.0.12
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "redis.redis.opstreelabs.in",
    version = "v1beta1",
    kind = "RedisSentinel",
    namespaced,
    status = "RedisSentinelStatus",
    shortname = "rsen",
    printcolumn = r#"{"name":"LeaderReplicas","type":"integer","jsonPath":".spec.redis.replicas","description":"Overridden leader replica count"}"#,
    printcolumn = r#"{"name":"SentinelReplicas","type":"integer","jsonPath":".spec.sentinel.replicas","description":"Overridden sentinel replica count"}"#,
    printcolumn = r#"{"name":"Master","type":"string","jsonPath":".status.master"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RedisSentinelSpec {
    pub kubernetes_config: KubernetesConfig,

    /// Leader tier
    #[serde(default)]
    pub redis: RedisLeader,

    /// Sentinel tier
    #[serde(default)]
    pub sentinel: Sentinel,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_exporter: Option<RedisExporter>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,

    #[serde(flatten)]
    pub scheduling: Scheduling,

    /// Fallback resources for both tiers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(rename = "TLS", skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Containers appended, in order, to every leader pod
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sidecars: Option<Vec<Sidecar>>,
}

impl RedisSentinelSpec {
    /// Raw per-tier replica override, 0 when unset
    pub fn replica_count(&self, tier: Tier) -> i32 {
        match tier {
            Tier::Leader => self.redis.replicas.unwrap_or(0),
            Tier::Sentinel => self.sentinel.replicas.unwrap_or(0),
        }
    }

    /// Whether the sentinel tier was switched off explicitly
    pub fn sentinel_disabled(&self) -> bool {
        self.sentinel.enabled == Some(false)
    }

    /// Structural checks that do not need defaulting
    pub fn validate(&self) -> Result<(), String> {
        if self.kubernetes_config.image.trim().is_empty() {
            return Err("kubernetesConfig.image must not be empty".to_string());
        }

        if !self.sentinel_disabled() && self.sentinel.image.trim().is_empty() {
            return Err("sentinel.image must not be empty".to_string());
        }

        if let Some(storage) = &self.storage {
            if storage.volume_claim_template.size.trim().is_empty() {
                return Err("storage.volumeClaimTemplate.size must not be empty".to_string());
            }
        }

        if let Some(exporter) = &self.redis_exporter {
            if exporter.enabled && exporter.image.trim().is_empty() {
                return Err("redisExporter.image must not be empty when enabled".to_string());
            }
        }

        if let Some(sidecars) = &self.sidecars {
            let mut seen = std::collections::BTreeSet::new();
            for (i, sidecar) in sidecars.iter().enumerate() {
                if sidecar.name.trim().is_empty() {
                    return Err(format!("sidecars[{}].name must not be empty", i));
                }
                if sidecar.image.trim().is_empty() {
                    return Err(format!("sidecars[{}].image must not be empty", i));
                }
                if !seen.insert(sidecar.name.as_str()) {
                    return Err(format!("sidecars[{}].name {} is duplicated", i, sidecar.name));
                }
            }
        }

        if let Some(pdb) = &self.redis.pdb {
            if pdb.enabled && pdb.min_available.is_some() && pdb.max_unavailable.is_some() {
                return Err(
                    "redis.pdb accepts either minAvailable or maxUnavailable, not both"
                        .to_string(),
                );
            }
        }

        Ok(())
    }
}

impl RedisSentinel {
    /// Stable logical handle for the master, independent of which pod holds it
    pub fn master_name(&self) -> String {
        master_name_for(self.metadata.name.as_deref().unwrap_or_default())
    }
}

/// `{name}-master`, or the unknown-name literal for an empty name
pub fn master_name_for(name: &str) -> String {
    if name.is_empty() {
        return UNKNOWN_MASTER_NAME.to_string();
    }
    format!("{}-master", name)
}

/// Status subresource for RedisSentinel
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisSentinelStatus {
    /// Current phase (Pending, Provisioning, Converging, FailoverPending, Ready, Failed)
    #[serde(default)]
    pub phase: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Leader pod last acknowledged as master
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Address reported by the sentinels for the acknowledged master
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_address: Option<String>,

    #[serde(default)]
    pub quorum_agreement: bool,

    #[serde(default)]
    pub leader_ready_replicas: i32,

    #[serde(default)]
    pub sentinel_ready_replicas: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_state: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentinel_state: Option<String>,

    /// Category of the most recent error, cleared on a clean pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_category: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Number of master changes acknowledged so far
    #[serde(default)]
    pub failover_count: i64,
}
