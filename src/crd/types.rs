//! Shared types for RedisSentinel specifications
//!
//! These types are used across the CRD definitions and controller logic.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, EnvVar, PodSecurityContext, Toleration};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One role group of the managed topology
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Redis data pods; one of them holds the master role at any time
    Leader,
    /// Sentinel pods watching the leader tier and electing its master
    Sentinel,
}

impl Tier {
    /// Both tiers, in reconciliation order
    pub const ALL: [Tier; 2] = [Tier::Leader, Tier::Sentinel];

    /// Suffix used for the tier's workload and service names
    pub fn suffix(&self) -> &'static str {
        match self {
            Tier::Leader => "redis",
            Tier::Sentinel => "sentinel",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Leader => write!(f, "leader"),
            Tier::Sentinel => write!(f, "sentinel"),
        }
    }
}

/// Replication role of a leader-tier pod, as written to its role label
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Master,
    Replica,
}

impl Role {
    /// Label value understood by the master Service selector
    pub fn label_value(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Replica => "slave",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "master" => Some(Role::Master),
            "slave" | "replica" => Some(Role::Replica),
            _ => None,
        }
    }
}

/// Pod-level settings shared by both tiers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    /// Redis container image (e.g., "quay.io/opstree/redis:v7.0.12")
    pub image: String,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Resources for the Redis container, unless overridden per tier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Names of Secrets used to pull images
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

/// Kubernetes-style resource requirements
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Minimum resources requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceSpec>,
    /// Maximum resources allowed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,
}

/// Resource specification for CPU and memory
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResourceSpec {
    /// CPU cores (e.g., "100m", "1")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory (e.g., "128Mi", "1Gi")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Probe override; unset fields keep the operator defaults
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
}

/// Redis leader tier configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisLeader {
    /// Number of Redis pods (one master, the rest replicas)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Image override for this tier; defaults to kubernetesConfig.image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,

    /// Extra redis.conf content, supplied through a ConfigMap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_config: Option<RedisConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub affinity: Option<Affinity>,

    /// PodDisruptionBudget for the leader tier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdb: Option<DisruptionBudget>,
}

/// Reference to additional redis.conf directives
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    /// Name of a ConfigMap holding `redis-additional.conf`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_redis_config: Option<String>,
}

/// PodDisruptionBudget settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudget {
    #[serde(default)]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_available: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
}

/// Sentinel tier configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sentinel {
    /// Number of sentinel pods (minimum 3 unless the tier is disabled)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Set to false to run without a sentinel tier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Sentinel container image
    #[serde(default)]
    pub image: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(rename = "env", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<serde_json::Value>>")]
    pub env_vars: Option<Vec<EnvVar>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentinel_config: Option<SentinelConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub affinity: Option<Affinity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
}

/// Parameters rendered into each sentinel's `sentinel monitor` setup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SentinelConfig {
    /// Monitored master group name; defaults to `<name>-master`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_group_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_port: Option<i32>,

    /// Sentinels that must agree a master is down; defaults to a majority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quorum: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_syncs: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failover_timeout: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub down_after_milliseconds: Option<i64>,
}

/// Prometheus exporter sidecar for the leader tier
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisExporter {
    #[serde(default)]
    pub enabled: bool,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "env", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<serde_json::Value>>")]
    pub env_vars: Option<Vec<EnvVar>>,
}

/// Storage for the leader tier; omitted means ephemeral `emptyDir`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    pub volume_claim_template: VolumeClaimConfig,
    /// Keep PVCs when the resource is deleted
    #[serde(default)]
    pub keep_after_delete: bool,
}

/// Subset of a PersistentVolumeClaim template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimConfig {
    /// Requested size (e.g., "1Gi")
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
}

/// TLS material for Redis and Sentinel connections
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Secret containing the certificate, key and CA
    pub secret_name: String,
    #[serde(default = "default_ca_key")]
    pub ca: String,
    #[serde(default = "default_cert_key")]
    pub cert: String,
    #[serde(default = "default_key_key")]
    pub key: String,
}

fn default_ca_key() -> String {
    "ca.crt".to_string()
}

fn default_cert_key() -> String {
    "tls.crt".to_string()
}

fn default_key_key() -> String {
    "tls.key".to_string()
}

/// Extra container appended to every leader pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    pub name: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "env", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<serde_json::Value>>")]
    pub env_vars: Option<Vec<EnvVar>>,
}

/// Scheduling knobs applied to both tiers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scheduling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<serde_json::Value>>")]
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub security_context: Option<PodSecurityContext>,
}

/// Condition for status reporting (Kubernetes convention)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "QuorumAgreement")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a new Ready condition
    pub fn ready(status: bool, reason: &str, message: &str) -> Self {
        Self::new("Ready", status, reason, message)
    }

    /// Keep the previous transition time when the status did not flip
    pub fn carry_transition_time(mut self, previous: &[Condition]) -> Self {
        if let Some(old) = previous
            .iter()
            .find(|c| c.type_ == self.type_ && c.status == self.status)
        {
            self.last_transition_time = old.last_transition_time.clone();
        }
        self
    }
}
