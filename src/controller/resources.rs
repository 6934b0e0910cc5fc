//! Kubernetes resource builders for RedisSentinel
//!
//! This module creates and manages the underlying Kubernetes resources
//! (StatefulSets, Services, ConfigMaps, PodDisruptionBudgets, PVCs) for each
//! tier of a RedisSentinel.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapKeySelector, ConfigMapVolumeSource, Container, ContainerPort,
    EmptyDirVolumeSource, EnvVar, EnvVarSource, ExecAction, LocalObjectReference,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
    Probe as K8sProbe, ResourceRequirements as K8sResources, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::crd::{RedisSentinel, ResourceRequirements, Role, Tier};
use crate::error::{Error, Result};

use super::config::{EffectiveConfig, ProbePolicy, TierConfig, SENTINEL_PORT};

pub const FIELD_MANAGER: &str = "redis-sentinel-operator";

/// Pod label carrying the replication role of a leader pod
pub const ROLE_LABEL: &str = "redis-role";

/// Digest of the pod template, on the StatefulSet and on every pod it creates
pub const TEMPLATE_HASH_ANNOTATION: &str = "redis.opstreelabs.in/template-hash";

/// Digest of the pod template ignoring container images
pub const SHAPE_HASH_ANNOTATION: &str = "redis.opstreelabs.in/shape-hash";

pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub const REDIS_CONTAINER: &str = "redis";
pub const SENTINEL_CONTAINER: &str = "sentinel";
const EXPORTER_PORT: i32 = 9121;

// ConfigMap keys shared by the sentinel and leader pods
pub const MASTER_HOST_KEY: &str = "master-host";
const MASTER_PORT_KEY: &str = "master-port";
const MASTER_GROUP_KEY: &str = "master-group-name";
const QUORUM_KEY: &str = "quorum";
const PARALLEL_SYNCS_KEY: &str = "parallel-syncs";
const FAILOVER_TIMEOUT_KEY: &str = "failover-timeout";
const DOWN_AFTER_KEY: &str = "down-after-milliseconds";

/// Selector labels for one tier; stable for the lifetime of the workload
pub fn selector_labels(name: &str, tier: Tier) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(NAME_LABEL.to_string(), "redis-sentinel".to_string());
    labels.insert(INSTANCE_LABEL.to_string(), name.to_string());
    labels.insert(COMPONENT_LABEL.to_string(), tier.suffix().to_string());
    labels
}

/// Get the standard labels for a tier's resources
fn standard_labels(name: &str, tier: Tier) -> BTreeMap<String, String> {
    let mut labels = selector_labels(name, tier);
    labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    labels
}

/// Label selector string used to list a tier's pods
pub fn tier_selector(name: &str, tier: Tier) -> String {
    selector_labels(name, tier)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Create an OwnerReference for garbage collection
fn owner_reference(resource: &RedisSentinel) -> OwnerReference {
    OwnerReference {
        api_version: RedisSentinel::api_version(&()).to_string(),
        kind: RedisSentinel::kind(&()).to_string(),
        name: resource.name_any(),
        uid: resource.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn object_meta(resource: &RedisSentinel, cfg: &EffectiveConfig, name: String, tier: Tier) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(cfg.namespace.clone()),
        labels: Some(standard_labels(&cfg.name, tier)),
        owner_references: Some(vec![owner_reference(resource)]),
        ..Default::default()
    }
}

pub fn workload_name(name: &str, tier: Tier) -> String {
    format!("{}-{}", name, tier.suffix())
}

pub fn headless_service_name(name: &str, tier: Tier) -> String {
    format!("{}-{}-headless", name, tier.suffix())
}

pub fn master_service_name(name: &str) -> String {
    format!("{}-redis-master", name)
}

pub fn sentinel_config_name(name: &str) -> String {
    format!("{}-sentinel-config", name)
}

/// Stable DNS name of a leader pod through the headless Service
pub fn leader_pod_fqdn(cfg: &EffectiveConfig, pod_name: &str) -> String {
    format!(
        "{}.{}.{}.svc",
        pod_name,
        headless_service_name(&cfg.name, Tier::Leader),
        cfg.namespace
    )
}

/// Leader pod Sentinel is pointed at before any master has been acknowledged
pub fn bootstrap_master_pod(name: &str) -> String {
    format!("{}-0", workload_name(name, Tier::Leader))
}

/// Digest of a rendered pod template
pub fn template_hash(template: &PodTemplateSpec) -> String {
    let bytes = serde_json::to_vec(template).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{:x}", digest)[..16].to_string()
}

/// Digest of a pod template with every container image blanked
///
/// Two templates with equal shape hashes differ at most in their images,
/// which Kubernetes lets us patch on a running pod.
pub fn shape_hash(template: &PodTemplateSpec) -> String {
    let mut template = template.clone();
    if let Some(spec) = template.spec.as_mut() {
        for container in spec.containers.iter_mut() {
            container.image = None;
        }
    }
    template_hash(&template)
}

/// Container name and image pairs of a rendered template
pub fn container_images(template: &PodTemplateSpec) -> Vec<(String, String)> {
    template
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .filter_map(|c| c.image.clone().map(|image| (c.name.clone(), image)))
        .collect()
}

// ============================================================================
// Pod Template Builder
// ============================================================================

/// Render the pod template of a tier from its effective configuration
pub fn build_pod_template(cfg: &EffectiveConfig, tier: Tier) -> PodTemplateSpec {
    let tier_cfg = cfg.tier(tier);
    let spec = &cfg.spec;

    let mut containers = match tier {
        Tier::Leader => vec![build_redis_container(cfg, tier_cfg)],
        Tier::Sentinel => vec![build_sentinel_container(cfg, tier_cfg)],
    };

    let mut volumes = Vec::new();

    if tier == Tier::Leader {
        if let Some(exporter) = spec.redis_exporter.as_ref().filter(|e| e.enabled) {
            containers.push(Container {
                name: "redis-exporter".to_string(),
                image: Some(exporter.image.clone()),
                image_pull_policy: exporter.image_pull_policy.clone(),
                env: exporter.env_vars.clone(),
                ports: Some(vec![ContainerPort {
                    name: Some("metrics".to_string()),
                    container_port: EXPORTER_PORT,
                    ..Default::default()
                }]),
                resources: exporter.resources.as_ref().map(to_k8s_resources),
                ..Default::default()
            });
        }

        for sidecar in spec.sidecars.iter().flatten() {
            containers.push(Container {
                name: sidecar.name.clone(),
                image: Some(sidecar.image.clone()),
                image_pull_policy: sidecar.image_pull_policy.clone(),
                env: sidecar.env_vars.clone(),
                resources: sidecar.resources.as_ref().map(to_k8s_resources),
                ..Default::default()
            });
        }

        if !cfg.persistent_storage() {
            volumes.push(Volume {
                name: "data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }

        if let Some(extra) = spec
            .redis
            .redis_config
            .as_ref()
            .and_then(|c| c.additional_redis_config.clone())
        {
            volumes.push(Volume {
                name: "external-config".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(extra),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }

    if let Some(tls) = &cfg.tls {
        volumes.push(Volume {
            name: "tls-certs".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(tls.secret_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let affinity = match tier {
        Tier::Leader => spec.redis.affinity.clone(),
        Tier::Sentinel => spec.sentinel.affinity.clone(),
    };

    let image_pull_secrets = if spec.kubernetes_config.image_pull_secrets.is_empty() {
        None
    } else {
        Some(
            spec.kubernetes_config
                .image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference {
                    name: Some(name.clone()),
                })
                .collect(),
        )
    };

    // Hashes are computed over the template without these annotations
    let annotations = if tier_cfg.template_hash.is_empty() {
        None
    } else {
        Some(BTreeMap::from([
            (TEMPLATE_HASH_ANNOTATION.to_string(), tier_cfg.template_hash.clone()),
            (SHAPE_HASH_ANNOTATION.to_string(), tier_cfg.shape_hash.clone()),
        ]))
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(standard_labels(&cfg.name, tier)),
            annotations,
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            affinity,
            node_selector: spec.scheduling.node_selector.clone(),
            tolerations: spec.scheduling.tolerations.clone(),
            priority_class_name: spec.scheduling.priority_class_name.clone(),
            security_context: spec.scheduling.security_context.clone(),
            image_pull_secrets,
            ..Default::default()
        }),
    }
}

fn build_redis_container(cfg: &EffectiveConfig, tier_cfg: &TierConfig) -> Container {
    let port = cfg.sentinel_settings.redis_port;

    let mut env = vec![
        plain_env("SETUP_MODE", "sentinel"),
        plain_env("REDIS_PORT", &port.to_string()),
        plain_env("MASTER_GROUP_NAME", &cfg.sentinel_settings.master_group_name),
        config_map_env(cfg, "REDIS_MASTER_HOST", MASTER_HOST_KEY),
    ];
    env.extend(tls_env(cfg));

    let mut volume_mounts = vec![VolumeMount {
        name: "data".to_string(),
        mount_path: "/data".to_string(),
        ..Default::default()
    }];
    if cfg
        .spec
        .redis
        .redis_config
        .as_ref()
        .and_then(|c| c.additional_redis_config.as_ref())
        .is_some()
    {
        volume_mounts.push(VolumeMount {
            name: "external-config".to_string(),
            mount_path: "/etc/redis/external.conf.d".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    if cfg.tls.is_some() {
        volume_mounts.push(tls_mount());
    }

    Container {
        name: REDIS_CONTAINER.to_string(),
        image: Some(tier_cfg.image.clone()),
        image_pull_policy: tier_cfg.image_pull_policy.clone(),
        ports: Some(vec![ContainerPort {
            name: Some("redis".to_string()),
            container_port: port,
            ..Default::default()
        }]),
        env: Some(env),
        resources: tier_cfg.resources.as_ref().map(to_k8s_resources),
        liveness_probe: Some(build_probe(&tier_cfg.probes.liveness, cfg, port)),
        readiness_probe: Some(build_probe(&tier_cfg.probes.readiness, cfg, port)),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

fn build_sentinel_container(cfg: &EffectiveConfig, tier_cfg: &TierConfig) -> Container {
    let mut env = vec![
        config_map_env(cfg, "MASTER_GROUP_NAME", MASTER_GROUP_KEY),
        config_map_env(cfg, "IP", MASTER_HOST_KEY),
        config_map_env(cfg, "PORT", MASTER_PORT_KEY),
        config_map_env(cfg, "QUORUM", QUORUM_KEY),
        config_map_env(cfg, "PARALLEL_SYNCS", PARALLEL_SYNCS_KEY),
        config_map_env(cfg, "FAILOVER_TIMEOUT", FAILOVER_TIMEOUT_KEY),
        config_map_env(cfg, "DOWN_AFTER_MILLISECONDS", DOWN_AFTER_KEY),
    ];
    env.extend(tls_env(cfg));
    env.extend(cfg.spec.sentinel.env_vars.clone().unwrap_or_default());

    Container {
        name: SENTINEL_CONTAINER.to_string(),
        image: Some(tier_cfg.image.clone()),
        image_pull_policy: tier_cfg.image_pull_policy.clone(),
        ports: Some(vec![ContainerPort {
            name: Some("sentinel".to_string()),
            container_port: SENTINEL_PORT,
            ..Default::default()
        }]),
        env: Some(env),
        resources: tier_cfg.resources.as_ref().map(to_k8s_resources),
        liveness_probe: Some(build_probe(&tier_cfg.probes.liveness, cfg, SENTINEL_PORT)),
        readiness_probe: Some(build_probe(&tier_cfg.probes.readiness, cfg, SENTINEL_PORT)),
        volume_mounts: cfg.tls.as_ref().map(|_| vec![tls_mount()]),
        ..Default::default()
    }
}

fn build_probe(policy: &ProbePolicy, cfg: &EffectiveConfig, port: i32) -> K8sProbe {
    let mut command = format!("redis-cli -p {}", port);
    if let Some(tls) = &cfg.tls {
        command.push_str(&format!(
            " --tls --cacert /tls/{} --cert /tls/{} --key /tls/{}",
            tls.ca, tls.cert, tls.key
        ));
    }
    command.push_str(" ping");

    K8sProbe {
        exec: Some(ExecAction {
            command: Some(vec!["sh".to_string(), "-c".to_string(), command]),
        }),
        initial_delay_seconds: Some(policy.initial_delay_seconds),
        timeout_seconds: Some(policy.timeout_seconds),
        period_seconds: Some(policy.period_seconds),
        success_threshold: Some(policy.success_threshold),
        failure_threshold: Some(policy.failure_threshold),
        ..Default::default()
    }
}

/// Read a probe policy back from a live container probe
pub fn probe_policy_of(probe: Option<&K8sProbe>) -> Option<ProbePolicy> {
    let probe = probe?;
    Some(ProbePolicy {
        initial_delay_seconds: probe.initial_delay_seconds.unwrap_or(0),
        timeout_seconds: probe.timeout_seconds.unwrap_or(1),
        period_seconds: probe.period_seconds.unwrap_or(10),
        success_threshold: probe.success_threshold.unwrap_or(1),
        failure_threshold: probe.failure_threshold.unwrap_or(3),
    })
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn config_map_env(cfg: &EffectiveConfig, name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                name: Some(sentinel_config_name(&cfg.name)),
                key: key.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
    }
}

fn tls_env(cfg: &EffectiveConfig) -> Vec<EnvVar> {
    match &cfg.tls {
        Some(tls) => vec![
            plain_env("TLS_MODE", "true"),
            plain_env("REDIS_TLS_CA_KEY", &format!("/tls/{}", tls.ca)),
            plain_env("REDIS_TLS_CERT", &format!("/tls/{}", tls.cert)),
            plain_env("REDIS_TLS_CERT_KEY", &format!("/tls/{}", tls.key)),
        ],
        None => Vec::new(),
    }
}

fn tls_mount() -> VolumeMount {
    VolumeMount {
        name: "tls-certs".to_string(),
        mount_path: "/tls".to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Convert the CRD resource shape into the Kubernetes one
pub fn to_k8s_resources(resources: &ResourceRequirements) -> K8sResources {
    fn quantities(spec: &crate::crd::ResourceSpec) -> BTreeMap<String, Quantity> {
        let mut map = BTreeMap::new();
        if let Some(cpu) = &spec.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &spec.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        map
    }

    K8sResources {
        requests: resources.requests.as_ref().map(quantities),
        limits: resources.limits.as_ref().map(quantities),
        claims: None,
    }
}

// ============================================================================
// StatefulSet
// ============================================================================

/// Build the StatefulSet of a tier with the desired replica count
pub fn build_statefulset(resource: &RedisSentinel, cfg: &EffectiveConfig, tier: Tier) -> StatefulSet {
    let tier_cfg = cfg.tier(tier);
    let name = workload_name(&cfg.name, tier);

    let mut metadata = object_meta(resource, cfg, name, tier);
    metadata.annotations = Some(BTreeMap::from([(
        TEMPLATE_HASH_ANNOTATION.to_string(),
        tier_cfg.template_hash.clone(),
    )]));

    let volume_claim_templates = match (&cfg.spec.storage, tier) {
        (Some(storage), Tier::Leader) => {
            let claim = &storage.volume_claim_template;
            let access_modes = if claim.access_modes.is_empty() {
                vec!["ReadWriteOnce".to_string()]
            } else {
                claim.access_modes.clone()
            };
            Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("data".to_string()),
                    labels: Some(standard_labels(&cfg.name, tier)),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(access_modes),
                    storage_class_name: claim.storage_class_name.clone(),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(claim.size.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                status: None,
            }])
        }
        _ => None,
    };

    StatefulSet {
        metadata,
        spec: Some(StatefulSetSpec {
            replicas: Some(tier_cfg.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&cfg.name, tier)),
                ..Default::default()
            },
            service_name: headless_service_name(&cfg.name, tier),
            template: build_pod_template(cfg, tier),
            // Pods are rolled by the reconciler, one at a time, replicas first
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                ..Default::default()
            }),
            pod_management_policy: Some("Parallel".to_string()),
            volume_claim_templates,
            ..Default::default()
        }),
        status: None,
    }
}

/// Server-side apply the StatefulSet of a tier
pub async fn apply_statefulset(
    client: &Client,
    resource: &RedisSentinel,
    cfg: &EffectiveConfig,
    tier: Tier,
) -> Result<()> {
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), &cfg.namespace);
    let name = workload_name(&cfg.name, tier);
    let statefulset = build_statefulset(resource, cfg, tier);

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&statefulset),
    )
    .await?;

    info!(
        "StatefulSet {}/{} applied with {} replicas",
        cfg.namespace,
        name,
        cfg.tier(tier).replicas
    );
    Ok(())
}

/// Delete the StatefulSet of a tier
pub async fn delete_statefulset(client: &Client, namespace: &str, name: &str, tier: Tier) -> Result<()> {
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    delete_ignoring_missing(&api, &workload_name(name, tier), "StatefulSet").await
}

// ============================================================================
// Services
// ============================================================================

/// Headless Service giving each pod of a tier a stable DNS name
pub fn build_headless_service(resource: &RedisSentinel, cfg: &EffectiveConfig, tier: Tier) -> Service {
    let port = match tier {
        Tier::Leader => cfg.sentinel_settings.redis_port,
        Tier::Sentinel => SENTINEL_PORT,
    };

    Service {
        metadata: object_meta(resource, cfg, headless_service_name(&cfg.name, tier), tier),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(selector_labels(&cfg.name, tier)),
            ports: Some(vec![service_port(tier.suffix(), port)]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Service routing to whichever leader pod carries the master role label
pub fn build_master_service(resource: &RedisSentinel, cfg: &EffectiveConfig) -> Service {
    let mut selector = selector_labels(&cfg.name, Tier::Leader);
    selector.insert(ROLE_LABEL.to_string(), Role::Master.label_value().to_string());

    Service {
        metadata: object_meta(resource, cfg, master_service_name(&cfg.name), Tier::Leader),
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![service_port("redis", cfg.sentinel_settings.redis_port)]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Client-facing Service for sentinel discovery
pub fn build_sentinel_service(resource: &RedisSentinel, cfg: &EffectiveConfig) -> Service {
    Service {
        metadata: object_meta(resource, cfg, workload_name(&cfg.name, Tier::Sentinel), Tier::Sentinel),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&cfg.name, Tier::Sentinel)),
            ports: Some(vec![service_port("sentinel", SENTINEL_PORT)]),
            ..Default::default()
        }),
        status: None,
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

/// Services expected for the enabled tiers
pub fn desired_services(resource: &RedisSentinel, cfg: &EffectiveConfig) -> Vec<Service> {
    let mut services = Vec::new();
    if cfg.leader.enabled() {
        services.push(build_headless_service(resource, cfg, Tier::Leader));
        services.push(build_master_service(resource, cfg));
    }
    if cfg.sentinel.enabled() {
        services.push(build_headless_service(resource, cfg, Tier::Sentinel));
        services.push(build_sentinel_service(resource, cfg));
    }
    services
}

/// Ensure the Services of all enabled tiers exist
pub async fn ensure_services(client: &Client, resource: &RedisSentinel, cfg: &EffectiveConfig) -> Result<()> {
    let api: Api<Service> = Api::namespaced(client.clone(), &cfg.namespace);

    for service in desired_services(resource, cfg) {
        let name = service.name_any();
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&service),
        )
        .await?;
        debug!("Service {}/{} ensured", cfg.namespace, name);
    }

    Ok(())
}

/// Delete every Service owned by the resource
pub async fn delete_services(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let services = [
        headless_service_name(name, Tier::Leader),
        master_service_name(name),
        headless_service_name(name, Tier::Sentinel),
        workload_name(name, Tier::Sentinel),
    ];
    for service in services {
        delete_ignoring_missing(&api, &service, "Service").await?;
    }
    Ok(())
}

// ============================================================================
// Sentinel ConfigMap
// ============================================================================

/// ConfigMap with the monitor parameters and the current master host
pub fn build_sentinel_config_map(
    resource: &RedisSentinel,
    cfg: &EffectiveConfig,
    master_host: &str,
) -> ConfigMap {
    let settings = &cfg.sentinel_settings;
    let data = BTreeMap::from([
        (MASTER_HOST_KEY.to_string(), master_host.to_string()),
        (MASTER_PORT_KEY.to_string(), settings.redis_port.to_string()),
        (MASTER_GROUP_KEY.to_string(), settings.master_group_name.clone()),
        (QUORUM_KEY.to_string(), settings.quorum.to_string()),
        (PARALLEL_SYNCS_KEY.to_string(), settings.parallel_syncs.to_string()),
        (FAILOVER_TIMEOUT_KEY.to_string(), settings.failover_timeout.to_string()),
        (DOWN_AFTER_KEY.to_string(), settings.down_after_milliseconds.to_string()),
    ]);

    ConfigMap {
        metadata: object_meta(resource, cfg, sentinel_config_name(&cfg.name), Tier::Sentinel),
        data: Some(data),
        ..Default::default()
    }
}

/// Ensure the sentinel ConfigMap points at `master_pod`
pub async fn ensure_sentinel_config_map(
    client: &Client,
    resource: &RedisSentinel,
    cfg: &EffectiveConfig,
    master_pod: &str,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &cfg.namespace);
    let name = sentinel_config_name(&cfg.name);
    let cm = build_sentinel_config_map(resource, cfg, &leader_pod_fqdn(cfg, master_pod));

    api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&cm))
        .await?;

    debug!("ConfigMap {}/{} points at {}", cfg.namespace, name, master_pod);
    Ok(())
}

/// Delete the sentinel ConfigMap
pub async fn delete_sentinel_config_map(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    delete_ignoring_missing(&api, &sentinel_config_name(name), "ConfigMap").await
}

// ============================================================================
// PodDisruptionBudget
// ============================================================================

/// Build the PDB of a tier, if one is wanted
///
/// The sentinel tier always gets one allowing a single voluntary disruption
/// so that node drains cannot take the quorum down.
pub fn build_pdb(resource: &RedisSentinel, cfg: &EffectiveConfig, tier: Tier) -> Option<PodDisruptionBudget> {
    if !cfg.tier(tier).enabled() {
        return None;
    }

    let (min_available, max_unavailable) = match tier {
        Tier::Leader => {
            let pdb = cfg.spec.redis.pdb.as_ref().filter(|p| p.enabled)?;
            match (pdb.min_available, pdb.max_unavailable) {
                (Some(min), _) => (Some(IntOrString::Int(min)), None),
                (None, Some(max)) => (None, Some(IntOrString::Int(max))),
                (None, None) => (None, Some(IntOrString::Int(1))),
            }
        }
        Tier::Sentinel => (None, Some(IntOrString::Int(1))),
    };

    Some(PodDisruptionBudget {
        metadata: object_meta(resource, cfg, workload_name(&cfg.name, tier), tier),
        spec: Some(PodDisruptionBudgetSpec {
            min_available,
            max_unavailable,
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(&cfg.name, tier)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Ensure PDBs match the configuration, removing ones no longer wanted
pub async fn ensure_pdbs(client: &Client, resource: &RedisSentinel, cfg: &EffectiveConfig) -> Result<()> {
    let api: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), &cfg.namespace);

    for tier in Tier::ALL {
        let name = workload_name(&cfg.name, tier);
        match build_pdb(resource, cfg, tier) {
            Some(pdb) => {
                api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&pdb))
                    .await?;
            }
            None => delete_ignoring_missing(&api, &name, "PodDisruptionBudget").await?,
        }
    }

    Ok(())
}

/// Delete the PDBs of both tiers
pub async fn delete_pdbs(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let api: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), namespace);
    for tier in Tier::ALL {
        delete_ignoring_missing(&api, &workload_name(name, tier), "PodDisruptionBudget").await?;
    }
    Ok(())
}

// ============================================================================
// PersistentVolumeClaims
// ============================================================================

/// Delete the leader tier's PVCs unless the storage policy keeps them
pub async fn delete_pvcs(client: &Client, resource: &RedisSentinel) -> Result<()> {
    let Some(storage) = &resource.spec.storage else {
        return Ok(());
    };
    let namespace = resource.namespace().unwrap_or_else(|| "default".to_string());
    let name = resource.name_any();
    if storage.keep_after_delete {
        info!("Retaining PVCs for {}/{} (keepAfterDelete)", namespace, name);
        return Ok(());
    }

    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &namespace);
    let pvcs = api
        .list(&ListParams::default().labels(&tier_selector(&name, Tier::Leader)))
        .await?;

    for pvc in pvcs.items {
        delete_ignoring_missing(&api, &pvc.name_any(), "PersistentVolumeClaim").await?;
    }

    Ok(())
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str, kind: &str) -> Result<()>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => info!("Deleted {} {}", kind, name),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!("{} {} not found, already deleted", kind, name);
        }
        Err(e) => {
            warn!("Failed to delete {} {}: {}", kind, name, e);
            return Err(Error::KubeError(e));
        }
    }
    Ok(())
}
