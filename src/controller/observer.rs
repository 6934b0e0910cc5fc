//! Cluster state observer
//!
//! Builds an [`ObservedTopology`] snapshot: the live pods of each tier read
//! from Kubernetes, and the master elected by the Sentinel quorum as seen by
//! a majority vote over every reachable sentinel.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::{join_all, try_join};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, ResourceRequirements as K8sResources};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::{ResourceRequirements, ResourceSpec, Role, Tier};
use crate::error::{Error, Result};

use super::config::{EffectiveConfig, ProbePolicy};
use super::resources::{
    self, probe_policy_of, REDIS_CONTAINER, ROLE_LABEL, SENTINEL_CONTAINER,
    SHAPE_HASH_ANNOTATION, TEMPLATE_HASH_ANNOTATION,
};
use super::sentinel_client::{MasterAddr, SentinelQuery};

/// One live pod of a tier
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedInstance {
    pub name: String,
    pub ip: Option<String>,
    pub ready: bool,
    /// Deletion already requested
    pub terminating: bool,
    /// Value of the role label, leader tier only
    pub role: Option<Role>,
    pub template_hash: Option<String>,
    pub shape_hash: Option<String>,
    pub liveness: Option<ProbePolicy>,
    pub readiness: Option<ProbePolicy>,
    pub resources: Option<ResourceRequirements>,
}

/// Live state of one tier
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedTier {
    /// Replicas declared on the StatefulSet, `None` when it does not exist
    pub workload_replicas: Option<i32>,
    /// Template hash annotation of the StatefulSet
    pub template_hash: Option<String>,
    /// Sorted by name
    pub instances: Vec<ObservedInstance>,
}

impl ObservedTier {
    /// Pods not on their way out
    pub fn live(&self) -> impl Iterator<Item = &ObservedInstance> {
        self.instances.iter().filter(|i| !i.terminating)
    }

    pub fn live_count(&self) -> i32 {
        self.live().count() as i32
    }

    pub fn ready_count(&self) -> i32 {
        self.live().filter(|i| i.ready).count() as i32
    }
}

/// Answer of a single sentinel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Vote {
    /// Leader pod name, or the raw address when no pod matches it
    Master { identity: String, address: String },
    /// Reachable, but the group is unknown to it
    Unknown,
    Unreachable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentinelVote {
    pub sentinel: String,
    pub vote: Vote,
}

/// Snapshot of the live topology, rebuilt every pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedTopology {
    pub leader: ObservedTier,
    pub sentinel: ObservedTier,
    /// Master elected by a strict majority of the responding sentinels
    pub current_master: Option<String>,
    pub current_master_address: Option<String>,
    /// A majority view exists and enough sentinels were reachable to trust it
    pub quorum_agreement: bool,
    /// Master last acknowledged by the operator, from the resource status
    pub last_known_master: Option<String>,
    pub sentinel_reachable: usize,
    pub sentinel_total: usize,
    pub votes: Vec<SentinelVote>,
}

impl ObservedTopology {
    pub fn tier(&self, tier: Tier) -> &ObservedTier {
        match tier {
            Tier::Leader => &self.leader,
            Tier::Sentinel => &self.sentinel,
        }
    }

    /// The reported master is one of the live leader pods
    pub fn master_is_member(&self) -> bool {
        self.current_master
            .as_deref()
            .is_some_and(|m| self.leader.live().any(|i| i.name == m))
    }

    /// Quorum agrees on a master that we can map to a leader pod.
    /// Anything else is a failover in progress or a split brain.
    pub fn master_settled(&self) -> bool {
        self.quorum_agreement && self.master_is_member()
    }
}

/// How many sentinels must answer before a majority view is trusted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuorumPolicy {
    /// Fixed threshold; defaults to a strict majority of the sentinel tier
    pub min_reachable: Option<usize>,
}

impl QuorumPolicy {
    pub fn threshold(&self, desired: usize, observed: usize) -> usize {
        self.min_reachable
            .unwrap_or_else(|| desired.max(observed) / 2 + 1)
            .max(1)
    }
}

/// Outcome of the majority vote
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tally {
    pub winner: Option<(String, String)>,
    pub reachable: usize,
}

/// Majority vote over sentinel answers
///
/// Only reachable sentinels count as responses. The winner needs strictly
/// more than half of them; ties and scattered votes yield no winner.
pub fn tally_votes(votes: &[SentinelVote]) -> Tally {
    let mut counts: BTreeMap<&str, (usize, &str)> = BTreeMap::new();
    let mut reachable = 0;

    for vote in votes {
        match &vote.vote {
            Vote::Master { identity, address } => {
                reachable += 1;
                counts.entry(identity.as_str()).or_insert((0, address.as_str())).0 += 1;
            }
            Vote::Unknown => reachable += 1,
            Vote::Unreachable => {}
        }
    }

    let winner = counts
        .into_iter()
        .find(|(_, (count, _))| count * 2 > reachable)
        .map(|(identity, (_, address))| (identity.to_string(), address.to_string()));

    Tally { winner, reachable }
}

/// Read access to the live pods and workloads of a tier
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn observe_tier(&self, cfg: &EffectiveConfig, tier: Tier) -> Result<ObservedTier>;
}

/// [`TopologySource`] backed by the Kubernetes API
pub struct KubeTopologySource {
    client: Client,
}

impl KubeTopologySource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TopologySource for KubeTopologySource {
    async fn observe_tier(&self, cfg: &EffectiveConfig, tier: Tier) -> Result<ObservedTier> {
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &cfg.namespace);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &cfg.namespace);

        let workload = statefulsets
            .get_opt(&resources::workload_name(&cfg.name, tier))
            .await
            .map_err(|e| Error::RetryableError(format!("reading {} workload: {}", tier, e)))?;

        let pod_list = pods
            .list(&ListParams::default().labels(&resources::tier_selector(&cfg.name, tier)))
            .await
            .map_err(|e| Error::RetryableError(format!("listing {} pods: {}", tier, e)))?;

        let main_container = match tier {
            Tier::Leader => REDIS_CONTAINER,
            Tier::Sentinel => SENTINEL_CONTAINER,
        };

        let mut instances: Vec<_> = pod_list
            .items
            .iter()
            .map(|pod| instance_from_pod(pod, main_container))
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ObservedTier {
            workload_replicas: workload
                .as_ref()
                .map(|sts| sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)),
            template_hash: workload.as_ref().and_then(|sts| {
                sts.annotations().get(TEMPLATE_HASH_ANNOTATION).cloned()
            }),
            instances,
        })
    }
}

/// Check the Ready condition of a pod
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

pub fn instance_from_pod(pod: &Pod, main_container: &str) -> ObservedInstance {
    let container = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.iter().find(|c| c.name == main_container));
    let annotations = pod.annotations();

    ObservedInstance {
        name: pod.name_any(),
        ip: pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
        ready: is_pod_ready(pod),
        terminating: pod.metadata.deletion_timestamp.is_some(),
        role: pod.labels().get(ROLE_LABEL).and_then(|v| Role::from_label(v)),
        template_hash: annotations.get(TEMPLATE_HASH_ANNOTATION).cloned(),
        shape_hash: annotations.get(SHAPE_HASH_ANNOTATION).cloned(),
        liveness: container.and_then(|c| probe_policy_of(c.liveness_probe.as_ref())),
        readiness: container.and_then(|c| probe_policy_of(c.readiness_probe.as_ref())),
        resources: container.and_then(|c| resources_of(c.resources.as_ref())),
    }
}

fn resources_of(resources: Option<&K8sResources>) -> Option<ResourceRequirements> {
    let resources = resources?;
    let spec_of = |map: Option<&BTreeMap<String, Quantity>>| {
        map.filter(|m| !m.is_empty()).map(|m| ResourceSpec {
            cpu: m.get("cpu").map(|q| q.0.clone()),
            memory: m.get("memory").map(|q| q.0.clone()),
        })
    };
    let requirements = ResourceRequirements {
        requests: spec_of(resources.requests.as_ref()),
        limits: spec_of(resources.limits.as_ref()),
    };
    if requirements.requests.is_none() && requirements.limits.is_none() {
        None
    } else {
        Some(requirements)
    }
}

/// Map a reported address onto a leader pod, by IP or by pod DNS name
fn identify_master(addr: &MasterAddr, leader: &ObservedTier) -> String {
    leader
        .instances
        .iter()
        .find(|i| {
            i.ip.as_deref() == Some(addr.host.as_str())
                || addr.host == i.name
                || addr.host.starts_with(&format!("{}.", i.name))
        })
        .map(|i| i.name.clone())
        .unwrap_or_else(|| addr.to_string())
}

/// Build a fresh topology snapshot
///
/// Listing failures abort the observation. A sentinel that cannot be
/// queried only lowers the number of reachable sentinels.
pub async fn observe(
    cfg: &EffectiveConfig,
    source: &dyn TopologySource,
    sentinels: &dyn SentinelQuery,
    policy: QuorumPolicy,
    last_known_master: Option<String>,
) -> Result<ObservedTopology> {
    let (leader, sentinel) = try_join(
        source.observe_tier(cfg, Tier::Leader),
        source.observe_tier(cfg, Tier::Sentinel),
    )
    .await?;

    let group = cfg.sentinel_settings.master_group_name.as_str();
    let leader_ref = &leader;
    let queries = sentinel.live().map(|instance| async move {
        let vote = match instance.ip.as_deref() {
            None => Vote::Unreachable,
            Some(ip) => match sentinels.master_addr(ip, group).await {
                Ok(Some(addr)) => Vote::Master {
                    identity: identify_master(&addr, leader_ref),
                    address: addr.to_string(),
                },
                Ok(None) => Vote::Unknown,
                Err(e) => {
                    debug!(sentinel = %instance.name, error = %e, "sentinel query failed");
                    Vote::Unreachable
                }
            },
        };
        SentinelVote {
            sentinel: instance.name.clone(),
            vote,
        }
    });
    let votes: Vec<SentinelVote> = join_all(queries).await;

    let sentinel_total = votes.len();
    let tally = tally_votes(&votes);
    let threshold = policy.threshold(cfg.sentinel.replicas.max(0) as usize, sentinel_total);
    let quorum_agreement =
        cfg.sentinel.enabled() && tally.winner.is_some() && tally.reachable >= threshold;

    if cfg.sentinel.enabled() && tally.reachable < threshold {
        warn!(
            name = %cfg.name,
            reachable = tally.reachable,
            threshold,
            "Too few sentinels reachable for a majority view"
        );
    }

    let (current_master, current_master_address) = match tally.winner {
        Some((identity, address)) => (Some(identity), Some(address)),
        None => (None, None),
    };

    let observed = ObservedTopology {
        leader,
        sentinel,
        current_master,
        current_master_address,
        quorum_agreement,
        last_known_master,
        sentinel_reachable: tally.reachable,
        sentinel_total,
        votes,
    };

    info!(
        name = %cfg.name,
        master = ?observed.current_master,
        quorum = observed.quorum_agreement,
        reachable = observed.sentinel_reachable,
        total = observed.sentinel_total,
        "Observed topology"
    );

    Ok(observed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::controller::config::resolve_spec;
    use crate::crd::{KubernetesConfig, RedisLeader, RedisSentinelSpec, Sentinel};

    fn cfg() -> EffectiveConfig {
        let spec = RedisSentinelSpec {
            kubernetes_config: KubernetesConfig {
                image: "redis:7".to_string(),
                ..Default::default()
            },
            redis: RedisLeader {
                replicas: Some(3),
                ..Default::default()
            },
            sentinel: Sentinel {
                replicas: Some(3),
                image: "redis-sentinel:7".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        resolve_spec("cache1", "default", &spec).unwrap()
    }

    fn tier(prefix: &str, count: usize, ip_base: u8) -> ObservedTier {
        ObservedTier {
            workload_replicas: Some(count as i32),
            template_hash: None,
            instances: (0..count)
                .map(|i| ObservedInstance {
                    name: format!("{}-{}", prefix, i),
                    ip: Some(format!("10.0.{}.{}", ip_base, i)),
                    ready: true,
                    ..Default::default()
                })
                .collect(),
        }
    }

    struct FakeSource {
        leader: ObservedTier,
        sentinel: ObservedTier,
        fail: bool,
    }

    #[async_trait]
    impl TopologySource for FakeSource {
        async fn observe_tier(&self, _cfg: &EffectiveConfig, tier: Tier) -> Result<ObservedTier> {
            if self.fail {
                return Err(Error::RetryableError("pods list timed out".to_string()));
            }
            Ok(match tier {
                Tier::Leader => self.leader.clone(),
                Tier::Sentinel => self.sentinel.clone(),
            })
        }
    }

    enum Answer {
        Addr(&'static str),
        Unknown,
        Down,
    }

    struct FakeSentinels(HashMap<&'static str, Answer>);

    #[async_trait]
    impl SentinelQuery for FakeSentinels {
        async fn master_addr(&self, host: &str, _group: &str) -> Result<Option<MasterAddr>> {
            match self.0.get(host) {
                Some(Answer::Addr(addr)) => {
                    let (host, port) = addr.split_once(':').unwrap();
                    Ok(Some(MasterAddr {
                        host: host.to_string(),
                        port: port.parse().unwrap(),
                    }))
                }
                Some(Answer::Unknown) => Ok(None),
                Some(Answer::Down) | None => Err(Error::SentinelQueryError {
                    address: host.to_string(),
                    message: "connection refused".to_string(),
                }),
            }
        }
    }

    fn source() -> FakeSource {
        FakeSource {
            leader: tier("cache1-redis", 3, 1),
            sentinel: tier("cache1-sentinel", 3, 2),
            fail: false,
        }
    }

    fn vote(sentinel: &str, vote: Vote) -> SentinelVote {
        SentinelVote {
            sentinel: sentinel.to_string(),
            vote,
        }
    }

    fn master(identity: &str) -> Vote {
        Vote::Master {
            identity: identity.to_string(),
            address: format!("{}:6379", identity),
        }
    }

    #[tokio::test]
    async fn test_unanimous_sentinels_agree_on_master() {
        let sentinels = FakeSentinels(HashMap::from([
            ("10.0.2.0", Answer::Addr("10.0.1.1:6379")),
            ("10.0.2.1", Answer::Addr("10.0.1.1:6379")),
            ("10.0.2.2", Answer::Addr("10.0.1.1:6379")),
        ]));
        let observed = observe(&cfg(), &source(), &sentinels, QuorumPolicy::default(), None)
            .await
            .unwrap();

        assert_eq!(observed.current_master.as_deref(), Some("cache1-redis-1"));
        assert_eq!(observed.current_master_address.as_deref(), Some("10.0.1.1:6379"));
        assert!(observed.quorum_agreement);
        assert!(observed.master_settled());
        assert_eq!(observed.sentinel_reachable, 3);
    }

    #[tokio::test]
    async fn test_minority_view_is_not_agreement() {
        let sentinels = FakeSentinels(HashMap::from([
            ("10.0.2.0", Answer::Addr("10.0.1.2:6379")),
            ("10.0.2.1", Answer::Down),
            ("10.0.2.2", Answer::Down),
        ]));
        let observed = observe(&cfg(), &source(), &sentinels, QuorumPolicy::default(), None)
            .await
            .unwrap();

        // best effort master, but not trusted
        assert_eq!(observed.current_master.as_deref(), Some("cache1-redis-2"));
        assert!(!observed.quorum_agreement);
        assert_eq!(observed.sentinel_reachable, 1);
    }

    #[tokio::test]
    async fn test_min_reachable_override() {
        let sentinels = FakeSentinels(HashMap::from([
            ("10.0.2.0", Answer::Addr("10.0.1.2:6379")),
            ("10.0.2.1", Answer::Down),
            ("10.0.2.2", Answer::Down),
        ]));
        let policy = QuorumPolicy {
            min_reachable: Some(1),
        };
        let observed = observe(&cfg(), &source(), &sentinels, policy, None).await.unwrap();
        assert!(observed.quorum_agreement);
    }

    #[tokio::test]
    async fn test_unmapped_master_is_not_settled() {
        let sentinels = FakeSentinels(HashMap::from([
            ("10.0.2.0", Answer::Addr("10.9.9.9:6379")),
            ("10.0.2.1", Answer::Addr("10.9.9.9:6379")),
            ("10.0.2.2", Answer::Unknown),
        ]));
        let observed = observe(&cfg(), &source(), &sentinels, QuorumPolicy::default(), None)
            .await
            .unwrap();

        assert_eq!(observed.current_master.as_deref(), Some("10.9.9.9:6379"));
        assert!(observed.quorum_agreement);
        assert!(!observed.master_is_member());
        assert!(!observed.master_settled());
    }

    #[tokio::test]
    async fn test_master_matched_by_dns_name() {
        let sentinels = FakeSentinels(HashMap::from([
            (
                "10.0.2.0",
                Answer::Addr("cache1-redis-0.cache1-redis-headless.default.svc:6379"),
            ),
            (
                "10.0.2.1",
                Answer::Addr("cache1-redis-0.cache1-redis-headless.default.svc:6379"),
            ),
            ("10.0.2.2", Answer::Addr("10.0.1.0:6379")),
        ]));
        let observed = observe(&cfg(), &source(), &sentinels, QuorumPolicy::default(), None)
            .await
            .unwrap();
        assert_eq!(observed.current_master.as_deref(), Some("cache1-redis-0"));
        assert!(observed.master_settled());
    }

    #[tokio::test]
    async fn test_listing_failure_is_retryable() {
        let mut failing = source();
        failing.fail = true;
        let sentinels = FakeSentinels(HashMap::new());
        let err = observe(&cfg(), &failing, &sentinels, QuorumPolicy::default(), None)
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_last_known_master_is_carried() {
        let sentinels = FakeSentinels(HashMap::new());
        let observed = observe(
            &cfg(),
            &source(),
            &sentinels,
            QuorumPolicy::default(),
            Some("cache1-redis-0".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(observed.last_known_master.as_deref(), Some("cache1-redis-0"));
        assert_eq!(observed.current_master, None);
        assert!(!observed.quorum_agreement);
        assert_eq!(observed.sentinel_reachable, 0);
    }

    #[test]
    fn test_tally_tie_has_no_winner() {
        let tally = tally_votes(&[vote("s0", master("a")), vote("s1", master("b"))]);
        assert_eq!(tally.winner, None);
        assert_eq!(tally.reachable, 2);
    }

    #[test]
    fn test_tally_all_unknown() {
        let tally = tally_votes(&[
            vote("s0", Vote::Unknown),
            vote("s1", Vote::Unknown),
            vote("s2", Vote::Unreachable),
        ]);
        assert_eq!(tally.winner, None);
        assert_eq!(tally.reachable, 2);
    }

    #[test]
    fn test_tally_unknown_answers_dilute_majority() {
        let tally = tally_votes(&[
            vote("s0", master("a")),
            vote("s1", Vote::Unknown),
            vote("s2", Vote::Unknown),
        ]);
        assert_eq!(tally.winner, None);

        let tally = tally_votes(&[
            vote("s0", master("a")),
            vote("s1", master("a")),
            vote("s2", master("b")),
        ]);
        assert_eq!(tally.winner.map(|(identity, _)| identity).as_deref(), Some("a"));
    }

    #[test]
    fn test_quorum_threshold() {
        let policy = QuorumPolicy::default();
        assert_eq!(policy.threshold(3, 3), 2);
        assert_eq!(policy.threshold(5, 3), 3);
        assert_eq!(policy.threshold(3, 4), 3);
        assert_eq!(policy.threshold(0, 0), 1);
        assert_eq!(QuorumPolicy { min_reachable: Some(0) }.threshold(3, 3), 1);
    }

    #[test]
    fn test_instance_from_pod() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "cache1-redis-0",
                "labels": { "redis-role": "master" },
                "annotations": { "redis.opstreelabs.in/template-hash": "abc" }
            },
            "spec": {
                "containers": [{
                    "name": "redis",
                    "image": "redis:7",
                    "resources": { "limits": { "memory": "1Gi" } },
                    "livenessProbe": { "periodSeconds": 10, "timeoutSeconds": 1 }
                }]
            },
            "status": {
                "podIP": "10.0.1.0",
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        }))
        .unwrap();

        let instance = instance_from_pod(&pod, REDIS_CONTAINER);
        assert_eq!(instance.name, "cache1-redis-0");
        assert_eq!(instance.ip.as_deref(), Some("10.0.1.0"));
        assert!(instance.ready);
        assert!(!instance.terminating);
        assert_eq!(instance.role, Some(Role::Master));
        assert_eq!(instance.template_hash.as_deref(), Some("abc"));
        assert_eq!(instance.shape_hash, None);
        assert_eq!(
            instance.resources.unwrap().limits.unwrap().memory.as_deref(),
            Some("1Gi")
        );
        assert_eq!(instance.readiness, None);
        assert_eq!(instance.liveness.unwrap().period_seconds, 10);
    }
}
