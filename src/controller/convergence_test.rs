//! Observe, plan and apply against an in-memory platform

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::crd::{KubernetesConfig, RedisLeader, RedisSentinelSpec, Role, Sentinel, Tier};
use crate::error::{Error, Result};

use super::config::{resolve_spec, EffectiveConfig};
use super::executor::{apply_plan, ActionExecutor, ApplyOutcome};
use super::observer::{
    observe, ObservedInstance, ObservedTier, ObservedTopology, QuorumPolicy, TopologySource,
};
use super::planner::{plan, ActionKind, PlannedAction};
use super::resources::workload_name;
use super::sentinel_client::{MasterAddr, SentinelQuery};

fn config() -> EffectiveConfig {
    let spec = RedisSentinelSpec {
        kubernetes_config: KubernetesConfig {
            image: "quay.io/opstree/redis:v7.0.12".to_string(),
            ..Default::default()
        },
        redis: RedisLeader {
            replicas: Some(3),
            ..Default::default()
        },
        sentinel: Sentinel {
            replicas: Some(3),
            image: "quay.io/opstree/redis-sentinel:v7.0.12".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    resolve_spec("cache1", "redis", &spec).unwrap()
}

fn pod_ip(tier: Tier, ordinal: i32) -> String {
    match tier {
        Tier::Leader => format!("10.0.0.{}", ordinal),
        Tier::Sentinel => format!("10.0.1.{}", ordinal),
    }
}

/// A pod started from the current template
fn fresh_pod(cfg: &EffectiveConfig, tier: Tier, ordinal: i32) -> ObservedInstance {
    let tier_cfg = cfg.tier(tier);
    ObservedInstance {
        name: format!("{}-{}", workload_name(&cfg.name, tier), ordinal),
        ip: Some(pod_ip(tier, ordinal)),
        ready: true,
        terminating: false,
        role: None,
        template_hash: Some(tier_cfg.template_hash.clone()),
        shape_hash: Some(tier_cfg.shape_hash.clone()),
        liveness: Some(tier_cfg.probes.liveness),
        readiness: Some(tier_cfg.probes.readiness),
        resources: tier_cfg.resources.clone(),
    }
}

fn ordinal_of(name: &str) -> i32 {
    name.rsplit('-').next().unwrap().parse().unwrap()
}

/// Workloads whose pods appear and disappear as soon as they are scaled
struct FakePlatform {
    cfg: EffectiveConfig,
    tiers: Mutex<BTreeMap<Tier, ObservedTier>>,
    acknowledged: Mutex<Option<String>>,
}

impl FakePlatform {
    fn new(cfg: EffectiveConfig, leader: i32, sentinel: i32) -> Self {
        let mut tiers = BTreeMap::new();
        for (tier, replicas) in [(Tier::Leader, leader), (Tier::Sentinel, sentinel)] {
            tiers.insert(
                tier,
                ObservedTier {
                    workload_replicas: Some(replicas),
                    template_hash: Some(cfg.tier(tier).template_hash.clone()),
                    instances: (0..replicas).map(|i| fresh_pod(&cfg, tier, i)).collect(),
                },
            );
        }
        Self {
            cfg,
            tiers: Mutex::new(tiers),
            acknowledged: Mutex::new(None),
        }
    }

    fn acknowledged(&self) -> Option<String> {
        self.acknowledged.lock().unwrap().clone()
    }

    async fn snapshot(&self, sentinels: &dyn SentinelQuery) -> ObservedTopology {
        observe(&self.cfg, self, sentinels, QuorumPolicy::default(), self.acknowledged())
            .await
            .unwrap()
    }
}

#[async_trait]
impl TopologySource for FakePlatform {
    async fn observe_tier(&self, _cfg: &EffectiveConfig, tier: Tier) -> Result<ObservedTier> {
        Ok(self.tiers.lock().unwrap().get(&tier).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ActionExecutor for FakePlatform {
    async fn apply(&self, action: &PlannedAction) -> Result<ApplyOutcome> {
        let mut tiers = self.tiers.lock().unwrap();
        match action {
            PlannedAction::Scale { tier, to, .. } => {
                let observed = tiers.entry(*tier).or_default();
                if observed.workload_replicas == Some(*to)
                    && observed.instances.len() == *to as usize
                {
                    return Ok(ApplyOutcome::Unchanged);
                }
                observed.workload_replicas = Some(*to);
                observed.instances.retain(|i| ordinal_of(&i.name) < *to);
                for ordinal in 0..*to {
                    if !observed.instances.iter().any(|i| ordinal_of(&i.name) == ordinal) {
                        observed.instances.push(fresh_pod(&self.cfg, *tier, ordinal));
                    }
                }
                observed.instances.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(ApplyOutcome::Applied)
            }
            PlannedAction::SetRole { pod, role } => {
                let leader = tiers.entry(Tier::Leader).or_default();
                match leader.instances.iter_mut().find(|i| &i.name == pod) {
                    Some(instance) if instance.role != Some(*role) => {
                        instance.role = Some(*role);
                        Ok(ApplyOutcome::Applied)
                    }
                    // already labelled, or the pod is gone
                    _ => Ok(ApplyOutcome::Unchanged),
                }
            }
            PlannedAction::AcknowledgeFailover { current, .. } => {
                let mut acknowledged = self.acknowledged.lock().unwrap();
                if acknowledged.as_deref() == Some(current.as_str()) {
                    return Ok(ApplyOutcome::Unchanged);
                }
                *acknowledged = Some(current.clone());
                Ok(ApplyOutcome::Applied)
            }
            other => Err(Error::RetryableError(format!("unexpected action {}", other))),
        }
    }
}

/// Every sentinel names the same master
struct AgreeOn(&'static str);

#[async_trait]
impl SentinelQuery for AgreeOn {
    async fn master_addr(&self, _sentinel_host: &str, _group: &str) -> Result<Option<MasterAddr>> {
        Ok(Some(MasterAddr {
            host: self.0.to_string(),
            port: 6379,
        }))
    }
}

fn names(tier: &ObservedTier) -> BTreeSet<String> {
    tier.instances.iter().map(|i| i.name.clone()).collect()
}

#[tokio::test]
async fn test_reapplying_a_plan_changes_nothing() {
    let cfg = config();
    let platform = FakePlatform::new(cfg.clone(), 4, 2);
    let sentinels = AgreeOn("10.0.0.1");
    let (_tx, rx) = watch::channel(false);

    let initial = platform.snapshot(&sentinels).await;
    let first_plan = plan(&cfg, &initial);
    let kinds: Vec<_> = first_plan.actions.iter().map(|a| a.kind()).collect();
    assert_eq!(
        &kinds[..3],
        &[ActionKind::Scale, ActionKind::Scale, ActionKind::AcknowledgeFailover]
    );
    assert!(first_plan
        .actions
        .iter()
        .any(|a| matches!(a, PlannedAction::SetRole { role: Role::Master, .. })));

    let first = apply_plan(&platform, &first_plan, &rx).await.unwrap();
    assert!(first.rejected.is_empty());
    // the role fix for the pod removed by the scale-down finds nothing
    assert_eq!(first.unchanged, vec!["label cache1-redis-3 as slave"]);
    let after_first = platform.snapshot(&sentinels).await;

    let second = apply_plan(&platform, &first_plan, &rx).await.unwrap();
    assert!(second.applied.is_empty());
    assert!(second.rejected.is_empty());
    assert_eq!(second.unchanged.len(), first_plan.actions.len());

    let after_second = platform.snapshot(&sentinels).await;
    assert_eq!(after_second, after_first);
    assert_eq!(after_second.leader.instances.len(), 3);
    assert_eq!(after_second.sentinel.instances.len(), 3);
    assert_eq!(names(&after_second.leader).len(), 3);
    assert_eq!(names(&after_second.sentinel).len(), 3);
    assert_eq!(platform.acknowledged().as_deref(), Some("cache1-redis-1"));
    assert_eq!(after_second.leader.instances[1].role, Some(Role::Master));

    assert!(plan(&cfg, &after_second).is_empty());
}
