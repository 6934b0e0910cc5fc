//! Reconciliation planning
//!
//! [`plan`] compares the effective configuration with an observed topology
//! and returns the ordered corrective actions for one pass. It performs no
//! I/O: the same inputs always produce the same plan.
//!
//! Steps run in a fixed priority order:
//!
//! 1. Scaling. A tier whose workload is missing or declares the wrong
//!    replica count is scaled. Tiers still rolling towards their count are
//!    left alone for the rest of the pass.
//! 2. Failover acknowledgment. Only when the Sentinel quorum agrees on a
//!    master that is one of our leader pods. Sentinel already moved the
//!    role; we only record it and fix the role labels.
//! 3. Drift. Template changes update the workload, image-only changes are
//!    patched in place, anything else recreates at most one pod per tier,
//!    replicas before the master.

use std::fmt;

use serde::Serialize;

use crate::crd::{ResourceRequirements, ResourceSpec, Role, Tier};

use super::config::{EffectiveConfig, TierConfig};
use super::observer::{ObservedInstance, ObservedTier, ObservedTopology};
use super::resources;

/// Reconciliation state of one tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TierState {
    /// Instance count differs from the desired count
    Scaling,
    /// Count matches, health or configuration does not
    Converging,
    /// Master unknown, disputed, or not yet acknowledged
    FailoverPending,
    Stable,
}

impl TierState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierState::Scaling => "Scaling",
            TierState::Converging => "Converging",
            TierState::FailoverPending => "FailoverPending",
            TierState::Stable => "Stable",
        }
    }
}

impl fmt::Display for TierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of actions
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ActionKind {
    Scale,
    AcknowledgeFailover,
    Reconfigure,
    Recreate,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Scale => "scale",
            ActionKind::AcknowledgeFailover => "acknowledge-failover",
            ActionKind::Reconfigure => "reconfigure",
            ActionKind::Recreate => "recreate",
        }
    }
}

/// What an action operates on
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionTarget {
    Tier(Tier),
    Instance { tier: Tier, pod: String },
}

/// Why a pod has to be recreated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DriftReason {
    Probes,
    Resources,
    Template,
}

impl fmt::Display for DriftReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftReason::Probes => write!(f, "probe policy changed"),
            DriftReason::Resources => write!(f, "resources changed"),
            DriftReason::Template => write!(f, "pod template changed"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContainerImage {
    pub container: String,
    pub image: String,
}

/// One corrective action
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum PlannedAction {
    /// Set the declared replica count of a tier workload
    Scale { tier: Tier, from: i32, to: i32 },
    /// Record the master Sentinel elected; moves nothing
    AcknowledgeFailover {
        previous: Option<String>,
        current: String,
        address: Option<String>,
    },
    /// Correct the role label of a leader pod
    SetRole { pod: String, role: Role },
    /// Update the tier workload to the current template
    ReconfigureWorkload { tier: Tier },
    /// Patch container images of a running pod
    ReconfigureInstance {
        tier: Tier,
        pod: String,
        images: Vec<ContainerImage>,
    },
    /// Delete a pod so that its workload recreates it from the current template
    Recreate {
        tier: Tier,
        pod: String,
        reason: DriftReason,
    },
}

impl PlannedAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            PlannedAction::Scale { .. } => ActionKind::Scale,
            PlannedAction::AcknowledgeFailover { .. } => ActionKind::AcknowledgeFailover,
            PlannedAction::SetRole { .. }
            | PlannedAction::ReconfigureWorkload { .. }
            | PlannedAction::ReconfigureInstance { .. } => ActionKind::Reconfigure,
            PlannedAction::Recreate { .. } => ActionKind::Recreate,
        }
    }

    pub fn target(&self) -> ActionTarget {
        match self {
            PlannedAction::Scale { tier, .. } | PlannedAction::ReconfigureWorkload { tier } => {
                ActionTarget::Tier(*tier)
            }
            PlannedAction::AcknowledgeFailover { .. } => ActionTarget::Tier(Tier::Leader),
            PlannedAction::SetRole { pod, .. } => ActionTarget::Instance {
                tier: Tier::Leader,
                pod: pod.clone(),
            },
            PlannedAction::ReconfigureInstance { tier, pod, .. }
            | PlannedAction::Recreate { tier, pod, .. } => ActionTarget::Instance {
                tier: *tier,
                pod: pod.clone(),
            },
        }
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedAction::Scale { tier, from, to } => {
                write!(f, "scale {} tier from {} to {}", tier, from, to)
            }
            PlannedAction::AcknowledgeFailover {
                previous, current, ..
            } => write!(
                f,
                "acknowledge failover from {} to {}",
                previous.as_deref().unwrap_or("<none>"),
                current
            ),
            PlannedAction::SetRole { pod, role } => {
                write!(f, "label {} as {}", pod, role.label_value())
            }
            PlannedAction::ReconfigureWorkload { tier } => {
                write!(f, "update {} workload template", tier)
            }
            PlannedAction::ReconfigureInstance { pod, .. } => {
                write!(f, "patch images of {}", pod)
            }
            PlannedAction::Recreate { pod, reason, .. } => {
                write!(f, "recreate {} ({})", pod, reason)
            }
        }
    }
}

/// Ordered actions for one pass, plus the state of each tier
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationPlan {
    pub actions: Vec<PlannedAction>,
    pub leader_state: TierState,
    pub sentinel_state: TierState,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn state(&self, tier: Tier) -> TierState {
        match tier {
            Tier::Leader => self.leader_state,
            Tier::Sentinel => self.sentinel_state,
        }
    }

    /// Both tiers stable and nothing left to do
    pub fn is_stable(&self) -> bool {
        self.is_empty()
            && self.leader_state == TierState::Stable
            && self.sentinel_state == TierState::Stable
    }
}

/// Compute the plan for one pass
pub fn plan(cfg: &EffectiveConfig, observed: &ObservedTopology) -> ReconciliationPlan {
    let mut actions = Vec::new();

    // 1. scaling
    let mut scaling = [false; 2];
    for (idx, tier) in Tier::ALL.into_iter().enumerate() {
        let desired = cfg.tier(tier).replicas;
        let tier_obs = observed.tier(tier);

        let workload_matches = match tier_obs.workload_replicas {
            Some(declared) => declared == desired,
            // a disabled tier needs no workload
            None => desired == 0,
        };
        if !workload_matches {
            actions.push(PlannedAction::Scale {
                tier,
                from: tier_obs.workload_replicas.unwrap_or(tier_obs.live_count()),
                to: desired,
            });
        }
        scaling[idx] = !workload_matches || tier_obs.live_count() != desired;
    }

    // 2. failover acknowledgment
    let tracks_master = cfg.leader.enabled() && cfg.sentinel.enabled();
    let mut failover_pending = false;
    if tracks_master {
        match observed.current_master.as_deref() {
            Some(current) if observed.master_settled() => {
                if observed.last_known_master.as_deref() != Some(current) {
                    failover_pending = true;
                    actions.push(PlannedAction::AcknowledgeFailover {
                        previous: observed.last_known_master.clone(),
                        current: current.to_string(),
                        address: observed.current_master_address.clone(),
                    });
                }
                actions.extend(role_corrections(&observed.leader, current));
            }
            _ => failover_pending = true,
        }
    }

    // 3. drift
    let master = if tracks_master && observed.master_settled() {
        observed.current_master.as_deref()
    } else {
        observed.last_known_master.as_deref()
    };
    let mut drifting = [false; 2];
    let mut recreates = Vec::new();
    for (idx, tier) in Tier::ALL.into_iter().enumerate() {
        let tier_cfg = cfg.tier(tier);
        if scaling[idx] || !tier_cfg.enabled() {
            continue;
        }
        let (reconfigure, recreate) = drift_actions(cfg, tier_cfg, observed.tier(tier), master);
        drifting[idx] = !reconfigure.is_empty() || !recreate.is_empty();
        actions.extend(reconfigure);
        recreates.extend(recreate);
    }
    // least disruptive first
    actions.extend(recreates);

    let state_of = |idx: usize, tier: Tier| {
        let ready = observed.tier(tier).ready_count() == cfg.tier(tier).replicas;
        if scaling[idx] {
            TierState::Scaling
        } else if tier == Tier::Leader && failover_pending {
            TierState::FailoverPending
        } else if drifting[idx] || !ready {
            TierState::Converging
        } else {
            TierState::Stable
        }
    };

    ReconciliationPlan {
        actions,
        leader_state: state_of(0, Tier::Leader),
        sentinel_state: state_of(1, Tier::Sentinel),
    }
}

/// Role label fixes; demotions first so the master Service never selects two pods
fn role_corrections(leader: &ObservedTier, master: &str) -> Vec<PlannedAction> {
    let mut fixes: Vec<PlannedAction> = sorted_live(leader)
        .into_iter()
        .filter_map(|instance| {
            let role = if instance.name == master {
                Role::Master
            } else {
                Role::Replica
            };
            (instance.role != Some(role)).then(|| PlannedAction::SetRole {
                pod: instance.name.clone(),
                role,
            })
        })
        .collect();
    fixes.sort_by_key(|action| match action {
        PlannedAction::SetRole { role, .. } => *role == Role::Master,
        _ => false,
    });
    fixes
}

fn drift_actions(
    cfg: &EffectiveConfig,
    tier_cfg: &TierConfig,
    tier_obs: &ObservedTier,
    master: Option<&str>,
) -> (Vec<PlannedAction>, Vec<PlannedAction>) {
    let tier = tier_cfg.tier;
    let mut reconfigure = Vec::new();
    let mut recreate = Vec::new();

    if tier_obs.template_hash.as_deref() != Some(tier_cfg.template_hash.as_str()) {
        reconfigure.push(PlannedAction::ReconfigureWorkload { tier });
    }

    let mut instances = sorted_live(tier_obs);
    // replicas first, the master last
    if tier == Tier::Leader {
        instances.sort_by_key(|i| Some(i.name.as_str()) == master);
    }

    let mut images: Option<Vec<ContainerImage>> = None;
    for instance in instances {
        if instance.template_hash.as_deref() == Some(tier_cfg.template_hash.as_str()) {
            continue;
        }
        if instance.shape_hash.as_deref() == Some(tier_cfg.shape_hash.as_str()) {
            let desired = images.get_or_insert_with(|| desired_images(cfg, tier));
            reconfigure.push(PlannedAction::ReconfigureInstance {
                tier,
                pod: instance.name.clone(),
                images: desired.clone(),
            });
        } else {
            recreate.push(PlannedAction::Recreate {
                tier,
                pod: instance.name.clone(),
                reason: drift_reason(tier_cfg, instance),
            });
        }
    }

    // one pod down at a time, and only once the tier is healthy again
    let tier_healthy = tier_obs.instances.iter().all(|i| i.ready && !i.terminating);
    recreate.truncate(if tier_healthy { 1 } else { 0 });

    (reconfigure, recreate)
}

fn sorted_live(tier_obs: &ObservedTier) -> Vec<&ObservedInstance> {
    let mut instances: Vec<_> = tier_obs.live().collect();
    instances.sort_by(|a, b| a.name.cmp(&b.name));
    instances
}

fn desired_images(cfg: &EffectiveConfig, tier: Tier) -> Vec<ContainerImage> {
    resources::container_images(&resources::build_pod_template(cfg, tier))
        .into_iter()
        .map(|(container, image)| ContainerImage { container, image })
        .collect()
}

fn drift_reason(tier_cfg: &TierConfig, instance: &ObservedInstance) -> DriftReason {
    if instance.liveness != Some(tier_cfg.probes.liveness)
        || instance.readiness != Some(tier_cfg.probes.readiness)
    {
        DriftReason::Probes
    } else if normalized(instance.resources.as_ref()) != normalized(tier_cfg.resources.as_ref()) {
        DriftReason::Resources
    } else {
        DriftReason::Template
    }
}

/// Treat empty resource blocks as absent
fn normalized(resources: Option<&ResourceRequirements>) -> Option<ResourceRequirements> {
    let spec = |s: &Option<ResourceSpec>| {
        s.clone()
            .filter(|s| s.cpu.is_some() || s.memory.is_some())
    };
    let resources = resources?;
    let out = ResourceRequirements {
        requests: spec(&resources.requests),
        limits: spec(&resources.limits),
    };
    (out.requests.is_some() || out.limits.is_some()).then_some(out)
}
