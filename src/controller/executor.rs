//! Action executor
//!
//! Applies planned actions through the Kubernetes API. Every action is
//! idempotent: re-applying one that already took effect changes nothing.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::crd::{RedisSentinel, Tier};
use crate::error::{Error, Result};

use super::config::EffectiveConfig;
use super::planner::{ContainerImage, PlannedAction, ReconciliationPlan};
use super::resources::{
    self, FIELD_MANAGER, ROLE_LABEL, SHAPE_HASH_ANNOTATION, TEMPLATE_HASH_ANNOTATION,
};

/// Result of applying one action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The target was already gone or already in the desired state
    Unchanged,
}

/// Platform refusals that are terminal for the current pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    QuotaExceeded,
    SpecRejected,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::QuotaExceeded => "quota exceeded",
            Rejection::SpecRejected => "rejected as invalid",
        }
    }
}

/// Applies one planned action against the platform
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn apply(&self, action: &PlannedAction) -> Result<ApplyOutcome>;
}

/// Which platform refusals must not be retried in a tight loop
pub fn rejection_of(err: &kube::Error) -> Option<Rejection> {
    match err {
        kube::Error::Api(resp) if resp.code == 403 && resp.message.contains("exceeded quota") => {
            Some(Rejection::QuotaExceeded)
        }
        kube::Error::Api(resp) if resp.code == 422 || resp.reason == "Invalid" => {
            Some(Rejection::SpecRejected)
        }
        _ => None,
    }
}

/// Map a failed action onto the error taxonomy
pub fn classify_error(action: &PlannedAction, err: Error) -> Error {
    match err {
        Error::KubeError(e) => match rejection_of(&e) {
            Some(rejection) => Error::ActionRejected {
                action: action.to_string(),
                reason: format!("{}: {}", rejection.as_str(), e),
            },
            None => Error::KubeError(e),
        },
        other => other,
    }
}

fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::KubeError(kube::Error::Api(resp)) if resp.code == 404)
}

/// [`ActionExecutor`] backed by the Kubernetes API
pub struct KubeExecutor {
    client: Client,
    resource: RedisSentinel,
    cfg: EffectiveConfig,
}

impl KubeExecutor {
    pub fn new(client: Client, resource: RedisSentinel, cfg: EffectiveConfig) -> Self {
        Self {
            client,
            resource,
            cfg,
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.cfg.namespace)
    }

    async fn acknowledge_failover(
        &self,
        previous: Option<&str>,
        current: &str,
        address: Option<&str>,
    ) -> Result<ApplyOutcome> {
        // Restarted sentinels and replicas follow the acknowledged master
        resources::ensure_sentinel_config_map(&self.client, &self.resource, &self.cfg, current)
            .await?;

        let failover_count = self
            .resource
            .status
            .as_ref()
            .map(|s| s.failover_count)
            .unwrap_or(0)
            + i64::from(previous.is_some());

        let api: Api<RedisSentinel> = Api::namespaced(self.client.clone(), &self.cfg.namespace);
        let patch = json!({
            "status": {
                "master": current,
                "masterAddress": address,
                "failoverCount": failover_count,
            }
        });
        api.patch_status(
            &self.cfg.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(
            name = %self.cfg.name,
            previous = previous.unwrap_or("<none>"),
            current,
            "Acknowledged master"
        );
        Ok(ApplyOutcome::Applied)
    }

    async fn set_role(&self, pod: &str, value: &str) -> Result<ApplyOutcome> {
        let patch = json!({ "metadata": { "labels": { ROLE_LABEL: value } } });
        match self
            .pods()
            .patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(ApplyOutcome::Applied),
            Err(e) => tolerate_missing(pod, e.into()),
        }
    }

    async fn patch_images(
        &self,
        tier: Tier,
        pod: &str,
        images: &[ContainerImage],
    ) -> Result<ApplyOutcome> {
        let tier_cfg = self.cfg.tier(tier);
        let containers: Vec<_> = images
            .iter()
            .map(|c| json!({ "name": c.container, "image": c.image }))
            .collect();
        let annotations = BTreeMap::from([
            (TEMPLATE_HASH_ANNOTATION, tier_cfg.template_hash.as_str()),
            (SHAPE_HASH_ANNOTATION, tier_cfg.shape_hash.as_str()),
        ]);
        let patch = json!({
            "metadata": { "annotations": annotations },
            "spec": { "containers": containers },
        });

        match self
            .pods()
            .patch(pod, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
        {
            Ok(_) => Ok(ApplyOutcome::Applied),
            Err(e) => tolerate_missing(pod, e.into()),
        }
    }

    async fn delete_pod(&self, pod: &str) -> Result<ApplyOutcome> {
        match self.pods().delete(pod, &DeleteParams::default()).await {
            Ok(_) => Ok(ApplyOutcome::Applied),
            Err(e) => tolerate_missing(pod, e.into()),
        }
    }
}

fn tolerate_missing(pod: &str, err: Error) -> Result<ApplyOutcome> {
    if is_not_found(&err) {
        debug!("Pod {} not found, nothing to do", pod);
        Ok(ApplyOutcome::Unchanged)
    } else {
        Err(err)
    }
}

#[async_trait]
impl ActionExecutor for KubeExecutor {
    async fn apply(&self, action: &PlannedAction) -> Result<ApplyOutcome> {
        let result = match action {
            PlannedAction::Scale { tier, .. } | PlannedAction::ReconfigureWorkload { tier } => {
                resources::apply_statefulset(&self.client, &self.resource, &self.cfg, *tier)
                    .await
                    .map(|_| ApplyOutcome::Applied)
            }
            PlannedAction::AcknowledgeFailover {
                previous,
                current,
                address,
            } => {
                self.acknowledge_failover(previous.as_deref(), current, address.as_deref())
                    .await
            }
            PlannedAction::SetRole { pod, role } => self.set_role(pod, role.label_value()).await,
            PlannedAction::ReconfigureInstance { tier, pod, images } => {
                self.patch_images(*tier, pod, images).await
            }
            PlannedAction::Recreate { pod, .. } => self.delete_pod(pod).await,
        };

        result.map_err(|e| classify_error(action, e))
    }
}

/// What happened to a plan
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub unchanged: Vec<String>,
    /// Rejected actions with the platform's reason
    pub rejected: Vec<(String, String)>,
}

/// Apply a plan in order
///
/// Rejected actions are recorded and skipped. Any other failure ends the
/// pass; the next pass re-plans from a fresh observation. The shutdown
/// signal is checked before each action, never in the middle of one.
pub async fn apply_plan(
    executor: &dyn ActionExecutor,
    plan: &ReconciliationPlan,
    shutdown: &watch::Receiver<bool>,
) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();

    for (idx, action) in plan.actions.iter().enumerate() {
        if *shutdown.borrow() {
            warn!(
                remaining = plan.actions.len() - idx,
                "Shutdown requested, stopping before {}",
                action
            );
            return Err(Error::Aborted(format!("shutdown before {}", action)));
        }

        match executor.apply(action).await {
            Ok(ApplyOutcome::Applied) => {
                info!(
                    kind = action.kind().as_str(),
                    target = ?action.target(),
                    "Applied: {}",
                    action
                );
                report.applied.push(action.to_string());
            }
            Ok(ApplyOutcome::Unchanged) => {
                debug!(
                    kind = action.kind().as_str(),
                    target = ?action.target(),
                    "Already in place: {}",
                    action
                );
                report.unchanged.push(action.to_string());
            }
            Err(Error::ActionRejected { action, reason }) => {
                warn!("Platform rejected {}: {}", action, reason);
                report.rejected.push((action, reason));
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}
