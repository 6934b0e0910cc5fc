//! RedisSentinel reconciliation loop
//!
//! Each pass resolves the desired state, makes sure the supporting objects
//! exist, observes the live topology, plans the next batch of actions and
//! applies it. Nothing from a previous pass is trusted except the master
//! recorded in the status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{Condition, RedisSentinel, Tier};
use crate::error::{Error, ErrorCategory, Result};

use super::config::{self, EffectiveConfig};
use super::executor::{apply_plan, ApplyReport, KubeExecutor};
use super::finalizers::REDIS_SENTINEL_FINALIZER;
use super::metrics;
use super::observer::{self, KubeTopologySource, ObservedTopology, QuorumPolicy};
use super::planner::{self, PlannedAction, ReconciliationPlan, TierState};
use super::resources;
use super::sentinel_client::{RespSentinelClient, SentinelQuery};

/// Tunables of the reconciliation loop
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Watch a single namespace instead of the whole cluster
    pub namespace: Option<String>,
    pub sentinel_port: u16,
    pub sentinel_connect_timeout: Duration,
    pub sentinel_read_timeout: Duration,
    /// First retry delay after a failed pass, in seconds
    pub backoff_base_secs: u64,
    /// Upper bound for retry delays, in seconds
    pub backoff_max_secs: u64,
    pub requeue_stable: Duration,
    pub requeue_converging: Duration,
    pub quorum: QuorumPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            namespace: None,
            sentinel_port: config::SENTINEL_PORT as u16,
            sentinel_connect_timeout: Duration::from_secs(2),
            sentinel_read_timeout: Duration::from_secs(2),
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            requeue_stable: Duration::from_secs(60),
            requeue_converging: Duration::from_secs(10),
            quorum: QuorumPolicy::default(),
        }
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub settings: ControllerSettings,
    pub sentinels: Arc<dyn SentinelQuery>,
    /// Flips to `true` once shutdown starts
    pub shutdown: watch::Receiver<bool>,
    failures: FailureCounter,
}

/// Consecutive failed passes per resource key
#[derive(Debug, Default)]
struct FailureCounter(Mutex<HashMap<String, u32>>);

impl FailureCounter {
    /// Count a failed pass and return the number of consecutive failures before it
    fn record(&self, key: &str) -> u32 {
        let mut failures = self.0.lock().unwrap_or_else(|p| p.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    fn clear(&self, key: &str) {
        let mut failures = self.0.lock().unwrap_or_else(|p| p.into_inner());
        failures.remove(key);
    }
}

impl ControllerState {
    pub fn new(client: Client, settings: ControllerSettings, shutdown: watch::Receiver<bool>) -> Self {
        let sentinels = Arc::new(RespSentinelClient::new(
            settings.sentinel_port,
            settings.sentinel_connect_timeout,
            settings.sentinel_read_timeout,
        ));
        Self {
            client,
            settings,
            sentinels,
            shutdown,
            failures: FailureCounter::default(),
        }
    }
}

fn resource_key(obj: &RedisSentinel) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_else(|| "default".to_string()),
        obj.name_any()
    )
}

/// Exponential retry delay: `base * 2^attempt`, capped at `max`
///
/// # Arguments
/// * `attempt` - Consecutive failures so far (0-indexed)
/// * `base_delay_secs` - Delay of the first retry
/// * `max_delay_secs` - Upper bound
pub fn calculate_backoff(attempt: u32, base_delay_secs: u64, max_delay_secs: u64) -> Duration {
    let delay_secs = base_delay_secs.saturating_mul(2_u64.saturating_pow(attempt.min(5)));
    Duration::from_secs(delay_secs.min(max_delay_secs))
}

/// Cluster-wide API unless the controller is pinned to a namespace
fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let scope = state.settings.namespace.clone();
    let namespace = scope.as_deref();
    let redis_sentinels: Api<RedisSentinel> = scoped_api(&client, namespace);

    info!("Starting RedisSentinel controller");

    // Verify CRD exists
    match redis_sentinels.list(&Default::default()).await {
        Ok(_) => info!("RedisSentinel CRD is available"),
        Err(e) => {
            error!(
                "RedisSentinel CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigurationError(
                "RedisSentinel CRD not installed".to_string(),
            ));
        }
    }

    Controller::new(redis_sentinels, Config::default())
        // Watch owned resources for changes
        .owns::<StatefulSet>(scoped_api(&client, namespace), Config::default())
        .owns::<Service>(scoped_api(&client, namespace), Config::default())
        .owns::<ConfigMap>(scoped_api(&client, namespace), Config::default())
        .owns::<PodDisruptionBudget>(scoped_api(&client, namespace), Config::default())
        // Pods belong to the StatefulSets; map them back through the instance label
        .watches(
            scoped_api::<Pod>(&client, namespace),
            Config::default().labels(&format!("{}=redis-sentinel", resources::NAME_LABEL)),
            |pod: Pod| {
                let namespace = pod.namespace();
                pod.labels().get(resources::INSTANCE_LABEL).map(|name| {
                    let obj = ObjectRef::<RedisSentinel>::new(name);
                    match namespace {
                        Some(ns) => obj.within(&ns),
                        None => obj,
                    }
                })
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Helper to emit a Kubernetes Event
async fn emit_event(
    client: &Client,
    obj: &RedisSentinel,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-event-", obj.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: obj.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        reporting_component: Some(resources::FIELD_MANAGER.to_string()),
        ..Default::default()
    };

    events
        .create(&PostParams::default(), &event)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Emit an event, logging instead of failing the pass
async fn try_emit_event(client: &Client, obj: &RedisSentinel, event_type: &str, reason: &str, message: &str) {
    if let Err(e) = emit_event(client, obj, event_type, reason, message).await {
        warn!("Failed to emit {} event: {:?}", reason, e);
    }
}

/// The main reconciliation function
///
/// This function is called whenever:
/// - A RedisSentinel is created, updated, or deleted
/// - An owned StatefulSet, Service, ConfigMap or PDB changes
/// - A pod of either tier changes
/// - The requeue timer expires
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<RedisSentinel>, ctx: Arc<ControllerState>) -> Result<Action> {
    let client = ctx.client.clone();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();
    let key = resource_key(&obj);
    let api: Api<RedisSentinel> = Api::namespaced(client.clone(), &namespace);

    debug!("Reconciling RedisSentinel {}/{}", namespace, name);

    let result = finalizer(&api, REDIS_SENTINEL_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(rs) => apply_redis_sentinel(&ctx, &rs).await,
            FinalizerEvent::Cleanup(rs) => {
                // the key has no future passes to reset it
                ctx.failures.clear(&resource_key(&rs));
                cleanup_redis_sentinel(&client, &rs).await
            }
        }
    })
    .await
    .map_err(Error::from);

    if result.is_ok() {
        ctx.failures.clear(&key);
        metrics::record_reconcile(&namespace, &name, "success");
    }
    result
}

/// One full pass over a live RedisSentinel
#[instrument(skip(ctx, obj), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn apply_redis_sentinel(ctx: &ControllerState, obj: &RedisSentinel) -> Result<Action> {
    match run_pass(ctx, obj).await {
        Ok(action) => Ok(action),
        Err(e) => {
            if let Err(status_err) = update_error_status(&ctx.client, obj, &e).await {
                warn!("Failed to record error in status: {:?}", status_err);
            }
            Err(e)
        }
    }
}

async fn run_pass(ctx: &ControllerState, obj: &RedisSentinel) -> Result<Action> {
    let client = &ctx.client;
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();

    // 1. Resolve the desired state
    let cfg = match config::resolve(obj) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("Validation failed for {}/{}: {}", namespace, name, e);
            try_emit_event(client, obj, "Warning", "InvalidConfiguration", &e.to_string()).await;
            return Err(e);
        }
    };
    for warning in &cfg.warnings {
        warn!("{}/{}: {}", namespace, name, warning);
    }

    // 2. Supporting objects
    let last_known_master = obj.status.as_ref().and_then(|s| s.master.clone());
    resources::ensure_services(client, obj, &cfg).await?;
    let configured_master = last_known_master
        .clone()
        .unwrap_or_else(|| resources::bootstrap_master_pod(&cfg.name));
    resources::ensure_sentinel_config_map(client, obj, &cfg, &configured_master).await?;
    resources::ensure_pdbs(client, obj, &cfg).await?;

    // 3. Observe
    let source = KubeTopologySource::new(client.clone());
    let observed = observer::observe(
        &cfg,
        &source,
        ctx.sentinels.as_ref(),
        ctx.settings.quorum,
        last_known_master,
    )
    .await?;
    debug!(
        master = ?observed.current_master,
        agreement = observed.quorum_agreement,
        reachable = observed.sentinel_reachable,
        "Observed topology for {}/{}",
        namespace,
        name
    );

    // 4. Plan
    let plan = planner::plan(&cfg, &observed);
    metrics::record_plan(&namespace, &name, &plan);
    if !plan.is_empty() {
        info!(
            actions = plan.actions.len(),
            leader = %plan.leader_state,
            sentinel = %plan.sentinel_state,
            "Planned {} action(s) for {}/{}",
            plan.actions.len(),
            namespace,
            name
        );
    }

    // 5. Apply
    let executor = KubeExecutor::new(client.clone(), obj.clone(), cfg.clone());
    let report = apply_plan(&executor, &plan, &ctx.shutdown).await?;

    for action in &plan.actions {
        if let PlannedAction::AcknowledgeFailover {
            previous: Some(previous),
            current,
            ..
        } = action
        {
            if report.applied.contains(&action.to_string()) {
                metrics::record_failover(&namespace, &name);
                try_emit_event(
                    client,
                    obj,
                    "Normal",
                    "FailoverAcknowledged",
                    &format!("Master moved from {} to {}", previous, current),
                )
                .await;
            }
        }
    }
    for (action, reason) in &report.rejected {
        try_emit_event(
            client,
            obj,
            "Warning",
            "ActionRejected",
            &format!("{}: {}", action, reason),
        )
        .await;
    }

    // 6. Status
    metrics::set_quorum_agreement(&namespace, &name, observed.quorum_agreement);
    for tier in Tier::ALL {
        metrics::set_ready_replicas(&namespace, &name, tier, observed.tier(tier).ready_count());
    }
    update_status(client, obj, &cfg, &observed, &plan, &report).await?;

    // 7. Requeue
    let requeue = if plan.is_stable() && report.rejected.is_empty() {
        ctx.settings.requeue_stable
    } else {
        ctx.settings.requeue_converging
    };
    Ok(Action::requeue(requeue))
}

/// Phase and message summarising one pass
fn pass_phase(plan: &ReconciliationPlan, report: &ApplyReport) -> (&'static str, String) {
    if !report.rejected.is_empty() {
        let reasons: Vec<String> = report
            .rejected
            .iter()
            .map(|(action, reason)| format!("{}: {}", action, reason))
            .collect();
        return ("Degraded", reasons.join("; "));
    }
    if plan.is_stable() {
        return ("Ready", "Topology converged".to_string());
    }
    if plan.leader_state == TierState::FailoverPending {
        return ("FailoverPending", "Waiting for sentinels to agree on a master".to_string());
    }
    if plan.state(Tier::Leader) == TierState::Scaling || plan.state(Tier::Sentinel) == TierState::Scaling {
        return ("Provisioning", format!("Applied {} action(s)", report.applied.len()));
    }
    ("Converging", format!("Applied {} action(s)", report.applied.len()))
}

/// Why the sentinels could not be trusted this pass, if they could not
fn quorum_issue(cfg: &EffectiveConfig, observed: &ObservedTopology) -> Option<Error> {
    if !cfg.sentinel.enabled() || !cfg.leader.enabled() || observed.quorum_agreement {
        return None;
    }
    let message = if observed.current_master.is_none() {
        format!(
            "no master holds a majority among {} of {} reachable sentinels",
            observed.sentinel_reachable, observed.sentinel_total
        )
    } else {
        format!(
            "only {} of {} sentinels reachable",
            observed.sentinel_reachable, observed.sentinel_total
        )
    };
    Some(Error::QuorumUncertain(message))
}

/// Conditions currently stored on the resource
fn previous_conditions(obj: &RedisSentinel) -> &[Condition] {
    obj.status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default()
}

/// Status body for a finished pass
///
/// Transition times are carried over from the stored conditions, so the
/// same inputs always produce the same patch.
fn status_patch(
    obj: &RedisSentinel,
    cfg: &EffectiveConfig,
    observed: &ObservedTopology,
    plan: &ReconciliationPlan,
    report: &ApplyReport,
) -> serde_json::Value {
    let previous = previous_conditions(obj);
    let (phase, message) = pass_phase(plan, report);
    let issue = if report.rejected.is_empty() {
        quorum_issue(cfg, observed)
    } else {
        Some(Error::ActionRejected {
            action: report.rejected.iter().map(|(a, _)| a.as_str()).collect::<Vec<_>>().join(", "),
            reason: message.clone(),
        })
    };

    let mut conditions = vec![Condition::ready(
        phase == "Ready",
        if phase == "Ready" { "Converged" } else { phase },
        &message,
    )];
    if cfg.sentinel.enabled() {
        conditions.push(Condition::new(
            "QuorumAgreement",
            observed.quorum_agreement,
            if observed.quorum_agreement { "MajorityAgrees" } else { "QuorumUncertain" },
            &format!(
                "{} of {} sentinels reachable",
                observed.sentinel_reachable, observed.sentinel_total
            ),
        ));
    }
    for warning in &cfg.warnings {
        conditions.push(Condition::new("ConfigurationWarning", true, "Defaulted", warning));
    }
    let conditions: Vec<Condition> = conditions
        .into_iter()
        .map(|c| c.carry_transition_time(previous))
        .collect();

    // null clears a previous error under a merge patch
    serde_json::json!({
        "status": {
            "phase": phase,
            "message": message,
            "observedGeneration": obj.metadata.generation,
            "conditions": conditions,
            "quorumAgreement": observed.quorum_agreement,
            "leaderReadyReplicas": observed.leader.ready_count(),
            "sentinelReadyReplicas": observed.sentinel.ready_count(),
            "leaderState": plan.leader_state.as_str(),
            "sentinelState": plan.sentinel_state.as_str(),
            "lastErrorCategory": issue.as_ref().map(|e| e.category().as_str()),
            "lastError": issue.as_ref().map(|e| e.status_message()),
        }
    })
}

/// Status body for a failed pass
fn error_status_patch(obj: &RedisSentinel, err: &Error) -> serde_json::Value {
    let category = err.category();
    let ready = Condition::ready(false, category.as_str(), &err.status_message())
        .carry_transition_time(previous_conditions(obj));

    let mut status = serde_json::json!({
        "message": err.status_message(),
        "lastErrorCategory": category.as_str(),
        "lastError": err.status_message(),
        "conditions": [ready],
    });
    if category == ErrorCategory::Configuration {
        status["phase"] = serde_json::json!("Failed");
        status["observedGeneration"] = serde_json::json!(obj.metadata.generation);
    }
    serde_json::json!({ "status": status })
}

/// Write the result of a pass to the status subresource
async fn update_status(
    client: &Client,
    obj: &RedisSentinel,
    cfg: &EffectiveConfig,
    observed: &ObservedTopology,
    plan: &ReconciliationPlan,
    report: &ApplyReport,
) -> Result<()> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<RedisSentinel> = Api::namespaced(client.clone(), &namespace);
    let patch = status_patch(obj, cfg, observed, plan, report);

    api.patch_status(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

/// Record a failed pass in the status
async fn update_error_status(client: &Client, obj: &RedisSentinel, err: &Error) -> Result<()> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<RedisSentinel> = Api::namespaced(client.clone(), &namespace);
    let patch = error_status_patch(obj, err);

    api.patch_status(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

/// Clean up resources when the RedisSentinel is deleted
#[instrument(skip(client, obj), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn cleanup_redis_sentinel(client: &Client, obj: &RedisSentinel) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();

    info!("Cleaning up RedisSentinel: {}/{}", namespace, name);

    // Sentinels first
    for tier in [Tier::Sentinel, Tier::Leader] {
        if let Err(e) = resources::delete_statefulset(client, &namespace, &name, tier).await {
            warn!("Failed to delete {} StatefulSet: {:?}", tier, e);
        }
    }
    if let Err(e) = resources::delete_pdbs(client, &namespace, &name).await {
        warn!("Failed to delete PDBs: {:?}", e);
    }
    if let Err(e) = resources::delete_services(client, &namespace, &name).await {
        warn!("Failed to delete Services: {:?}", e);
    }
    if let Err(e) = resources::delete_sentinel_config_map(client, &namespace, &name).await {
        warn!("Failed to delete ConfigMap: {:?}", e);
    }
    if let Err(e) = resources::delete_pvcs(client, obj).await {
        warn!("Failed to delete PVCs: {:?}", e);
    }

    info!("Cleanup complete for RedisSentinel: {}/{}", namespace, name);

    // Return await_change to signal finalizer completion
    Ok(Action::await_change())
}

/// Requeue policy for failed passes
///
/// Configuration errors wait for the maximum delay; a spec edit triggers a
/// pass on its own.
fn error_policy(obj: Arc<RedisSentinel>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();
    let category = error.category();
    metrics::record_reconcile(&namespace, &name, category.as_str());

    let attempt = ctx.failures.record(&resource_key(&obj));
    let settings = &ctx.settings;
    let delay = retry_delay(category, attempt, settings.backoff_base_secs, settings.backoff_max_secs);

    error!(
        category = category.as_str(),
        attempt,
        "Reconciliation error for {}/{}, retrying in {:?}: {}",
        namespace,
        name,
        delay,
        error
    );

    Action::requeue(delay)
}

fn retry_delay(category: ErrorCategory, attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    match category {
        ErrorCategory::Configuration => Duration::from_secs(max_secs),
        _ => calculate_backoff(attempt, base_secs, max_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::observer::ObservedTier;
    use crate::crd::{KubernetesConfig, RedisSentinelSpec, RedisSentinelStatus, Sentinel};

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, 5, 300), Duration::from_secs(5));
        assert_eq!(calculate_backoff(1, 5, 300), Duration::from_secs(10));
        assert_eq!(calculate_backoff(3, 5, 300), Duration::from_secs(40));
        assert_eq!(calculate_backoff(5, 5, 300), Duration::from_secs(160));
        // exponent stops growing after 5 attempts
        assert_eq!(calculate_backoff(9, 5, 300), Duration::from_secs(160));
        assert_eq!(calculate_backoff(4, 15, 300), Duration::from_secs(240));
        assert_eq!(calculate_backoff(5, 15, 300), Duration::from_secs(300));
    }

    #[test]
    fn test_configuration_errors_wait_longest() {
        assert_eq!(
            retry_delay(ErrorCategory::Configuration, 0, 5, 300),
            Duration::from_secs(300)
        );
        assert_eq!(
            retry_delay(ErrorCategory::Retryable, 0, 5, 300),
            Duration::from_secs(5)
        );
    }

    fn plan_with(leader: TierState, sentinel: TierState, actions: Vec<PlannedAction>) -> ReconciliationPlan {
        ReconciliationPlan {
            actions,
            leader_state: leader,
            sentinel_state: sentinel,
        }
    }

    #[test]
    fn test_pass_phase() {
        let report = ApplyReport::default();
        assert_eq!(
            pass_phase(&plan_with(TierState::Stable, TierState::Stable, vec![]), &report).0,
            "Ready"
        );
        assert_eq!(
            pass_phase(&plan_with(TierState::FailoverPending, TierState::Stable, vec![]), &report).0,
            "FailoverPending"
        );
        assert_eq!(
            pass_phase(&plan_with(TierState::Converging, TierState::Scaling, vec![]), &report).0,
            "Provisioning"
        );
        assert_eq!(
            pass_phase(&plan_with(TierState::Converging, TierState::Stable, vec![]), &report).0,
            "Converging"
        );
    }

    #[test]
    fn test_rejections_degrade_the_phase() {
        let report = ApplyReport {
            rejected: vec![(
                "scale leader tier from 3 to 5".to_string(),
                "exceeded quota".to_string(),
            )],
            ..Default::default()
        };
        let (phase, message) =
            pass_phase(&plan_with(TierState::Scaling, TierState::Stable, vec![]), &report);
        assert_eq!(phase, "Degraded");
        assert_eq!(message, "scale leader tier from 3 to 5: exceeded quota");
    }

    fn topology(reachable: usize, total: usize, master: Option<&str>, agreement: bool) -> ObservedTopology {
        ObservedTopology {
            leader: ObservedTier::default(),
            sentinel: ObservedTier::default(),
            current_master: master.map(str::to_string),
            current_master_address: None,
            quorum_agreement: agreement,
            last_known_master: None,
            sentinel_reachable: reachable,
            sentinel_total: total,
            votes: vec![],
        }
    }

    fn test_config() -> EffectiveConfig {
        let spec = RedisSentinelSpec {
            kubernetes_config: KubernetesConfig {
                image: "quay.io/opstree/redis:v7.0.12".to_string(),
                ..Default::default()
            },
            sentinel: Sentinel {
                image: "quay.io/opstree/redis-sentinel:v7.0.12".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        config::resolve_spec("cache1", "default", &spec).unwrap()
    }

    #[test]
    fn test_quorum_issue_reporting() {
        let cfg = test_config();
        assert!(quorum_issue(&cfg, &topology(3, 3, Some("cache1-redis-0"), true)).is_none());

        let issue = quorum_issue(&cfg, &topology(1, 3, Some("cache1-redis-0"), false)).unwrap();
        assert_eq!(issue.category(), ErrorCategory::QuorumUncertain);
        assert!(issue.to_string().contains("only 1 of 3 sentinels reachable"));

        let issue = quorum_issue(&cfg, &topology(3, 3, None, false)).unwrap();
        assert!(issue.to_string().contains("no master holds a majority"));
    }

    fn stored(conditions: Vec<Condition>) -> RedisSentinel {
        let mut obj = RedisSentinel::new("cache1", test_config().spec);
        obj.metadata.namespace = Some("default".to_string());
        obj.metadata.generation = Some(4);
        obj.status = Some(RedisSentinelStatus {
            phase: "Ready".to_string(),
            conditions,
            ..Default::default()
        });
        obj
    }

    fn condition_at(type_: &str, status: bool, reason: &str, time: &str) -> Condition {
        Condition {
            last_transition_time: time.to_string(),
            ..Condition::new(type_, status, reason, "")
        }
    }

    #[test]
    fn test_status_patch_is_stable_across_passes() {
        let cfg = test_config();
        let obj = stored(vec![
            condition_at("Ready", true, "Converged", "2026-01-01T00:00:00+00:00"),
            condition_at("QuorumAgreement", true, "MajorityAgrees", "2026-01-01T00:00:00+00:00"),
        ]);
        let observed = topology(3, 3, Some("cache1-redis-0"), true);
        let plan = plan_with(TierState::Stable, TierState::Stable, vec![]);
        let report = ApplyReport::default();

        let first = status_patch(&obj, &cfg, &observed, &plan, &report);
        std::thread::sleep(Duration::from_millis(5));
        let second = status_patch(&obj, &cfg, &observed, &plan, &report);
        assert_eq!(first, second);

        let conditions = first["status"]["conditions"].as_array().unwrap();
        assert_eq!(conditions.len(), 2);
        for condition in conditions {
            assert_eq!(condition["lastTransitionTime"], "2026-01-01T00:00:00+00:00");
        }
        assert_eq!(first["status"]["lastErrorCategory"], serde_json::Value::Null);
    }

    #[test]
    fn test_flipped_condition_gets_new_transition_time() {
        let cfg = test_config();
        let obj = stored(vec![
            condition_at("Ready", true, "Converged", "2026-01-01T00:00:00+00:00"),
            condition_at("QuorumAgreement", true, "MajorityAgrees", "2026-01-01T00:00:00+00:00"),
        ]);
        let observed = topology(1, 3, Some("cache1-redis-0"), false);
        let plan = plan_with(TierState::FailoverPending, TierState::Stable, vec![]);

        let patch = status_patch(&obj, &cfg, &observed, &plan, &ApplyReport::default());
        let conditions = patch["status"]["conditions"].as_array().unwrap();
        assert_eq!(conditions[1]["type"], "QuorumAgreement");
        assert_eq!(conditions[1]["status"], "False");
        assert_ne!(conditions[1]["lastTransitionTime"], "2026-01-01T00:00:00+00:00");
        assert_eq!(patch["status"]["lastErrorCategory"], "QuorumUncertain");
    }

    #[test]
    fn test_error_status_patch_is_stable() {
        let obj = stored(vec![condition_at(
            "Ready",
            false,
            "RetryableError",
            "2026-01-01T00:00:00+00:00",
        )]);
        let err = Error::RetryableError("list pods timed out".to_string());

        let first = error_status_patch(&obj, &err);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(first, error_status_patch(&obj, &err));
        assert_eq!(
            first["status"]["conditions"][0]["lastTransitionTime"],
            "2026-01-01T00:00:00+00:00"
        );
        assert!(first["status"].get("phase").is_none());

        let invalid = error_status_patch(&obj, &Error::ConfigurationError("bad".to_string()));
        assert_eq!(invalid["status"]["phase"], "Failed");
        assert_eq!(invalid["status"]["observedGeneration"], 4);
    }

    #[test]
    fn test_failure_counter() {
        let failures = FailureCounter::default();
        assert_eq!(failures.record("redis/cache1"), 0);
        assert_eq!(failures.record("redis/cache1"), 1);
        assert_eq!(failures.record("redis/cache2"), 0);

        failures.clear("redis/cache1");
        assert_eq!(failures.record("redis/cache1"), 0);

        failures.clear("redis/cache1");
        failures.clear("redis/cache2");
        assert!(failures.0.lock().unwrap().is_empty());
    }
}
