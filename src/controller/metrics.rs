//! Prometheus metrics for the Redis Sentinel operator

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

use crate::crd::Tier;

use super::planner::ReconciliationPlan;

/// Labels identifying one RedisSentinel
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceLabels {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub namespace: String,
    pub name: String,
    /// "success" or an error category
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TierLabels {
    pub namespace: String,
    pub name: String,
    pub tier: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ActionLabels {
    pub namespace: String,
    pub name: String,
    pub kind: String,
}

/// Reconciliation passes by outcome
pub static RECONCILE_TOTAL: Lazy<Family<OutcomeLabels, Counter>> = Lazy::new(Family::default);

/// Planned actions by kind
pub static PLANNED_ACTIONS: Lazy<Family<ActionLabels, Counter>> = Lazy::new(Family::default);

/// Master changes acknowledged
pub static FAILOVERS_ACKNOWLEDGED: Lazy<Family<ResourceLabels, Counter>> =
    Lazy::new(Family::default);

/// 1 when a majority of sentinels agree on the master
pub static QUORUM_AGREEMENT: Lazy<Family<ResourceLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Ready pods per tier
pub static READY_REPLICAS: Lazy<Family<TierLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "redis_sentinel_reconcile",
        "Reconciliation passes by outcome",
        RECONCILE_TOTAL.clone(),
    );
    registry.register(
        "redis_sentinel_planned_actions",
        "Corrective actions planned, by kind",
        PLANNED_ACTIONS.clone(),
    );
    registry.register(
        "redis_sentinel_failovers_acknowledged",
        "Master changes elected by Sentinel and acknowledged by the operator",
        FAILOVERS_ACKNOWLEDGED.clone(),
    );
    registry.register(
        "redis_sentinel_quorum_agreement",
        "Whether a majority of reachable sentinels agree on the master",
        QUORUM_AGREEMENT.clone(),
    );
    registry.register(
        "redis_sentinel_ready_replicas",
        "Ready pods per tier",
        READY_REPLICAS.clone(),
    );
    registry
});

fn resource_labels(namespace: &str, name: &str) -> ResourceLabels {
    ResourceLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

/// Count a finished pass
pub fn record_reconcile(namespace: &str, name: &str, outcome: &str) {
    let labels = OutcomeLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
        outcome: outcome.to_string(),
    };
    RECONCILE_TOTAL.get_or_create(&labels).inc();
}

/// Count the actions of a plan
pub fn record_plan(namespace: &str, name: &str, plan: &ReconciliationPlan) {
    for action in &plan.actions {
        let labels = ActionLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind: action.kind().as_str().to_string(),
        };
        PLANNED_ACTIONS.get_or_create(&labels).inc();
    }
}

pub fn record_failover(namespace: &str, name: &str) {
    FAILOVERS_ACKNOWLEDGED
        .get_or_create(&resource_labels(namespace, name))
        .inc();
}

pub fn set_quorum_agreement(namespace: &str, name: &str, agreed: bool) {
    QUORUM_AGREEMENT
        .get_or_create(&resource_labels(namespace, name))
        .set(i64::from(agreed));
}

pub fn set_ready_replicas(namespace: &str, name: &str, tier: Tier, ready: i32) {
    let labels = TierLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
        tier: tier.to_string(),
    };
    READY_REPLICAS.get_or_create(&labels).set(i64::from(ready));
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_metrics_are_exported() {
        record_reconcile("metrics-test", "cache1", "success");
        record_failover("metrics-test", "cache1");
        set_quorum_agreement("metrics-test", "cache1", true);
        set_ready_replicas("metrics-test", "cache1", Tier::Sentinel, 3);

        let mut buffer = String::new();
        encode(&mut buffer, &REGISTRY).unwrap();

        assert!(buffer.contains("redis_sentinel_reconcile_total{namespace=\"metrics-test\",name=\"cache1\",outcome=\"success\"} 1"));
        assert!(buffer.contains("redis_sentinel_failovers_acknowledged_total{namespace=\"metrics-test\",name=\"cache1\"} 1"));
        assert!(buffer.contains("redis_sentinel_quorum_agreement{namespace=\"metrics-test\",name=\"cache1\"} 1"));
        assert!(buffer.contains("redis_sentinel_ready_replicas{namespace=\"metrics-test\",name=\"cache1\",tier=\"sentinel\"} 3"));
    }
}
