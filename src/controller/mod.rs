//! Controller module for RedisSentinel reconciliation
//!
//! Observation, planning and execution are separate stages: the observer
//! builds a snapshot of the live topology, the planner turns snapshot and
//! desired state into an ordered plan, and the executor applies it.

mod config;
#[cfg(test)]
mod convergence_test;
mod executor;
mod finalizers;
pub mod metrics;
mod observer;
mod planner;
mod reconciler;
mod resources;
mod sentinel_client;

pub use config::{resolve, EffectiveConfig, ProbePolicy};
pub use executor::{apply_plan, ActionExecutor, ApplyOutcome, ApplyReport};
pub use finalizers::REDIS_SENTINEL_FINALIZER;
pub use observer::{observe, ObservedTopology, QuorumPolicy, TopologySource};
pub use planner::{plan, PlannedAction, ReconciliationPlan, TierState};
pub use reconciler::{calculate_backoff, run_controller, ControllerSettings, ControllerState};
pub use sentinel_client::{MasterAddr, RespSentinelClient, SentinelQuery};
