// Copyright 2025 Cassop Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Rack scale-down, one decommissioned node at a time.
//!
//! Nothing about an ongoing decommission is stored. Every pass re-reads the replica
//! count of the rack's StatefulSet, the pods around its highest ordinal, the operation
//! mode of that node and, when a new decommission could start, the disruption budget.
//! [`decide`] maps those observations to a [`Phase`] and at most one [`Action`]:
//!
//! | observation                                    | phase             | action            |
//! |------------------------------------------------|-------------------|-------------------|
//! | pod `current` still exists                     | PendingPodRemoval | none              |
//! | `current == desired`                           | Stable            | none              |
//! | `current < desired`                            | ScaleUpPending    | none              |
//! | pod `current - 1` missing                      | TargetUnavailable | none              |
//! | target `LEAVING`                               | InProgress        | none              |
//! | target `DECOMMISSIONED`                        | CommandComplete   | replicas - 1      |
//! | target `NORMAL`, commanded recently            | CommandIssued     | none              |
//! | target `NORMAL`, budget exhausted              | AwaitingSafety    | none              |
//! | target `NORMAL`, budget available              | NotStarted        | decommission      |
//! | target in any other mode                       | Unsettled         | none              |
//!
//! Only the node with the highest ordinal is ever queried or commanded.

use crate::context;
use crate::jolokia::{self, OperationMode};
use crate::types::node::{DeclaredRack, NodeRef, RackRef};
use snafu::{ResultExt, Snafu, ensure};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use strum::Display;
use tracing::{debug, info, warn};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("node {}: {}", node, source))]
    NodeHealth {
        node: String,
        source: jolokia::Error,
    },

    #[snafu(display("rack {}: {}", rack, source))]
    Platform {
        rack: String,
        source: context::Error,
    },

    #[snafu(display(
        "rack {}: refusing to address ordinal {} while the highest ordinal is {}",
        rack,
        ordinal,
        highest
    ))]
    TargetingViolation {
        rack: String,
        ordinal: i32,
        highest: i32,
    },

    #[snafu(display(
        "rack {}: refusing to change replicas from {} to {}, only single-step decrements are allowed",
        rack,
        from,
        to
    ))]
    ShrinkViolation { rack: String, from: i32, to: i32 },
}

impl Error {
    /// Collaborator failures are retried on the next pass. Violations of the targeting
    /// rule point at a defect and are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NodeHealth { .. } | Error::Platform { .. })
    }

    /// Event reason for this failure.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::NodeHealth { .. } => "NodeHealthFailed",
            Error::Platform { .. } => "PlatformFailed",
            Error::TargetingViolation { .. } => "TargetingViolation",
            Error::ShrinkViolation { .. } => "ShrinkViolation",
        }
    }
}

/// Management side-channel of a single node.
pub trait NodeHealth {
    fn operation_mode(
        &self,
        node: &NodeRef,
    ) -> impl Future<Output = Result<OperationMode, jolokia::Error>> + Send;

    fn decommission(&self, node: &NodeRef) -> impl Future<Output = Result<(), jolokia::Error>> + Send;
}

/// The rack's pod group.
pub trait ReplicaSets {
    fn replica_count(&self, rack: &RackRef) -> impl Future<Output = Result<i32, context::Error>> + Send;

    /// Callers only ever pass `replica_count(rack) - 1`.
    fn set_replica_count(
        &self,
        rack: &RackRef,
        replicas: i32,
    ) -> impl Future<Output = Result<(), context::Error>> + Send;

    fn pod_exists(
        &self,
        rack: &RackRef,
        ordinal: i32,
    ) -> impl Future<Output = Result<bool, context::Error>> + Send;
}

/// The cluster's disruption budget.
pub trait DisruptionGate {
    fn disruption_allowed(&self, rack: &RackRef) -> impl Future<Output = Result<bool, context::Error>> + Send;
}

#[derive(Clone, Debug, PartialEq, Eq, Display)]
pub enum Phase {
    Stable,
    ScaleUpPending,
    PendingPodRemoval { ordinal: i32 },
    TargetUnavailable { ordinal: i32 },
    AwaitingSafety { ordinal: i32 },
    NotStarted { ordinal: i32 },
    CommandIssued { ordinal: i32 },
    InProgress { ordinal: i32 },
    CommandComplete { ordinal: i32 },
    Unsettled { ordinal: i32, mode: OperationMode },
}

/// How soon a rack in a given phase wants to be looked at again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Requeue {
    /// Something is about to change, look again shortly.
    Retry,
    /// A decommission is under way, keep polling.
    Poll,
    /// Nothing to do until the cluster resource changes.
    Idle,
}

impl Phase {
    /// Ordinal of the node this phase is about.
    pub fn target_ordinal(&self) -> Option<i32> {
        match self {
            Phase::Stable | Phase::ScaleUpPending => None,
            Phase::PendingPodRemoval { ordinal }
            | Phase::TargetUnavailable { ordinal }
            | Phase::AwaitingSafety { ordinal }
            | Phase::NotStarted { ordinal }
            | Phase::CommandIssued { ordinal }
            | Phase::InProgress { ordinal }
            | Phase::CommandComplete { ordinal }
            | Phase::Unsettled { ordinal, .. } => Some(*ordinal),
        }
    }

    pub fn requeue(&self) -> Requeue {
        match self {
            Phase::Stable | Phase::ScaleUpPending => Requeue::Idle,
            Phase::TargetUnavailable { .. } | Phase::Unsettled { .. } => Requeue::Retry,
            _ => Requeue::Poll,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    Decommission { ordinal: i32 },
    Shrink { from: i32, to: i32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub phase: Phase,
    pub action: Action,
    pub current_replicas: i32,
}

/// The next read [`decide`] needs before it can conclude.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// Does the pod at ordinal `current` still exist?
    RemovedPod,
    /// Does the pod at ordinal `current - 1` exist?
    TargetPod,
    OperationMode,
    DisruptionGate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Next {
    Observe(Probe),
    Decided(Decision),
}

/// Everything observed about a rack during one pass. `None` means not read yet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observation {
    pub desired: i32,
    pub current: i32,
    pub removed_pod_present: Option<bool>,
    pub target_pod_present: Option<bool>,
    pub mode: Option<OperationMode>,
    pub recently_commanded: bool,
    pub disruption_allowed: Option<bool>,
}

impl Observation {
    pub fn new(desired: i32, current: i32) -> Self {
        Self {
            desired,
            current,
            ..Default::default()
        }
    }

    /// The node that would be removed next.
    pub fn target_ordinal(&self) -> i32 {
        self.current - 1
    }

    fn decided(&self, phase: Phase, action: Action) -> Next {
        Next::Decided(Decision {
            phase,
            action,
            current_replicas: self.current,
        })
    }
}

/// Derives the phase of a rack from what has been observed so far, or names the
/// observation still missing.
pub fn decide(obs: &Observation) -> Next {
    // A pod beyond the replica count was removed from the ring already; the
    // StatefulSet controller deletes it asynchronously.
    match obs.removed_pod_present {
        None => return Next::Observe(Probe::RemovedPod),
        Some(true) => {
            return obs.decided(
                Phase::PendingPodRemoval {
                    ordinal: obs.current,
                },
                Action::None,
            );
        }
        Some(false) => {}
    }

    if obs.current == obs.desired {
        return obs.decided(Phase::Stable, Action::None);
    }
    if obs.current < obs.desired {
        return obs.decided(Phase::ScaleUpPending, Action::None);
    }

    let ordinal = obs.target_ordinal();

    match obs.target_pod_present {
        None => return Next::Observe(Probe::TargetPod),
        Some(false) => return obs.decided(Phase::TargetUnavailable { ordinal }, Action::None),
        Some(true) => {}
    }

    match &obs.mode {
        None => Next::Observe(Probe::OperationMode),
        Some(OperationMode::Leaving) => obs.decided(Phase::InProgress { ordinal }, Action::None),
        Some(OperationMode::Decommissioned) => obs.decided(
            Phase::CommandComplete { ordinal },
            Action::Shrink {
                from: obs.current,
                to: obs.current - 1,
            },
        ),
        Some(OperationMode::Normal) if obs.recently_commanded => {
            obs.decided(Phase::CommandIssued { ordinal }, Action::None)
        }
        Some(OperationMode::Normal) => match obs.disruption_allowed {
            None => Next::Observe(Probe::DisruptionGate),
            Some(false) => obs.decided(Phase::AwaitingSafety { ordinal }, Action::None),
            Some(true) => obs.decided(Phase::NotStarted { ordinal }, Action::Decommission { ordinal }),
        },
        Some(mode) => obs.decided(
            Phase::Unsettled {
                ordinal,
                mode: mode.clone(),
            },
            Action::None,
        ),
    }
}

/// Remembers acknowledged decommission commands so that a node still reporting
/// `NORMAL` right after the command is not commanded again on every pass.
///
/// This is only a hint. Losing it (operator restart) at worst re-sends the command,
/// which Cassandra rejects or ignores while the node is already leaving.
#[derive(Debug)]
pub struct CommandGuard {
    window: Duration,
    issued: Mutex<HashMap<NodeRef, Instant>>,
}

impl CommandGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            issued: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_recent(&self, node: &NodeRef) -> bool {
        match self.issued.lock() {
            Ok(issued) => issued
                .get(node)
                .is_some_and(|at| at.elapsed() < self.window),
            Err(_) => false,
        }
    }

    pub fn record(&self, node: &NodeRef) {
        if let Ok(mut issued) = self.issued.lock() {
            let window = self.window;
            issued.retain(|_, at| at.elapsed() < window);
            issued.insert(node.clone(), Instant::now());
        }
    }

    pub fn forget(&self, node: &NodeRef) {
        if let Ok(mut issued) = self.issued.lock() {
            issued.remove(node);
        }
    }
}

/// Only the highest surviving ordinal may be queried or commanded.
fn checked_target(rack: &RackRef, ordinal: i32, current: i32) -> Result<NodeRef, Error> {
    let highest = current - 1;
    ensure!(
        ordinal >= 0 && ordinal == highest,
        TargetingViolationSnafu {
            rack: rack.to_string(),
            ordinal,
            highest,
        }
    );
    Ok(rack.node(ordinal))
}

/// Runs one pass of the state machine for a rack: observes lazily, then performs at
/// most one state-advancing action.
pub async fn step<N, R, G>(
    declared: &DeclaredRack,
    nodes: &N,
    replicas: &R,
    gate: &G,
    guard: &CommandGuard,
) -> Result<Decision, Error>
where
    N: NodeHealth,
    R: ReplicaSets,
    G: DisruptionGate,
{
    let rack = &declared.rack;
    let current = replicas
        .replica_count(rack)
        .await
        .context(PlatformSnafu {
            rack: rack.to_string(),
        })?;

    let mut obs = Observation::new(declared.desired_replicas, current);

    let decision = loop {
        match decide(&obs) {
            Next::Decided(decision) => break decision,
            Next::Observe(Probe::RemovedPod) => {
                let present = replicas
                    .pod_exists(rack, current)
                    .await
                    .context(PlatformSnafu {
                        rack: rack.to_string(),
                    })?;
                obs.removed_pod_present = Some(present);
            }
            Next::Observe(Probe::TargetPod) => {
                let present = replicas
                    .pod_exists(rack, obs.target_ordinal())
                    .await
                    .context(PlatformSnafu {
                        rack: rack.to_string(),
                    })?;
                obs.target_pod_present = Some(present);
            }
            Next::Observe(Probe::OperationMode) => {
                let node = checked_target(rack, obs.target_ordinal(), current)?;
                let mode = nodes
                    .operation_mode(&node)
                    .await
                    .context(NodeHealthSnafu {
                        node: node.to_string(),
                    })?;
                debug!("node {} reports operation mode {}", node, mode);
                obs.recently_commanded = guard.is_recent(&node);
                obs.mode = Some(mode);
            }
            Next::Observe(Probe::DisruptionGate) => {
                let allowed = gate
                    .disruption_allowed(rack)
                    .await
                    .context(PlatformSnafu {
                        rack: rack.to_string(),
                    })?;
                obs.disruption_allowed = Some(allowed);
            }
        }
    };

    debug!(
        "rack {} desired={} current={} phase={}",
        rack, declared.desired_replicas, current, decision.phase
    );

    match decision.action {
        Action::None => {
            if let Phase::AwaitingSafety { ordinal } = decision.phase {
                warn!(
                    "rack {} must shrink but the disruption budget {} allows no disruption, ordinal {} waits",
                    rack,
                    rack.pdb_name(),
                    ordinal
                );
            }
        }
        Action::Decommission { ordinal } => {
            let node = checked_target(rack, ordinal, current)?;
            nodes
                .decommission(&node)
                .await
                .context(NodeHealthSnafu {
                    node: node.to_string(),
                })?;
            guard.record(&node);
            info!("decommission of node {} started", node);
        }
        Action::Shrink { from, to } => {
            ensure!(
                from == current && to == current - 1 && to >= 0,
                ShrinkViolationSnafu {
                    rack: rack.to_string(),
                    from,
                    to,
                }
            );
            let node = checked_target(rack, current - 1, current)?;
            replicas
                .set_replica_count(rack, to)
                .await
                .context(PlatformSnafu {
                    rack: rack.to_string(),
                })?;
            guard.forget(&node);
            info!(
                "node {} is decommissioned, replicas of {} lowered from {} to {}",
                node, rack, from, to
            );
        }
    }

    Ok(decision)
}
