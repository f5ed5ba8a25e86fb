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

pub mod decommission;

use crate::config::OperatorConfig;
use crate::context::Context;
use crate::types::node::DeclaredRack;
use crate::types::v1alpha1::cluster::CassandraCluster;
use crate::types::v1alpha1::status::{self, Status, state::State};
use crate::{context, types};
use decommission::{
    Action as RackAction, CommandGuard, Decision, DisruptionGate, NodeHealth, ReplicaSets,
    Requeue,
};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use snafu::Snafu;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span, warn};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },

    #[snafu(transparent)]
    Types { source: types::error::Error },

    #[snafu(display("{} rack(s) failed, first failure: {}", failed, source))]
    Racks {
        failed: usize,
        source: decommission::Error,
    },
}

/// Result of one rack's evaluation during a pass.
#[derive(Debug)]
pub struct RackReport {
    pub rack: DeclaredRack,
    pub outcome: Result<Decision, decommission::Error>,
}

/// Result of evaluating every rack of a cluster once.
#[derive(Debug, Default)]
pub struct PassReport {
    pub racks: Vec<RackReport>,
}

impl PassReport {
    /// Earliest follow-up any rack asks for; `None` when every rack is settled.
    pub fn requeue(&self) -> Option<Requeue> {
        self.racks
            .iter()
            .map(|report| match &report.outcome {
                Ok(decision) => decision.phase.requeue(),
                Err(_) => Requeue::Retry,
            })
            .filter(|requeue| *requeue != Requeue::Idle)
            .min()
    }

    pub fn action(&self, config: &OperatorConfig) -> Action {
        match self.requeue() {
            Some(Requeue::Retry) => Action::requeue(config.retry_delay()),
            Some(Requeue::Poll) => Action::requeue(config.poll_interval()),
            Some(Requeue::Idle) | None => Action::await_change(),
        }
    }

    pub fn state(&self) -> State {
        if self.racks.iter().any(|r| r.outcome.is_err()) {
            State::Degraded
        } else if self.requeue().is_some() {
            State::ScalingDown
        } else {
            State::Ready
        }
    }

    /// Status as observed by this pass, without an update time.
    pub fn observed_status(&self) -> Status {
        let racks = self
            .racks
            .iter()
            .map(|report| {
                let (current_replicas, phase, target_ordinal) = match &report.outcome {
                    Ok(decision) => (
                        Some(decision.current_replicas),
                        decision.phase.to_string(),
                        decision.phase.target_ordinal(),
                    ),
                    Err(_) => (None, "Error".to_owned(), None),
                };

                status::rack::Rack {
                    name: format!("{}/{}", report.rack.rack.datacenter, report.rack.rack.rack),
                    stateful_set: report.rack.rack.statefulset.clone(),
                    desired_replicas: report.rack.desired_replicas,
                    current_replicas,
                    phase,
                    target_ordinal,
                }
            })
            .collect();

        let last_error = self
            .racks
            .iter()
            .filter_map(|report| report.outcome.as_ref().err())
            .map(|e| e.to_string())
            .next();

        Status {
            current_state: self.state(),
            racks,
            last_error,
            last_update_time: None,
        }
    }

    /// The status to write, or `None` when `previous` already says the same.
    /// `last_update_time` only moves together with the rest of the status.
    pub fn status_update(&self, previous: Option<&Status>) -> Option<Status> {
        let observed = self.observed_status();
        if previous.is_some_and(|previous| previous.same_observation(&observed)) {
            return None;
        }

        Some(Status {
            last_update_time: Some(chrono::Utc::now().to_rfc3339()),
            ..observed
        })
    }

    /// Fails the pass when any rack hit a non-retryable error. Retryable failures are
    /// handled by requeueing.
    pub fn into_result(mut self) -> Result<Self, Error> {
        let fatal = |r: &RackReport| matches!(&r.outcome, Err(e) if !e.is_retryable());
        let failed = self.racks.iter().filter(|r| fatal(*r)).count();
        let Some(first) = self.racks.iter().position(fatal) else {
            return Ok(self);
        };

        match self.racks.swap_remove(first).outcome {
            Err(source) => Err(Error::Racks { failed, source }),
            Ok(_) => Ok(self),
        }
    }
}

/// Runs the decommission state machine once for every rack. A failing rack never
/// keeps the others from being evaluated.
pub async fn evaluate_racks<N, R, G>(
    racks: Vec<DeclaredRack>,
    nodes: &N,
    replicas: &R,
    gate: &G,
    guard: &CommandGuard,
) -> PassReport
where
    N: NodeHealth,
    R: ReplicaSets,
    G: DisruptionGate,
{
    let mut report = PassReport::default();

    for rack in racks {
        let span = info_span!(
            "rack",
            cluster = %rack.rack.cluster,
            namespace = %rack.rack.namespace,
            statefulset = %rack.rack.statefulset
        );
        let outcome = decommission::step(&rack, nodes, replicas, gate, guard)
            .instrument(span)
            .await;

        match &outcome {
            Ok(decision) => debug!("rack {} is {}", rack.rack, decision.phase),
            Err(e) if e.is_retryable() => warn!("rack {} will be retried: {}", rack.rack, e),
            Err(e) => error!("rack {} failed: {}", rack.rack, e),
        }

        report.racks.push(RackReport { rack, outcome });
    }

    report
}

async fn publish_events(cluster: &CassandraCluster, report: &PassReport, ctx: &Context) {
    for rack in &report.racks {
        let event = match &rack.outcome {
            Ok(decision) => match decision.action {
                RackAction::None => None,
                RackAction::Decommission { ordinal } => Some((
                    EventType::Normal,
                    "DecommissionStarted",
                    format!("decommission of {} started", rack.rack.rack.pod_name(ordinal)),
                )),
                RackAction::Shrink { from, to } => Some((
                    EventType::Normal,
                    "ReplicasDecreased",
                    format!(
                        "{} replicas lowered from {} to {}",
                        rack.rack.rack.statefulset, from, to
                    ),
                )),
            },
            Err(e) if !e.is_retryable() => Some((EventType::Warning, e.reason(), e.to_string())),
            Err(_) => None,
        };

        let Some((event_type, reason, message)) = event else {
            continue;
        };
        if let Err(e) = ctx.record(cluster, event_type, reason, &message).await {
            warn!("failed to record {} event: {}", reason, e);
        }
    }
}

pub async fn reconcile_cluster(
    cluster: Arc<CassandraCluster>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let ns = cluster.namespace()?;
    let latest = ctx.get::<CassandraCluster>(&cluster.name(), &ns).await?;

    if latest.metadata.deletion_timestamp.is_some() {
        debug!(
            "cluster {} is deleted, deletion_timestamp is {:?}",
            latest.name(),
            latest.metadata.deletion_timestamp
        );
        return Ok(Action::await_change());
    }

    let racks = latest.racks()?;
    let report = evaluate_racks(racks, &ctx.jolokia, ctx.as_ref(), ctx.as_ref(), &ctx.guard).await;

    publish_events(&latest, &report, &ctx).await;

    match report.status_update(latest.status.as_ref()) {
        Some(status) => {
            if let Err(e) = ctx.update_status(&latest, &status).await {
                warn!("failed to update status of {}/{}: {}", ns, latest.name(), e);
            }
        }
        None => debug!("status of {}/{} is unchanged", ns, latest.name()),
    }

    let action = report.into_result()?.action(&ctx.config);
    debug!("cluster {}/{} requeue: {:?}", ns, latest.name(), action);
    Ok(action)
}

pub fn error_policy(_object: Arc<CassandraCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    error!("error_policy: {:?}", error);

    match error {
        Error::Context { source } if source.is_not_found() => Action::await_change(),
        Error::Racks { .. } | Error::Types { .. } => Action::requeue(ctx.config.error_backoff()),
        _ => Action::requeue(ctx.config.retry_delay()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::jolokia::OperationMode;
    use crate::tests::{FakePlatform, TEST_CLUSTER, create_test_cluster};
    use crate::types::v1alpha1::topology::{Datacenter, Rack, Topology};
    use super::decommission::Phase;
    use std::time::Duration;

    fn two_racks(nodes_per_racks: i32) -> Vec<DeclaredRack> {
        let topology = Topology {
            dc: vec![Datacenter {
                name: "dc1".to_owned(),
                nodes_per_racks: None,
                rack: vec![
                    Rack {
                        name: "rack1".to_owned(),
                    },
                    Rack {
                        name: "rack2".to_owned(),
                    },
                ],
            }],
        };
        create_test_cluster(nodes_per_racks, topology)
            .racks()
            .unwrap()
    }

    fn guard() -> CommandGuard {
        CommandGuard::new(Duration::from_secs(300))
    }

    fn violation() -> decommission::Error {
        decommission::Error::TargetingViolation {
            rack: "default/cassandra-demo-dc1-rack1".to_owned(),
            ordinal: 0,
            highest: 2,
        }
    }

    fn transient() -> decommission::Error {
        decommission::Error::NodeHealth {
            node: "default/cassandra-demo-dc1-rack1-2".to_owned(),
            source: crate::jolokia::Error::Timeout {
                node: "default/cassandra-demo-dc1-rack1-2".to_owned(),
            },
        }
    }

    fn decided(phase: Phase) -> Result<Decision, decommission::Error> {
        Ok(Decision {
            phase,
            action: RackAction::None,
            current_replicas: 3,
        })
    }

    fn report(outcomes: Vec<Result<Decision, decommission::Error>>) -> PassReport {
        let racks = two_racks(3);
        PassReport {
            racks: outcomes
                .into_iter()
                .zip(racks.into_iter().cycle())
                .map(|(outcome, rack)| RackReport { rack, outcome })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_racks_progress_independently() {
        let rack1 = format!("{TEST_CLUSTER}-dc1-rack1");
        let rack2 = format!("{TEST_CLUSTER}-dc1-rack2");
        let platform = FakePlatform::new(&rack1, 3);
        platform.add_rack(&rack2, 3);
        platform.forbid(&format!("{rack1}-1"));
        platform.forbid(&format!("{rack2}-1"));
        platform.set_mode(&format!("{rack1}-2"), OperationMode::Leaving);
        platform.set_mode(&format!("{rack2}-2"), OperationMode::Decommissioned);

        let report =
            evaluate_racks(two_racks(2), &platform, &platform, &platform, &guard()).await;

        let phases: Vec<_> = report
            .racks
            .iter()
            .map(|r| r.outcome.as_ref().unwrap().phase.clone())
            .collect();
        assert_eq!(
            phases,
            vec![
                Phase::InProgress { ordinal: 2 },
                Phase::CommandComplete { ordinal: 2 }
            ]
        );
        assert_eq!(platform.replicas(&rack1), 3);
        assert_eq!(platform.replicas(&rack2), 2);
        assert_eq!(report.requeue(), Some(Requeue::Poll));
        assert_eq!(report.state(), State::ScalingDown);
    }

    #[tokio::test]
    async fn test_unreachable_node_does_not_block_sibling_rack() {
        let rack1 = format!("{TEST_CLUSTER}-dc1-rack1");
        let rack2 = format!("{TEST_CLUSTER}-dc1-rack2");
        let platform = FakePlatform::new(&rack1, 3);
        platform.add_rack(&rack2, 3);
        platform.set_unreachable(&format!("{rack1}-2"));
        platform.set_mode(&format!("{rack2}-2"), OperationMode::Normal);

        let report =
            evaluate_racks(two_racks(2), &platform, &platform, &platform, &guard()).await;

        assert!(report.racks[0].outcome.is_err());
        assert_eq!(platform.decommission_calls(&format!("{rack2}-2")), 1);
        assert_eq!(report.requeue(), Some(Requeue::Retry));
        assert_eq!(report.state(), State::Degraded);

        let report = report.into_result().expect("transient errors do not fail the pass");
        assert_eq!(report.racks.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_statefulset_is_retryable() {
        let platform = FakePlatform::new(&format!("{TEST_CLUSTER}-dc1-rack1"), 3);

        let report =
            evaluate_racks(two_racks(3), &platform, &platform, &platform, &guard()).await;

        let err = report.racks[1].outcome.as_ref().unwrap_err();
        assert!(err.is_retryable());
        assert!(report.racks[0].outcome.is_ok());
    }

    #[test]
    fn test_stable_cluster_awaits_change() {
        let report = report(vec![decided(Phase::Stable), decided(Phase::ScaleUpPending)]);

        assert_eq!(report.requeue(), None);
        assert_eq!(report.state(), State::Ready);
        assert_eq!(
            report.action(&OperatorConfig::default()),
            Action::await_change()
        );
    }

    #[test]
    fn test_scale_down_polls() {
        let config = OperatorConfig::default();
        let report = report(vec![
            decided(Phase::Stable),
            decided(Phase::PendingPodRemoval { ordinal: 2 }),
        ]);

        assert_eq!(report.action(&config), Action::requeue(config.poll_interval()));
    }

    #[test]
    fn test_retry_wins_over_poll() {
        let config = OperatorConfig::default();
        let report = report(vec![
            decided(Phase::InProgress { ordinal: 2 }),
            Err(transient()),
        ]);

        assert_eq!(report.action(&config), Action::requeue(config.retry_delay()));
    }

    #[test]
    fn test_violation_fails_pass_after_all_racks() {
        let report = report(vec![Err(violation()), decided(Phase::InProgress { ordinal: 2 })]);

        let status = report.observed_status();
        assert_eq!(status.current_state, State::Degraded);
        assert_eq!(status.racks.len(), 2);
        assert_eq!(status.racks[0].phase, "Error");
        assert_eq!(status.racks[1].phase, "InProgress");
        assert_eq!(status.racks[1].target_ordinal, Some(2));
        assert!(status.last_error.unwrap().contains("refusing to address ordinal 0"));

        let err = report.into_result().unwrap_err();
        assert!(matches!(
            err,
            Error::Racks {
                failed: 1,
                source: decommission::Error::TargetingViolation { .. }
            }
        ));
    }

    #[test]
    fn test_status_for_healthy_pass() {
        let report = report(vec![decided(Phase::Stable), decided(Phase::Stable)]);

        let status = report.status_update(None).unwrap();
        assert_eq!(status.current_state, State::Ready);
        assert_eq!(status.racks[0].name, "dc1/rack1");
        assert_eq!(status.racks[1].stateful_set, "cassandra-demo-dc1-rack2");
        assert_eq!(status.racks[0].current_replicas, Some(3));
        assert!(status.last_error.is_none());
        assert!(status.last_update_time.is_some());
    }

    #[tokio::test]
    async fn test_unchanged_pass_skips_status_write() {
        let rack1 = format!("{TEST_CLUSTER}-dc1-rack1");
        let rack2 = format!("{TEST_CLUSTER}-dc1-rack2");
        let platform = FakePlatform::new(&rack1, 2);
        platform.add_rack(&rack2, 2);
        let guard = guard();

        let first = evaluate_racks(two_racks(2), &platform, &platform, &platform, &guard).await;
        let written = first.status_update(None).unwrap();
        assert_eq!(written.current_state, State::Ready);

        let second = evaluate_racks(two_racks(2), &platform, &platform, &platform, &guard).await;
        assert_eq!(second.status_update(Some(&written)), None);
    }

    #[tokio::test]
    async fn test_progress_rewrites_status() {
        let rack1 = format!("{TEST_CLUSTER}-dc1-rack1");
        let rack2 = format!("{TEST_CLUSTER}-dc1-rack2");
        let platform = FakePlatform::new(&rack1, 3);
        platform.add_rack(&rack2, 2);
        platform.set_mode(&format!("{rack1}-2"), OperationMode::Normal);
        let guard = guard();

        let first = evaluate_racks(two_racks(2), &platform, &platform, &platform, &guard).await;
        let written = first.status_update(None).unwrap();
        assert_eq!(written.racks[0].phase, "NotStarted");

        // commanded node still reports NORMAL
        let second = evaluate_racks(two_racks(2), &platform, &platform, &platform, &guard).await;
        let written = second.status_update(Some(&written)).unwrap();
        assert_eq!(written.racks[0].phase, "CommandIssued");

        let third = evaluate_racks(two_racks(2), &platform, &platform, &platform, &guard).await;
        assert_eq!(third.status_update(Some(&written)), None);

        platform.set_mode(&format!("{rack1}-2"), OperationMode::Leaving);
        let fourth = evaluate_racks(two_racks(2), &platform, &platform, &platform, &guard).await;
        let written = fourth.status_update(Some(&written)).unwrap();
        assert_eq!(written.racks[0].phase, "InProgress");
        assert_eq!(written.current_state, State::ScalingDown);
    }

    #[test]
    fn test_shrink_violation_has_its_own_reason() {
        let shrink = decommission::Error::ShrinkViolation {
            rack: "default/cassandra-demo-dc1-rack1".to_owned(),
            from: 3,
            to: 1,
        };

        assert_eq!(shrink.reason(), "ShrinkViolation");
        assert_eq!(violation().reason(), "TargetingViolation");
    }
}
