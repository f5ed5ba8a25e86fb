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

use crate::config::OperatorConfig;
use crate::jolokia::{self, JolokiaClient};
use crate::reconcile::decommission::{CommandGuard, DisruptionGate, ReplicaSets};
use crate::types;
use crate::types::node::RackRef;
use crate::types::v1alpha1::cluster::CassandraCluster;
use crate::types::v1alpha1::status::Status;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::policy::v1 as policyv1;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Resource, api::Api};
use serde::de::DeserializeOwned;
use serde_json::json;
use snafu::Snafu;
use snafu::futures::TryFutureExt;
use std::fmt::Debug;
use tracing::{debug, info, warn};

pub const FIELD_MANAGER: &str = "cassandra-operator";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Kubernetes API error: {}", source))]
    Kube { source: kube::Error },

    #[snafu(display("record event error: {}", source))]
    Record { source: kube::Error },

    #[snafu(transparent)]
    Types { source: types::error::Error },

    #[snafu(display("{} '{}' not found", kind, name))]
    MissingObject { kind: String, name: String },

    #[snafu(transparent)]
    Serde { source: serde_json::Error },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(e),
            } => e.code == 404,
            Error::MissingObject { .. } => true,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(e),
            } if e.code == 409
        )
    }
}

pub struct Context {
    pub(crate) client: kube::Client,
    pub(crate) recorder: Recorder,
    pub(crate) config: OperatorConfig,
    pub(crate) jolokia: JolokiaClient,
    pub(crate) guard: CommandGuard,
}

impl Context {
    pub fn new(client: kube::Client, config: OperatorConfig) -> Result<Self, jolokia::Error> {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: std::env::var("HOSTNAME").ok(),
        };

        let recorder = Recorder::new(client.clone(), reporter);
        let jolokia = JolokiaClient::new(&config)?;
        let guard = CommandGuard::new(config.command_resend_window());

        Ok(Self {
            client,
            recorder,
            config,
            jolokia,
            guard,
        })
    }

    /// send event
    #[inline]
    pub async fn record(
        &self,
        resource: &CassandraCluster,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<(), Error> {
        self.recorder
            .publish(
                &Event {
                    type_: event_type,
                    reason: reason.to_owned(),
                    note: Some(message.into()),
                    action: "Decommission".into(),
                    secondary: None,
                },
                &resource.object_ref(&()),
            )
            .context(RecordSnafu)
            .await
    }

    pub async fn update_status(
        &self,
        resource: &CassandraCluster,
        status: &Status,
    ) -> Result<CassandraCluster, Error> {
        let api: Api<CassandraCluster> =
            Api::namespaced(self.client.clone(), &resource.namespace()?);
        let name = &resource.name();

        let update_func = async |cluster: &CassandraCluster| {
            let mut latest = cluster.clone();
            latest.status = Some(status.clone());
            let body = serde_json::to_vec(&latest)?;

            api.replace_status(name, &PostParams::default(), &latest)
                .context(KubeSnafu)
                .await
        };

        match update_func(resource).await {
            Err(e) if e.is_conflict() => {}
            result => return result,
        }

        info!("status update failed due to conflict, retrieve the latest resource and retry.");

        let new_one = api.get(name).context(KubeSnafu).await?;
        update_func(&new_one).await
    }

    pub async fn get<T>(&self, name: &str, namespace: &str) -> Result<T, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as kube::Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).context(KubeSnafu).await
    }

    pub async fn get_opt<T>(&self, name: &str, namespace: &str) -> Result<Option<T>, Error>
    where
        T: Clone + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
        <T as kube::Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).context(KubeSnafu).await
    }
}

impl ReplicaSets for Context {
    async fn replica_count(&self, rack: &RackRef) -> Result<i32, Error> {
        let statefulset = self
            .get_opt::<appsv1::StatefulSet>(&rack.statefulset, &rack.namespace)
            .await?
            .ok_or_else(|| Error::MissingObject {
                kind: "StatefulSet".to_owned(),
                name: rack.to_string(),
            })?;

        // an unset replica count means 1, as for the StatefulSet controller
        Ok(statefulset
            .spec
            .and_then(|spec| spec.replicas)
            .unwrap_or(1))
    }

    /// Merge patch of `spec.replicas` only, so concurrent changes to other fields survive.
    async fn set_replica_count(&self, rack: &RackRef, replicas: i32) -> Result<(), Error> {
        let api: Api<appsv1::StatefulSet> =
            Api::namespaced(self.client.clone(), &rack.namespace);
        let patch = json!({ "spec": { "replicas": replicas } });

        api.patch(
            &rack.statefulset,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_owned()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .context(KubeSnafu)
        .await?;

        Ok(())
    }

    async fn pod_exists(&self, rack: &RackRef, ordinal: i32) -> Result<bool, Error> {
        let pod = self
            .get_opt::<corev1::Pod>(&rack.pod_name(ordinal), &rack.namespace)
            .await?;
        Ok(pod.is_some())
    }
}

impl DisruptionGate for Context {
    async fn disruption_allowed(&self, rack: &RackRef) -> Result<bool, Error> {
        let pdb = self
            .get_opt::<policyv1::PodDisruptionBudget>(rack.pdb_name(), &rack.namespace)
            .await?;

        let Some(pdb) = pdb else {
            warn!(
                "PodDisruptionBudget {}/{} not found, no disruption allowed",
                rack.namespace,
                rack.pdb_name()
            );
            return Ok(false);
        };

        let allowed = pdb
            .status
            .map(|status| status.disruptions_allowed)
            .unwrap_or_default();
        debug!(
            "PodDisruptionBudget {}/{} allows {} disruption(s)",
            rack.namespace,
            rack.pdb_name(),
            allowed
        );

        Ok(allowed > 0)
    }
}
