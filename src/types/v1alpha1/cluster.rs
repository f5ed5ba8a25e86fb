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

use crate::types;
use crate::types::error::{InvalidTopologySnafu, NoNamespaceSnafu};
use crate::types::node::{DeclaredRack, RackRef};
use crate::types::v1alpha1::topology::Topology;
use kube::{CustomResource, KubeSchema, ResourceExt};
use serde::{Deserialize, Serialize};
use snafu::OptionExt;
use std::collections::HashSet;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, KubeSchema, Default)]
#[kube(
    group = "db.cassop.io",
    version = "v1alpha1",
    kind = "CassandraCluster",
    namespaced,
    status = "crate::types::v1alpha1::status::Status",
    shortname = "cassc",
    plural = "cassandraclusters",
    singular = "cassandracluster",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.currentState"}"#,
    printcolumn = r#"{"name":"Nodes/Rack", "type":"integer", "jsonPath":".spec.nodesPerRacks"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    crates(serde_json = "k8s_openapi::serde_json")
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraClusterSpec {
    /// Number of Cassandra nodes in every rack, unless a datacenter overrides it.
    #[x_kube(validation = Rule::new("self >= 1").message("nodesPerRacks must be at least 1"))]
    pub nodes_per_racks: i32,

    #[serde(default)]
    pub topology: Topology,

    /// Headless service resolving the Cassandra pods. Defaults to the cluster name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

impl CassandraCluster {
    pub fn namespace(&self) -> Result<String, types::error::Error> {
        ResourceExt::namespace(self).context(NoNamespaceSnafu)
    }

    pub fn name(&self) -> String {
        ResourceExt::name_any(self)
    }

    pub fn headless_service_name(&self) -> String {
        self.spec
            .service_name
            .clone()
            .unwrap_or_else(|| self.name())
    }

    pub fn statefulset_name(&self, dc: &str, rack: &str) -> String {
        format!("{}-{}-{}", self.name(), dc, rack)
    }

    /// Every rack of the cluster with the replica count its datacenter asks for.
    ///
    /// Datacenter names must be unique within the cluster and rack names unique within
    /// their datacenter, otherwise two racks would share a StatefulSet.
    pub fn racks(&self) -> Result<Vec<DeclaredRack>, types::error::Error> {
        let namespace = self.namespace()?;
        let service = self.headless_service_name();

        let mut seen = HashSet::new();
        let mut racks = Vec::new();

        for dc in self.spec.topology.datacenters() {
            let desired_replicas = dc.nodes_per_racks.unwrap_or(self.spec.nodes_per_racks);
            if desired_replicas < 0 {
                return InvalidTopologySnafu {
                    name: self.name(),
                    message: format!("datacenter {} asks for {desired_replicas} nodes per rack", dc.name),
                }
                .fail();
            }

            for rack in &dc.rack {
                if dc.name.is_empty() || rack.name.is_empty() {
                    return InvalidTopologySnafu {
                        name: self.name(),
                        message: "datacenter and rack names must not be empty".to_owned(),
                    }
                    .fail();
                }

                let statefulset = self.statefulset_name(&dc.name, &rack.name);
                if !seen.insert(statefulset.clone()) {
                    return InvalidTopologySnafu {
                        name: self.name(),
                        message: format!("rack {}/{} is declared twice", dc.name, rack.name),
                    }
                    .fail();
                }

                racks.push(DeclaredRack {
                    rack: RackRef {
                        cluster: self.name(),
                        namespace: namespace.clone(),
                        datacenter: dc.name.clone(),
                        rack: rack.name.clone(),
                        statefulset,
                        service: service.clone(),
                    },
                    desired_replicas,
                });
            }
        }

        Ok(racks)
    }
}
