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

//! Runtime identities of racks and nodes, derived from a cluster's declared topology.

use std::fmt;

/// One rack of one cluster, i.e. one StatefulSet.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RackRef {
    pub cluster: String,
    pub namespace: String,
    pub datacenter: String,
    pub rack: String,
    pub statefulset: String,
    /// Headless service resolving the pods of the cluster.
    pub service: String,
}

impl RackRef {
    pub fn node(&self, ordinal: i32) -> NodeRef {
        NodeRef {
            rack: self.clone(),
            ordinal,
        }
    }

    pub fn pod_name(&self, ordinal: i32) -> String {
        format!("{}-{}", self.statefulset, ordinal)
    }

    pub fn pdb_name(&self) -> &str {
        &self.cluster
    }
}

impl fmt::Display for RackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.statefulset)
    }
}

/// A rack together with the replica count the cluster spec asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeclaredRack {
    pub rack: RackRef,
    pub desired_replicas: i32,
}

/// A single storage node, addressed by the ordinal of its pod.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub rack: RackRef,
    pub ordinal: i32,
}

impl NodeRef {
    pub fn pod_name(&self) -> String {
        self.rack.pod_name(self.ordinal)
    }

    /// Format: {statefulset}-{ordinal}.{service}.{namespace}.svc.{cluster_domain}
    pub fn fqdn(&self, cluster_domain: &str) -> String {
        format!(
            "{}.{}.{}.svc.{}",
            self.pod_name(),
            self.rack.service,
            self.rack.namespace,
            cluster_domain.trim_matches('.')
        )
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rack.namespace, self.pod_name())
    }
}
