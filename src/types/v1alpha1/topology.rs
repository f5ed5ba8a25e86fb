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

use kube::KubeSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DATACENTER: &str = "dc1";
pub const DEFAULT_RACK: &str = "rack1";

/// Datacenters and racks of a cluster. Every rack maps to one StatefulSet.
///
/// An empty topology stands for a single `dc1` datacenter holding a single `rack1` rack.
#[derive(Deserialize, Serialize, Clone, Debug, KubeSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dc: Vec<Datacenter>,
}

#[derive(Deserialize, Serialize, Clone, Debug, KubeSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Datacenter {
    #[x_kube(validation = Rule::new("self != ''").message("datacenter name must not be empty"))]
    pub name: String,

    /// Overrides `spec.nodesPerRacks` for every rack of this datacenter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[x_kube(validation = Rule::new("self >= 1").message("nodesPerRacks must be at least 1"))]
    pub nodes_per_racks: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rack: Vec<Rack>,
}

#[derive(Deserialize, Serialize, Clone, Debug, KubeSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rack {
    #[x_kube(validation = Rule::new("self != ''").message("rack name must not be empty"))]
    pub name: String,
}

impl Topology {
    /// Datacenters as declared, falling back to the implicit `dc1`/`rack1` layout.
    pub fn datacenters(&self) -> Vec<Datacenter> {
        if self.dc.is_empty() {
            return vec![Datacenter::default_layout()];
        }

        self.dc
            .iter()
            .map(|dc| {
                let mut dc = dc.clone();
                if dc.rack.is_empty() {
                    dc.rack.push(Rack {
                        name: DEFAULT_RACK.to_owned(),
                    });
                }
                dc
            })
            .collect()
    }
}

impl Datacenter {
    fn default_layout() -> Self {
        Self {
            name: DEFAULT_DATACENTER.to_owned(),
            nodes_per_racks: None,
            rack: vec![Rack {
                name: DEFAULT_RACK.to_owned(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_topology_defaults_to_single_rack() {
        let dcs = Topology::default().datacenters();

        assert_eq!(dcs.len(), 1);
        assert_eq!(dcs[0].name, DEFAULT_DATACENTER);
        assert_eq!(dcs[0].rack.len(), 1);
        assert_eq!(dcs[0].rack[0].name, DEFAULT_RACK);
    }

    #[test]
    fn test_datacenter_without_racks_gets_default_rack() {
        let topology = Topology {
            dc: vec![Datacenter {
                name: "eu".to_owned(),
                nodes_per_racks: Some(2),
                rack: vec![],
            }],
        };

        let dcs = topology.datacenters();
        assert_eq!(dcs[0].name, "eu");
        assert_eq!(dcs[0].nodes_per_racks, Some(2));
        assert_eq!(dcs[0].rack[0].name, DEFAULT_RACK);
    }
}
