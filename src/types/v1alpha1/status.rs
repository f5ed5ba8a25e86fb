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

pub mod rack;
pub mod state;

use kube::KubeSchema;
use serde::{Deserialize, Serialize};

/// Observed state of a cluster, written when a reconcile pass sees something new.
///
/// Decisions never depend on it: every decision is derived from live objects.
#[derive(Deserialize, Serialize, Clone, Debug, KubeSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default)]
    pub current_state: state::State,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub racks: Vec<rack::Rack>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

impl Status {
    /// Equal apart from `last_update_time`.
    pub fn same_observation(&self, other: &Status) -> bool {
        self.current_state == other.current_state
            && self.racks == other.racks
            && self.last_error == other.last_error
    }
}
