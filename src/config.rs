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

use clap::Args;
use std::time::Duration;

pub const DEFAULT_JOLOKIA_PORT: u16 = 8778;
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Runtime settings of the controller, taken from flags or environment variables.
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Port of the Jolokia agent running next to every Cassandra node.
    #[arg(long, env = "CASSOP_JOLOKIA_PORT", default_value_t = DEFAULT_JOLOKIA_PORT)]
    pub jolokia_port: u16,

    /// Timeout in seconds for reading a node's operation mode.
    #[arg(long, env = "CASSOP_JOLOKIA_READ_TIMEOUT", default_value_t = 5)]
    pub jolokia_read_timeout_secs: u64,

    /// Timeout in seconds for the decommission command.
    #[arg(long, env = "CASSOP_JOLOKIA_COMMAND_TIMEOUT", default_value_t = 30)]
    pub jolokia_command_timeout_secs: u64,

    /// DNS domain of the Kubernetes cluster.
    #[arg(long, env = "CASSOP_CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
    pub cluster_domain: String,

    /// Requeue delay in seconds while a rack is removing a node.
    #[arg(long, env = "CASSOP_POLL_INTERVAL", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Requeue delay in seconds after a transient failure.
    #[arg(long, env = "CASSOP_RETRY_DELAY", default_value_t = 5)]
    pub retry_delay_secs: u64,

    /// Requeue delay in seconds after a failed pass.
    #[arg(long, env = "CASSOP_ERROR_BACKOFF", default_value_t = 60)]
    pub error_backoff_secs: u64,

    /// Seconds during which a node still reporting NORMAL is not commanded again.
    #[arg(long, env = "CASSOP_COMMAND_RESEND_WINDOW", default_value_t = 300)]
    pub command_resend_window_secs: u64,

    /// Port of the /healthz and /readyz endpoints.
    #[arg(long, env = "CASSOP_PROBE_PORT", default_value_t = 8080)]
    pub probe_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            jolokia_port: DEFAULT_JOLOKIA_PORT,
            jolokia_read_timeout_secs: 5,
            jolokia_command_timeout_secs: 30,
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_owned(),
            poll_interval_secs: 10,
            retry_delay_secs: 5,
            error_backoff_secs: 60,
            command_resend_window_secs: 300,
            probe_port: 8080,
        }
    }
}

impl OperatorConfig {
    pub fn jolokia_read_timeout(&self) -> Duration {
        Duration::from_secs(self.jolokia_read_timeout_secs)
    }

    pub fn jolokia_command_timeout(&self) -> Duration {
        Duration::from_secs(self.jolokia_command_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn command_resend_window(&self) -> Duration {
        Duration::from_secs(self.command_resend_window_secs)
    }
}
