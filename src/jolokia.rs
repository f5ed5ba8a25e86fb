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

//! Client for the Jolokia agent (JMX over HTTP) running next to every Cassandra node.
//!
//! Only two calls are needed: reading `StorageService.OperationMode` and invoking
//! `StorageService.decommission`. Every failure is attributable to one node and is
//! retryable.

use crate::config::OperatorConfig;
use crate::reconcile::decommission::NodeHealth;
use crate::types::node::NodeRef;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::debug;

pub const STORAGE_SERVICE_MBEAN: &str = "org.apache.cassandra.db:type=StorageService";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to build http client: {}", source))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("jolokia request to {} timed out", node))]
    Timeout { node: String },

    #[snafu(display("jolokia on {} is unreachable: {}", node, source))]
    Unreachable { node: String, source: reqwest::Error },

    #[snafu(display("jolokia on {} answered with http status {}", node, status))]
    HttpStatus { node: String, status: u16 },

    #[snafu(display("jolokia on {} rejected the request with status {}: {}", node, status, message))]
    Rejected {
        node: String,
        status: u16,
        message: String,
    },

    #[snafu(display("cannot decode jolokia response from {}: {}", node, source))]
    Decode { node: String, source: reqwest::Error },

    #[snafu(display("jolokia on {} returned an unexpected value: {}", node, value))]
    UnexpectedValue { node: String, value: String },
}

impl Error {
    fn from_send(node: &NodeRef, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Error::Timeout {
                node: node.to_string(),
            }
        } else {
            Error::Unreachable {
                node: node.to_string(),
                source,
            }
        }
    }
}

/// Membership state of a node as reported by `StorageService.OperationMode`.
#[derive(Clone, Debug, PartialEq, Eq, Display, EnumString)]
pub enum OperationMode {
    #[strum(serialize = "NORMAL")]
    Normal,

    #[strum(serialize = "LEAVING")]
    Leaving,

    #[strum(serialize = "DECOMMISSIONED")]
    Decommissioned,

    #[strum(serialize = "STARTING")]
    Starting,

    #[strum(serialize = "JOINING")]
    Joining,

    #[strum(serialize = "MOVING")]
    Moving,

    #[strum(serialize = "DRAINING")]
    Draining,

    #[strum(serialize = "DRAINED")]
    Drained,

    #[strum(default)]
    Unknown(String),
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Request<'a> {
    Read {
        mbean: &'a str,
        attribute: &'a str,
    },
    Exec {
        mbean: &'a str,
        operation: &'a str,
    },
}

#[derive(Deserialize, Debug)]
struct Response {
    status: u16,

    #[serde(default)]
    value: serde_json::Value,

    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct JolokiaClient {
    http: reqwest::Client,
    port: u16,
    cluster_domain: String,
    read_timeout: Duration,
    command_timeout: Duration,
}

impl JolokiaClient {
    pub fn new(config: &OperatorConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.jolokia_read_timeout())
            .build()
            .context(BuildClientSnafu)?;

        Ok(Self::with_http_client(http, config))
    }

    pub fn with_http_client(http: reqwest::Client, config: &OperatorConfig) -> Self {
        Self {
            http,
            port: config.jolokia_port,
            cluster_domain: config.cluster_domain.clone(),
            read_timeout: config.jolokia_read_timeout(),
            command_timeout: config.jolokia_command_timeout(),
        }
    }

    pub fn url(&self, node: &NodeRef) -> String {
        format!(
            "http://{}:{}/jolokia/",
            node.fqdn(&self.cluster_domain),
            self.port
        )
    }

    async fn call(
        &self,
        node: &NodeRef,
        request: &Request<'_>,
        timeout: Duration,
    ) -> Result<serde_json::Value, Error> {
        let url = self.url(node);
        debug!("jolokia {:?} on {}", request, url);

        let response = self
            .http
            .post(&url)
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::from_send(node, e))?;

        let status = response.status();
        if !status.is_success() {
            return HttpStatusSnafu {
                node: node.to_string(),
                status: status.as_u16(),
            }
            .fail();
        }

        let body: Response = response.json().await.map_err(|source| {
            if source.is_timeout() {
                Error::Timeout {
                    node: node.to_string(),
                }
            } else {
                Error::Decode {
                    node: node.to_string(),
                    source,
                }
            }
        })?;

        if body.status != 200 {
            return RejectedSnafu {
                node: node.to_string(),
                status: body.status,
                message: body.error.unwrap_or_default(),
            }
            .fail();
        }

        Ok(body.value)
    }
}

impl NodeHealth for JolokiaClient {
    async fn operation_mode(&self, node: &NodeRef) -> Result<OperationMode, Error> {
        let value = self
            .call(
                node,
                &Request::Read {
                    mbean: STORAGE_SERVICE_MBEAN,
                    attribute: "OperationMode",
                },
                self.read_timeout,
            )
            .await?;

        match value.as_str() {
            Some(mode) => Ok(mode
                .parse()
                .unwrap_or_else(|_| OperationMode::Unknown(mode.to_owned()))),
            None => UnexpectedValueSnafu {
                node: node.to_string(),
                value: value.to_string(),
            }
            .fail(),
        }
    }

    /// Asks the node to stream its data to the rest of the ring and leave it.
    async fn decommission(&self, node: &NodeRef) -> Result<(), Error> {
        self.call(
            node,
            &Request::Exec {
                mbean: STORAGE_SERVICE_MBEAN,
                operation: "decommission",
            },
            self.command_timeout,
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::node::RackRef;
    use serde_json::json;
    use std::net::SocketAddr;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn node() -> NodeRef {
        RackRef {
            cluster: "cassandra-demo".to_owned(),
            namespace: "default".to_owned(),
            datacenter: "dc1".to_owned(),
            rack: "rack1".to_owned(),
            statefulset: "cassandra-demo-dc1-rack1".to_owned(),
            service: "cassandra-demo".to_owned(),
        }
        .node(2)
    }

    // The node's FQDN is resolved to `addr`, the port comes from the URL.
    fn client_at(addr: SocketAddr) -> JolokiaClient {
        let config = OperatorConfig {
            jolokia_port: addr.port(),
            jolokia_read_timeout_secs: 1,
            jolokia_command_timeout_secs: 1,
            ..Default::default()
        };
        let http = reqwest::Client::builder()
            .resolve(&node().fqdn(&config.cluster_domain), addr)
            .build()
            .unwrap();

        JolokiaClient::with_http_client(http, &config)
    }

    fn client_for(server: &MockServer) -> JolokiaClient {
        client_at(*server.address())
    }

    fn read_body() -> serde_json::Value {
        json!({
            "type": "read",
            "mbean": STORAGE_SERVICE_MBEAN,
            "attribute": "OperationMode"
        })
    }

    fn read_response(mode: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "request": read_body(),
            "value": mode,
            "timestamp": 1528850319,
            "status": 200
        }))
    }

    #[test]
    fn test_operation_mode_parsing() {
        assert_eq!("NORMAL".parse::<OperationMode>().unwrap(), OperationMode::Normal);
        assert_eq!("LEAVING".parse::<OperationMode>().unwrap(), OperationMode::Leaving);
        assert_eq!(
            "DECOMMISSIONED".parse::<OperationMode>().unwrap(),
            OperationMode::Decommissioned
        );
        assert_eq!(
            "SHUFFLING".parse::<OperationMode>().unwrap(),
            OperationMode::Unknown("SHUFFLING".to_owned())
        );
    }

    #[test]
    fn test_url_uses_node_fqdn() {
        let client = JolokiaClient::new(&OperatorConfig::default()).unwrap();
        assert_eq!(
            client.url(&node()),
            "http://cassandra-demo-dc1-rack1-2.cassandra-demo.default.svc.cluster.local:8778/jolokia/"
        );
    }

    #[tokio::test]
    async fn test_read_operation_mode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jolokia/"))
            .and(body_json(read_body()))
            .respond_with(read_response("LEAVING"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let mode = client.operation_mode(&node()).await.unwrap();

        assert_eq!(mode, OperationMode::Leaving);
    }

    #[tokio::test]
    async fn test_decommission_sends_exec() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jolokia/"))
            .and(body_json(json!({
                "type": "exec",
                "mbean": STORAGE_SERVICE_MBEAN,
                "operation": "decommission"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": null,
                "status": 200
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.decommission(&node()).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.operation_mode(&node()).await.unwrap_err();

        assert!(matches!(err, Error::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_embedded_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error_type": "javax.management.InstanceNotFoundException",
                "error": "javax.management.InstanceNotFoundException : org.apache.cassandra.db:type=StorageService",
                "status": 404
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.decommission(&node()).await.unwrap_err();

        assert!(matches!(err, Error::Rejected { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_non_string_value_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": 42,
                "status": 200
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.operation_mode(&node()).await.unwrap_err();

        assert!(matches!(err, Error::UnexpectedValue { .. }));
    }

    #[tokio::test]
    async fn test_slow_node_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(read_response("NORMAL").set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.operation_mode(&node()).await.unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }), "got {err}");
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let client = client_at(addr);

        let err = client.operation_mode(&node()).await.unwrap_err();
        assert!(matches!(err, Error::Unreachable { .. }), "got {err}");
    }
}
