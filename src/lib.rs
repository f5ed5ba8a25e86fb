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
use crate::context::Context;
use crate::reconcile::{error_policy, reconcile_cluster};
use crate::types::v1alpha1::cluster::CassandraCluster;
use futures::StreamExt;
use k8s_openapi::api::apps::v1 as appsv1;
use kube::CustomResourceExt;
use kube::runtime::{Controller, watcher};
use kube::{Api, Client};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub mod config;
mod context;
pub mod jolokia;
pub mod reconcile;
pub mod server;
pub mod types;


pub async fn run(config: OperatorConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("a rustls crypto provider is already installed");
    }

    info!("starting operator with {:?}", config);

    let client = Client::try_default().await?;
    let cluster_client = Api::<CassandraCluster>::all(client.clone());

    let probes = server::ProbeState::default();
    let probe_port = config.probe_port;
    let probe_state = probes.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run(probe_port, probe_state).await {
            error!("probe server stopped: {}", e);
        }
    });

    let context = Context::new(client.clone(), config)?;
    probes.set_ready(true);

    Controller::new(cluster_client, watcher::Config::default())
        .owns(
            Api::<appsv1::StatefulSet>::all(client.clone()),
            watcher::Config::default(),
        )
        .run(reconcile_cluster, error_policy, Arc::new(context))
        .for_each(|res| async move {
            match res {
                Ok((cluster, _)) => info!("reconciled successful, object {:?}", cluster.name),
                Err(e) => warn!("reconcile failed: {}", e),
            }
        })
        .await;

    Ok(())
}

pub async fn crd(file: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer: Pin<Box<dyn AsyncWrite + Send>> = if let Some(file) = file {
        Box::pin(
            tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(file)
                .await?,
        )
    } else {
        Box::pin(tokio::io::stdout())
    };

    writer
        .write_all(serde_yaml_ng::to_string(&CassandraCluster::crd())?.as_bytes())
        .await?;

    Ok(())
}
