// Copyright Istio Authors
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

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::pods::list::ListProvider;
use crate::pods::metrics::Metrics;
use crate::pods::watch::WatchProvider;
use crate::pods::{PodProvider, PodResolver};
use crate::redirect::iptables::IptablesCommand;
use crate::redirect::loopback::NetlinkAddressTable;
use crate::redirect::{Redirection, RoutingMode, routing};
use crate::{cluster, signal, stats};

/// Performs node setup against the cluster and the kernel, then starts background work.
pub async fn build(config: Arc<Config>) -> anyhow::Result<Bound> {
    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::new(&mut registry));
    let cancel = CancellationToken::new();

    let node_name = config.node_name()?.to_string();
    let client = cluster::client().await?;
    let node = match config.routing_mode {
        Some(_) => None,
        None => Some(cluster::get_node(client.clone(), &node_name).await?),
    };
    let mode = routing::select(config.routing_mode, node.as_ref())?;
    info!(%mode, node = %node_name, "selected routing mode");

    let redirection = redirection(&config, mode)?;
    let (provider, watch_task) = pod_provider(&config, client, &node_name, metrics.clone(), &cancel);

    match build_with(config, redirection, provider, registry, metrics, cancel).await {
        Ok(mut bound) => {
            bound.tasks.extend(watch_task);
            Ok(bound)
        }
        Err(e) => {
            // build_with has already cancelled the token
            if let Some(task) = watch_task {
                if let Err(join) = task.await {
                    warn!("pod watch task failed: {join}");
                }
            }
            Err(e)
        }
    }
}

/// Starts from already constructed components. The redirection is attached here, and it is
/// released again if attaching fails part way.
pub async fn build_with(
    config: Arc<Config>,
    redirection: Redirection,
    provider: Arc<dyn PodProvider>,
    registry: Registry,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> anyhow::Result<Bound> {
    let shutdown = signal::Shutdown::new();
    let stats_server = match stats::Server::bind(config.stats_addr, registry).await {
        Ok(server) => server,
        Err(e) => {
            cancel.cancel();
            return Err(e).context("stats server starts");
        }
    };
    let stats_address = stats_server.address();

    if let Err(e) = redirection.attach().await {
        if let Err(release) = redirection.release().await {
            error!("failed to roll back partial redirection: {release}");
        }
        cancel.cancel();
        return Err(e).context("attaching metadata server redirection");
    }

    let resolver = PodResolver::new(provider, config.pod_lookup_timeout, metrics);
    let tasks = vec![stats_server.spawn(cancel.clone())];

    Ok(Bound {
        stats_address,
        resolver,
        shutdown,
        config,
        cancel,
        redirection,
        tasks,
    })
}

/// Builds the kernel-backed redirection for `mode`.
pub fn redirection(config: &Config, mode: RoutingMode) -> anyhow::Result<Redirection> {
    let addresses = Arc::new(NetlinkAddressTable::connect().context("opening netlink socket")?);
    let rules = Arc::new(IptablesCommand::new(&config.iptables_path));
    Ok(Redirection::new(
        mode,
        addresses,
        rules,
        config.emulator_addr,
    )?)
}

/// Picks the per-call list provider, or the watch cache when enabled.
pub fn pod_provider(
    config: &Config,
    client: kube::Client,
    node_name: &str,
    metrics: Arc<Metrics>,
    cancel: &CancellationToken,
) -> (Arc<dyn PodProvider>, Option<JoinHandle<()>>) {
    let list: Arc<dyn PodProvider> = Arc::new(ListProvider::new(node_name, client.clone()));
    if !config.watch_pods {
        return (list, None);
    }
    let fallback = (!config.watch_pods_disable_fallback).then_some(list);
    let (watch, task) = WatchProvider::start(client, node_name, fallback, metrics, cancel.clone());
    (Arc::new(watch), Some(task))
}

pub struct Bound {
    pub stats_address: SocketAddr,
    pub resolver: PodResolver,

    pub shutdown: signal::Shutdown,
    config: Arc<Config>,
    cancel: CancellationToken,
    redirection: Redirection,
    tasks: Vec<JoinHandle<()>>,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        self.shutdown.wait().await;
        self.cancel.cancel();

        let grace = self.config.termination_grace_period;
        let redirection = self.redirection;
        let tasks = self.tasks;
        let teardown = async move {
            let res = redirection.release().await;
            for task in futures::future::join_all(tasks).await {
                if let Err(e) = task {
                    warn!("background task failed: {e}");
                }
            }
            res
        };
        match time::timeout(grace, teardown).await {
            Ok(Ok(())) => info!("shutdown completed gracefully"),
            Ok(Err(e)) => error!("failed to release metadata server redirection: {e}"),
            Err(_) => warn!("graceful shutdown did not complete in {grace:?}, terminating now"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::construct_config;
    use crate::test_helpers::pods::{FakePodLister, test_pod};
    use crate::test_helpers::redirect::{FakeAddressTable, FakeRuleTable};
    use std::time::Duration;

    fn config() -> Arc<Config> {
        let cfg = construct_config(&|key| match key {
            "NODE_NAME" => Some("node-1".to_string()),
            "EMULATOR_IP" => Some("10.0.0.5".to_string()),
            "STATS_ADDR" => Some("127.0.0.1:0".to_string()),
            _ => None,
        })
        .unwrap();
        Arc::new(cfg)
    }

    fn provider() -> Arc<dyn PodProvider> {
        Arc::new(ListProvider::with_lister(
            "node-1",
            Arc::new(FakePodLister::new(vec![test_pod(
                "ns", "app", "10.1.2.3", "Running",
            )])),
        ))
    }

    fn build_parts(
        cfg: &Config,
        addrs: &Arc<FakeAddressTable>,
        rules: &Arc<FakeRuleTable>,
    ) -> (Redirection, Registry, Arc<Metrics>) {
        let redirection = Redirection::new(
            RoutingMode::Loopback,
            addrs.clone(),
            rules.clone(),
            cfg.emulator_addr,
        )
        .unwrap();
        let mut registry = Registry::default();
        let metrics = Arc::new(Metrics::new(&mut registry));
        (redirection, registry, metrics)
    }

    #[tokio::test]
    async fn lifecycle_restores_kernel_state() {
        let cfg = config();
        let addrs = Arc::new(FakeAddressTable::with_loopback());
        let rules = Arc::new(FakeRuleTable::default());
        let (redirection, registry, metrics) = build_parts(&cfg, &addrs, &rules);

        let bound = build_with(
            cfg,
            redirection,
            provider(),
            registry,
            metrics,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(addrs.addresses().len(), 1);
        assert_eq!(rules.rules().len(), 2);

        let pod = bound
            .resolver
            .resolve_by_ip("10.1.2.3".parse().unwrap(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pod.reference(), "ns/app");

        bound.shutdown.trigger().shutdown_now().await;
        time::timeout(Duration::from_secs(5), bound.wait_termination())
            .await
            .unwrap()
            .unwrap();
        assert!(addrs.addresses().is_empty());
        assert!(rules.rules().is_empty());
    }

    #[tokio::test]
    async fn failed_attach_is_rolled_back() {
        let cfg = config();
        let addrs = Arc::new(FakeAddressTable::with_loopback());
        let rules = Arc::new(FakeRuleTable::default());
        rules.fail_append_on(crate::redirect::iptables::Table::Filter);
        let (redirection, registry, metrics) = build_parts(&cfg, &addrs, &rules);

        let cancel = CancellationToken::new();
        let err = build_with(
            cfg,
            redirection,
            provider(),
            registry,
            metrics,
            cancel.clone(),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("attaching metadata server redirection"));
        assert!(addrs.addresses().is_empty());
        assert!(rules.rules().is_empty());
        assert!(cancel.is_cancelled());
    }
}
