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

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use gke_metadata_agent::pods::list::ListProvider;
use gke_metadata_agent::pods::metrics::Metrics;
use gke_metadata_agent::pods::PodResolver;
use gke_metadata_agent::redirect::iptables::{IptablesCommand, RedirectRuleManager};
use gke_metadata_agent::*;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn main() -> anyhow::Result<()> {
    telemetry::setup_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().cloned();
    match command.as_deref() {
        None | Some("run") | Some("init-network") | Some("resolve") => (),
        Some("version") => return version(),
        Some("help") => return help(),
        Some(unknown) => {
            eprintln!("unknown command: {unknown}");
            help()?;
            std::process::exit(1)
        }
    };

    let config = Arc::new(config::parse_config()?);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        match command.as_deref() {
            Some("init-network") => init_network(config).await,
            Some("resolve") => {
                let ip = args
                    .get(1)
                    .context("usage: resolve <ip>")?
                    .parse::<IpAddr>()
                    .context("invalid pod ip")?;
                resolve(config, ip).await
            }
            _ => run(config).await,
        }
    })
}

fn help() -> anyhow::Result<()> {
    let version = version::BuildInfo::new();
    println!(
        "
GKE Metadata Agent ({version})

Commands:
run (default)   - Redirect metadata server traffic on this node until terminated
init-network    - Install the redirect rules in the current network namespace and exit
resolve <ip>    - Print the namespace/name of the pod on this node owning <ip>
version         - Print the version of the agent
help            - Print commands and version of the agent"
    );
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", version::BuildInfo::new());
    Ok(())
}

async fn run(cfg: Arc<config::Config>) -> anyhow::Result<()> {
    info!("version: {}", version::BuildInfo::new());
    info!("running with config: {}", serde_yaml::to_string(&cfg)?);
    app::build(cfg).await?.wait_termination().await
}

async fn init_network(cfg: Arc<config::Config>) -> anyhow::Result<()> {
    let emulator = cfg
        .emulator_addr
        .ok_or(config::Error::MissingEnvVar("EMULATOR_IP"))?;
    let rules = RedirectRuleManager::new(
        Arc::new(IptablesCommand::new(&cfg.iptables_path)),
        *emulator.ip(),
        emulator.port(),
    );
    rules.install().await?;
    Ok(())
}

async fn resolve(cfg: Arc<config::Config>, ip: IpAddr) -> anyhow::Result<()> {
    let client = cluster::client().await?;
    let provider = Arc::new(ListProvider::new(cfg.node_name()?, client));
    let metrics = Arc::new(Metrics::new(&mut Registry::default()));
    let resolver = PodResolver::new(provider, cfg.pod_lookup_timeout, metrics);
    let pod = resolver.resolve_by_ip(ip, &CancellationToken::new()).await?;
    println!("{}", pod.reference());
    Ok(())
}
