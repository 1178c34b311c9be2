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

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::redirect::RoutingMode;

const NODE_NAME: &str = "NODE_NAME";
const EMULATOR_IP: &str = "EMULATOR_IP";
const DAEMONSET_IP: &str = "DAEMONSET_IP";
const EMULATOR_PORT: &str = "EMULATOR_PORT";
const DAEMONSET_PORT: &str = "DAEMONSET_PORT";
const ROUTING_MODE: &str = "ROUTING_MODE";
const WATCH_PODS: &str = "WATCH_PODS";
const WATCH_PODS_DISABLE_FALLBACK: &str = "WATCH_PODS_DISABLE_FALLBACK";
const POD_LOOKUP_TIMEOUT: &str = "POD_LOOKUP_TIMEOUT";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const STATS_ADDR: &str = "STATS_ADDR";
const IPTABLES_PATH: &str = "IPTABLES_PATH";

const DEFAULT_EMULATOR_PORT: u16 = 8080;
const DEFAULT_STATS_PORT: u16 = 15020;
const DEFAULT_POD_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(20);
const DEFAULT_IPTABLES_PATH: &str = "iptables";

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Name of the node this agent runs on; pods are only resolved on this node.
    pub node_name: Option<String>,
    /// Where the emulator listens. Required when traffic is redirected.
    pub emulator_addr: Option<SocketAddrV4>,
    /// Overrides the routing mode read from the node.
    pub routing_mode: Option<RoutingMode>,
    pub watch_pods: bool,
    pub watch_pods_disable_fallback: bool,
    pub pod_lookup_timeout: Duration,
    pub termination_grace_period: Duration,
    pub stats_addr: SocketAddr,
    pub iptables_path: PathBuf,
}

impl Config {
    pub fn node_name(&self) -> Result<&str, Error> {
        self.node_name
            .as_deref()
            .ok_or(Error::MissingEnvVar(NODE_NAME))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("env var {0} is required")]
    MissingEnvVar(&'static str),
}

/// DurationStr accepts values like `5s`, `1m30s` or `250ms`.
struct DurationStr(Duration);

impl FromStr for DurationStr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s).map(DurationStr)
    }
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn parse<T: FromStr>(env: Lookup, key: &str) -> Result<Option<T>, Error> {
    match env(key) {
        Some(val) => val
            .parse()
            .map(Some)
            .map_err(|_| Error::EnvVar(key.to_string(), val)),
        None => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: Lookup, key: &str, default: T) -> Result<T, Error> {
    parse(env, key).map(|v| v.unwrap_or(default))
}

/// Parses the first of `keys` that is set.
fn parse_first<T: FromStr>(env: Lookup, keys: &[&str]) -> Result<Option<T>, Error> {
    for key in keys {
        if let Some(v) = parse(env, key)? {
            return Ok(Some(v));
        }
    }
    Ok(None)
}

pub fn parse_config() -> Result<Config, Error> {
    construct_config(&|key| std::env::var(key).ok())
}

/// Builds the configuration from `env`. Empty values count as unset.
pub fn construct_config(env: Lookup) -> Result<Config, Error> {
    let env: Lookup = &|key| env(key).filter(|v| !v.is_empty());

    let emulator_ip: Option<Ipv4Addr> = parse_first(env, &[EMULATOR_IP, DAEMONSET_IP])?;
    let emulator_port =
        parse_first(env, &[EMULATOR_PORT, DAEMONSET_PORT])?.unwrap_or(DEFAULT_EMULATOR_PORT);

    Ok(Config {
        node_name: parse(env, NODE_NAME)?,
        emulator_addr: emulator_ip.map(|ip| SocketAddrV4::new(ip, emulator_port)),
        routing_mode: parse(env, ROUTING_MODE)?,
        watch_pods: parse_default(env, WATCH_PODS, false)?,
        watch_pods_disable_fallback: parse_default(env, WATCH_PODS_DISABLE_FALLBACK, false)?,
        pod_lookup_timeout: parse(env, POD_LOOKUP_TIMEOUT)?
            .map(|d: DurationStr| d.0)
            .unwrap_or(DEFAULT_POD_LOOKUP_TIMEOUT),
        termination_grace_period: parse(env, TERMINATION_GRACE_PERIOD)?
            .map(|d: DurationStr| d.0)
            .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD),
        stats_addr: parse_default(
            env,
            STATS_ADDR,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_STATS_PORT),
        )?,
        iptables_path: parse_default(env, IPTABLES_PATH, PathBuf::from(DEFAULT_IPTABLES_PATH))?,
    })
}
