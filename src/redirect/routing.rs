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

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Node;

use super::Error;

/// Annotation (or label) on the Node object selecting how traffic is routed to the emulator.
pub const ROUTING_MODE_KEY: &str = "node.gke-metadata-server.matheuscscp.io/routingMode";

#[derive(serde::Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    /// Loopback alias plus DNAT and forward rules.
    #[default]
    Loopback,
    /// cgroup connect hook. Recognised so it can be rejected with a clear error.
    #[serde(rename = "eBPF")]
    Ebpf,
    /// Nothing is installed; something else routes the traffic.
    None,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RoutingMode::Loopback => "Loopback",
            RoutingMode::Ebpf => "eBPF",
            RoutingMode::None => "None",
        })
    }
}

impl FromStr for RoutingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Loopback" => Ok(RoutingMode::Loopback),
            "eBPF" => Ok(RoutingMode::Ebpf),
            "None" => Ok(RoutingMode::None),
            other => Err(Error::InvalidRoutingMode(other.to_string())),
        }
    }
}

/// Reads the routing mode off the node, preferring the annotation over the label.
pub fn from_node(node: &Node) -> Result<Option<RoutingMode>, Error> {
    let meta = &node.metadata;
    let lookup = |m: &Option<BTreeMap<String, String>>| {
        m.as_ref()
            .and_then(|m| m.get(ROUTING_MODE_KEY))
            .filter(|v| !v.is_empty())
            .cloned()
    };
    lookup(&meta.annotations)
        .or_else(|| lookup(&meta.labels))
        .map(|v| v.parse())
        .transpose()
}

/// Picks the routing mode: an explicit override wins, then the node, then the default.
pub fn select(configured: Option<RoutingMode>, node: Option<&Node>) -> Result<RoutingMode, Error> {
    if let Some(mode) = configured {
        return Ok(mode);
    }
    match node {
        Some(node) => Ok(from_node(node)?.unwrap_or_default()),
        None => Ok(RoutingMode::default()),
    }
}
