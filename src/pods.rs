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

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod list;
pub mod metrics;
pub mod watch;

use metrics::{LookupOutcome, Metrics};

#[derive(serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<Option<&str>> for PodPhase {
    fn from(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// The fields of a Pod needed to attribute traffic to it.
#[derive(serde::Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub ip: Option<IpAddr>,
    pub phase: PodPhase,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub host_network: bool,
}

impl PodRecord {
    /// `namespace/name`
    pub fn reference(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// A pod being torn down, or one that already finished, no longer owns its IP.
    pub fn is_running(&self) -> bool {
        self.deletion_timestamp.is_none()
            && !matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl From<&Pod> for PodRecord {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        PodRecord {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            ip: pod_ip(pod),
            phase: status.and_then(|s| s.phase.as_deref()).into(),
            deletion_timestamp: pod.metadata.deletion_timestamp.as_ref().map(|t| t.0),
            host_network: pod
                .spec
                .as_ref()
                .and_then(|s| s.host_network)
                .unwrap_or(false),
        }
    }
}

pub(crate) fn pod_ip(pod: &Pod) -> Option<IpAddr> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| ip.parse().ok())
}

/// ResolutionQuery selects the candidate owners of an IP on one node.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionQuery<'a> {
    pub node_name: &'a str,
    pub ip: IpAddr,
}

impl ResolutionQuery<'_> {
    /// Host network pods are excluded here rather than after the fact: they share the node IP
    /// and can never be told apart by address.
    pub fn field_selector(&self) -> String {
        [
            format!("spec.nodeName={}", self.node_name),
            "spec.hostNetwork=false".to_string(),
            format!("status.podIP={}", self.ip),
        ]
        .join(",")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error listing pods in the node matching pod ip {ip}: {source}")]
    Query {
        ip: IpAddr,
        #[source]
        source: kube::Error,
    },
    #[error("no pods found in the node matching pod ip {0}")]
    NotFound(IpAddr),
    #[error("multiple pods found in the node matching pod ip {ip} ({} pods): {}", .refs.len(), .refs.join(", "))]
    AmbiguousOwner { ip: IpAddr, refs: Vec<String> },
    #[error("lookup of pod ip {0} was cancelled")]
    Cancelled(IpAddr),
    #[error("lookup of pod ip {ip} timed out after {timeout:?}")]
    Timeout { ip: IpAddr, timeout: Duration },
    #[error("cache: {0}")]
    Cache(Box<Error>),
}

impl Error {
    /// Whether trying again later may give a different answer without the cluster changing.
    ///
    /// `NotFound` is a definitive answer for the current cluster state and is not
    /// retryable here. A caller that expects the pod to appear shortly, such as a
    /// request racing pod startup, decides on its own whether to retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query { .. } | Error::Timeout { .. } => true,
            Error::Cache(inner) => inner.is_retryable(),
            Error::NotFound(_) | Error::AmbiguousOwner { .. } | Error::Cancelled(_) => false,
        }
    }

    pub fn outcome(&self) -> LookupOutcome {
        match self {
            Error::Query { .. } => LookupOutcome::QueryError,
            Error::NotFound(_) => LookupOutcome::NotFound,
            Error::AmbiguousOwner { .. } => LookupOutcome::Ambiguous,
            Error::Cancelled(_) => LookupOutcome::Cancelled,
            Error::Timeout { .. } => LookupOutcome::Timeout,
            Error::Cache(inner) => inner.outcome(),
        }
    }
}

/// Applies the liveness filter and the single-owner rule to the candidates for `ip`.
pub fn select_owner(
    ip: IpAddr,
    candidates: impl IntoIterator<Item = PodRecord>,
) -> Result<PodRecord, Error> {
    let mut running: Vec<PodRecord> = candidates.into_iter().filter(PodRecord::is_running).collect();
    match running.len() {
        0 => Err(Error::NotFound(ip)),
        1 => Ok(running.remove(0)),
        _ => Err(Error::AmbiguousOwner {
            ip,
            refs: running.iter().map(PodRecord::reference).collect(),
        }),
    }
}

/// PodProvider looks up the pod owning an IP on this node.
#[async_trait::async_trait]
pub trait PodProvider: Send + Sync {
    async fn get_by_ip(&self, ip: IpAddr) -> Result<PodRecord, Error>;
}

/// PodResolver is the entry point used per intercepted request. It bounds each lookup by a
/// timeout and by the caller's cancellation token, and records the outcome.
#[derive(Clone)]
pub struct PodResolver {
    provider: Arc<dyn PodProvider>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for PodResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PodResolver")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PodResolver {
    pub fn new(provider: Arc<dyn PodProvider>, timeout: Duration, metrics: Arc<Metrics>) -> Self {
        PodResolver {
            provider,
            timeout,
            metrics,
        }
    }

    pub async fn resolve_by_ip(
        &self,
        ip: IpAddr,
        cancel: &CancellationToken,
    ) -> Result<PodRecord, Error> {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(ip)),
            res = tokio::time::timeout(self.timeout, self.provider.get_by_ip(ip)) => match res {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout { ip, timeout: self.timeout }),
            },
        };
        match &res {
            Ok(pod) => debug!(%ip, pod = %pod.reference(), "resolved pod"),
            Err(e) => debug!(%ip, "failed to resolve pod: {e}"),
        }
        self.metrics.record_lookup(match &res {
            Ok(_) => LookupOutcome::Found,
            Err(e) => e.outcome(),
        });
        res
    }
}
