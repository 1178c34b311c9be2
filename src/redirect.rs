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

//! Node-level interception of metadata server traffic.
//!
//! Two pieces of process-wide kernel state are managed here: a secondary address on the
//! loopback interface ([loopback]) and a pair of packet-filter rules ([iptables]). Both are
//! installed with existence checks so that a restarted agent picks up what a previous run left
//! behind instead of duplicating it.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use tracing::{debug, info};

pub mod iptables;
pub mod loopback;
pub mod routing;

pub use routing::RoutingMode;

use iptables::{RedirectRuleManager, RuleTable};
use loopback::{AddressTable, LoopbackAliasManager};

/// The link-local address workloads use to reach the metadata server.
pub const METADATA_SERVER_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);
/// The port workloads use to reach the metadata server.
pub const METADATA_SERVER_PORT: u16 = 80;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error loading {name} interface: {source}")]
    InterfaceLookup {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("error listing addresses of the {name} interface: {source}")]
    AddressList {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("the metadata server address is already present in the loopback interface: {0}")]
    AddressConflict(String),
    #[error("error adding {address} to the loopback interface: {source}")]
    AddressAdd {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid loopback alias {0}")]
    InvalidAlias(String),
    #[error("error adding rule {rule}: {source}")]
    RuleInstall {
        rule: String,
        #[source]
        source: std::io::Error,
    },
    #[error("teardown failed: {}", join_failures(.0))]
    Teardown(Vec<TeardownFailure>),
    #[error("invalid routing mode: {0}")]
    InvalidRoutingMode(String),
    #[error("routing mode {0} is not supported by this agent")]
    UnsupportedRoutingMode(RoutingMode),
    #[error("routing mode {0} requires the emulator address to be configured")]
    MissingEmulatorAddress(RoutingMode),
}

/// A single kernel resource that could not be removed on shutdown.
#[derive(thiserror::Error, Debug)]
#[error("failed to remove {resource}: {source}")]
pub struct TeardownFailure {
    pub resource: String,
    #[source]
    pub source: std::io::Error,
}

fn join_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Flattens teardown errors so several releases can be reported as one.
    fn into_failures(self) -> Vec<TeardownFailure> {
        match self {
            Error::Teardown(failures) => failures,
            other => vec![TeardownFailure {
                resource: "redirection".to_string(),
                source: std::io::Error::other(other.to_string()),
            }],
        }
    }
}

/// Redirection composes the loopback alias and the redirect rules for a routing mode.
///
/// The alias is always attached before the rules and released after them.
pub struct Redirection {
    mode: RoutingMode,
    alias: Option<LoopbackAliasManager>,
    rules: Option<RedirectRuleManager>,
}

impl std::fmt::Debug for Redirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redirection")
            .field("mode", &self.mode)
            .field("alias", &self.alias.is_some())
            .field("rules", &self.rules.is_some())
            .finish()
    }
}

impl Redirection {
    pub fn new(
        mode: RoutingMode,
        addresses: Arc<dyn AddressTable>,
        rules: Arc<dyn RuleTable>,
        emulator: Option<SocketAddrV4>,
    ) -> Result<Self, Error> {
        match mode {
            RoutingMode::None => Ok(Redirection {
                mode,
                alias: None,
                rules: None,
            }),
            RoutingMode::Ebpf => Err(Error::UnsupportedRoutingMode(mode)),
            RoutingMode::Loopback => {
                let emulator = emulator.ok_or(Error::MissingEmulatorAddress(mode))?;
                Ok(Redirection {
                    mode,
                    alias: Some(LoopbackAliasManager::new(addresses)?),
                    rules: Some(RedirectRuleManager::new(
                        rules,
                        *emulator.ip(),
                        emulator.port(),
                    )),
                })
            }
        }
    }

    /// Attaches the alias and then installs the rules.
    ///
    /// On failure whatever was already installed stays in place; callers are expected to
    /// invoke [Redirection::release] to clean it up.
    pub async fn attach(&self) -> Result<(), Error> {
        if let Some(alias) = &self.alias {
            alias.attach().await?;
        }
        if let Some(rules) = &self.rules {
            rules.install().await?;
        }
        info!(mode = %self.mode, "metadata server redirection attached");
        Ok(())
    }

    /// Removes the rules and then the alias. Every step is attempted and all failures are
    /// reported together.
    pub async fn release(&self) -> Result<(), Error> {
        let mut failures = Vec::new();
        if let Some(rules) = &self.rules {
            if let Err(e) = rules.release().await {
                failures.extend(e.into_failures());
            }
        }
        if let Some(alias) = &self.alias {
            if let Err(e) = alias.release().await {
                failures.extend(e.into_failures());
            }
        }
        if failures.is_empty() {
            debug!(mode = %self.mode, "metadata server redirection released");
            Ok(())
        } else {
            Err(Error::Teardown(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::redirect::{FakeAddressTable, FakeRuleTable};
    use matches::assert_matches;

    fn emulator() -> Option<SocketAddrV4> {
        Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 8080))
    }

    #[tokio::test]
    async fn loopback_mode_attaches_alias_and_rules() {
        let addrs = Arc::new(FakeAddressTable::with_loopback());
        let rules = Arc::new(FakeRuleTable::default());
        let r = Redirection::new(
            RoutingMode::Loopback,
            addrs.clone(),
            rules.clone(),
            emulator(),
        )
        .unwrap();

        r.attach().await.unwrap();
        assert_eq!(addrs.addresses().len(), 1);
        assert_eq!(rules.rules().len(), 2);

        r.release().await.unwrap();
        assert!(addrs.addresses().is_empty());
        assert!(rules.rules().is_empty());
    }

    #[tokio::test]
    async fn none_mode_does_not_touch_the_kernel() {
        let addrs = Arc::new(FakeAddressTable::with_loopback());
        let rules = Arc::new(FakeRuleTable::default());
        let r = Redirection::new(RoutingMode::None, addrs.clone(), rules.clone(), None).unwrap();

        r.attach().await.unwrap();
        r.release().await.unwrap();
        assert_eq!(addrs.mutations(), 0);
        assert_eq!(rules.mutations(), 0);
    }

    #[test]
    fn ebpf_mode_is_rejected() {
        let res = Redirection::new(
            RoutingMode::Ebpf,
            Arc::new(FakeAddressTable::with_loopback()),
            Arc::new(FakeRuleTable::default()),
            emulator(),
        );
        assert_matches!(res, Err(Error::UnsupportedRoutingMode(RoutingMode::Ebpf)));
    }

    #[test]
    fn loopback_mode_requires_emulator() {
        let res = Redirection::new(
            RoutingMode::Loopback,
            Arc::new(FakeAddressTable::with_loopback()),
            Arc::new(FakeRuleTable::default()),
            None,
        );
        assert_matches!(res, Err(Error::MissingEmulatorAddress(_)));
    }

    #[tokio::test]
    async fn release_after_failed_rule_install_cleans_alias() {
        let addrs = Arc::new(FakeAddressTable::with_loopback());
        let rules = Arc::new(FakeRuleTable::default());
        rules.fail_append_on(iptables::Table::Nat);
        let r = Redirection::new(
            RoutingMode::Loopback,
            addrs.clone(),
            rules.clone(),
            emulator(),
        )
        .unwrap();

        assert_matches!(r.attach().await, Err(Error::RuleInstall { .. }));
        assert_eq!(addrs.addresses().len(), 1);

        r.release().await.unwrap();
        assert!(addrs.addresses().is_empty());
    }

    #[tokio::test]
    async fn release_collects_failures_from_every_step() {
        let addrs = Arc::new(FakeAddressTable::with_loopback());
        let rules = Arc::new(FakeRuleTable::default());
        let r = Redirection::new(
            RoutingMode::Loopback,
            addrs.clone(),
            rules.clone(),
            emulator(),
        )
        .unwrap();
        r.attach().await.unwrap();

        rules.fail_delete_on(iptables::Table::Filter);
        addrs.fail_delete();
        let Err(Error::Teardown(failures)) = r.release().await else {
            panic!("expected teardown error");
        };
        assert_eq!(failures.len(), 2);
        // the nat rule was still removed
        assert_eq!(rules.rules().len(), 1);
    }
}
