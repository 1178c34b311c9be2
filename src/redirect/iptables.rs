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
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info};

use super::{Error, METADATA_SERVER_IP, METADATA_SERVER_PORT, TeardownFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Address translation, evaluated before routing.
    Nat,
    /// Access control for routed packets.
    Filter,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    /// Locally generated traffic.
    Output,
    /// Traffic routed through the host.
    Forward,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Output => "OUTPUT",
            Chain::Forward => "FORWARD",
        }
    }
}

/// A single rule: where it lives plus its match and target arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRule {
    pub table: Table,
    pub chain: Chain,
    args: Vec<String>,
}

impl RedirectRule {
    /// Rewrites the destination of locally generated metadata server traffic to the emulator.
    pub fn dnat(emulator_ip: Ipv4Addr) -> Self {
        RedirectRule {
            table: Table::Nat,
            chain: Chain::Output,
            args: to_args(&[
                "-d",
                &METADATA_SERVER_IP.to_string(),
                "-p",
                "tcp",
                "--dport",
                &METADATA_SERVER_PORT.to_string(),
                "-j",
                "DNAT",
                "--to-destination",
                &emulator_ip.to_string(),
            ]),
        }
    }

    /// Keeps a default-deny forwarding policy from dropping rewritten packets.
    pub fn forward_accept(emulator_ip: Ipv4Addr, emulator_port: u16) -> Self {
        RedirectRule {
            table: Table::Filter,
            chain: Chain::Forward,
            args: to_args(&[
                "-d",
                &emulator_ip.to_string(),
                "-p",
                "tcp",
                "--dport",
                &emulator_port.to_string(),
                "-m",
                "state",
                "--state",
                "NEW,ESTABLISHED,RELATED",
                "-j",
                "ACCEPT",
            ]),
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

impl fmt::Display for RedirectRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-t {} {} {}",
            self.table.as_str(),
            self.chain.as_str(),
            self.args.join(" ")
        )
    }
}

/// RuleTable is the seam to the kernel's packet filter state.
#[async_trait::async_trait]
pub trait RuleTable: Send + Sync {
    async fn exists(&self, rule: &RedirectRule) -> io::Result<bool>;
    async fn append(&self, rule: &RedirectRule) -> io::Result<()>;
    async fn delete(&self, rule: &RedirectRule) -> io::Result<()>;
}

/// Appends the rule unless an identical one is already present. Returns whether it was added.
pub async fn ensure_rule(table: &dyn RuleTable, rule: &RedirectRule) -> io::Result<bool> {
    if table.exists(rule).await? {
        return Ok(false);
    }
    table.append(rule).await?;
    Ok(true)
}

/// Deletes the rule if present. Returns whether it was removed.
pub async fn delete_rule(table: &dyn RuleTable, rule: &RedirectRule) -> io::Result<bool> {
    if !table.exists(rule).await? {
        return Ok(false);
    }
    table.delete(rule).await?;
    Ok(true)
}

/// RedirectRuleManager installs the DNAT and forward rules pointing at the emulator.
pub struct RedirectRuleManager {
    table: Arc<dyn RuleTable>,
    dnat: RedirectRule,
    forward: RedirectRule,
}

impl RedirectRuleManager {
    pub fn new(table: Arc<dyn RuleTable>, emulator_ip: Ipv4Addr, emulator_port: u16) -> Self {
        RedirectRuleManager {
            table,
            dnat: RedirectRule::dnat(emulator_ip),
            forward: RedirectRule::forward_accept(emulator_ip, emulator_port),
        }
    }

    pub fn rules(&self) -> [&RedirectRule; 2] {
        [&self.dnat, &self.forward]
    }

    /// Installs both rules in order. A failure on the second rule leaves the first one in
    /// place; [RedirectRuleManager::release] removes it.
    pub async fn install(&self) -> Result<(), Error> {
        for rule in self.rules() {
            let added = ensure_rule(self.table.as_ref(), rule)
                .await
                .map_err(|source| Error::RuleInstall {
                    rule: rule.to_string(),
                    source,
                })?;
            if added {
                info!(table = rule.table.as_str(), chain = rule.chain.as_str(), %rule, "rule added");
            } else {
                info!(table = rule.table.as_str(), chain = rule.chain.as_str(), %rule, "rule already present");
            }
        }
        Ok(())
    }

    /// Attempts to delete both rules, returning every failure.
    pub async fn release(&self) -> Result<(), Error> {
        let mut failures = Vec::new();
        for rule in self.rules() {
            match delete_rule(self.table.as_ref(), rule).await {
                Ok(true) => debug!(%rule, "rule deleted"),
                Ok(false) => debug!(%rule, "rule not present, nothing to delete"),
                Err(source) => failures.push(TeardownFailure {
                    resource: format!("rule {rule}"),
                    source,
                }),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(failures))
        }
    }
}

/// IptablesCommand drives the `iptables` binary, holding the xtables lock for each call.
pub struct IptablesCommand {
    path: PathBuf,
}

impl IptablesCommand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        IptablesCommand { path: path.into() }
    }

    async fn run(&self, op: &str, rule: &RedirectRule) -> io::Result<std::process::Output> {
        debug!(path = ?self.path, op, %rule, "running iptables");
        Command::new(&self.path)
            .arg("-w")
            .arg("-t")
            .arg(rule.table.as_str())
            .arg(op)
            .arg(rule.chain.as_str())
            .args(rule.args())
            .output()
            .await
    }

    async fn run_checked(&self, op: &str, rule: &RedirectRule) -> io::Result<()> {
        let output = self.run(op, rule).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(command_error(op, &output))
        }
    }
}

fn command_error(op: &str, output: &std::process::Output) -> io::Error {
    io::Error::other(format!(
        "iptables {op} exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

#[async_trait::async_trait]
impl RuleTable for IptablesCommand {
    async fn exists(&self, rule: &RedirectRule) -> io::Result<bool> {
        let output = self.run("-C", rule).await?;
        // -C exits with 1 when no matching rule exists; anything else is a real failure
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(command_error("-C", &output)),
        }
    }

    async fn append(&self, rule: &RedirectRule) -> io::Result<()> {
        self.run_checked("-A", rule).await
    }

    async fn delete(&self, rule: &RedirectRule) -> io::Result<()> {
        self.run_checked("-D", rule).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::redirect::FakeRuleTable;
    use matches::assert_matches;

    const EMULATOR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    fn manager(table: &Arc<FakeRuleTable>) -> RedirectRuleManager {
        RedirectRuleManager::new(table.clone(), EMULATOR, 8080)
    }

    #[test]
    fn dnat_rule_literal() {
        let rule = RedirectRule::dnat(EMULATOR);
        assert_eq!(rule.table, Table::Nat);
        assert_eq!(rule.chain, Chain::Output);
        assert_eq!(
            rule.args(),
            [
                "-d",
                "169.254.169.254",
                "-p",
                "tcp",
                "--dport",
                "80",
                "-j",
                "DNAT",
                "--to-destination",
                "10.0.0.5"
            ]
        );
    }

    #[test]
    fn forward_rule_literal() {
        let rule = RedirectRule::forward_accept(EMULATOR, 8080);
        assert_eq!(rule.table, Table::Filter);
        assert_eq!(rule.chain, Chain::Forward);
        assert_eq!(
            rule.to_string(),
            "-t filter FORWARD -d 10.0.0.5 -p tcp --dport 8080 -m state --state NEW,ESTABLISHED,RELATED -j ACCEPT"
        );
    }

    #[tokio::test]
    async fn install_is_idempotent() {
        let table = Arc::new(FakeRuleTable::default());
        manager(&table).install().await.unwrap();
        manager(&table).install().await.unwrap();
        assert_eq!(
            table.rules(),
            vec![
                RedirectRule::dnat(EMULATOR),
                RedirectRule::forward_accept(EMULATOR, 8080)
            ]
        );
        assert_eq!(table.mutations(), 2);
    }

    #[tokio::test]
    async fn first_failure_skips_second_rule() {
        let table = Arc::new(FakeRuleTable::default());
        table.fail_append_on(Table::Nat);
        let err = manager(&table).install().await.unwrap_err();
        assert_matches!(err, Error::RuleInstall { rule, .. } if rule.starts_with("-t nat OUTPUT"));
        assert!(table.rules().is_empty());
        assert_eq!(table.checks(Table::Filter), 0);
    }

    #[tokio::test]
    async fn second_failure_keeps_first_rule() {
        let table = Arc::new(FakeRuleTable::default());
        table.fail_append_on(Table::Filter);
        let m = manager(&table);
        assert_matches!(m.install().await, Err(Error::RuleInstall { .. }));
        assert_eq!(table.rules(), vec![RedirectRule::dnat(EMULATOR)]);

        m.release().await.unwrap();
        assert!(table.rules().is_empty());
    }

    #[tokio::test]
    async fn release_reports_all_failures() {
        let table = Arc::new(FakeRuleTable::default());
        let m = manager(&table);
        m.install().await.unwrap();
        table.fail_delete_on(Table::Nat);
        table.fail_delete_on(Table::Filter);

        let Err(Error::Teardown(failures)) = m.release().await else {
            panic!("expected teardown error");
        };
        assert_eq!(failures.len(), 2);
        assert!(failures[0].resource.contains("-t nat OUTPUT"));
        assert!(failures[1].resource.contains("-t filter FORWARD"));
    }

    #[tokio::test]
    async fn release_attempts_second_rule_after_first_fails() {
        let table = Arc::new(FakeRuleTable::default());
        let m = manager(&table);
        m.install().await.unwrap();
        table.fail_delete_on(Table::Nat);

        assert_matches!(m.release().await, Err(Error::Teardown(f)) if f.len() == 1);
        assert_eq!(table.rules(), vec![RedirectRule::dnat(EMULATOR)]);
    }

    fn failing_iptables(name: &str, code: i32, stderr: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = std::env::temp_dir().join(format!("{name}-{}", std::process::id()));
        std::fs::write(&path, format!("#!/bin/sh\necho '{stderr}' >&2\nexit {code}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn check_success_means_present() {
        let cmd = IptablesCommand::new("true");
        assert!(cmd.exists(&RedirectRule::dnat(EMULATOR)).await.unwrap());
        cmd.append(&RedirectRule::dnat(EMULATOR)).await.unwrap();
    }

    #[tokio::test]
    async fn check_exit_one_means_absent() {
        let cmd = IptablesCommand::new("false");
        assert!(!cmd.exists(&RedirectRule::dnat(EMULATOR)).await.unwrap());
        assert!(cmd.append(&RedirectRule::dnat(EMULATOR)).await.is_err());
        assert!(cmd.delete(&RedirectRule::dnat(EMULATOR)).await.is_err());
    }

    #[tokio::test]
    async fn check_other_exit_is_an_error() {
        let path = failing_iptables("iptables-busy", 2, "iptables: resource busy");
        let cmd = IptablesCommand::new(path.clone());
        let err = cmd.exists(&RedirectRule::dnat(EMULATOR)).await.unwrap_err();
        std::fs::remove_file(&path).unwrap();
        let msg = err.to_string();
        assert!(msg.starts_with("iptables -C exited with"), "{msg}");
        assert!(msg.contains("resource busy"), "{msg}");
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let cmd = IptablesCommand::new("/nonexistent/iptables");
        let err = cmd.exists(&RedirectRule::dnat(EMULATOR)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn release_without_install() {
        let table = Arc::new(FakeRuleTable::default());
        manager(&table).release().await.unwrap();
        assert_eq!(table.mutations(), 0);
    }
}
