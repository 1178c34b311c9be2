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

//! In-memory stand-ins for the kernel address and packet filter tables.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Mutex;

use crate::redirect::iptables::{RedirectRule, RuleTable, Table};
use crate::redirect::loopback::{AddressTable, InterfaceAddress, LoopbackAlias};

const LOOPBACK_INDEX: u32 = 1;

#[derive(Default)]
struct AddressState {
    has_loopback: bool,
    addresses: Vec<InterfaceAddress>,
    mutations: usize,
    fail_delete: bool,
}

/// FakeAddressTable models a single loopback interface. The default value has no interfaces.
#[derive(Default)]
pub struct FakeAddressTable {
    state: Mutex<AddressState>,
}

impl FakeAddressTable {
    pub fn with_loopback() -> Self {
        let table = Self::default();
        table.state.lock().unwrap().has_loopback = true;
        table
    }

    /// Adds an address directly, as another tool on the host would.
    pub fn insert(&self, address: InterfaceAddress) {
        self.state.lock().unwrap().addresses.push(address);
    }

    pub fn addresses(&self) -> Vec<InterfaceAddress> {
        self.state.lock().unwrap().addresses.clone()
    }

    /// Number of successful adds and deletes.
    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    pub fn fail_delete(&self) {
        self.state.lock().unwrap().fail_delete = true;
    }

    fn check_index(state: &AddressState, index: u32) -> io::Result<()> {
        if state.has_loopback && index == LOOPBACK_INDEX {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such device"))
        }
    }
}

#[async_trait::async_trait]
impl AddressTable for FakeAddressTable {
    async fn link_index(&self, name: &str) -> io::Result<u32> {
        let state = self.state.lock().unwrap();
        if state.has_loopback && name == "lo" {
            Ok(LOOPBACK_INDEX)
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("interface {name} not found"),
            ))
        }
    }

    async fn list_v4(&self, index: u32) -> io::Result<Vec<InterfaceAddress>> {
        let state = self.state.lock().unwrap();
        Self::check_index(&state, index)?;
        Ok(state.addresses.clone())
    }

    async fn add(&self, index: u32, alias: &LoopbackAlias) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_index(&state, index)?;
        if state.addresses.iter().any(|a| a.address == alias.address()) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "file exists"));
        }
        state.addresses.push(InterfaceAddress {
            address: alias.address(),
            prefix_len: LoopbackAlias::PREFIX_LEN,
            label: Some(alias.label().to_string()),
        });
        state.mutations += 1;
        Ok(())
    }

    async fn delete(&self, index: u32, alias: &LoopbackAlias) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_index(&state, index)?;
        if state.fail_delete {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "operation not permitted",
            ));
        }
        let before = state.addresses.len();
        state.addresses.retain(|a| !alias.owns(a));
        if state.addresses.len() == before {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "cannot assign requested address",
            ));
        }
        state.mutations += 1;
        Ok(())
    }
}

#[derive(Default)]
struct RuleState {
    rules: Vec<RedirectRule>,
    mutations: usize,
    checks: HashMap<Table, usize>,
    fail_append: HashSet<Table>,
    fail_delete: HashSet<Table>,
}

/// FakeRuleTable keeps rules in append order across all tables.
#[derive(Default)]
pub struct FakeRuleTable {
    state: Mutex<RuleState>,
}

impl FakeRuleTable {
    pub fn rules(&self) -> Vec<RedirectRule> {
        self.state.lock().unwrap().rules.clone()
    }

    /// Number of successful appends and deletes.
    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    /// Number of existence checks made against `table`.
    pub fn checks(&self, table: Table) -> usize {
        self.state
            .lock()
            .unwrap()
            .checks
            .get(&table)
            .copied()
            .unwrap_or_default()
    }

    pub fn fail_append_on(&self, table: Table) {
        self.state.lock().unwrap().fail_append.insert(table);
    }

    pub fn fail_delete_on(&self, table: Table) {
        self.state.lock().unwrap().fail_delete.insert(table);
    }
}

fn rejected(rule: &RedirectRule) -> io::Error {
    io::Error::other(format!(
        "iptables: {} table rejected the operation",
        rule.table.as_str()
    ))
}

#[async_trait::async_trait]
impl RuleTable for FakeRuleTable {
    async fn exists(&self, rule: &RedirectRule) -> io::Result<bool> {
        let mut state = self.state.lock().unwrap();
        *state.checks.entry(rule.table).or_default() += 1;
        Ok(state.rules.contains(rule))
    }

    async fn append(&self, rule: &RedirectRule) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_append.contains(&rule.table) {
            return Err(rejected(rule));
        }
        state.rules.push(rule.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn delete(&self, rule: &RedirectRule) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_delete.contains(&rule.table) {
            return Err(rejected(rule));
        }
        let Some(pos) = state.rules.iter().position(|r| r == rule) else {
            return Err(io::Error::other("iptables: bad rule"));
        };
        state.rules.remove(pos);
        state.mutations += 1;
        Ok(())
    }
}
