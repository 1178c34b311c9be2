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
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use futures::TryStreamExt;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::address::{AddressAttribute, AddressMessage, AddressScope};
use tracing::{debug, info};

use super::{Error, METADATA_SERVER_IP, TeardownFailure};

pub const LOOPBACK_INTERFACE: &str = "lo";

/// Label tagging the alias rows owned by this agent.
pub const METADATA_SERVER_ADDR_LABEL: &str = "lo:gke-md-sv";

// IFNAMSIZ, including the trailing NUL
const MAX_LABEL_LEN: usize = 15;

/// An IPv4 address as currently configured on an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub label: Option<String>,
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)?;
        if let Some(label) = &self.label {
            write!(f, " {label}")?;
        }
        Ok(())
    }
}

/// The secondary loopback address the emulator is reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackAlias {
    address: Ipv4Addr,
    label: String,
}

impl LoopbackAlias {
    pub const PREFIX_LEN: u8 = 32;

    /// The alias for the metadata server address.
    pub fn metadata_server() -> Result<Self, Error> {
        Self::new(METADATA_SERVER_IP, METADATA_SERVER_ADDR_LABEL)
    }

    pub fn new(address: Ipv4Addr, label: &str) -> Result<Self, Error> {
        // The kernel requires alias labels to be prefixed by the interface name.
        if !label.starts_with(LOOPBACK_INTERFACE) || label.len() > MAX_LABEL_LEN {
            return Err(Error::InvalidAlias(format!("{address} {label}")));
        }
        if address.is_unspecified() || address.is_broadcast() {
            return Err(Error::InvalidAlias(format!("{address} {label}")));
        }
        Ok(LoopbackAlias {
            address,
            label: label.to_string(),
        })
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// An existing row is ours only if address, prefix and label all match.
    pub fn owns(&self, existing: &InterfaceAddress) -> bool {
        existing.address == self.address
            && existing.prefix_len == Self::PREFIX_LEN
            && existing.label.as_deref() == Some(self.label.as_str())
    }

    fn as_interface_address(&self) -> InterfaceAddress {
        InterfaceAddress {
            address: self.address,
            prefix_len: Self::PREFIX_LEN,
            label: Some(self.label.clone()),
        }
    }
}

impl fmt::Display for LoopbackAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_interface_address().fmt(f)
    }
}

/// AddressTable is the seam to the kernel's interface address state.
#[async_trait::async_trait]
pub trait AddressTable: Send + Sync {
    /// Returns the index of the named interface, failing with `NotFound` if it does not exist.
    async fn link_index(&self, name: &str) -> io::Result<u32>;
    async fn list_v4(&self, index: u32) -> io::Result<Vec<InterfaceAddress>>;
    /// Adds the alias with host scope.
    async fn add(&self, index: u32, alias: &LoopbackAlias) -> io::Result<()>;
    async fn delete(&self, index: u32, alias: &LoopbackAlias) -> io::Result<()>;
}

/// LoopbackAliasManager attaches the metadata server address to the loopback interface.
pub struct LoopbackAliasManager {
    table: Arc<dyn AddressTable>,
    alias: LoopbackAlias,
}

impl LoopbackAliasManager {
    pub fn new(table: Arc<dyn AddressTable>) -> Result<Self, Error> {
        Ok(Self::with_alias(table, LoopbackAlias::metadata_server()?))
    }

    pub fn with_alias(table: Arc<dyn AddressTable>, alias: LoopbackAlias) -> Self {
        Self { table, alias }
    }

    async fn loopback(&self) -> Result<(u32, Vec<InterfaceAddress>), Error> {
        let index = self
            .table
            .link_index(LOOPBACK_INTERFACE)
            .await
            .map_err(|source| Error::InterfaceLookup {
                name: LOOPBACK_INTERFACE,
                source,
            })?;
        let addrs = self
            .table
            .list_v4(index)
            .await
            .map_err(|source| Error::AddressList {
                name: LOOPBACK_INTERFACE,
                source,
            })?;
        Ok((index, addrs))
    }

    /// Attaches the alias. An alias left behind by a previous run is adopted as is; the same
    /// address under any other label or prefix is never touched.
    pub async fn attach(&self) -> Result<(), Error> {
        let (index, addrs) = self.loopback().await?;

        if let Some(existing) = addrs.iter().find(|a| a.address == self.alias.address) {
            if !self.alias.owns(existing) {
                return Err(Error::AddressConflict(existing.to_string()));
            }
            info!(address = %self.alias, "loopback alias already attached");
            return Ok(());
        }

        self.table
            .add(index, &self.alias)
            .await
            .map_err(|source| Error::AddressAdd {
                address: self.alias.to_string(),
                source,
            })?;
        info!(address = %self.alias, "loopback alias attached");
        Ok(())
    }

    /// Detaches the alias. Releasing an alias that is no longer present succeeds without doing
    /// anything, so this may be called more than once.
    pub async fn release(&self) -> Result<(), Error> {
        let teardown = |source| {
            Error::Teardown(vec![TeardownFailure {
                resource: self.alias.to_string(),
                source,
            }])
        };
        let index = self
            .table
            .link_index(LOOPBACK_INTERFACE)
            .await
            .map_err(teardown)?;
        let addrs = self.table.list_v4(index).await.map_err(teardown)?;
        if !addrs.iter().any(|a| self.alias.owns(a)) {
            debug!(address = %self.alias, "loopback alias not present, nothing to release");
            return Ok(());
        }
        self.table
            .delete(index, &self.alias)
            .await
            .map_err(teardown)?;
        info!(address = %self.alias, "loopback alias detached");
        Ok(())
    }
}

/// NetlinkAddressTable talks rtnetlink to the kernel of the current network namespace.
pub struct NetlinkAddressTable {
    handle: rtnetlink::Handle,
}

impl NetlinkAddressTable {
    /// Opens a netlink socket and spawns its connection on the current runtime.
    pub fn connect() -> io::Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(NetlinkAddressTable { handle })
    }

    fn message(index: u32, alias: &LoopbackAlias) -> AddressMessage {
        let mut msg = AddressMessage::default();
        msg.header.family = AddressFamily::Inet;
        msg.header.prefix_len = LoopbackAlias::PREFIX_LEN;
        msg.header.scope = AddressScope::Host;
        msg.header.index = index;
        let ip = IpAddr::V4(alias.address);
        msg.attributes.push(AddressAttribute::Local(ip));
        msg.attributes.push(AddressAttribute::Address(ip));
        msg.attributes
            .push(AddressAttribute::Label(alias.label.clone()));
        msg
    }
}

fn to_io(e: rtnetlink::Error) -> io::Error {
    match e {
        rtnetlink::Error::NetlinkError(msg) => msg.to_io(),
        other => io::Error::other(other),
    }
}

fn interface_address(msg: AddressMessage) -> Option<InterfaceAddress> {
    if msg.header.family != AddressFamily::Inet {
        return None;
    }
    let mut address = None;
    let mut local = None;
    let mut label = None;
    for attr in msg.attributes {
        match attr {
            AddressAttribute::Address(IpAddr::V4(ip)) => address = Some(ip),
            AddressAttribute::Local(IpAddr::V4(ip)) => local = Some(ip),
            AddressAttribute::Label(l) => label = Some(l),
            _ => {}
        }
    }
    // IFA_LOCAL is the interface address; IFA_ADDRESS differs only on point-to-point links
    Some(InterfaceAddress {
        address: local.or(address)?,
        prefix_len: msg.header.prefix_len,
        label,
    })
}

#[async_trait::async_trait]
impl AddressTable for NetlinkAddressTable {
    async fn link_index(&self, name: &str) -> io::Result<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        let not_found = || {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("interface {name} not found"),
            )
        };
        match links.try_next().await.map_err(to_io) {
            Ok(Some(link)) => Ok(link.header.index),
            Ok(None) => Err(not_found()),
            Err(e) if e.raw_os_error() == Some(libc::ENODEV) => Err(not_found()),
            Err(e) => Err(e),
        }
    }

    async fn list_v4(&self, index: u32) -> io::Result<Vec<InterfaceAddress>> {
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut res = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(to_io)? {
            if let Some(addr) = interface_address(msg) {
                res.push(addr);
            }
        }
        Ok(res)
    }

    async fn add(&self, index: u32, alias: &LoopbackAlias) -> io::Result<()> {
        let mut req = self.handle.address().add(
            index,
            IpAddr::V4(alias.address),
            LoopbackAlias::PREFIX_LEN,
        );
        let msg = req.message_mut();
        msg.header.scope = AddressScope::Host;
        msg.attributes
            .push(AddressAttribute::Label(alias.label.clone()));
        req.execute().await.map_err(to_io)
    }

    async fn delete(&self, index: u32, alias: &LoopbackAlias) -> io::Result<()> {
        self.handle
            .address()
            .del(Self::message(index, alias))
            .execute()
            .await
            .map_err(to_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::redirect::FakeAddressTable;
    use matches::assert_matches;

    fn manager(table: &Arc<FakeAddressTable>) -> LoopbackAliasManager {
        LoopbackAliasManager::new(table.clone()).unwrap()
    }

    #[test]
    fn metadata_server_alias() {
        let alias = LoopbackAlias::metadata_server().unwrap();
        assert_eq!(alias.address(), Ipv4Addr::new(169, 254, 169, 254));
        assert_eq!(alias.to_string(), "169.254.169.254/32 lo:gke-md-sv");
    }

    #[test]
    fn alias_label_must_belong_to_loopback() {
        assert_matches!(
            LoopbackAlias::new(METADATA_SERVER_IP, "eth0:md"),
            Err(Error::InvalidAlias(_))
        );
        assert_matches!(
            LoopbackAlias::new(METADATA_SERVER_IP, "lo:a-very-long-label"),
            Err(Error::InvalidAlias(_))
        );
    }

    #[tokio::test]
    async fn attach_adds_alias() {
        let table = Arc::new(FakeAddressTable::with_loopback());
        manager(&table).attach().await.unwrap();
        assert_eq!(
            table.addresses(),
            vec![InterfaceAddress {
                address: METADATA_SERVER_IP,
                prefix_len: 32,
                label: Some(METADATA_SERVER_ADDR_LABEL.to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn attach_twice_is_idempotent() {
        let table = Arc::new(FakeAddressTable::with_loopback());
        manager(&table).attach().await.unwrap();

        // a restarted process finds the alias it left behind
        let restarted = manager(&table);
        restarted.attach().await.unwrap();
        assert_eq!(table.addresses().len(), 1);
        assert_eq!(table.mutations(), 1);

        restarted.release().await.unwrap();
        assert!(table.addresses().is_empty());
    }

    #[tokio::test]
    async fn attach_rejects_conflicting_label() {
        let table = Arc::new(FakeAddressTable::with_loopback());
        table.insert(InterfaceAddress {
            address: METADATA_SERVER_IP,
            prefix_len: 32,
            label: Some("other".to_string()),
        });

        let err = manager(&table).attach().await.unwrap_err();
        assert_matches!(&err, Error::AddressConflict(a) if a == "169.254.169.254/32 other");
        assert_eq!(table.mutations(), 0);
    }

    #[tokio::test]
    async fn attach_rejects_conflicting_prefix() {
        let table = Arc::new(FakeAddressTable::with_loopback());
        table.insert(InterfaceAddress {
            address: METADATA_SERVER_IP,
            prefix_len: 16,
            label: Some(METADATA_SERVER_ADDR_LABEL.to_string()),
        });
        assert_matches!(
            manager(&table).attach().await,
            Err(Error::AddressConflict(_))
        );
    }

    #[tokio::test]
    async fn attach_ignores_unrelated_addresses() {
        let table = Arc::new(FakeAddressTable::with_loopback());
        table.insert(InterfaceAddress {
            address: Ipv4Addr::LOCALHOST,
            prefix_len: 8,
            label: Some("lo".to_string()),
        });
        manager(&table).attach().await.unwrap();
        assert_eq!(table.addresses().len(), 2);
    }

    #[tokio::test]
    async fn attach_fails_without_loopback() {
        let table = Arc::new(FakeAddressTable::default());
        assert_matches!(
            manager(&table).attach().await,
            Err(Error::InterfaceLookup { .. })
        );
    }

    #[tokio::test]
    async fn release_twice_is_a_noop() {
        let table = Arc::new(FakeAddressTable::with_loopback());
        let m = manager(&table);
        m.attach().await.unwrap();
        m.release().await.unwrap();
        m.release().await.unwrap();
        assert_eq!(table.mutations(), 2);
    }

    #[tokio::test]
    async fn release_never_removes_foreign_address() {
        let table = Arc::new(FakeAddressTable::with_loopback());
        table.insert(InterfaceAddress {
            address: METADATA_SERVER_IP,
            prefix_len: 32,
            label: Some("other".to_string()),
        });
        let m = manager(&table);
        assert!(m.attach().await.is_err());
        m.release().await.unwrap();
        assert_eq!(table.addresses().len(), 1);
    }

    #[tokio::test]
    async fn release_surfaces_delete_error() {
        let table = Arc::new(FakeAddressTable::with_loopback());
        let m = manager(&table);
        m.attach().await.unwrap();
        table.fail_delete();
        let Err(Error::Teardown(failures)) = m.release().await else {
            panic!("expected teardown error");
        };
        assert_eq!(failures[0].resource, "169.254.169.254/32 lo:gke-md-sv");
    }

    #[test]
    fn netlink_message_parsing() {
        let msg = NetlinkAddressTable::message(1, &LoopbackAlias::metadata_server().unwrap());
        assert_eq!(msg.header.scope, AddressScope::Host);
        assert_eq!(
            interface_address(msg),
            Some(InterfaceAddress {
                address: METADATA_SERVER_IP,
                prefix_len: 32,
                label: Some(METADATA_SERVER_ADDR_LABEL.to_string()),
            })
        );
    }
}
