//! Owned snapshots of kernel links, addresses and neighbors.

use basebox_types::{IpPrefix, MacAddress};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

pub const AF_UNSPEC: u8 = 0;
pub const AF_INET: u8 = 2;
pub const AF_BRIDGE: u8 = 7;
pub const AF_INET6: u8 = 10;

pub const IFF_UP: u32 = 0x1;
pub const IFF_RUNNING: u32 = 0x40;

/// IFLA_INFO_KIND of a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Bridge,
    Bond,
    Team,
    Tun,
    Other(String),
}

impl LinkKind {
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "bridge" => Self::Bridge,
            "bond" => Self::Bond,
            "team" => Self::Team,
            "tun" => Self::Tun,
            other => Self::Other(other.to_string()),
        }
    }

    /// Bond and team devices both aggregate their slaves.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Bond | Self::Team)
    }
}

/// A kernel network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub ifindex: u32,
    pub devname: String,
    pub hwaddr: MacAddress,
    pub broadcast: MacAddress,
    /// IFF_* bits
    pub flags: u32,
    pub family: u8,
    pub arptype: u16,
    pub mtu: u32,
    /// Ifindex of the enslaving bridge or bond, 0 when none.
    pub master: u32,
    pub kind: Option<LinkKind>,
    pub addrs: BTreeSet<IpPrefix>,
    pub neighbors: BTreeMap<NeighborKey, NeighborEntry>,
}

impl LinkState {
    pub fn new(ifindex: u32, devname: impl Into<String>) -> Self {
        Self {
            ifindex,
            devname: devname.into(),
            hwaddr: MacAddress::ZERO,
            broadcast: MacAddress::BROADCAST,
            flags: 0,
            family: AF_UNSPEC,
            arptype: 1,
            mtu: 1500,
            master: 0,
            kind: None,
            addrs: BTreeSet::new(),
            neighbors: BTreeMap::new(),
        }
    }

    pub fn with_hwaddr(mut self, hwaddr: MacAddress) -> Self {
        self.hwaddr = hwaddr;
        self
    }

    pub fn with_master(mut self, master: u32) -> Self {
        self.master = master;
        self
    }

    pub fn with_kind(mut self, kind: LinkKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_up(&self) -> bool {
        self.flags & IFF_UP != 0
    }

    pub fn is_bridge(&self) -> bool {
        self.kind == Some(LinkKind::Bridge)
    }

    pub fn is_aggregate(&self) -> bool {
        self.kind.as_ref().is_some_and(LinkKind::is_aggregate)
    }

    /// Compares everything except the address and neighbor sets.
    pub fn same_attributes(&self, other: &LinkState) -> bool {
        self.ifindex == other.ifindex
            && self.devname == other.devname
            && self.hwaddr == other.hwaddr
            && self.broadcast == other.broadcast
            && self.flags == other.flags
            && self.family == other.family
            && self.arptype == other.arptype
            && self.mtu == other.mtu
            && self.master == other.master
            && self.kind == other.kind
    }

    /// Copy of the link attributes with empty address and neighbor sets.
    pub fn attributes(&self) -> LinkState {
        LinkState {
            addrs: BTreeSet::new(),
            neighbors: BTreeMap::new(),
            ..self.clone()
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.devname, self.ifindex)
    }
}

/// Neighbor reachability (NUD_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeighborState {
    Incomplete,
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    NoArp,
    Permanent,
    None,
}

impl NeighborState {
    /// States in which the link-layer address can be used for forwarding.
    pub fn is_usable(self) -> bool {
        !matches!(self, Self::Incomplete | Self::Failed | Self::None)
    }
}

/// Per-link key of a neighbor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NeighborKey {
    /// ARP / NDP entry
    Ip(IpAddr),
    /// AF_BRIDGE FDB entry
    Fdb { lladdr: MacAddress, vlan: u16 },
}

impl fmt::Display for NeighborKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{}", addr),
            Self::Fdb { lladdr, vlan } => write!(f, "{} vlan {}", lladdr, vlan),
        }
    }
}

/// A kernel neighbor table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub state: NeighborState,
    /// NTF_* bits
    pub flags: u8,
    pub ifindex: u32,
    pub lladdr: Option<MacAddress>,
    pub family: u8,
    /// Absent for AF_BRIDGE FDB entries.
    pub dst: Option<IpAddr>,
    /// Bridge FDB entries only.
    pub vlan: Option<u16>,
}

impl NeighborEntry {
    pub fn ip(ifindex: u32, dst: IpAddr, lladdr: MacAddress, state: NeighborState) -> Self {
        Self {
            state,
            flags: 0,
            ifindex,
            lladdr: Some(lladdr),
            family: if dst.is_ipv4() { AF_INET } else { AF_INET6 },
            dst: Some(dst),
            vlan: None,
        }
    }

    pub fn fdb(ifindex: u32, lladdr: MacAddress, vlan: u16) -> Self {
        Self {
            state: NeighborState::Reachable,
            flags: 0,
            ifindex,
            lladdr: Some(lladdr),
            family: AF_BRIDGE,
            dst: None,
            vlan: Some(vlan),
        }
    }

    /// `None` for entries that carry neither a destination nor a lladdr.
    pub fn key(&self) -> Option<NeighborKey> {
        match (self.dst, self.lladdr) {
            (Some(dst), _) => Some(NeighborKey::Ip(dst)),
            (None, Some(lladdr)) => Some(NeighborKey::Fdb {
                lladdr,
                vlan: self.vlan.unwrap_or(0),
            }),
            (None, None) => None,
        }
    }

    pub fn is_fdb(&self) -> bool {
        self.family == AF_BRIDGE && self.dst.is_none()
    }
}

/// Change notification published by the link state cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    LinkCreated(LinkState),
    LinkUpdated { old: LinkState, new: LinkState },
    LinkDeleted(LinkState),
    AddrCreated { ifindex: u32, prefix: IpPrefix },
    AddrDeleted { ifindex: u32, prefix: IpPrefix },
    NeighCreated(NeighborEntry),
    NeighUpdated { old: NeighborEntry, new: NeighborEntry },
    NeighDeleted(NeighborEntry),
}

impl LinkEvent {
    pub fn ifindex(&self) -> u32 {
        match self {
            Self::LinkCreated(link) | Self::LinkDeleted(link) => link.ifindex,
            Self::LinkUpdated { new, .. } => new.ifindex,
            Self::AddrCreated { ifindex, .. } | Self::AddrDeleted { ifindex, .. } => *ifindex,
            Self::NeighCreated(neigh) | Self::NeighDeleted(neigh) => neigh.ifindex,
            Self::NeighUpdated { new, .. } => new.ifindex,
        }
    }
}

/// Notification received from the kernel, already converted to owned values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    NewLink(LinkState),
    DelLink(u32),
    NewAddr { ifindex: u32, prefix: IpPrefix },
    DelAddr { ifindex: u32, prefix: IpPrefix },
    NewNeigh(NeighborEntry),
    DelNeigh(NeighborEntry),
}

/// Full kernel state, keyed by ifindex.
pub type KernelSnapshot = BTreeMap<u32, LinkState>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_neighbor_keys() {
        let mac = MacAddress::new([2, 0, 0, 0, 0, 1]);
        let ip = NeighborEntry::ip(3, "10.0.0.2".parse().unwrap(), mac, NeighborState::Reachable);
        assert_eq!(ip.key(), Some(NeighborKey::Ip("10.0.0.2".parse().unwrap())));
        assert_eq!(ip.family, AF_INET);

        let fdb = NeighborEntry::fdb(3, mac, 10);
        assert_eq!(fdb.key(), Some(NeighborKey::Fdb { lladdr: mac, vlan: 10 }));
        assert!(fdb.is_fdb());
    }

    #[test]
    fn test_same_attributes_ignores_addresses() {
        let link = LinkState::new(4, "port4");
        let mut with_addr = link.clone();
        with_addr.addrs.insert("10.0.0.1/24".parse().unwrap());
        assert!(link.same_attributes(&with_addr));
        assert!(!link.same_attributes(&link.clone().with_master(9)));
        assert_eq!(with_addr.attributes(), link);
    }

    #[test]
    fn test_usable_states() {
        assert!(NeighborState::Reachable.is_usable());
        assert!(NeighborState::Stale.is_usable());
        assert!(!NeighborState::Failed.is_usable());
        assert!(!NeighborState::Incomplete.is_usable());
    }
}
