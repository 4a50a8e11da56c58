//! Kernel bridge state turned into VLAN, bridging and next-hop intents.
//!
//! A link takes part in switching when it is enslaved to a bridge and is
//! backed by a switch port, either directly or as a bond whose LAG has a
//! member. Bond membership itself is tracked whether or not a datapath is
//! attached; flow programming only happens while attached and is replayed
//! in full on every attach.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use basebox_types::{LogicalPortId, SwitchPortNo, VlanId};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace};

use crate::config::BaseboxConfig;
use crate::context::ShutdownSignal;
use crate::error::{BaseboxError, Result};
use crate::flow::FlowTableProgrammer;
use crate::lag::LagAggregator;
use crate::netlink::{LinkEvent, LinkState, LinkStateCache, NeighborEntry};
use crate::ports::{PortIdentityMap, PortKey};
use crate::session::SwitchConnection;

/// VLAN membership of a bridged switch port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortVlans {
    pub vlans: BTreeSet<VlanId>,
    pub pvid: VlanId,
}

impl PortVlans {
    fn is_untagged(&self, vid: VlanId) -> bool {
        vid == self.pvid
    }
}

pub struct BridgeAgent {
    config: Arc<BaseboxConfig>,
    links: Arc<LinkStateCache>,
    ports: Arc<PortIdentityMap>,
    lags: Arc<LagAggregator>,
    connection: Arc<SwitchConnection>,
    programmer: Arc<FlowTableProgrammer>,
    halt: Arc<ShutdownSignal>,
    /// Bridged link ifindex to the port its entries are programmed on.
    bridged: Mutex<HashMap<u32, LogicalPortId>>,
}

impl BridgeAgent {
    pub fn new(
        config: Arc<BaseboxConfig>,
        links: Arc<LinkStateCache>,
        ports: Arc<PortIdentityMap>,
        lags: Arc<LagAggregator>,
        connection: Arc<SwitchConnection>,
        programmer: Arc<FlowTableProgrammer>,
        halt: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            config,
            links,
            ports,
            lags,
            connection,
            programmer,
            halt,
            bridged: Mutex::new(HashMap::new()),
        }
    }

    /// Link cache callback.
    pub fn handle(&self, event: &LinkEvent) {
        let result = match event {
            LinkEvent::LinkCreated(link) => self.link_changed(None, link),
            LinkEvent::LinkUpdated { old, new } => self.link_changed(Some(old), new),
            LinkEvent::LinkDeleted(link) => self.link_deleted(link),
            LinkEvent::NeighCreated(neigh) => self.neighbor_changed(neigh),
            LinkEvent::NeighUpdated { new, .. } => self.neighbor_changed(new),
            LinkEvent::NeighDeleted(neigh) => self.neighbor_deleted(neigh),
            LinkEvent::AddrCreated { .. } | LinkEvent::AddrDeleted { .. } => Ok(()),
        };
        if let Err(e) = result {
            self.halt.report("bridge agent", e);
        }
    }

    /// Reprograms every bridged port and neighbor from the cache. Called
    /// right after attach, when the installed set is empty.
    #[instrument(skip(self))]
    pub fn replay(&self) {
        self.bridged.lock().clear();
        let links = self.links.get_links();
        // bond members seen before their switch port existed
        for link in links.iter().filter(|link| self.is_aggregate(link.master)) {
            if let Err(e) = self.join_lag(link.master, link.ifindex) {
                self.halt.report("bridge replay", e);
            }
        }
        for link in &links {
            if let Err(e) = self.reconcile(link) {
                self.halt.report("bridge replay", e);
            }
        }
        for link in &links {
            for neigh in link.neighbors.values() {
                if let Err(e) = self.neighbor_changed(neigh) {
                    self.halt.report("bridge replay", e);
                }
            }
        }
        info!(bridged = self.bridged.lock().len(), "bridge state replayed");
    }

    /// Re-evaluates one link, e.g. after its switch port reappeared.
    pub fn replay_link(&self, ifindex: u32) -> Result<()> {
        let link = self.links.get_link(ifindex)?;
        if self.is_aggregate(link.master) {
            self.join_lag(link.master, link.ifindex)?;
        }
        self.reconcile(&link)?;
        for neigh in link.neighbors.values() {
            self.neighbor_changed(neigh)?;
        }
        Ok(())
    }

    /// Drops the bookkeeping of a port whose flows were already retracted.
    pub fn forget_port(&self, port: LogicalPortId) {
        self.bridged.lock().retain(|_, bridged| *bridged != port);
    }

    pub fn bridged_port(&self, ifindex: u32) -> Option<LogicalPortId> {
        self.bridged.lock().get(&ifindex).copied()
    }

    /// VLANs configured for `port_no`, VLAN 1 untagged when unconfigured.
    pub fn port_vlans(&self, port_no: SwitchPortNo) -> PortVlans {
        let dpid = self.connection.dpid().unwrap_or(0);
        match self.config.port(dpid, port_no.as_u32()) {
            Some(port) => {
                let mut vlans: BTreeSet<VlanId> = port.vlans.iter().copied().collect();
                vlans.insert(port.pvid);
                PortVlans {
                    vlans,
                    pvid: port.pvid,
                }
            }
            None => PortVlans {
                vlans: BTreeSet::from([VlanId::DEFAULT]),
                pvid: VlanId::DEFAULT,
            },
        }
    }

    fn link_changed(&self, old: Option<&LinkState>, link: &LinkState) -> Result<()> {
        if let Some(old) = old {
            if old.master != link.master && self.is_aggregate(old.master) {
                self.leave_lag(old.master, link.ifindex)?;
            }
        }
        if self.is_aggregate(link.master) {
            self.join_lag(link.master, link.ifindex)?;
        }
        self.reconcile(link)
    }

    fn link_deleted(&self, link: &LinkState) -> Result<()> {
        let bridged = self.bridged.lock().remove(&link.ifindex);
        if let Some(port) = bridged {
            self.unbridge_port(port)?;
        }
        if self.is_aggregate(link.master) {
            self.leave_lag(link.master, link.ifindex)?;
        }
        if link.is_aggregate() {
            match self.lags.remove_lag(link.ifindex) {
                Ok(()) | Err(BaseboxError::LagNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn join_lag(&self, bond: u32, member: u32) -> Result<()> {
        if self
            .lags
            .lag(bond)
            .and_then(|lag| lag.member)
            .is_some_and(|current| current.ifindex == member)
        {
            return Ok(());
        }
        match self.lags.add_member(bond, member) {
            Err(e) if !e.is_fatal() => {
                e.log("lag member add");
                Ok(())
            }
            other => other,
        }
    }

    fn leave_lag(&self, bond: u32, member: u32) -> Result<()> {
        let is_member = self
            .lags
            .lag(bond)
            .and_then(|lag| lag.member)
            .is_some_and(|current| current.ifindex == member);
        if !is_member {
            trace!(bond, member, "not the lag member");
            return Ok(());
        }

        // the bond's entries live on the member port
        let bridged = self.bridged.lock().remove(&bond);
        if let Some(port) = bridged {
            self.unbridge_port(port)?;
        }
        self.lags.remove_member(bond, member)
    }

    fn is_aggregate(&self, ifindex: u32) -> bool {
        ifindex != 0
            && self
                .links
                .get_link(ifindex)
                .is_ok_and(|link| link.is_aggregate())
    }

    fn is_bridged(&self, link: &LinkState) -> bool {
        link.master != 0
            && self
                .links
                .get_link(link.master)
                .is_ok_and(|master| master.is_bridge())
    }

    /// Switch port carrying the traffic of `link`.
    fn port_of(&self, link: &LinkState) -> Option<(LogicalPortId, SwitchPortNo)> {
        let mapping = if link.is_aggregate() {
            match self.lags.lookup_port_id(link.ifindex) {
                0 => return None,
                port_no => self
                    .ports
                    .resolve(PortKey::SwitchPort(SwitchPortNo::new(port_no)))
                    .ok()?,
            }
        } else {
            self.ports.resolve(PortKey::IfIndex(link.ifindex)).ok()?
        };
        Some((mapping.id, mapping.switch_port?))
    }

    fn reconcile(&self, link: &LinkState) -> Result<()> {
        if !self.connection.is_attached() {
            return Ok(());
        }

        let wanted = if self.is_bridged(link) {
            self.port_of(link)
        } else {
            None
        };
        let current = self.bridged.lock().get(&link.ifindex).copied();
        if current == wanted.map(|(port, _)| port) {
            return Ok(());
        }

        if let Some(port) = current {
            self.bridged.lock().remove(&link.ifindex);
            self.unbridge_port(port)?;
        }
        if let Some((port, port_no)) = wanted {
            self.bridge_port(link, port, port_no)?;
            self.bridged.lock().insert(link.ifindex, port);
        }
        Ok(())
    }

    #[instrument(skip(self, link), fields(link = %link))]
    fn bridge_port(&self, link: &LinkState, port: LogicalPortId, port_no: SwitchPortNo) -> Result<()> {
        let vlans = self.port_vlans(port_no);
        for vid in &vlans.vlans {
            let untagged = vlans.is_untagged(*vid);
            self.programmer.egress_vlan_add(port, *vid, untagged)?;
            self.programmer.ingress_vlan_add(port, *vid, untagged)?;
        }
        info!(%port, %port_no, vlans = vlans.vlans.len(), pvid = %vlans.pvid, "port bridged");

        for neigh in link.neighbors.values().filter(|n| n.is_fdb()) {
            if let Err(e) = self.fdb_add(port, port_no, neigh) {
                if e.is_fatal() {
                    return Err(e);
                }
                e.log("bridge fdb replay");
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn unbridge_port(&self, port: LogicalPortId) -> Result<()> {
        if !self.connection.is_attached() {
            return Ok(());
        }
        let port_no = self.ports.switch_port(PortKey::Logical(port))?;
        let vlans = self.port_vlans(port_no);
        for vid in &vlans.vlans {
            let untagged = vlans.is_untagged(*vid);
            self.programmer.ingress_vlan_remove(port, *vid, untagged)?;
            // takes the bridging entries of the vlan along
            self.programmer.egress_vlan_remove(port, *vid)?;
        }
        info!(%port, %port_no, "port left bridge");
        Ok(())
    }

    fn fdb_vid(&self, port_no: SwitchPortNo, neigh: &NeighborEntry) -> Result<VlanId> {
        VlanId::from_kernel(neigh.vlan, self.port_vlans(port_no).pvid)
            .map_err(|e| BaseboxError::InvalidArgument(e.to_string()))
    }

    fn fdb_add(&self, port: LogicalPortId, port_no: SwitchPortNo, neigh: &NeighborEntry) -> Result<()> {
        let Some(lladdr) = neigh.lladdr else {
            return Ok(());
        };
        if !lladdr.is_unicast() {
            trace!(%lladdr, "multicast fdb entry skipped");
            return Ok(());
        }
        let vid = self.fdb_vid(port_no, neigh)?;
        self.programmer.add_bridging_unicast(port, vid, lladdr)
    }

    fn neighbor_changed(&self, neigh: &NeighborEntry) -> Result<()> {
        if !self.connection.is_attached() {
            return Ok(());
        }

        if neigh.is_fdb() {
            let Some(port) = self.bridged_port(neigh.ifindex) else {
                trace!(ifindex = neigh.ifindex, "fdb entry on unbridged link");
                return Ok(());
            };
            let port_no = self.ports.switch_port(PortKey::Logical(port))?;
            return self.fdb_add(port, port_no, neigh);
        }

        let Some(dst) = neigh.dst else {
            return Ok(());
        };
        let link = self.links.get_link(neigh.ifindex)?;
        let Some((port, _)) = self.port_of(&link) else {
            trace!(link = %link, "neighbor on a link without switch port");
            return Ok(());
        };
        match neigh.lladdr {
            Some(lladdr) if neigh.state.is_usable() => {
                self.programmer.add_neighbor_nexthop(port, dst, link.hwaddr, lladdr)
            }
            _ => {
                debug!(%dst, state = ?neigh.state, "neighbor unusable");
                self.programmer.remove_neighbor_nexthop(port, dst)
            }
        }
    }

    fn neighbor_deleted(&self, neigh: &NeighborEntry) -> Result<()> {
        if !self.connection.is_attached() {
            return Ok(());
        }

        if neigh.is_fdb() {
            let (Some(port), Some(lladdr)) = (self.bridged_port(neigh.ifindex), neigh.lladdr) else {
                return Ok(());
            };
            let port_no = self.ports.switch_port(PortKey::Logical(port))?;
            let vid = self.fdb_vid(port_no, neigh)?;
            return self.programmer.remove_bridging_unicast(port, vid, lladdr);
        }

        let Some(dst) = neigh.dst else {
            return Ok(());
        };
        let Ok(link) = self.links.get_link(neigh.ifindex) else {
            return Ok(());
        };
        match self.port_of(&link) {
            Some((port, _)) => self.programmer.remove_neighbor_nexthop(port, dst),
            None => Ok(()),
        }
    }
}
