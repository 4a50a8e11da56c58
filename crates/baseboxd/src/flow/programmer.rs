//! The only component that modifies datapath flow and group tables.
//!
//! Every operation is "ensure present" or "ensure absent" against the set of
//! entries this programmer has installed since the last attach:
//! - absent entry: ADD
//! - installed with different content: MODIFY_STRICT (groups: MODIFY)
//! - installed and identical: nothing is sent
//! - ensure absent of an installed entry: DELETE_STRICT (groups: DELETE)
//!
//! Entries are recorded only after the message was queued, so a congested
//! or closed channel leaves the installed set untouched.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use basebox_common::SyncMap;
use basebox_ofdpa::ofdpa::{
    l2_interface_group_id, l2_unfiltered_interface_group_id, OFPVID_PRESENT, VID_MASK,
};
use basebox_ofdpa::{
    Action, DatapathChannel, FlowModCommand, GroupModCommand, Instruction, Match, OfMessage,
    OfdpaTable, OxmField, OFPFF_SEND_FLOW_REM, OFPP_CONTROLLER,
};
use basebox_types::{LogicalPortId, MacAddress, VlanId};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, trace};

use super::intent::{FlowIntent, FlowKey, GroupEntry, GroupIntent, InstalledIntents};
use crate::error::{BaseboxError, Result};
use crate::ports::{FlowsRetracted, PortIdentityMap, PortKey};
use crate::session::SwitchConnection;

const PRIORITY_VLAN_TAGGED: u16 = 3;
const PRIORITY_VLAN_UNTAGGED: u16 = 2;
const PRIORITY_VLAN_ACCEPT_ALL: u16 = 1;
const PRIORITY_BRIDGING: u16 = 2;
const PRIORITY_POLICY: u16 = 0xfff0;
const PRIORITY_NEXTHOP: u16 = 0xfffe;

const ETH_P_IP: u16 = 0x0800;
const ETH_P_ARP: u16 = 0x0806;
const ETH_P_IPV6: u16 = 0x86dd;
const ETH_P_SLOW: u16 = 0x8809;
const ETH_P_LLDP: u16 = 0x88cc;

const LLDP_DST: MacAddress = MacAddress::new([0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e]);
const SLOW_PROTOCOLS_DST: MacAddress = MacAddress::new([0x01, 0x80, 0xc2, 0x00, 0x00, 0x02]);

/// Control traffic punted to the controller from the ACL policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyTrap {
    Arp,
    Lldp,
    Lacp,
}

impl PolicyTrap {
    fn match_fields(self) -> Match {
        match self {
            Self::Arp => Match::new().with(OxmField::EthType(ETH_P_ARP)),
            Self::Lldp => Match::new()
                .with(OxmField::EthType(ETH_P_LLDP))
                .with(OxmField::eth_dst(LLDP_DST)),
            Self::Lacp => Match::new()
                .with(OxmField::EthType(ETH_P_SLOW))
                .with(OxmField::eth_dst(SLOW_PROTOCOLS_DST)),
        }
    }

    fn intent(self) -> FlowIntent {
        FlowIntent::new(OfdpaTable::AclPolicy, PRIORITY_POLICY, self.match_fields())
            .with_instruction(Instruction::ApplyActions(vec![Action::output(OFPP_CONTROLLER)]))
    }
}

#[derive(Debug, Default)]
struct Installed {
    flows: HashMap<FlowKey, FlowIntent>,
    groups: SyncMap<u32, GroupEntry>,
}

impl Installed {
    fn reference(&mut self, groups: &[u32]) -> Result<()> {
        for group in groups {
            self.groups.increment_ref(group).map_err(|e| {
                BaseboxError::InvariantViolation(format!("group {:#010x}: {}", group, e))
            })?;
        }
        Ok(())
    }

    fn release(&mut self, groups: &[u32]) -> Result<()> {
        for group in groups {
            self.groups.decrement_ref(group).map_err(|e| {
                BaseboxError::InvariantViolation(format!("group {:#010x}: {}", group, e))
            })?;
        }
        Ok(())
    }

    fn forget_flow(&mut self, key: &FlowKey) -> Result<Option<FlowIntent>> {
        match self.flows.remove(key) {
            Some(intent) => {
                self.release(&intent.groups().collect::<Vec<_>>())?;
                Ok(Some(intent))
            }
            None => Ok(None),
        }
    }
}

/// Turns bridging, VLAN, policy and next-hop intents into flow-mods and
/// group-mods.
pub struct FlowTableProgrammer {
    connection: Arc<SwitchConnection>,
    ports: Arc<PortIdentityMap>,
    installed: RwLock<Installed>,
}

impl FlowTableProgrammer {
    pub fn new(connection: Arc<SwitchConnection>, ports: Arc<PortIdentityMap>) -> Self {
        Self {
            connection,
            ports,
            installed: RwLock::new(Installed::default()),
        }
    }

    fn channel(&self) -> Result<Arc<dyn DatapathChannel>> {
        self.connection.channel().ok_or(BaseboxError::ChannelDown)
    }

    fn port_no(&self, port: LogicalPortId) -> Result<u32> {
        Ok(self.ports.switch_port(PortKey::Logical(port))?.as_u32())
    }

    fn ensure_flow(&self, intent: FlowIntent) -> Result<()> {
        let channel = self.channel()?;
        let mut installed = self.installed.write();

        let key = intent.key();
        let command = match installed.flows.get(&key) {
            Some(current) if *current == intent => {
                trace!(table = %intent.table, "flow already installed");
                return Ok(());
            }
            Some(_) => FlowModCommand::ModifyStrict,
            None => FlowModCommand::Add,
        };

        let groups: Vec<u32> = intent.groups().collect();
        if let Some(missing) = groups.iter().find(|g| !installed.groups.contains_key(g)) {
            return Err(BaseboxError::InvalidArgument(format!(
                "flow in {} references group {:#010x} which is not installed",
                intent.table, missing
            )));
        }

        channel.send(OfMessage::FlowMod(intent.to_flow_mod(command)))?;
        debug!(table = %intent.table, priority = intent.priority, ?command, "flow programmed");

        installed.reference(&groups)?;
        if let Some(previous) = installed.flows.insert(key, intent) {
            installed.release(&previous.groups().collect::<Vec<_>>())?;
        }
        Ok(())
    }

    fn retract_flow(
        channel: &dyn DatapathChannel,
        installed: &mut Installed,
        key: &FlowKey,
    ) -> Result<bool> {
        let Some(current) = installed.flows.get(key) else {
            return Ok(false);
        };
        channel.send(OfMessage::FlowMod(current.to_flow_mod(FlowModCommand::DeleteStrict)))?;
        debug!(table = %key.table, priority = key.priority, "flow deleted");
        installed.forget_flow(key)?;
        Ok(true)
    }

    /// Removes `key` if it is installed for `port`.
    fn retract_port_flow(&self, port: LogicalPortId, key: &FlowKey) -> Result<()> {
        let channel = self.channel()?;
        let mut installed = self.installed.write();
        match installed.flows.get(key) {
            Some(current) if current.port == Some(port) => {
                Self::retract_flow(channel.as_ref(), &mut installed, key)?;
            }
            Some(_) => debug!(table = %key.table, %port, "entry owned by another port, kept"),
            None => trace!(table = %key.table, %port, "entry not installed"),
        }
        Ok(())
    }

    /// Removes the installed entry under `intent`'s key only when it is
    /// exactly `intent`.
    fn retract_port_intent(&self, intent: &FlowIntent) -> Result<()> {
        let channel = self.channel()?;
        let mut installed = self.installed.write();
        let key = intent.key();
        match installed.flows.get(&key) {
            Some(current) if current == intent => {
                Self::retract_flow(channel.as_ref(), &mut installed, &key)?;
            }
            Some(_) => debug!(table = %key.table, "entry programmed differently, kept"),
            None => trace!(table = %key.table, "entry not installed"),
        }
        Ok(())
    }

    fn ensure_group(&self, intent: GroupIntent) -> Result<()> {
        let channel = self.channel()?;
        let mut installed = self.installed.write();

        let command = match installed.groups.get(&intent.group_id) {
            Some(entry) if entry.intent == intent => return Ok(()),
            Some(_) => GroupModCommand::Modify,
            None => GroupModCommand::Add,
        };
        channel.send(OfMessage::GroupMod(intent.to_group_mod(command)))?;
        debug!(group = format_args!("{:#010x}", intent.group_id), ?command, "group programmed");

        match installed.groups.get_mut(&intent.group_id) {
            Some(entry) => entry.intent = intent,
            None => {
                installed.groups.insert(intent.group_id, GroupEntry::new(intent));
            }
        }
        Ok(())
    }

    /// Deletes a group after the flows pointing at it.
    fn retract_group(
        channel: &dyn DatapathChannel,
        installed: &mut Installed,
        group_id: u32,
    ) -> Result<bool> {
        let Some(entry) = installed.groups.get(&group_id) else {
            return Ok(false);
        };
        let intent = entry.intent.clone();

        let dependents: Vec<FlowKey> = installed
            .flows
            .values()
            .filter(|flow| flow.groups().any(|g| g == group_id))
            .map(FlowIntent::key)
            .collect();
        for key in &dependents {
            Self::retract_flow(channel, installed, key)?;
        }

        channel.send(OfMessage::GroupMod(intent.to_group_mod(GroupModCommand::Delete)))?;
        installed.groups.remove(&group_id);
        debug!(
            group = format_args!("{:#010x}", group_id),
            dependents = dependents.len(),
            "group deleted"
        );
        Ok(true)
    }

    fn retract_port_group(&self, group_id: u32) -> Result<()> {
        let channel = self.channel()?;
        let mut installed = self.installed.write();
        Self::retract_group(channel.as_ref(), &mut installed, group_id)?;
        Ok(())
    }

    // bridging

    fn bridging_match(vid: VlanId, mac: MacAddress) -> Match {
        Match::new()
            .with(OxmField::VlanVid {
                vid: vid.tagged(),
                mask: Some(VID_MASK),
            })
            .with(OxmField::eth_dst(mac))
    }

    fn bridging_key(vid: VlanId, mac: MacAddress) -> FlowKey {
        FlowKey {
            table: OfdpaTable::Bridging,
            priority: PRIORITY_BRIDGING,
            match_fields: Self::bridging_match(vid, mac),
        }
    }

    /// Forwards `mac` in `vid` to `port` through its L2 interface group.
    #[instrument(skip(self))]
    pub fn add_bridging_unicast(&self, port: LogicalPortId, vid: VlanId, mac: MacAddress) -> Result<()> {
        let port_no = self.port_no(port)?;
        let group = l2_interface_group_id(vid.as_u16(), port_no);

        let intent = FlowIntent::new(
            OfdpaTable::Bridging,
            PRIORITY_BRIDGING,
            Self::bridging_match(vid, mac),
        )
        .with_instruction(Instruction::WriteActions(vec![Action::Group(group)]))
        .with_instruction(Instruction::GotoTable(OfdpaTable::AclPolicy.id()))
        .with_cookie(u64::from(port_no))
        .with_flags(OFPFF_SEND_FLOW_REM)
        .for_port(port);
        self.ensure_flow(intent)
    }

    #[instrument(skip(self))]
    pub fn remove_bridging_unicast(&self, port: LogicalPortId, vid: VlanId, mac: MacAddress) -> Result<()> {
        self.port_no(port)?;
        self.retract_port_flow(port, &Self::bridging_key(vid, mac))
    }

    /// Removes every bridging entry of `port` in `vid`; returns how many.
    #[instrument(skip(self))]
    pub fn remove_bridging_unicast_all_in_vlan(&self, port: LogicalPortId, vid: VlanId) -> Result<usize> {
        self.port_no(port)?;
        let channel = self.channel()?;
        let mut installed = self.installed.write();

        let wanted = vid.tagged();
        let keys: Vec<FlowKey> = installed
            .flows
            .values()
            .filter(|flow| {
                flow.table == OfdpaTable::Bridging
                    && flow.port == Some(port)
                    && flow.match_fields.vlan_vid() == Some(wanted)
            })
            .map(FlowIntent::key)
            .collect();
        for key in &keys {
            Self::retract_flow(channel.as_ref(), &mut installed, key)?;
        }
        Ok(keys.len())
    }

    /// Drops a bridging entry the datapath reported as removed, without
    /// sending anything.
    pub fn forget_removed_flow(
        &self,
        table: OfdpaTable,
        priority: u16,
        match_fields: &Match,
    ) -> Result<Option<FlowIntent>> {
        let key = FlowKey {
            table,
            priority,
            match_fields: match_fields.clone(),
        };
        self.installed.write().forget_flow(&key)
    }

    // ingress vlan

    fn ingress_tagged(port: LogicalPortId, port_no: u32, vid: VlanId) -> FlowIntent {
        FlowIntent::new(
            OfdpaTable::Vlan,
            PRIORITY_VLAN_TAGGED,
            Match::new().with(OxmField::InPort(port_no)).with(OxmField::VlanVid {
                vid: vid.tagged(),
                mask: Some(VID_MASK),
            }),
        )
        .with_instruction(Instruction::GotoTable(OfdpaTable::TerminationMac.id()))
        .for_port(port)
    }

    fn ingress_untagged(port: LogicalPortId, port_no: u32, vid: VlanId) -> FlowIntent {
        FlowIntent::new(
            OfdpaTable::Vlan,
            PRIORITY_VLAN_UNTAGGED,
            Match::new()
                .with(OxmField::InPort(port_no))
                .with(OxmField::vlan_vid(0)),
        )
        .with_instruction(Instruction::ApplyActions(vec![Action::SetField(
            OxmField::vlan_vid(vid.tagged()),
        )]))
        .with_instruction(Instruction::GotoTable(OfdpaTable::TerminationMac.id()))
        .for_port(port)
    }

    fn ingress_accept_all(port: LogicalPortId, port_no: u32) -> FlowIntent {
        FlowIntent::new(
            OfdpaTable::Vlan,
            PRIORITY_VLAN_ACCEPT_ALL,
            Match::new().with(OxmField::InPort(port_no)).with(OxmField::VlanVid {
                vid: OFPVID_PRESENT,
                mask: Some(OFPVID_PRESENT),
            }),
        )
        .with_instruction(Instruction::GotoTable(OfdpaTable::TerminationMac.id()))
        .for_port(port)
    }

    /// Admits `vid` tagged on `port`; with `pvid` untagged frames are
    /// admitted into `vid` too.
    #[instrument(skip(self))]
    pub fn ingress_vlan_add(&self, port: LogicalPortId, vid: VlanId, pvid: bool) -> Result<()> {
        let port_no = self.port_no(port)?;
        self.ensure_flow(Self::ingress_tagged(port, port_no, vid))?;
        if pvid {
            self.ensure_flow(Self::ingress_untagged(port, port_no, vid))?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn ingress_vlan_remove(&self, port: LogicalPortId, vid: VlanId, pvid: bool) -> Result<()> {
        let port_no = self.port_no(port)?;
        if pvid {
            // the untagged entry is keyed by port only; it may carry another pvid
            self.retract_port_intent(&Self::ingress_untagged(port, port_no, vid))?;
        }
        self.retract_port_flow(port, &Self::ingress_tagged(port, port_no, vid).key())
    }

    #[instrument(skip(self))]
    pub fn ingress_vlan_accept_all(&self, port: LogicalPortId) -> Result<()> {
        let port_no = self.port_no(port)?;
        self.ensure_flow(Self::ingress_accept_all(port, port_no))
    }

    #[instrument(skip(self))]
    pub fn ingress_vlan_drop_accept_all(&self, port: LogicalPortId) -> Result<()> {
        let port_no = self.port_no(port)?;
        self.retract_port_flow(port, &Self::ingress_accept_all(port, port_no).key())
    }

    // egress vlan

    /// Installs the L2 interface group of (`vid`, `port`); `untagged` pops
    /// the tag on egress.
    #[instrument(skip(self))]
    pub fn egress_vlan_add(&self, port: LogicalPortId, vid: VlanId, untagged: bool) -> Result<()> {
        let port_no = self.port_no(port)?;
        let mut actions = Vec::with_capacity(2);
        if untagged {
            actions.push(Action::PopVlan);
        }
        actions.push(Action::output(port_no));

        let group = l2_interface_group_id(vid.as_u16(), port_no);
        self.ensure_group(GroupIntent::indirect(group, actions).for_port(port))
    }

    /// Deletes the L2 interface group of (`vid`, `port`) together with the
    /// bridging entries forwarding into it.
    #[instrument(skip(self))]
    pub fn egress_vlan_remove(&self, port: LogicalPortId, vid: VlanId) -> Result<()> {
        let port_no = self.port_no(port)?;
        self.retract_port_group(l2_interface_group_id(vid.as_u16(), port_no))
    }

    #[instrument(skip(self))]
    pub fn egress_vlan_accept_all(&self, port: LogicalPortId) -> Result<()> {
        let port_no = self.port_no(port)?;
        let group = l2_unfiltered_interface_group_id(port_no);
        self.ensure_group(GroupIntent::indirect(group, vec![Action::output(port_no)]).for_port(port))
    }

    #[instrument(skip(self))]
    pub fn egress_vlan_drop_accept_all(&self, port: LogicalPortId) -> Result<()> {
        let port_no = self.port_no(port)?;
        self.retract_port_group(l2_unfiltered_interface_group_id(port_no))
    }

    // acl policy

    #[instrument(skip(self))]
    pub fn enable_policy(&self, trap: PolicyTrap) -> Result<()> {
        self.ensure_flow(trap.intent())
    }

    #[instrument(skip(self))]
    pub fn disable_policy(&self, trap: PolicyTrap) -> Result<()> {
        let channel = self.channel()?;
        let mut installed = self.installed.write();
        Self::retract_flow(channel.as_ref(), &mut installed, &trap.intent().key())?;
        Ok(())
    }

    // neighbor next hops

    fn nexthop_match(dst: IpAddr) -> Match {
        match dst {
            IpAddr::V4(addr) => Match::new()
                .with(OxmField::EthType(ETH_P_IP))
                .with(OxmField::ipv4_dst(addr)),
            IpAddr::V6(addr) => Match::new()
                .with(OxmField::EthType(ETH_P_IPV6))
                .with(OxmField::ipv6_dst(addr)),
        }
    }

    fn nexthop_key(dst: IpAddr) -> FlowKey {
        FlowKey {
            table: OfdpaTable::UnicastRouting,
            priority: PRIORITY_NEXTHOP,
            match_fields: Self::nexthop_match(dst),
        }
    }

    /// Routes `dst` out of `port`, rewriting the Ethernet addresses in this
    /// order: source, destination, output.
    #[instrument(skip(self))]
    pub fn add_neighbor_nexthop(
        &self,
        port: LogicalPortId,
        dst: IpAddr,
        src_mac: MacAddress,
        dst_mac: MacAddress,
    ) -> Result<()> {
        let port_no = self.port_no(port)?;
        let intent = FlowIntent::new(
            OfdpaTable::UnicastRouting,
            PRIORITY_NEXTHOP,
            Self::nexthop_match(dst),
        )
        .with_instruction(Instruction::ApplyActions(vec![
            Action::SetField(OxmField::eth_src(src_mac)),
            Action::SetField(OxmField::eth_dst(dst_mac)),
            Action::output(port_no),
        ]))
        .with_cookie(u64::from(port_no))
        .with_flags(OFPFF_SEND_FLOW_REM)
        .for_port(port);
        self.ensure_flow(intent)
    }

    #[instrument(skip(self))]
    pub fn remove_neighbor_nexthop(&self, port: LogicalPortId, dst: IpAddr) -> Result<()> {
        self.port_no(port)?;
        self.retract_port_flow(port, &Self::nexthop_key(dst))
    }

    // lifecycle

    /// Removes every installed flow and group belonging to `port`.
    #[instrument(skip(self))]
    pub fn retract_port(&self, port: LogicalPortId) -> Result<FlowsRetracted> {
        let mut installed = self.installed.write();

        let flows: Vec<FlowKey> = installed
            .flows
            .values()
            .filter(|flow| flow.port == Some(port))
            .map(FlowIntent::key)
            .collect();
        let groups: Vec<u32> = installed
            .groups
            .values()
            .filter(|entry| entry.intent.port == Some(port))
            .map(|entry| entry.intent.group_id)
            .collect();

        if !flows.is_empty() || !groups.is_empty() {
            let channel = self.channel()?;
            for key in &flows {
                Self::retract_flow(channel.as_ref(), &mut installed, key)?;
            }
            for group in &groups {
                Self::retract_group(channel.as_ref(), &mut installed, *group)?;
            }
            info!(%port, flows = flows.len(), groups = groups.len(), "port flows retracted");
        }
        Ok(FlowsRetracted::new(port))
    }

    /// Forgets the installed set; nothing is sent.
    pub fn reset(&self) {
        let mut installed = self.installed.write();
        let count = installed.flows.len() + installed.groups.len();
        *installed = Installed::default();
        info!(entries = count, "installed flow state reset");
    }

    /// Re-sends ADD for every installed group, then every installed flow.
    #[instrument(skip(self))]
    pub fn resend_installed(&self) -> Result<usize> {
        let channel = self.channel()?;
        let installed = self.installed.read();

        for entry in installed.groups.values() {
            channel.send(OfMessage::GroupMod(entry.intent.to_group_mod(GroupModCommand::Add)))?;
        }
        for flow in installed.flows.values() {
            channel.send(OfMessage::FlowMod(flow.to_flow_mod(FlowModCommand::Add)))?;
        }

        let count = installed.flows.len() + installed.groups.len();
        info!(entries = count, "installed state resent");
        Ok(count)
    }

    pub fn installed_intents(&self) -> InstalledIntents {
        let installed = self.installed.read();
        InstalledIntents {
            flows: installed.flows.values().cloned().collect(),
            groups: installed.groups.values().map(|e| e.intent.clone()).collect(),
        }
    }

    /// Number of installed flows referencing `group_id`.
    pub fn group_refs(&self, group_id: u32) -> Option<u32> {
        self.installed.read().groups.ref_count(&group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingChannel;
    use basebox_ofdpa::{FlowMod, GroupMod};
    use basebox_types::SwitchPortNo;
    use pretty_assertions::assert_eq;

    struct Fixture {
        channel: Arc<RecordingChannel>,
        connection: Arc<SwitchConnection>,
        programmer: FlowTableProgrammer,
        port: LogicalPortId,
    }

    fn fixture() -> Fixture {
        let ports = Arc::new(PortIdentityMap::new());
        let port = ports.register(7, "port3").unwrap();
        ports.bind_switch_port(port, SwitchPortNo::new(3)).unwrap();

        let connection = Arc::new(SwitchConnection::new());
        let channel = Arc::new(RecordingChannel::new());
        connection.attach(1, channel.clone());

        Fixture {
            programmer: FlowTableProgrammer::new(Arc::clone(&connection), ports),
            channel,
            connection,
            port,
        }
    }

    fn vid(id: u16) -> VlanId {
        VlanId::new(id).unwrap()
    }

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x02, 0, 0, 0, 0, last])
    }

    fn flow_mods(channel: &RecordingChannel) -> Vec<FlowMod> {
        channel
            .take()
            .into_iter()
            .filter_map(|msg| match msg {
                OfMessage::FlowMod(flow) => Some(flow),
                _ => None,
            })
            .collect()
    }

    fn group_mods(channel: &RecordingChannel) -> Vec<GroupMod> {
        channel
            .take()
            .into_iter()
            .filter_map(|msg| match msg {
                OfMessage::GroupMod(group) => Some(group),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_add_modify_noop_delete() {
        let f = fixture();
        f.programmer.egress_vlan_add(f.port, vid(10), false).unwrap();
        f.channel.take();

        f.programmer.add_bridging_unicast(f.port, vid(10), mac(1)).unwrap();
        f.programmer.add_bridging_unicast(f.port, vid(10), mac(1)).unwrap();
        let sent = flow_mods(&f.channel);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, FlowModCommand::Add);
        assert_eq!(sent[0].table_id, 50);
        assert_eq!(sent[0].cookie, 3);
        assert_eq!(sent[0].flags, OFPFF_SEND_FLOW_REM);
        assert_eq!(
            sent[0].instructions[0],
            Instruction::WriteActions(vec![Action::Group(0x000a_0003)])
        );

        f.programmer.remove_bridging_unicast(f.port, vid(10), mac(1)).unwrap();
        f.programmer.remove_bridging_unicast(f.port, vid(10), mac(1)).unwrap();
        let sent = flow_mods(&f.channel);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, FlowModCommand::DeleteStrict);
    }

    #[test]
    fn test_modify_strict_on_changed_content() {
        let f = fixture();
        f.programmer
            .add_neighbor_nexthop(f.port, "10.0.0.2".parse().unwrap(), mac(1), mac(2))
            .unwrap();
        f.programmer
            .add_neighbor_nexthop(f.port, "10.0.0.2".parse().unwrap(), mac(1), mac(3))
            .unwrap();

        let sent = flow_mods(&f.channel);
        assert_eq!(sent[0].command, FlowModCommand::Add);
        assert_eq!(sent[1].command, FlowModCommand::ModifyStrict);
        assert_eq!(sent[1].table_id, 30);
        assert_eq!(sent[1].priority, 0xfffe);
        assert_eq!(
            sent[1].instructions,
            vec![Instruction::ApplyActions(vec![
                Action::SetField(OxmField::eth_src(mac(1))),
                Action::SetField(OxmField::eth_dst(mac(3))),
                Action::output(3),
            ])]
        );
    }

    #[test]
    fn test_bridging_requires_egress_group() {
        let f = fixture();
        let err = f
            .programmer
            .add_bridging_unicast(f.port, vid(10), mac(1))
            .unwrap_err();
        assert!(matches!(err, BaseboxError::InvalidArgument(_)));
        assert!(f.channel.take().is_empty());
    }

    #[test]
    fn test_unmapped_port_is_not_found() {
        let f = fixture();
        let err = f
            .programmer
            .ingress_vlan_add(LogicalPortId::new(42), vid(10), true)
            .unwrap_err();
        assert!(matches!(err, BaseboxError::PortNotFound(_)));
    }

    #[test]
    fn test_ingress_vlan_pvid() {
        let f = fixture();
        f.programmer.ingress_vlan_add(f.port, vid(10), true).unwrap();
        let sent = flow_mods(&f.channel);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].priority, 3);
        assert_eq!(sent[1].priority, 2);
        assert_eq!(sent[1].match_fields.vlan_vid(), Some(0));
        assert_eq!(
            sent[1].instructions[0],
            Instruction::ApplyActions(vec![Action::SetField(OxmField::vlan_vid(0x100a))])
        );

        f.programmer.ingress_vlan_remove(f.port, vid(10), true).unwrap();
        let sent = flow_mods(&f.channel);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|flow| flow.command == FlowModCommand::DeleteStrict));
        assert!(f.programmer.installed_intents().is_empty());
    }

    #[test]
    fn test_pvid_removal_keeps_other_pvid() {
        let f = fixture();
        f.programmer.ingress_vlan_add(f.port, vid(20), true).unwrap();
        f.channel.take();

        f.programmer.ingress_vlan_remove(f.port, vid(10), true).unwrap();
        assert!(f.channel.take().is_empty());
        let vlan_flows = f.programmer.installed_intents().flows_in(OfdpaTable::Vlan).count();
        assert_eq!(vlan_flows, 2);

        f.programmer.ingress_vlan_remove(f.port, vid(20), true).unwrap();
        assert_eq!(flow_mods(&f.channel).len(), 2);
        assert!(f.programmer.installed_intents().is_empty());
    }

    #[test]
    fn test_egress_vlan_groups() {
        let f = fixture();
        f.programmer.egress_vlan_add(f.port, vid(10), true).unwrap();
        f.programmer.egress_vlan_accept_all(f.port).unwrap();
        let sent = group_mods(&f.channel);
        assert_eq!(sent[0].group_id, 0x000a_0003);
        assert_eq!(sent[0].buckets[0].actions, vec![Action::PopVlan, Action::output(3)]);
        assert_eq!(sent[1].group_id, 0xb000_0003);
        assert_eq!(sent[1].buckets[0].actions, vec![Action::output(3)]);
    }

    #[test]
    fn test_egress_vlan_remove_retracts_bridging_first() {
        let f = fixture();
        f.programmer.egress_vlan_add(f.port, vid(10), false).unwrap();
        f.programmer.add_bridging_unicast(f.port, vid(10), mac(1)).unwrap();
        f.programmer.add_bridging_unicast(f.port, vid(10), mac(2)).unwrap();
        assert_eq!(f.programmer.group_refs(0x000a_0003), Some(2));
        f.channel.take();

        f.programmer.egress_vlan_remove(f.port, vid(10)).unwrap();
        let sent = f.channel.take();
        assert_eq!(sent.len(), 3);
        assert!(matches!(sent[0], OfMessage::FlowMod(_)));
        assert!(matches!(sent[1], OfMessage::FlowMod(_)));
        assert!(matches!(
            &sent[2],
            OfMessage::GroupMod(g) if g.command == GroupModCommand::Delete
        ));
        assert!(f.programmer.installed_intents().is_empty());
    }

    #[test]
    fn test_remove_all_in_vlan() {
        let f = fixture();
        f.programmer.egress_vlan_add(f.port, vid(10), false).unwrap();
        f.programmer.egress_vlan_add(f.port, vid(20), false).unwrap();
        for last in 1..=3 {
            f.programmer.add_bridging_unicast(f.port, vid(10), mac(last)).unwrap();
        }
        f.programmer.add_bridging_unicast(f.port, vid(20), mac(9)).unwrap();

        assert_eq!(
            f.programmer
                .remove_bridging_unicast_all_in_vlan(f.port, vid(10))
                .unwrap(),
            3
        );
        let left = f.programmer.installed_intents();
        assert_eq!(left.flows_in(OfdpaTable::Bridging).count(), 1);
        assert_eq!(f.programmer.group_refs(0x000a_0003), Some(0));
    }

    #[test]
    fn test_policy_traps() {
        let f = fixture();
        f.programmer.enable_policy(PolicyTrap::Arp).unwrap();
        f.programmer.enable_policy(PolicyTrap::Lldp).unwrap();
        f.programmer.enable_policy(PolicyTrap::Lldp).unwrap();
        let sent = flow_mods(&f.channel);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].table_id, 60);
        assert_eq!(sent[0].priority, 0xfff0);
        assert_eq!(
            sent[0].instructions,
            vec![Instruction::ApplyActions(vec![Action::output(OFPP_CONTROLLER)])]
        );

        f.programmer.disable_policy(PolicyTrap::Lldp).unwrap();
        assert_eq!(flow_mods(&f.channel)[0].command, FlowModCommand::DeleteStrict);
    }

    #[test]
    fn test_detached_records_nothing() {
        let f = fixture();
        f.connection.detach();
        assert!(matches!(
            f.programmer.enable_policy(PolicyTrap::Arp),
            Err(BaseboxError::ChannelDown)
        ));
        assert!(f.programmer.installed_intents().is_empty());
    }

    #[test]
    fn test_congested_records_nothing() {
        let f = fixture();
        f.channel.fail_with(Some(basebox_ofdpa::ChannelError::Congested));
        assert!(matches!(
            f.programmer.enable_policy(PolicyTrap::Arp),
            Err(BaseboxError::ChannelCongested)
        ));
        assert!(f.programmer.installed_intents().is_empty());

        f.channel.fail_with(None);
        f.programmer.enable_policy(PolicyTrap::Arp).unwrap();
        assert_eq!(f.programmer.installed_intents().flows.len(), 1);
    }

    #[test]
    fn test_retract_port() {
        let f = fixture();
        f.programmer.enable_policy(PolicyTrap::Arp).unwrap();
        f.programmer.ingress_vlan_add(f.port, vid(10), true).unwrap();
        f.programmer.egress_vlan_add(f.port, vid(10), true).unwrap();
        f.programmer.add_bridging_unicast(f.port, vid(10), mac(1)).unwrap();

        let proof = f.programmer.retract_port(f.port).unwrap();
        assert_eq!(proof.port(), f.port);

        let left = f.programmer.installed_intents();
        assert_eq!(left.flows.len(), 1);
        assert!(left.groups.is_empty());
    }

    #[test]
    fn test_reset_and_resend() {
        let f = fixture();
        f.programmer.enable_policy(PolicyTrap::Arp).unwrap();
        f.programmer.egress_vlan_add(f.port, vid(10), false).unwrap();
        f.programmer.add_bridging_unicast(f.port, vid(10), mac(1)).unwrap();
        f.channel.take();

        assert_eq!(f.programmer.resend_installed().unwrap(), 3);
        let sent = f.channel.take();
        assert!(matches!(&sent[0], OfMessage::GroupMod(g) if g.command == GroupModCommand::Add));
        assert!(sent[1..]
            .iter()
            .all(|m| matches!(m, OfMessage::FlowMod(flow) if flow.command == FlowModCommand::Add)));

        f.programmer.reset();
        assert!(f.channel.take().is_empty());
        assert!(f.programmer.installed_intents().is_empty());
    }

    #[test]
    fn test_forget_removed_flow() {
        let f = fixture();
        f.programmer.egress_vlan_add(f.port, vid(10), false).unwrap();
        f.programmer.add_bridging_unicast(f.port, vid(10), mac(1)).unwrap();
        f.channel.take();

        let removed = f
            .programmer
            .forget_removed_flow(
                OfdpaTable::Bridging,
                PRIORITY_BRIDGING,
                &FlowTableProgrammer::bridging_match(vid(10), mac(1)),
            )
            .unwrap();
        assert_eq!(removed.unwrap().port, Some(f.port));
        assert_eq!(f.programmer.group_refs(0x000a_0003), Some(0));
        assert!(f.channel.take().is_empty());
    }
}
