//! OF-DPA pipeline layout.
//!
//! The OF-DPA abstraction fixes the table ids and encodes the group type and
//! its scope into the 32 bit group id.

use std::fmt;

/// Flow tables of the OF-DPA pipeline that baseboxd programs or receives
/// packet-ins from.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OfdpaTable {
    IngressPort = 0,
    Vlan = 10,
    TerminationMac = 20,
    UnicastRouting = 30,
    MulticastRouting = 40,
    Bridging = 50,
    AclPolicy = 60,
    SaLookup = 254,
}

impl OfdpaTable {
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::IngressPort),
            10 => Some(Self::Vlan),
            20 => Some(Self::TerminationMac),
            30 => Some(Self::UnicastRouting),
            40 => Some(Self::MulticastRouting),
            50 => Some(Self::Bridging),
            60 => Some(Self::AclPolicy),
            254 => Some(Self::SaLookup),
            _ => None,
        }
    }
}

impl fmt::Display for OfdpaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IngressPort => "ingress-port",
            Self::Vlan => "vlan",
            Self::TerminationMac => "termination-mac",
            Self::UnicastRouting => "unicast-routing",
            Self::MulticastRouting => "multicast-routing",
            Self::Bridging => "bridging",
            Self::AclPolicy => "acl-policy",
            Self::SaLookup => "sa-lookup",
        };
        write!(f, "{}({})", name, self.id())
    }
}

/// OF-DPA group kinds, stored in the top four bits of a group id.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    L2Interface = 0,
    L2Rewrite = 1,
    L3Unicast = 2,
    L2Multicast = 3,
    L2Flood = 4,
    L3Interface = 5,
    L3Multicast = 6,
    L3Ecmp = 7,
    L2Overlay = 8,
    L2Unfiltered = 11,
}

impl GroupKind {
    /// Decodes the kind of an OF-DPA group id.
    pub fn of(group_id: u32) -> Option<Self> {
        match group_id >> 28 {
            0 => Some(Self::L2Interface),
            1 => Some(Self::L2Rewrite),
            2 => Some(Self::L3Unicast),
            3 => Some(Self::L2Multicast),
            4 => Some(Self::L2Flood),
            5 => Some(Self::L3Interface),
            6 => Some(Self::L3Multicast),
            7 => Some(Self::L3Ecmp),
            8 => Some(Self::L2Overlay),
            11 => Some(Self::L2Unfiltered),
            _ => None,
        }
    }
}

/// OFPVID_PRESENT: set in a VLAN_VID match/set-field when a tag is present.
pub const OFPVID_PRESENT: u16 = basebox_types::VlanId::TAG_PRESENT;

/// Mask covering the VLAN id plus the present bit.
pub const VID_MASK: u16 = 0x1fff;

/// L2 interface group: `(vid << 16) | port`.
pub const fn l2_interface_group_id(vid: u16, port_no: u32) -> u32 {
    (((vid & 0x0fff) as u32) << 16) | (port_no & 0xffff)
}

/// L2 unfiltered interface group: `(11 << 28) | port`.
pub const fn l2_unfiltered_interface_group_id(port_no: u32) -> u32 {
    ((GroupKind::L2Unfiltered as u32) << 28) | (port_no & 0xffff)
}

/// Experimenter id carried by the BISDN flow-state query messages.
pub const BISDN_EXPERIMENTER_ID: u32 = 0xFF00_00B0;

/// Experimenter message types under [`BISDN_EXPERIMENTER_ID`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BisdnExperimenter {
    /// The datapath asks the controller for its full flow state.
    QueryFlowEntries = 0,
    /// Controller acknowledgement, followed by the full state.
    ReceivedFlowEntriesQuery = 1,
}

impl BisdnExperimenter {
    pub fn from_type(exp_type: u32) -> Option<Self> {
        match exp_type {
            0 => Some(Self::QueryFlowEntries),
            1 => Some(Self::ReceivedFlowEntriesQuery),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_table_ids_round_trip() {
        for table in [
            OfdpaTable::Vlan,
            OfdpaTable::Bridging,
            OfdpaTable::AclPolicy,
            OfdpaTable::SaLookup,
        ] {
            assert_eq!(OfdpaTable::from_id(table.id()), Some(table));
        }
        assert_eq!(OfdpaTable::from_id(99), None);
    }

    #[test]
    fn test_group_id_encoding() {
        assert_eq!(l2_interface_group_id(100, 3), 0x0064_0003);
        assert_eq!(GroupKind::of(l2_interface_group_id(100, 3)), Some(GroupKind::L2Interface));
        assert_eq!(l2_unfiltered_interface_group_id(3), 0xb000_0003);
        assert_eq!(
            GroupKind::of(l2_unfiltered_interface_group_id(3)),
            Some(GroupKind::L2Unfiltered)
        );
    }

    #[test]
    fn test_bisdn_types() {
        assert_eq!(
            BisdnExperimenter::from_type(0),
            Some(BisdnExperimenter::QueryFlowEntries)
        );
        assert_eq!(BisdnExperimenter::ReceivedFlowEntriesQuery as u32, 1);
        assert_eq!(BisdnExperimenter::from_type(7), None);
    }
}
