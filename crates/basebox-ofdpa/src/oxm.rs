//! Match fields (OXM), actions and instructions.
//!
//! Field, action and instruction lists keep their insertion order: the
//! datapath applies actions in the order they are encoded, so a set-field
//! that precedes an output must stay in front of it.

use basebox_types::MacAddress;
use bytes::{Buf, BufMut, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{CodecError, CodecResult};

const OFPXMC_OPENFLOW_BASIC: u16 = 0x8000;
const OFPMT_OXM: u16 = 1;

const OXM_IN_PORT: u8 = 0;
const OXM_ETH_DST: u8 = 3;
const OXM_ETH_SRC: u8 = 4;
const OXM_ETH_TYPE: u8 = 5;
const OXM_VLAN_VID: u8 = 6;
const OXM_IP_PROTO: u8 = 10;
const OXM_IPV4_DST: u8 = 12;
const OXM_UDP_DST: u8 = 16;
const OXM_IPV6_DST: u8 = 27;

const OFPAT_OUTPUT: u16 = 0;
const OFPAT_PUSH_VLAN: u16 = 17;
const OFPAT_POP_VLAN: u16 = 18;
const OFPAT_GROUP: u16 = 22;
const OFPAT_SET_FIELD: u16 = 25;

const OFPIT_GOTO_TABLE: u16 = 1;
const OFPIT_WRITE_ACTIONS: u16 = 3;
const OFPIT_APPLY_ACTIONS: u16 = 4;
const OFPIT_CLEAR_ACTIONS: u16 = 5;

/// A single OXM match field or set-field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OxmField {
    InPort(u32),
    EthDst {
        addr: MacAddress,
        mask: Option<MacAddress>,
    },
    EthSrc {
        addr: MacAddress,
        mask: Option<MacAddress>,
    },
    EthType(u16),
    /// VLAN_VID including the OFPVID_PRESENT bit.
    VlanVid {
        vid: u16,
        mask: Option<u16>,
    },
    IpProto(u8),
    Ipv4Dst {
        addr: Ipv4Addr,
        mask: Option<Ipv4Addr>,
    },
    Ipv6Dst {
        addr: Ipv6Addr,
        mask: Option<Ipv6Addr>,
    },
    UdpDst(u16),
    /// Any OPENFLOW_BASIC field this crate does not interpret.
    Other {
        field: u8,
        has_mask: bool,
        payload: Vec<u8>,
    },
}

impl OxmField {
    pub fn eth_dst(addr: MacAddress) -> Self {
        Self::EthDst { addr, mask: None }
    }

    pub fn eth_src(addr: MacAddress) -> Self {
        Self::EthSrc { addr, mask: None }
    }

    pub fn vlan_vid(vid: u16) -> Self {
        Self::VlanVid { vid, mask: None }
    }

    pub fn ipv4_dst(addr: Ipv4Addr) -> Self {
        Self::Ipv4Dst { addr, mask: None }
    }

    pub fn ipv6_dst(addr: Ipv6Addr) -> Self {
        Self::Ipv6Dst { addr, mask: None }
    }

    fn field_code(&self) -> u8 {
        match self {
            Self::InPort(_) => OXM_IN_PORT,
            Self::EthDst { .. } => OXM_ETH_DST,
            Self::EthSrc { .. } => OXM_ETH_SRC,
            Self::EthType(_) => OXM_ETH_TYPE,
            Self::VlanVid { .. } => OXM_VLAN_VID,
            Self::IpProto(_) => OXM_IP_PROTO,
            Self::Ipv4Dst { .. } => OXM_IPV4_DST,
            Self::Ipv6Dst { .. } => OXM_IPV6_DST,
            Self::UdpDst(_) => OXM_UDP_DST,
            Self::Other { field, .. } => *field,
        }
    }

    fn has_mask(&self) -> bool {
        match self {
            Self::EthDst { mask, .. } | Self::EthSrc { mask, .. } => mask.is_some(),
            Self::VlanVid { mask, .. } => mask.is_some(),
            Self::Ipv4Dst { mask, .. } => mask.is_some(),
            Self::Ipv6Dst { mask, .. } => mask.is_some(),
            Self::Other { has_mask, .. } => *has_mask,
            _ => false,
        }
    }

    fn payload_len(&self) -> usize {
        let base = match self {
            Self::InPort(_) => 4,
            Self::EthDst { .. } | Self::EthSrc { .. } => 6,
            Self::EthType(_) | Self::VlanVid { .. } | Self::UdpDst(_) => 2,
            Self::IpProto(_) => 1,
            Self::Ipv4Dst { .. } => 4,
            Self::Ipv6Dst { .. } => 16,
            Self::Other { payload, .. } => return payload.len(),
        };
        if self.has_mask() {
            base * 2
        } else {
            base
        }
    }

    /// Encoded size including the 4 byte OXM header.
    pub fn encoded_len(&self) -> usize {
        4 + self.payload_len()
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(OFPXMC_OPENFLOW_BASIC);
        dst.put_u8((self.field_code() << 1) | u8::from(self.has_mask()));
        dst.put_u8(self.payload_len() as u8);
        match self {
            Self::InPort(port) => dst.put_u32(*port),
            Self::EthDst { addr, mask } | Self::EthSrc { addr, mask } => {
                dst.put_slice(addr.as_bytes());
                if let Some(mask) = mask {
                    dst.put_slice(mask.as_bytes());
                }
            }
            Self::EthType(eth_type) => dst.put_u16(*eth_type),
            Self::VlanVid { vid, mask } => {
                dst.put_u16(*vid);
                if let Some(mask) = mask {
                    dst.put_u16(*mask);
                }
            }
            Self::IpProto(proto) => dst.put_u8(*proto),
            Self::Ipv4Dst { addr, mask } => {
                dst.put_slice(&addr.octets());
                if let Some(mask) = mask {
                    dst.put_slice(&mask.octets());
                }
            }
            Self::Ipv6Dst { addr, mask } => {
                dst.put_slice(&addr.octets());
                if let Some(mask) = mask {
                    dst.put_slice(&mask.octets());
                }
            }
            Self::UdpDst(port) => dst.put_u16(*port),
            Self::Other { payload, .. } => dst.put_slice(payload),
        }
    }

    pub(crate) fn decode(src: &mut impl Buf) -> CodecResult<Self> {
        ensure(src, 4, "oxm header")?;
        let class = src.get_u16();
        let field_and_mask = src.get_u8();
        let len = src.get_u8() as usize;
        ensure(src, len, "oxm payload")?;

        let field = field_and_mask >> 1;
        let has_mask = field_and_mask & 1 == 1;
        let mut payload = vec![0u8; len];
        src.copy_to_slice(&mut payload);

        if class != OFPXMC_OPENFLOW_BASIC {
            return Ok(Self::Other {
                field,
                has_mask,
                payload,
            });
        }

        let mut p = payload.as_slice();
        let expect = |base: usize| -> CodecResult<()> {
            let want = if has_mask { base * 2 } else { base };
            if len == want {
                Ok(())
            } else {
                Err(CodecError::Malformed {
                    what: "oxm field",
                    detail: format!("field {} has length {}, expected {}", field, len, want),
                })
            }
        };

        let decoded = match field {
            OXM_IN_PORT => {
                expect(4)?;
                Self::InPort(p.get_u32())
            }
            OXM_ETH_DST | OXM_ETH_SRC => {
                expect(6)?;
                let addr = read_mac(&mut p);
                let mask = has_mask.then(|| read_mac(&mut p));
                if field == OXM_ETH_DST {
                    Self::EthDst { addr, mask }
                } else {
                    Self::EthSrc { addr, mask }
                }
            }
            OXM_ETH_TYPE => {
                expect(2)?;
                Self::EthType(p.get_u16())
            }
            OXM_VLAN_VID => {
                expect(2)?;
                let vid = p.get_u16();
                let mask = has_mask.then(|| p.get_u16());
                Self::VlanVid { vid, mask }
            }
            OXM_IP_PROTO => {
                expect(1)?;
                Self::IpProto(p.get_u8())
            }
            OXM_IPV4_DST => {
                expect(4)?;
                let addr = Ipv4Addr::from(p.get_u32());
                let mask = has_mask.then(|| Ipv4Addr::from(p.get_u32()));
                Self::Ipv4Dst { addr, mask }
            }
            OXM_IPV6_DST => {
                expect(16)?;
                let addr = Ipv6Addr::from(p.get_u128());
                let mask = has_mask.then(|| Ipv6Addr::from(p.get_u128()));
                Self::Ipv6Dst { addr, mask }
            }
            OXM_UDP_DST => {
                expect(2)?;
                Self::UdpDst(p.get_u16())
            }
            _ => Self::Other {
                field,
                has_mask,
                payload,
            },
        };
        Ok(decoded)
    }
}

fn read_mac(src: &mut impl Buf) -> MacAddress {
    let mut octets = [0u8; 6];
    src.copy_to_slice(&mut octets);
    MacAddress::new(octets)
}

pub(crate) fn ensure(src: &impl Buf, len: usize, what: &'static str) -> CodecResult<()> {
    if src.remaining() < len {
        Err(CodecError::Truncated(what))
    } else {
        Ok(())
    }
}

pub(crate) const fn pad8(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// An ordered list of OXM match fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Match {
    fields: Vec<OxmField>,
}

impl Match {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field, keeping insertion order.
    pub fn with(mut self, field: OxmField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(&self) -> &[OxmField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn in_port(&self) -> Option<u32> {
        self.fields.iter().find_map(|f| match f {
            OxmField::InPort(port) => Some(*port),
            _ => None,
        })
    }

    pub fn eth_dst(&self) -> Option<MacAddress> {
        self.fields.iter().find_map(|f| match f {
            OxmField::EthDst { addr, .. } => Some(*addr),
            _ => None,
        })
    }

    /// VLAN_VID value including the present bit.
    pub fn vlan_vid(&self) -> Option<u16> {
        self.fields.iter().find_map(|f| match f {
            OxmField::VlanVid { vid, .. } => Some(*vid),
            _ => None,
        })
    }

    /// Encodes `ofp_match` including trailing padding to 8 bytes.
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let len = 4 + self.fields.iter().map(OxmField::encoded_len).sum::<usize>();
        dst.put_u16(OFPMT_OXM);
        dst.put_u16(len as u16);
        for field in &self.fields {
            field.encode(dst);
        }
        dst.put_bytes(0, pad8(len));
    }

    /// Decodes `ofp_match` and consumes its padding.
    pub(crate) fn decode(src: &mut impl Buf) -> CodecResult<Self> {
        ensure(src, 4, "match header")?;
        let match_type = src.get_u16();
        let len = src.get_u16() as usize;
        if match_type != OFPMT_OXM || len < 4 {
            return Err(CodecError::Malformed {
                what: "match",
                detail: format!("type {} length {}", match_type, len),
            });
        }
        ensure(src, len - 4 + pad8(len), "match body")?;

        let mut body = src.copy_to_bytes(len - 4);
        src.advance(pad8(len));

        let mut fields = Vec::new();
        while body.has_remaining() {
            fields.push(OxmField::decode(&mut body)?);
        }
        Ok(Self { fields })
    }
}

/// Actions used in apply/write-actions instructions, packet-outs and group
/// buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Output { port: u32, max_len: u16 },
    Group(u32),
    PushVlan(u16),
    PopVlan,
    SetField(OxmField),
}

impl Action {
    /// Output to `port` without truncation.
    pub fn output(port: u32) -> Self {
        Self::Output {
            port,
            max_len: crate::OFPCML_NO_BUFFER,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Output { .. } => 16,
            Self::Group(_) | Self::PushVlan(_) | Self::PopVlan => 8,
            Self::SetField(field) => {
                let len = 4 + field.encoded_len();
                len + pad8(len)
            }
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Output { port, max_len } => {
                dst.put_u16(OFPAT_OUTPUT);
                dst.put_u16(16);
                dst.put_u32(*port);
                dst.put_u16(*max_len);
                dst.put_bytes(0, 6);
            }
            Self::Group(group_id) => {
                dst.put_u16(OFPAT_GROUP);
                dst.put_u16(8);
                dst.put_u32(*group_id);
            }
            Self::PushVlan(ethertype) => {
                dst.put_u16(OFPAT_PUSH_VLAN);
                dst.put_u16(8);
                dst.put_u16(*ethertype);
                dst.put_bytes(0, 2);
            }
            Self::PopVlan => {
                dst.put_u16(OFPAT_POP_VLAN);
                dst.put_u16(8);
                dst.put_bytes(0, 4);
            }
            Self::SetField(field) => {
                let len = self.encoded_len();
                dst.put_u16(OFPAT_SET_FIELD);
                dst.put_u16(len as u16);
                field.encode(dst);
                dst.put_bytes(0, len - 4 - field.encoded_len());
            }
        }
    }
}

pub(crate) fn encode_actions(actions: &[Action], dst: &mut BytesMut) {
    for action in actions {
        action.encode(dst);
    }
}

pub(crate) fn actions_len(actions: &[Action]) -> usize {
    actions.iter().map(Action::encoded_len).sum()
}

/// Flow-mod instructions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Instruction {
    GotoTable(u8),
    WriteActions(Vec<Action>),
    ApplyActions(Vec<Action>),
    ClearActions,
}

impl Instruction {
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::GotoTable(_) | Self::ClearActions => 8,
            Self::WriteActions(actions) | Self::ApplyActions(actions) => 8 + actions_len(actions),
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::GotoTable(table_id) => {
                dst.put_u16(OFPIT_GOTO_TABLE);
                dst.put_u16(8);
                dst.put_u8(*table_id);
                dst.put_bytes(0, 3);
            }
            Self::WriteActions(actions) | Self::ApplyActions(actions) => {
                let kind = if matches!(self, Self::WriteActions(_)) {
                    OFPIT_WRITE_ACTIONS
                } else {
                    OFPIT_APPLY_ACTIONS
                };
                dst.put_u16(kind);
                dst.put_u16(self.encoded_len() as u16);
                dst.put_bytes(0, 4);
                encode_actions(actions, dst);
            }
            Self::ClearActions => {
                dst.put_u16(OFPIT_CLEAR_ACTIONS);
                dst.put_u16(8);
                dst.put_bytes(0, 4);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_match_encoding_is_padded() {
        let m = Match::new()
            .with(OxmField::InPort(3))
            .with(OxmField::vlan_vid(0x100a));
        let mut buf = BytesMut::new();
        m.encode(&mut buf);
        // 4 header + 8 in_port + 6 vlan = 18, padded to 24
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[..4], &[0x00, 0x01, 0x00, 18]);
        assert_eq!(&buf[4..8], &[0x80, 0x00, OXM_IN_PORT << 1, 4]);
        assert_eq!(&buf[18..], &[0u8; 6]);
    }

    #[test]
    fn test_match_decode_masked_vlan() {
        let m = Match::new()
            .with(OxmField::InPort(7))
            .with(OxmField::VlanVid {
                vid: 0x1000,
                mask: Some(0x1000),
            })
            .with(OxmField::eth_dst(MacAddress::new([0, 1, 2, 3, 4, 5])));
        let mut buf = BytesMut::new();
        m.encode(&mut buf);
        let mut frozen = buf.freeze();
        let decoded = Match::decode(&mut frozen).unwrap();
        assert_eq!(decoded, m);
        assert_eq!(decoded.in_port(), Some(7));
        assert_eq!(decoded.vlan_vid(), Some(0x1000));
        assert!(!frozen.has_remaining());
    }

    #[test]
    fn test_match_decode_truncated() {
        let bytes: &[u8] = &[0x00, 0x01, 0x00, 0x0c, 0x80, 0x00];
        let mut src = bytes;
        assert!(matches!(
            Match::decode(&mut src),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn test_set_field_action_is_padded() {
        let action = Action::SetField(OxmField::eth_src(MacAddress::new([2, 0, 0, 0, 0, 1])));
        // 4 action header + 10 oxm = 14, padded to 16
        assert_eq!(action.encoded_len(), 16);
        let mut buf = BytesMut::new();
        action.encode(&mut buf);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..4], &[0x00, 25, 0x00, 16]);
    }

    #[test]
    fn test_apply_actions_preserve_order() {
        let instruction = Instruction::ApplyActions(vec![
            Action::SetField(OxmField::eth_src(MacAddress::new([2, 0, 0, 0, 0, 1]))),
            Action::SetField(OxmField::eth_dst(MacAddress::new([2, 0, 0, 0, 0, 2]))),
            Action::output(3),
        ]);
        let mut buf = BytesMut::new();
        instruction.encode(&mut buf);
        assert_eq!(buf.len(), 8 + 16 + 16 + 16);
        // first action: set-field eth_src
        assert_eq!(buf[8 + 6], OXM_ETH_SRC << 1);
        // second action: set-field eth_dst
        assert_eq!(buf[24 + 6], OXM_ETH_DST << 1);
        // third action: output
        assert_eq!(&buf[40..42], &[0x00, 0x00]);
        assert_eq!(&buf[44..48], &[0, 0, 0, 3]);
    }
}
