//! Length-delimited framing of OpenFlow messages for a `tokio_util` framed
//! TCP stream.

use basebox_types::MacAddress;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{CodecError, CodecResult};
use crate::message::{
    ErrorMsg, ExperimenterMsg, FeaturesReply, FlowRemoved, OfMessage, PacketIn, PortDesc,
    PortReason, PortStatus,
};
use crate::oxm::{actions_len, encode_actions, ensure, Match};
use crate::OFP_VERSION;

const OFP_HEADER_LEN: usize = 8;
const OFP_PORT_LEN: usize = 64;
const OFP_MAX_PORT_NAME_LEN: usize = 16;

const OFPT_HELLO: u8 = 0;
const OFPT_ERROR: u8 = 1;
const OFPT_ECHO_REQUEST: u8 = 2;
const OFPT_ECHO_REPLY: u8 = 3;
const OFPT_EXPERIMENTER: u8 = 4;
const OFPT_FEATURES_REQUEST: u8 = 5;
const OFPT_FEATURES_REPLY: u8 = 6;
const OFPT_PACKET_IN: u8 = 10;
const OFPT_FLOW_REMOVED: u8 = 11;
const OFPT_PORT_STATUS: u8 = 12;
const OFPT_PACKET_OUT: u8 = 13;
const OFPT_FLOW_MOD: u8 = 14;
const OFPT_GROUP_MOD: u8 = 15;
const OFPT_MULTIPART_REQUEST: u8 = 18;
const OFPT_MULTIPART_REPLY: u8 = 19;
const OFPT_BARRIER_REQUEST: u8 = 20;
const OFPT_BARRIER_REPLY: u8 = 21;

const OFPMP_PORT_DESC: u16 = 13;
const OFPMPF_REPLY_MORE: u16 = 1;

/// A message together with its transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfFrame {
    pub xid: u32,
    pub message: OfMessage,
}

impl OfFrame {
    pub fn new(xid: u32, message: OfMessage) -> Self {
        Self { xid, message }
    }
}

/// OpenFlow 1.3 codec. Inbound hello messages of any version are accepted so
/// the version check can happen at the session layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfCodec;

impl OfCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for OfCodec {
    type Item = OfFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> CodecResult<Option<OfFrame>> {
        if src.len() < OFP_HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[2], src[3]]) as usize;
        if length < OFP_HEADER_LEN {
            return Err(CodecError::BadLength(length));
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length).freeze();
        let version = frame.get_u8();
        let msg_type = frame.get_u8();
        let _length = frame.get_u16();
        let xid = frame.get_u32();

        if version != OFP_VERSION && msg_type != OFPT_HELLO {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let message = decode_body(msg_type, frame)?;
        trace!(xid, message = message.name(), "decoded OpenFlow message");
        Ok(Some(OfFrame { xid, message }))
    }
}

impl Encoder<OfFrame> for OfCodec {
    type Error = CodecError;

    fn encode(&mut self, item: OfFrame, dst: &mut BytesMut) -> CodecResult<()> {
        encode_frame(&item, dst)
    }
}

/// Encodes one frame into `dst`.
pub fn encode_frame(frame: &OfFrame, dst: &mut BytesMut) -> CodecResult<()> {
    let start = dst.len();
    dst.put_u8(OFP_VERSION);
    dst.put_u8(0);
    dst.put_u16(0);
    dst.put_u32(frame.xid);

    let msg_type = match &frame.message {
        OfMessage::Hello => OFPT_HELLO,
        OfMessage::FeaturesRequest => OFPT_FEATURES_REQUEST,
        OfMessage::BarrierRequest => OFPT_BARRIER_REQUEST,
        OfMessage::EchoRequest(data) => {
            dst.put_slice(data);
            OFPT_ECHO_REQUEST
        }
        OfMessage::EchoReply(data) => {
            dst.put_slice(data);
            OFPT_ECHO_REPLY
        }
        OfMessage::Experimenter(exp) => {
            dst.put_u32(exp.experimenter);
            dst.put_u32(exp.exp_type);
            dst.put_slice(&exp.data);
            OFPT_EXPERIMENTER
        }
        OfMessage::PortDescRequest => {
            dst.put_u16(OFPMP_PORT_DESC);
            dst.put_u16(0);
            dst.put_bytes(0, 4);
            OFPT_MULTIPART_REQUEST
        }
        OfMessage::PacketOut(out) => {
            dst.put_u32(out.buffer_id);
            dst.put_u32(out.in_port);
            dst.put_u16(actions_len(&out.actions) as u16);
            dst.put_bytes(0, 6);
            encode_actions(&out.actions, dst);
            dst.put_slice(&out.data);
            OFPT_PACKET_OUT
        }
        OfMessage::FlowMod(flow) => {
            dst.put_u64(flow.cookie);
            dst.put_u64(flow.cookie_mask);
            dst.put_u8(flow.table_id);
            dst.put_u8(flow.command as u8);
            dst.put_u16(flow.idle_timeout);
            dst.put_u16(flow.hard_timeout);
            dst.put_u16(flow.priority);
            dst.put_u32(flow.buffer_id);
            dst.put_u32(flow.out_port);
            dst.put_u32(flow.out_group);
            dst.put_u16(flow.flags);
            dst.put_bytes(0, 2);
            flow.match_fields.encode(dst);
            for instruction in &flow.instructions {
                instruction.encode(dst);
            }
            OFPT_FLOW_MOD
        }
        OfMessage::GroupMod(group) => {
            dst.put_u16(group.command as u16);
            dst.put_u8(group.group_type as u8);
            dst.put_u8(0);
            dst.put_u32(group.group_id);
            for bucket in &group.buckets {
                dst.put_u16((16 + actions_len(&bucket.actions)) as u16);
                dst.put_u16(bucket.weight);
                dst.put_u32(bucket.watch_port);
                dst.put_u32(bucket.watch_group);
                dst.put_bytes(0, 4);
                encode_actions(&bucket.actions, dst);
            }
            OFPT_GROUP_MOD
        }
        other => {
            dst.truncate(start);
            return Err(CodecError::NotEncodable(other.name()));
        }
    };

    let length = dst.len() - start;
    if length > u16::MAX as usize {
        dst.truncate(start);
        return Err(CodecError::TooLarge(length));
    }
    dst[start + 1] = msg_type;
    dst[start + 2..start + 4].copy_from_slice(&(length as u16).to_be_bytes());
    Ok(())
}

fn decode_body(msg_type: u8, mut body: Bytes) -> CodecResult<OfMessage> {
    let message = match msg_type {
        // hello elements are not needed for a 1.3-only controller
        OFPT_HELLO => OfMessage::Hello,
        OFPT_ERROR => {
            ensure(&body, 4, "error")?;
            OfMessage::Error(ErrorMsg {
                err_type: body.get_u16(),
                code: body.get_u16(),
                data: body.to_vec(),
            })
        }
        OFPT_ECHO_REQUEST => OfMessage::EchoRequest(body.to_vec()),
        OFPT_ECHO_REPLY => OfMessage::EchoReply(body.to_vec()),
        OFPT_EXPERIMENTER => {
            ensure(&body, 8, "experimenter")?;
            OfMessage::Experimenter(ExperimenterMsg {
                experimenter: body.get_u32(),
                exp_type: body.get_u32(),
                data: body.to_vec(),
            })
        }
        OFPT_FEATURES_REPLY => {
            ensure(&body, 24, "features reply")?;
            let datapath_id = body.get_u64();
            let n_buffers = body.get_u32();
            let n_tables = body.get_u8();
            let auxiliary_id = body.get_u8();
            body.advance(2);
            let capabilities = body.get_u32();
            OfMessage::FeaturesReply(FeaturesReply {
                datapath_id,
                n_buffers,
                n_tables,
                auxiliary_id,
                capabilities,
            })
        }
        OFPT_PACKET_IN => {
            ensure(&body, 16, "packet-in")?;
            let buffer_id = body.get_u32();
            let total_len = body.get_u16();
            let reason = body.get_u8();
            let table_id = body.get_u8();
            let cookie = body.get_u64();
            let match_fields = Match::decode(&mut body)?;
            ensure(&body, 2, "packet-in padding")?;
            body.advance(2);
            OfMessage::PacketIn(PacketIn {
                buffer_id,
                total_len,
                reason,
                table_id,
                cookie,
                match_fields,
                data: body.to_vec(),
            })
        }
        OFPT_FLOW_REMOVED => {
            ensure(&body, 40, "flow-removed")?;
            let cookie = body.get_u64();
            let priority = body.get_u16();
            let reason = body.get_u8();
            let table_id = body.get_u8();
            let duration_sec = body.get_u32();
            let duration_nsec = body.get_u32();
            let idle_timeout = body.get_u16();
            let hard_timeout = body.get_u16();
            let packet_count = body.get_u64();
            let byte_count = body.get_u64();
            let match_fields = Match::decode(&mut body)?;
            OfMessage::FlowRemoved(FlowRemoved {
                cookie,
                priority,
                reason,
                table_id,
                duration_sec,
                duration_nsec,
                idle_timeout,
                hard_timeout,
                packet_count,
                byte_count,
                match_fields,
            })
        }
        OFPT_PORT_STATUS => {
            ensure(&body, 8 + OFP_PORT_LEN, "port-status")?;
            let reason = match body.get_u8() {
                0 => PortReason::Add,
                1 => PortReason::Delete,
                2 => PortReason::Modify,
                other => {
                    return Err(CodecError::Malformed {
                        what: "port-status",
                        detail: format!("unknown reason {}", other),
                    })
                }
            };
            body.advance(7);
            OfMessage::PortStatus(PortStatus {
                reason,
                desc: decode_port(&mut body)?,
            })
        }
        OFPT_MULTIPART_REPLY => {
            ensure(&body, 8, "multipart reply")?;
            let mp_type = body.get_u16();
            let flags = body.get_u16();
            body.advance(4);
            if mp_type != OFPMP_PORT_DESC {
                return Ok(OfMessage::Unknown {
                    msg_type,
                    body: body.to_vec(),
                });
            }
            let mut ports = Vec::with_capacity(body.remaining() / OFP_PORT_LEN);
            while body.has_remaining() {
                ports.push(decode_port(&mut body)?);
            }
            OfMessage::PortDescReply {
                ports,
                more: flags & OFPMPF_REPLY_MORE != 0,
            }
        }
        OFPT_BARRIER_REPLY => OfMessage::BarrierReply,
        _ => OfMessage::Unknown {
            msg_type,
            body: body.to_vec(),
        },
    };
    Ok(message)
}

fn decode_port(src: &mut Bytes) -> CodecResult<PortDesc> {
    ensure(&*src, OFP_PORT_LEN, "port description")?;
    let port_no = src.get_u32();
    src.advance(4);
    let mut hw_addr = [0u8; 6];
    src.copy_to_slice(&mut hw_addr);
    src.advance(2);
    let mut raw_name = [0u8; OFP_MAX_PORT_NAME_LEN];
    src.copy_to_slice(&mut raw_name);
    let name_len = raw_name
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(OFP_MAX_PORT_NAME_LEN);
    let name = String::from_utf8_lossy(&raw_name[..name_len]).into_owned();

    Ok(PortDesc {
        port_no,
        hw_addr: MacAddress::new(hw_addr),
        name,
        config: src.get_u32(),
        state: src.get_u32(),
        curr: src.get_u32(),
        advertised: src.get_u32(),
        supported: src.get_u32(),
        peer: src.get_u32(),
        curr_speed: src.get_u32(),
        max_speed: src.get_u32(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FlowMod, FlowModCommand, PacketOut};
    use crate::ofdpa::OfdpaTable;
    use crate::oxm::{Action, Instruction, OxmField};
    use crate::{OFPFF_SEND_FLOW_REM, OFPP_CONTROLLER, OFP_NO_BUFFER};
    use pretty_assertions::assert_eq;

    fn header(msg_type: u8, body_len: usize, xid: u32) -> Vec<u8> {
        let mut raw = vec![OFP_VERSION, msg_type];
        raw.extend_from_slice(&((OFP_HEADER_LEN + body_len) as u16).to_be_bytes());
        raw.extend_from_slice(&xid.to_be_bytes());
        raw
    }

    fn port_bytes(port_no: u32, name: &str) -> Vec<u8> {
        let mut raw = Vec::with_capacity(OFP_PORT_LEN);
        raw.extend_from_slice(&port_no.to_be_bytes());
        raw.extend_from_slice(&[0; 4]);
        raw.extend_from_slice(&[0x02, 0, 0, 0, 0, port_no as u8]);
        raw.extend_from_slice(&[0; 2]);
        let mut name_buf = [0u8; OFP_MAX_PORT_NAME_LEN];
        name_buf[..name.len()].copy_from_slice(name.as_bytes());
        raw.extend_from_slice(&name_buf);
        raw.extend_from_slice(&[0; 32]);
        raw
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = OfCodec::new();
        let mut raw = header(OFPT_ECHO_REQUEST, 4, 9);
        raw.extend_from_slice(b"ping");

        let mut buf = BytesMut::from(&raw[..10]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&raw[10..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.xid, 9);
        assert_eq!(frame.message, OfMessage::EchoRequest(b"ping".to_vec()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_other_versions() {
        let mut codec = OfCodec::new();
        let mut raw = header(OFPT_ECHO_REQUEST, 0, 1);
        raw[0] = 0x01;
        let mut buf = BytesMut::from(&raw[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::UnsupportedVersion(0x01))
        ));

        let mut hello = header(OFPT_HELLO, 0, 1);
        hello[0] = 0x05;
        let mut buf = BytesMut::from(&hello[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().message, OfMessage::Hello);
    }

    #[test]
    fn test_decode_port_desc_reply() {
        let mut body = vec![0x00, 13, 0x00, 0x00, 0, 0, 0, 0];
        body.extend(port_bytes(1, "port1"));
        body.extend(port_bytes(2, "port2"));
        let mut raw = header(OFPT_MULTIPART_REPLY, body.len(), 3);
        raw.extend(body);

        let mut buf = BytesMut::from(&raw[..]);
        let frame = OfCodec::new().decode(&mut buf).unwrap().unwrap();
        match frame.message {
            OfMessage::PortDescReply { ports, more } => {
                assert!(!more);
                assert_eq!(ports.len(), 2);
                assert_eq!(ports[0].name, "port1");
                assert_eq!(ports[1].port_no, 2);
                assert_eq!(ports[1].hw_addr, MacAddress::new([0x02, 0, 0, 0, 0, 2]));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_decode_packet_in() {
        let mut body = Vec::new();
        body.extend_from_slice(&OFP_NO_BUFFER.to_be_bytes());
        body.extend_from_slice(&64u16.to_be_bytes());
        body.push(1); // reason: action
        body.push(OfdpaTable::AclPolicy.id());
        body.extend_from_slice(&0u64.to_be_bytes());
        // match: in_port 3, 12 bytes padded to 16
        body.extend_from_slice(&[0x00, 0x01, 0x00, 0x0c, 0x80, 0x00, 0x00, 0x04]);
        body.extend_from_slice(&3u32.to_be_bytes());
        body.extend_from_slice(&[0; 4]);
        body.extend_from_slice(&[0; 2]);
        body.extend_from_slice(&[0xaa; 14]);
        let mut raw = header(OFPT_PACKET_IN, body.len(), 11);
        raw.extend(body);

        let mut buf = BytesMut::from(&raw[..]);
        let frame = OfCodec::new().decode(&mut buf).unwrap().unwrap();
        match frame.message {
            OfMessage::PacketIn(pin) => {
                assert_eq!(pin.table_id, 60);
                assert_eq!(pin.in_port(), Some(3));
                assert_eq!(pin.data, vec![0xaa; 14]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_decode_port_status() {
        let mut body = vec![1, 0, 0, 0, 0, 0, 0, 0];
        body.extend(port_bytes(5, "port5"));
        let mut raw = header(OFPT_PORT_STATUS, body.len(), 0);
        raw.extend(body);

        let mut buf = BytesMut::from(&raw[..]);
        let frame = OfCodec::new().decode(&mut buf).unwrap().unwrap();
        match frame.message {
            OfMessage::PortStatus(status) => {
                assert_eq!(status.reason, PortReason::Delete);
                assert_eq!(status.desc.name, "port5");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_encode_flow_mod_layout() {
        let flow = FlowMod::new(OfdpaTable::AclPolicy, FlowModCommand::Add, 0xfff0)
            .with_flags(OFPFF_SEND_FLOW_REM)
            .with_match(Match::new().with(OxmField::EthType(0x0806)))
            .with_instruction(Instruction::ApplyActions(vec![Action::output(OFPP_CONTROLLER)]));
        let mut buf = BytesMut::new();
        encode_frame(&OfFrame::new(42, OfMessage::FlowMod(flow)), &mut buf).unwrap();

        // header 8 + fixed 40 + match 16 + instruction 24
        assert_eq!(buf.len(), 88);
        assert_eq!(&buf[..4], &[OFP_VERSION, OFPT_FLOW_MOD, 0, 88]);
        assert_eq!(&buf[4..8], &42u32.to_be_bytes());
        assert_eq!(buf[24], 60);
        assert_eq!(buf[25], FlowModCommand::Add as u8);
        assert_eq!(&buf[30..32], &0xfff0u16.to_be_bytes());
        assert_eq!(&buf[44..46], &OFPFF_SEND_FLOW_REM.to_be_bytes());
    }

    #[test]
    fn test_encode_packet_out_carries_payload() {
        let out = PacketOut {
            buffer_id: OFP_NO_BUFFER,
            in_port: OFPP_CONTROLLER,
            actions: vec![Action::output(3)],
            data: Bytes::from(vec![0x55; 20]),
        };
        let mut buf = BytesMut::new();
        OfCodec::new()
            .encode(OfFrame::new(1, OfMessage::PacketOut(out)), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), 8 + 16 + 16 + 20);
        assert_eq!(&buf[16..18], &16u16.to_be_bytes());
        assert_eq!(&buf[40..], &[0x55; 20][..]);
    }

    #[test]
    fn test_inbound_only_messages_are_not_encodable() {
        let mut buf = BytesMut::new();
        let result = encode_frame(&OfFrame::new(1, OfMessage::BarrierReply), &mut buf);
        assert!(matches!(result, Err(CodecError::NotEncodable("barrier-reply"))));
        assert!(buf.is_empty());
    }
}
