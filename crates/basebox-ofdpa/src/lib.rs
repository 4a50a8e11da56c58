//! OpenFlow 1.3 message subset and OF-DPA pipeline helpers.
//!
//! Only the messages baseboxd actually exchanges with an OF-DPA datapath are
//! modelled: the hello/echo/features/port-description handshake, flow and
//! group programming, packet-in/out, flow-removed, port-status, error and
//! experimenter messages.
//!
//! # Architecture
//!
//! - [`message`]: owned message model ([`OfMessage`], [`FlowMod`], ...)
//! - [`oxm`]: match fields, actions and instructions
//! - [`ofdpa`]: OF-DPA table ids, group id encoding, BISDN experimenter ids
//! - [`codec`]: `tokio_util` framing codec for a TCP connection
//! - [`channel`]: the outbound [`DatapathChannel`] seam
//!
//! # Example
//!
//! ```
//! use basebox_ofdpa::{FlowMod, FlowModCommand, Instruction, Match, OfdpaTable, OxmField};
//!
//! let flow = FlowMod::new(OfdpaTable::AclPolicy, FlowModCommand::Add, 0xfff0)
//!     .with_match(Match::new().with(OxmField::EthType(0x0806)))
//!     .with_instruction(Instruction::GotoTable(OfdpaTable::AclPolicy.id()));
//! assert_eq!(flow.table_id, 60);
//! ```

pub mod channel;
pub mod codec;
pub mod error;
pub mod message;
pub mod ofdpa;
pub mod oxm;

pub use channel::{ChannelError, DatapathChannel, QueuedChannel};
pub use codec::{OfCodec, OfFrame};
pub use error::{CodecError, CodecResult};
pub use message::{
    Bucket, ErrorMsg, ExperimenterMsg, FeaturesReply, FlowMod, FlowModCommand, FlowRemoved,
    GroupMod, GroupModCommand, GroupType, OfMessage, PacketIn, PacketOut, PortDesc,
    PortReason, PortStatus,
};
pub use ofdpa::{BisdnExperimenter, GroupKind, OfdpaTable, BISDN_EXPERIMENTER_ID};
pub use oxm::{Action, Instruction, Match, OxmField};

/// OpenFlow protocol version implemented here (1.3).
pub const OFP_VERSION: u8 = 0x04;

/// Default TCP port a datapath connects to.
pub const OFP_TCP_PORT: u16 = 6653;

/// Reserved port: send to controller.
pub const OFPP_CONTROLLER: u32 = 0xffff_fffd;

/// Reserved port: wildcard.
pub const OFPP_ANY: u32 = 0xffff_ffff;

/// Wildcard group.
pub const OFPG_ANY: u32 = 0xffff_ffff;

/// Packet is not buffered on the datapath.
pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;

/// Send the complete packet to the controller.
pub const OFPCML_NO_BUFFER: u16 = 0xffff;

/// Flow-mod flag requesting a flow-removed message on expiry/removal.
pub const OFPFF_SEND_FLOW_REM: u16 = 1 << 0;
