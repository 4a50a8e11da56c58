//! Owned OpenFlow 1.3 message model.

use basebox_types::MacAddress;
use bytes::Bytes;

use crate::ofdpa::OfdpaTable;
use crate::oxm::{Action, Instruction, Match};
use crate::{OFPG_ANY, OFPP_ANY, OFP_NO_BUFFER};

/// Flow-mod commands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowModCommand {
    Add = 0,
    Modify = 1,
    ModifyStrict = 2,
    Delete = 3,
    DeleteStrict = 4,
}

/// A flow-table modification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowMod {
    pub cookie: u64,
    pub cookie_mask: u64,
    pub table_id: u8,
    pub command: FlowModCommand,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub out_port: u32,
    pub out_group: u32,
    pub flags: u16,
    pub match_fields: Match,
    pub instructions: Vec<Instruction>,
}

impl FlowMod {
    pub fn new(table: OfdpaTable, command: FlowModCommand, priority: u16) -> Self {
        Self {
            cookie: 0,
            cookie_mask: 0,
            table_id: table.id(),
            command,
            idle_timeout: 0,
            hard_timeout: 0,
            priority,
            buffer_id: OFP_NO_BUFFER,
            out_port: OFPP_ANY,
            out_group: OFPG_ANY,
            flags: 0,
            match_fields: Match::new(),
            instructions: Vec::new(),
        }
    }

    pub fn with_match(mut self, match_fields: Match) -> Self {
        self.match_fields = match_fields;
        self
    }

    pub fn with_instruction(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }
}

/// Group-mod commands.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupModCommand {
    Add = 0,
    Modify = 1,
    Delete = 2,
}

/// OpenFlow group types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupType {
    All = 0,
    Select = 1,
    Indirect = 2,
    FastFailover = 3,
}

/// A group bucket; actions are applied in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bucket {
    pub weight: u16,
    pub watch_port: u32,
    pub watch_group: u32,
    pub actions: Vec<Action>,
}

impl Bucket {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            weight: 0,
            watch_port: OFPP_ANY,
            watch_group: OFPG_ANY,
            actions,
        }
    }
}

/// A group-table modification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupMod {
    pub command: GroupModCommand,
    pub group_type: GroupType,
    pub group_id: u32,
    pub buckets: Vec<Bucket>,
}

/// A port as described by the datapath (`ofp_port`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDesc {
    pub port_no: u32,
    pub hw_addr: MacAddress,
    pub name: String,
    pub config: u32,
    pub state: u32,
    pub curr: u32,
    pub advertised: u32,
    pub supported: u32,
    pub peer: u32,
    pub curr_speed: u32,
    pub max_speed: u32,
}

impl PortDesc {
    /// Minimal description, as used by tests and port-status handling.
    pub fn new(port_no: u32, name: impl Into<String>, hw_addr: MacAddress) -> Self {
        Self {
            port_no,
            hw_addr,
            name: name.into(),
            config: 0,
            state: 0,
            curr: 0,
            advertised: 0,
            supported: 0,
            peer: 0,
            curr_speed: 0,
            max_speed: 0,
        }
    }

    /// OFPPS_LINK_DOWN is clear.
    pub fn is_link_up(&self) -> bool {
        self.state & 0x1 == 0
    }
}

/// Reason carried by a port-status message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortReason {
    Add = 0,
    Delete = 1,
    Modify = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PortDesc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeaturesReply {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub auxiliary_id: u8,
    pub capabilities: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    pub buffer_id: u32,
    pub total_len: u16,
    pub reason: u8,
    pub table_id: u8,
    pub cookie: u64,
    pub match_fields: Match,
    pub data: Vec<u8>,
}

impl PacketIn {
    pub fn in_port(&self) -> Option<u32> {
        self.match_fields.in_port()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    pub buffer_id: u32,
    pub in_port: u32,
    pub actions: Vec<Action>,
    /// The frame; may own a pooled buffer that is released once the
    /// message has been written and dropped.
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRemoved {
    pub cookie: u64,
    pub priority: u16,
    pub reason: u8,
    pub table_id: u8,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub packet_count: u64,
    pub byte_count: u64,
    pub match_fields: Match,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    pub err_type: u16,
    pub code: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimenterMsg {
    pub experimenter: u32,
    pub exp_type: u32,
    pub data: Vec<u8>,
}

/// Every message baseboxd sends or understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfMessage {
    Hello,
    Error(ErrorMsg),
    EchoRequest(Vec<u8>),
    EchoReply(Vec<u8>),
    Experimenter(ExperimenterMsg),
    FeaturesRequest,
    FeaturesReply(FeaturesReply),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    PortStatus(PortStatus),
    PacketOut(PacketOut),
    FlowMod(FlowMod),
    GroupMod(GroupMod),
    /// Multipart port-description request.
    PortDescRequest,
    /// Multipart port-description reply; `more` is set while further
    /// replies follow.
    PortDescReply { ports: Vec<PortDesc>, more: bool },
    BarrierRequest,
    BarrierReply,
    /// Anything else, kept for logging.
    Unknown { msg_type: u8, body: Vec<u8> },
}

impl OfMessage {
    /// Short name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Error(_) => "error",
            Self::EchoRequest(_) => "echo-request",
            Self::EchoReply(_) => "echo-reply",
            Self::Experimenter(_) => "experimenter",
            Self::FeaturesRequest => "features-request",
            Self::FeaturesReply(_) => "features-reply",
            Self::PacketIn(_) => "packet-in",
            Self::FlowRemoved(_) => "flow-removed",
            Self::PortStatus(_) => "port-status",
            Self::PacketOut(_) => "packet-out",
            Self::FlowMod(_) => "flow-mod",
            Self::GroupMod(_) => "group-mod",
            Self::PortDescRequest => "port-desc-request",
            Self::PortDescReply { .. } => "port-desc-reply",
            Self::BarrierRequest => "barrier-request",
            Self::BarrierReply => "barrier-reply",
            Self::Unknown { .. } => "unknown",
        }
    }
}
