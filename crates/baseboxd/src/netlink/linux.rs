//! Route netlink transport built on `netlink-sys` and `netlink-packet-route`.
//!
//! Kernel messages are converted into owned [`LinkState`] and
//! [`NeighborEntry`] values right after parsing; nothing downstream sees a
//! netlink type.

use std::net::IpAddr;

use async_trait::async_trait;
use basebox_types::{IpPrefix, MacAddress, VlanId};
use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP,
    NLM_F_REPLACE, NLM_F_REQUEST,
};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourMessage, NeighbourState,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tracing::{debug, instrument, trace, warn};

use super::types::{
    KernelEvent, KernelSnapshot, LinkKind, LinkState, NeighborEntry, NeighborState,
};
use super::{KernelSource, KernelWriter};
use crate::error::{BaseboxError, Result};

const RTNLGRP_LINK: u32 = 1;
const RTNLGRP_NEIGH: u32 = 3;
const RTNLGRP_IPV4_IFADDR: u32 = 5;
const RTNLGRP_IPV6_IFADDR: u32 = 9;

const RECV_BUFFER_SIZE: usize = 64 * 1024;

fn nl_err(what: &str, e: impl std::fmt::Display) -> BaseboxError {
    BaseboxError::Netlink(format!("{}: {}", what, e))
}

fn group_mask(groups: &[u32]) -> u32 {
    groups.iter().fold(0, |mask, group| mask | 1 << (group - 1))
}

/// Non-blocking route socket registered with the tokio reactor.
struct RouteSocket {
    inner: AsyncFd<Socket>,
    buffer: Vec<u8>,
    sequence: u32,
}

impl RouteSocket {
    fn open(groups: u32) -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE).map_err(|e| nl_err("socket", e))?;
        socket
            .bind(&SocketAddr::new(0, groups))
            .map_err(|e| nl_err("bind", e))?;
        socket.set_non_blocking(true).map_err(|e| nl_err("non-blocking", e))?;
        let inner = AsyncFd::new(socket).map_err(|e| nl_err("async fd", e))?;

        Ok(Self {
            inner,
            buffer: Vec::with_capacity(RECV_BUFFER_SIZE),
            sequence: 0,
        })
    }

    fn send(&mut self, flags: u16, payload: RouteNetlinkMessage) -> Result<()> {
        self.sequence = self.sequence.wrapping_add(1);
        let buf = serialize(flags, self.sequence, payload);
        self.inner
            .get_ref()
            .send_to(&buf, &SocketAddr::new(0, 0), 0)
            .map_err(|e| nl_err("send", e))?;
        Ok(())
    }

    /// Receives one datagram and parses every message in it.
    async fn recv(&mut self) -> Result<Vec<NetlinkMessage<RouteNetlinkMessage>>> {
        loop {
            let mut guard = self
                .inner
                .readable()
                .await
                .map_err(|e| nl_err("readable", e))?;

            self.buffer.clear();
            let buffer = &mut self.buffer;
            match guard.try_io(|inner| inner.get_ref().recv(buffer, 0)) {
                Ok(Ok(_)) => return parse_datagram(&self.buffer),
                Ok(Err(e)) => return Err(nl_err("recv", e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Sends a dump request and collects the replies up to NLMSG_DONE.
    async fn dump(&mut self, request: RouteNetlinkMessage) -> Result<Vec<RouteNetlinkMessage>> {
        self.send(NLM_F_REQUEST | NLM_F_DUMP, request)?;

        let mut replies = Vec::new();
        loop {
            for msg in self.recv().await? {
                match msg.payload {
                    NetlinkPayload::Done(_) => return Ok(replies),
                    NetlinkPayload::Error(err) => return Err(nl_err("dump", err)),
                    NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                    _ => {}
                }
            }
        }
    }
}

fn serialize(flags: u16, sequence: u32, payload: RouteNetlinkMessage) -> Vec<u8> {
    let mut header = NetlinkHeader::default();
    header.flags = flags;
    header.sequence_number = sequence;
    let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
    packet.finalize();

    let mut buf = vec![0u8; packet.buffer_len()];
    packet.serialize(&mut buf);
    buf
}

fn parse_datagram(buf: &[u8]) -> Result<Vec<NetlinkMessage<RouteNetlinkMessage>>> {
    let mut messages = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..])
            .map_err(|e| nl_err("parse", e))?;
        let len = msg.header.length as usize;
        if len == 0 {
            break;
        }
        offset += (len + 3) & !3;
        messages.push(msg);
    }
    Ok(messages)
}

/// [`KernelSource`] subscribed to link, address and neighbor groups, with a
/// second socket for dump requests so dumps never interleave with
/// notifications.
pub struct NetlinkSource {
    events: RouteSocket,
    requests: RouteSocket,
}

impl NetlinkSource {
    #[instrument]
    pub fn new() -> Result<Self> {
        let groups = group_mask(&[
            RTNLGRP_LINK,
            RTNLGRP_NEIGH,
            RTNLGRP_IPV4_IFADDR,
            RTNLGRP_IPV6_IFADDR,
        ]);
        let events = RouteSocket::open(groups)?;
        let requests = RouteSocket::open(0)?;
        debug!(groups = format_args!("{:#x}", groups), "netlink source bound");
        Ok(Self { events, requests })
    }
}

#[async_trait]
impl KernelSource for NetlinkSource {
    async fn next_events(&mut self) -> Result<Vec<KernelEvent>> {
        let events: Vec<KernelEvent> = self
            .events
            .recv()
            .await?
            .into_iter()
            .filter_map(|msg| match msg.payload {
                NetlinkPayload::InnerMessage(inner) => convert(inner),
                _ => None,
            })
            .collect();
        trace!(count = events.len(), "kernel events");
        Ok(events)
    }

    #[instrument(skip(self))]
    async fn dump(&mut self) -> Result<KernelSnapshot> {
        let mut snapshot = KernelSnapshot::new();

        for msg in self
            .requests
            .dump(RouteNetlinkMessage::GetLink(LinkMessage::default()))
            .await?
        {
            if let RouteNetlinkMessage::NewLink(link) = msg {
                let link = link_state(&link);
                snapshot.insert(link.ifindex, link);
            }
        }

        for msg in self
            .requests
            .dump(RouteNetlinkMessage::GetAddress(AddressMessage::default()))
            .await?
        {
            if let RouteNetlinkMessage::NewAddress(addr) = msg {
                if let Some((ifindex, prefix)) = address(&addr) {
                    if let Some(link) = snapshot.get_mut(&ifindex) {
                        link.addrs.insert(prefix);
                    }
                }
            }
        }

        let mut fdb_request = NeighbourMessage::default();
        fdb_request.header.family = AddressFamily::Bridge;
        for request in [NeighbourMessage::default(), fdb_request] {
            for msg in self
                .requests
                .dump(RouteNetlinkMessage::GetNeighbour(request))
                .await?
            {
                if let RouteNetlinkMessage::NewNeighbour(neigh) = msg {
                    let neigh = neighbor(&neigh);
                    let key = neigh.key();
                    if let (Some(link), Some(key)) = (snapshot.get_mut(&neigh.ifindex), key) {
                        link.neighbors.insert(key, neigh);
                    }
                }
            }
        }

        debug!(links = snapshot.len(), "kernel dump complete");
        Ok(snapshot)
    }
}

fn convert(msg: RouteNetlinkMessage) -> Option<KernelEvent> {
    match msg {
        RouteNetlinkMessage::NewLink(link) => Some(KernelEvent::NewLink(link_state(&link))),
        RouteNetlinkMessage::DelLink(link) => Some(KernelEvent::DelLink(link.header.index)),
        RouteNetlinkMessage::NewAddress(addr) => {
            address(&addr).map(|(ifindex, prefix)| KernelEvent::NewAddr { ifindex, prefix })
        }
        RouteNetlinkMessage::DelAddress(addr) => {
            address(&addr).map(|(ifindex, prefix)| KernelEvent::DelAddr { ifindex, prefix })
        }
        RouteNetlinkMessage::NewNeighbour(neigh) => Some(KernelEvent::NewNeigh(neighbor(&neigh))),
        RouteNetlinkMessage::DelNeighbour(neigh) => Some(KernelEvent::DelNeigh(neighbor(&neigh))),
        other => {
            trace!(?other, "ignored route message");
            None
        }
    }
}

fn link_state(msg: &LinkMessage) -> LinkState {
    let mut link = LinkState::new(msg.header.index, "");
    link.flags = msg.header.flags.bits();
    link.family = u8::from(msg.header.interface_family);
    link.arptype = u16::from(msg.header.link_layer_type);

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.devname = name.clone(),
            LinkAttribute::Mtu(mtu) => link.mtu = *mtu,
            LinkAttribute::Controller(master) => link.master = *master,
            LinkAttribute::Address(bytes) => {
                if let Some(mac) = MacAddress::from_slice(bytes) {
                    link.hwaddr = mac;
                }
            }
            LinkAttribute::Broadcast(bytes) => {
                if let Some(mac) = MacAddress::from_slice(bytes) {
                    link.broadcast = mac;
                }
            }
            LinkAttribute::LinkInfo(infos) => {
                link.kind = infos.iter().find_map(|info| match info {
                    LinkInfo::Kind(kind) => Some(link_kind(kind)),
                    _ => None,
                });
            }
            _ => {}
        }
    }
    link
}

fn link_kind(kind: &InfoKind) -> LinkKind {
    match kind {
        InfoKind::Bridge => LinkKind::Bridge,
        InfoKind::Bond => LinkKind::Bond,
        InfoKind::Tun => LinkKind::Tun,
        InfoKind::Other(name) => LinkKind::from_kind(name),
        other => LinkKind::Other(format!("{:?}", other).to_lowercase()),
    }
}

fn address(msg: &AddressMessage) -> Option<(u32, IpPrefix)> {
    // IFA_LOCAL is the interface address on point-to-point links
    let addr = msg
        .attributes
        .iter()
        .find_map(|attr| match attr {
            AddressAttribute::Local(addr) => Some(*addr),
            _ => None,
        })
        .or_else(|| {
            msg.attributes.iter().find_map(|attr| match attr {
                AddressAttribute::Address(addr) => Some(*addr),
                _ => None,
            })
        })?;

    match IpPrefix::new(addr, msg.header.prefix_len) {
        Ok(prefix) => Some((msg.header.index, prefix)),
        Err(e) => {
            warn!(ifindex = msg.header.index, error = %e, "malformed address ignored");
            None
        }
    }
}

fn neighbor(msg: &NeighbourMessage) -> NeighborEntry {
    let mut dst = None;
    let mut lladdr = None;
    let mut vlan = None;

    for attr in &msg.attributes {
        match attr {
            NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)) => {
                dst = Some(IpAddr::V4(*addr))
            }
            NeighbourAttribute::Destination(NeighbourAddress::Inet6(addr)) => {
                dst = Some(IpAddr::V6(*addr))
            }
            NeighbourAttribute::LinkLocalAddress(bytes) => lladdr = MacAddress::from_slice(bytes),
            NeighbourAttribute::Vlan(vid) => vlan = Some(*vid),
            _ => {}
        }
    }

    NeighborEntry {
        state: neighbor_state(&msg.header.state),
        flags: msg.header.flags.bits(),
        ifindex: msg.header.ifindex,
        lladdr,
        family: u8::from(msg.header.family),
        dst,
        vlan,
    }
}

fn neighbor_state(state: &NeighbourState) -> NeighborState {
    match state {
        NeighbourState::Incomplete => NeighborState::Incomplete,
        NeighbourState::Reachable => NeighborState::Reachable,
        NeighbourState::Stale => NeighborState::Stale,
        NeighbourState::Delay => NeighborState::Delay,
        NeighbourState::Probe => NeighborState::Probe,
        NeighbourState::Failed => NeighborState::Failed,
        NeighbourState::Noarp => NeighborState::NoArp,
        NeighbourState::Permanent => NeighborState::Permanent,
        _ => NeighborState::None,
    }
}

/// [`KernelWriter`] issuing acknowledged requests on a blocking socket.
pub struct NetlinkWriter {
    socket: Mutex<(Socket, u32)>,
}

impl NetlinkWriter {
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE).map_err(|e| nl_err("socket", e))?;
        socket.bind_auto().map_err(|e| nl_err("bind", e))?;
        Ok(Self {
            socket: Mutex::new((socket, 0)),
        })
    }

    fn request(&self, flags: u16, payload: RouteNetlinkMessage) -> Result<()> {
        let mut guard = self.socket.lock();
        let (socket, sequence) = &mut *guard;
        *sequence = sequence.wrapping_add(1);

        let buf = serialize(NLM_F_REQUEST | NLM_F_ACK | flags, *sequence, payload);
        socket
            .send_to(&buf, &SocketAddr::new(0, 0), 0)
            .map_err(|e| nl_err("send", e))?;

        let mut reply = Vec::with_capacity(RECV_BUFFER_SIZE);
        loop {
            reply.clear();
            socket.recv(&mut reply, 0).map_err(|e| nl_err("recv", e))?;
            for msg in parse_datagram(&reply)? {
                if msg.header.sequence_number != *sequence {
                    continue;
                }
                if let NetlinkPayload::Error(err) = msg.payload {
                    return match err.code {
                        None => Ok(()),
                        Some(code) => Err(BaseboxError::Netlink(format!(
                            "request rejected: {}",
                            std::io::Error::from_raw_os_error(-code.get())
                        ))),
                    };
                }
            }
        }
    }

    fn fdb_message(ifindex: u32, vid: VlanId, lladdr: MacAddress) -> NeighbourMessage {
        let mut msg = NeighbourMessage::default();
        msg.header.family = AddressFamily::Bridge;
        msg.header.ifindex = ifindex;
        msg.header.state = NeighbourState::Reachable;
        msg.attributes = vec![
            NeighbourAttribute::LinkLocalAddress(lladdr.as_bytes().to_vec()),
            NeighbourAttribute::Vlan(vid.as_u16()),
        ];
        msg
    }

    fn address_message(ifindex: u32, prefix: IpPrefix) -> AddressMessage {
        let mut msg = AddressMessage::default();
        msg.header.family = if prefix.is_ipv4() {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        };
        msg.header.prefix_len = prefix.prefix_len();
        msg.header.index = ifindex;
        msg.attributes = vec![
            AddressAttribute::Local(prefix.address()),
            AddressAttribute::Address(prefix.address()),
        ];
        msg
    }
}

impl KernelWriter for NetlinkWriter {
    fn fdb_add(&self, ifindex: u32, vid: VlanId, lladdr: MacAddress) -> Result<()> {
        debug!(ifindex, %vid, %lladdr, "fdb add");
        self.request(
            NLM_F_CREATE | NLM_F_REPLACE,
            RouteNetlinkMessage::NewNeighbour(Self::fdb_message(ifindex, vid, lladdr)),
        )
    }

    fn fdb_del(&self, ifindex: u32, vid: VlanId, lladdr: MacAddress) -> Result<()> {
        debug!(ifindex, %vid, %lladdr, "fdb del");
        self.request(
            0,
            RouteNetlinkMessage::DelNeighbour(Self::fdb_message(ifindex, vid, lladdr)),
        )
    }

    fn addr_add(&self, ifindex: u32, prefix: IpPrefix) -> Result<()> {
        debug!(ifindex, %prefix, "address add");
        self.request(
            NLM_F_CREATE | NLM_F_REPLACE,
            RouteNetlinkMessage::NewAddress(Self::address_message(ifindex, prefix)),
        )
    }

    fn addr_del(&self, ifindex: u32, prefix: IpPrefix) -> Result<()> {
        debug!(ifindex, %prefix, "address del");
        self.request(
            0,
            RouteNetlinkMessage::DelAddress(Self::address_message(ifindex, prefix)),
        )
    }
}
