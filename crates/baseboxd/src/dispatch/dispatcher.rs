//! Packet path between the datapath and the tap devices.

use std::sync::{Arc, Weak};

use basebox_ofdpa::{
    Action, FlowRemoved, OfMessage, OfdpaTable, PacketIn, PacketOut, OFPP_CONTROLLER,
    OFP_NO_BUFFER,
};
use basebox_types::{MacAddress, SwitchPortNo};
use bytes::Bytes;
use tracing::{debug, instrument, trace};

use super::pool::PacketPool;
use crate::error::{BaseboxError, Result};
use crate::flow::FlowTableProgrammer;
use crate::ports::{FrameHandler, PortIdentityMap, PortKey, TapDevice, TapManager};
use crate::session::SwitchConnection;

#[cfg(feature = "mac-learning")]
use crate::netlink::KernelWriter;

const ETH_HLEN: usize = 14;

fn eth_dst(frame: &[u8]) -> Option<MacAddress> {
    MacAddress::from_slice(frame)
}

#[cfg(feature = "mac-learning")]
fn eth_src(frame: &[u8]) -> Option<MacAddress> {
    MacAddress::from_slice(frame.get(6..)?)
}

/// Routes packet-ins to the table specific handler and tap frames to the
/// datapath.
pub struct PacketDispatcher {
    connection: Arc<SwitchConnection>,
    ports: Arc<PortIdentityMap>,
    taps: Arc<dyn TapManager>,
    programmer: Arc<FlowTableProgrammer>,
    pool: PacketPool,
    #[cfg(feature = "mac-learning")]
    kernel: Arc<dyn KernelWriter>,
}

impl PacketDispatcher {
    pub fn new(
        connection: Arc<SwitchConnection>,
        ports: Arc<PortIdentityMap>,
        taps: Arc<dyn TapManager>,
        programmer: Arc<FlowTableProgrammer>,
        pool: PacketPool,
        #[cfg(feature = "mac-learning")] kernel: Arc<dyn KernelWriter>,
    ) -> Self {
        Self {
            connection,
            ports,
            taps,
            programmer,
            pool,
            #[cfg(feature = "mac-learning")]
            kernel,
        }
    }

    /// Receive path for every tap device. The tap manager stores the handler,
    /// so it only keeps a weak reference back.
    pub fn frame_handler(self: &Arc<Self>) -> FrameHandler {
        let dispatcher: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |tap: &dyn TapDevice, frame: &[u8]| {
            if let Some(dispatcher) = dispatcher.upgrade() {
                if let Err(e) = dispatcher.enqueue(tap, frame) {
                    e.log("tap enqueue");
                }
            }
        })
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    #[instrument(skip(self, packet_in), fields(table = packet_in.table_id, len = packet_in.data.len()))]
    pub fn handle_packet_in(&self, packet_in: &PacketIn) -> Result<()> {
        match OfdpaTable::from_id(packet_in.table_id) {
            Some(OfdpaTable::AclPolicy) => self.deliver_to_tap(packet_in),
            Some(OfdpaTable::SaLookup) => self.learn(packet_in),
            _ => {
                debug!("packet-in from unhandled table dropped");
                Ok(())
            }
        }
    }

    fn deliver_to_tap(&self, packet_in: &PacketIn) -> Result<()> {
        let port_no = packet_in
            .in_port()
            .ok_or_else(|| BaseboxError::InvalidArgument("packet-in without in_port".to_string()))?;
        let dst = eth_dst(&packet_in.data).ok_or_else(|| {
            BaseboxError::InvalidArgument(format!("runt frame of {} bytes", packet_in.data.len()))
        })?;
        if dst.is_ipv6_multicast() {
            trace!(%dst, "ipv6 multicast packet-in dropped");
            return Ok(());
        }

        let devname = match self.ports.resolve(PortKey::SwitchPort(SwitchPortNo::new(port_no))) {
            Ok(mapping) => mapping.devname,
            Err(_) => {
                debug!(port_no, "packet-in on unmapped port dropped");
                return Ok(());
            }
        };
        let Some(tap) = self.taps.get(&devname) else {
            debug!(port_no, tap = %devname, "no tap bound, packet-in dropped");
            return Ok(());
        };

        trace!(port_no, tap = %devname, "packet-in delivered");
        tap.enqueue(&packet_in.data)
    }

    #[cfg(not(feature = "mac-learning"))]
    fn learn(&self, packet_in: &PacketIn) -> Result<()> {
        debug!(
            in_port = packet_in.in_port(),
            "source mac learning not built in, packet-in dropped"
        );
        Ok(())
    }

    /// Installs the kernel FDB entry and the bridging entry for an unknown
    /// source address.
    #[cfg(feature = "mac-learning")]
    fn learn(&self, packet_in: &PacketIn) -> Result<()> {
        use basebox_types::VlanId;

        let port_no = packet_in
            .in_port()
            .ok_or_else(|| BaseboxError::InvalidArgument("packet-in without in_port".to_string()))?;
        let src = eth_src(&packet_in.data).ok_or_else(|| {
            BaseboxError::InvalidArgument(format!("runt frame of {} bytes", packet_in.data.len()))
        })?;
        if !src.is_unicast() || src.is_zero() {
            trace!(%src, "not learning non-unicast source");
            return Ok(());
        }
        let vid = packet_in
            .match_fields
            .vlan_vid()
            .ok_or_else(|| BaseboxError::InvalidArgument("learning packet-in without vlan".to_string()))?;
        let vid = VlanId::from_tag(vid).map_err(|e| BaseboxError::InvalidArgument(e.to_string()))?;

        let mapping = self.ports.resolve(PortKey::SwitchPort(SwitchPortNo::new(port_no)))?;
        self.kernel.fdb_add(mapping.ifindex, vid, src)?;
        self.programmer.add_bridging_unicast(mapping.id, vid, src)?;
        debug!(port_no, %vid, %src, "source address learned");
        Ok(())
    }

    /// Drops the programmer's record of a flow the datapath removed.
    #[instrument(skip(self, removed), fields(table = removed.table_id, cookie = removed.cookie))]
    pub fn handle_flow_removed(&self, removed: &FlowRemoved) -> Result<()> {
        let Some(table) = OfdpaTable::from_id(removed.table_id) else {
            debug!("flow-removed from unknown table ignored");
            return Ok(());
        };
        let forgotten =
            self.programmer
                .forget_removed_flow(table, removed.priority, &removed.match_fields)?;
        if forgotten.is_none() {
            trace!("flow-removed for an entry that was not installed");
        }

        #[cfg(feature = "mac-learning")]
        if table == OfdpaTable::Bridging {
            self.unlearn(removed)?;
        }
        Ok(())
    }

    #[cfg(feature = "mac-learning")]
    fn unlearn(&self, removed: &FlowRemoved) -> Result<()> {
        use basebox_types::VlanId;

        let port = u32::try_from(removed.cookie)
            .map_err(|_| BaseboxError::InvalidArgument(format!("cookie {:#x} is no port", removed.cookie)))?;
        let (Some(vid), Some(mac)) = (removed.match_fields.vlan_vid(), removed.match_fields.eth_dst())
        else {
            return Err(BaseboxError::InvalidArgument(
                "bridging flow-removed without vlan or eth_dst".to_string(),
            ));
        };
        let vid = VlanId::from_tag(vid).map_err(|e| BaseboxError::InvalidArgument(e.to_string()))?;

        let mapping = self.ports.resolve(PortKey::SwitchPort(SwitchPortNo::new(port)))?;
        self.kernel.fdb_del(mapping.ifindex, vid, mac)?;
        debug!(port, %vid, %mac, "learned address aged out");
        Ok(())
    }

    /// Sends a frame the kernel transmitted on `tap` out of its switch port.
    ///
    /// The packet-out owns a pool buffer until the channel has written and
    /// dropped it, so frames queued towards the datapath are bounded by the
    /// pool. An empty pool fails with [`BaseboxError::PoolExhausted`].
    pub fn enqueue(&self, tap: &dyn TapDevice, frame: &[u8]) -> Result<()> {
        if frame.len() < ETH_HLEN {
            return Err(BaseboxError::InvalidArgument(format!(
                "runt frame of {} bytes on {}",
                frame.len(),
                tap.devname()
            )));
        }
        if eth_dst(frame).is_some_and(|dst| dst.is_ipv6_multicast()) {
            return Err(BaseboxError::NotSupported("ipv6 multicast from tap"));
        }

        let channel = self.connection.channel().ok_or(BaseboxError::NotConnected)?;
        let port_no = self
            .ports
            .switch_port(PortKey::DevName(tap.devname()))
            .map_err(|_| BaseboxError::InvalidPort(format!("tap {} has no switch port", tap.devname())))?;

        let buffer = self.pool.acquire(frame)?;
        channel.send(OfMessage::PacketOut(PacketOut {
            buffer_id: OFP_NO_BUFFER,
            in_port: OFPP_CONTROLLER,
            actions: vec![Action::output(port_no.as_u32())],
            data: Bytes::from_owner(buffer),
        }))?;
        trace!(tap = tap.devname(), port = %port_no, len = frame.len(), "packet-out");
        Ok(())
    }
}
