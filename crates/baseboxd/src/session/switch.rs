//! Attach/detach state machine of one datapath connection.
//!
//! ```text
//!  connect -> hello + features-request
//!  features-reply -> port-desc-request
//!  port-desc-reply (last part) -> ATTACHED: ports bound, taps created,
//!                                 defaults and kernel state programmed
//!  connection lost -> DETACHED: installed set forgotten, nothing sent
//! ```

use std::sync::Arc;

use basebox_ofdpa::{
    BisdnExperimenter, DatapathChannel, ExperimenterMsg, OfFrame, OfMessage, PortDesc,
    PortReason, PortStatus, BISDN_EXPERIMENTER_ID,
};
use basebox_types::{LogicalPortId, SwitchPortNo};
use tracing::{debug, info, instrument, trace, warn};

use crate::context::BaseboxContext;
use crate::error::{BaseboxError, Result};
use crate::flow::PolicyTrap;
use crate::ports::{PortKey, PortMapping};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the features reply.
    Features,
    /// Collecting port descriptions.
    PortDesc { dpid: u64, ports: Vec<PortDesc> },
    Attached { dpid: u64 },
    Closed,
}

pub struct SwitchSession {
    ctx: Arc<BaseboxContext>,
    channel: Arc<dyn DatapathChannel>,
    phase: SessionPhase,
}

impl SwitchSession {
    pub fn new(ctx: Arc<BaseboxContext>, channel: Arc<dyn DatapathChannel>) -> Self {
        Self {
            ctx,
            channel,
            phase: SessionPhase::Features,
        }
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.phase, SessionPhase::Attached { .. })
    }

    /// Opens the handshake.
    pub fn start(&self) -> Result<()> {
        self.channel.send(OfMessage::Hello)?;
        self.channel.send(OfMessage::FeaturesRequest)?;
        Ok(())
    }

    /// Handles one inbound message. Only fatal errors are returned; all
    /// others are logged here.
    pub fn handle(&mut self, frame: OfFrame) -> Result<()> {
        let name = frame.message.name();
        match self.dispatch(frame) {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                e.log(name);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn dispatch(&mut self, frame: OfFrame) -> Result<()> {
        let OfFrame { xid, message } = frame;
        match message {
            OfMessage::Hello => {
                trace!("hello received");
                Ok(())
            }
            OfMessage::EchoRequest(data) => Ok(self.channel.reply(xid, OfMessage::EchoReply(data))?),
            OfMessage::EchoReply(_) | OfMessage::BarrierReply => Ok(()),
            OfMessage::FeaturesReply(features) => {
                if self.phase != SessionPhase::Features {
                    debug!("unsolicited features reply ignored");
                    return Ok(());
                }
                info!(
                    dpid = format_args!("{:#018x}", features.datapath_id),
                    tables = features.n_tables,
                    "features received"
                );
                self.phase = SessionPhase::PortDesc {
                    dpid: features.datapath_id,
                    ports: Vec::new(),
                };
                Ok(self.channel.send(OfMessage::PortDescRequest)?)
            }
            OfMessage::PortDescReply { ports, more } => self.port_desc_reply(ports, more),
            OfMessage::PacketIn(packet_in) if self.is_attached() => {
                self.ctx.dispatcher.handle_packet_in(&packet_in)
            }
            OfMessage::FlowRemoved(removed) if self.is_attached() => {
                self.ctx.dispatcher.handle_flow_removed(&removed)
            }
            OfMessage::PortStatus(status) if self.is_attached() => self.port_status(status),
            OfMessage::Experimenter(msg) => self.experimenter(xid, msg),
            OfMessage::Error(err) => {
                warn!(
                    err_type = err.err_type,
                    code = err.code,
                    len = err.data.len(),
                    "datapath reported error"
                );
                Ok(())
            }
            other => {
                debug!(message = other.name(), phase = ?self.phase, "message ignored");
                Ok(())
            }
        }
    }

    fn port_desc_reply(&mut self, mut ports: Vec<PortDesc>, more: bool) -> Result<()> {
        let SessionPhase::PortDesc { dpid, ports: collected } = &mut self.phase else {
            debug!("unsolicited port description ignored");
            return Ok(());
        };
        collected.append(&mut ports);
        if more {
            return Ok(());
        }

        let dpid = *dpid;
        let ports = std::mem::take(collected);
        self.attach(dpid, ports)
    }

    #[instrument(skip(self, ports), fields(ports = ports.len()))]
    fn attach(&mut self, dpid: u64, ports: Vec<PortDesc>) -> Result<()> {
        self.retire_stale_ports(&ports)?;
        for desc in &ports {
            if let Err(e) = self.add_port(desc) {
                if e.is_fatal() {
                    return Err(e);
                }
                e.log("port add");
            }
        }

        let ctx = &self.ctx;
        ctx.programmer.reset();
        ctx.connection.attach(dpid, Arc::clone(&self.channel));
        self.phase = SessionPhase::Attached { dpid };

        ctx.programmer.enable_policy(PolicyTrap::Arp)?;
        if ctx.config.policy.lldp {
            ctx.programmer.enable_policy(PolicyTrap::Lldp)?;
        }
        if ctx.config.policy.lacp {
            ctx.programmer.enable_policy(PolicyTrap::Lacp)?;
        }

        ctx.bridge.replay();
        self.install_endpoints();

        info!(
            installed = ctx.programmer.installed_intents().len(),
            "datapath attached and programmed"
        );
        Ok(())
    }

    /// Returns to DETACHED. Nothing is sent: the connection is gone.
    pub fn detach(&mut self) {
        if self.is_attached() {
            self.ctx.connection.detach();
            self.ctx.programmer.reset();
        }
        self.phase = SessionPhase::Closed;
    }

    fn install_endpoints(&self) {
        let ctx = &self.ctx;
        for endpoint in &ctx.config.endpoints {
            let result = ctx
                .ports
                .resolve(PortKey::DevName(&endpoint.devname))
                .and_then(|mapping| {
                    let port_no = mapping
                        .switch_port
                        .ok_or_else(|| BaseboxError::port_not_found(&endpoint.devname))?;
                    let untagged = ctx.bridge.port_vlans(port_no).pvid == endpoint.vid;
                    ctx.programmer.egress_vlan_add(mapping.id, endpoint.vid, untagged)?;
                    ctx.programmer
                        .add_bridging_unicast(mapping.id, endpoint.vid, endpoint.hwaddr)?;
                    if let Some(address) = endpoint.address {
                        ctx.kernel.addr_add(mapping.ifindex, address)?;
                    }
                    debug!(endpoint = %endpoint.devname, vid = %endpoint.vid, "endpoint installed");
                    Ok(())
                });
            if let Err(e) = result {
                e.log("endpoint");
            }
        }
    }

    /// Releases bound ports that `ports` no longer reports, or reports under
    /// another port number, so the new set can be bound.
    fn retire_stale_ports(&self, ports: &[PortDesc]) -> Result<()> {
        for mapping in self.ctx.ports.mappings() {
            let Some(port_no) = mapping.switch_port else {
                continue;
            };
            let reported = ports
                .iter()
                .find(|desc| desc.name == mapping.devname)
                .map(|desc| SwitchPortNo::new(desc.port_no));
            if reported == Some(port_no) {
                continue;
            }
            info!(port = %mapping.devname, %port_no, ?reported, "stale port binding");
            if let Err(e) = self.release_port(mapping) {
                if e.is_fatal() {
                    return Err(e);
                }
                e.log("port retire");
            }
        }
        Ok(())
    }

    /// Creates the tap for `desc` and binds it to its switch port.
    fn add_port(&self, desc: &PortDesc) -> Result<LogicalPortId> {
        let ctx = &self.ctx;
        let tap = ctx.taps.create(&desc.name, desc.hw_addr)?;
        let id = ctx.ports.register(tap.ifindex(), tap.devname())?;
        ctx.ports.bind_switch_port(id, SwitchPortNo::new(desc.port_no))?;
        debug!(port = %desc.name, port_no = desc.port_no, ifindex = tap.ifindex(), "port bound");
        Ok(id)
    }

    #[instrument(skip(self, status), fields(port = %status.desc.name, reason = ?status.reason))]
    fn port_status(&mut self, status: PortStatus) -> Result<()> {
        let desc = status.desc;
        match status.reason {
            PortReason::Add => {
                let id = self.add_port(&desc)?;
                let mapping = self.ctx.ports.resolve(PortKey::Logical(id))?;
                info!(port_no = desc.port_no, "port added");
                match self.ctx.bridge.replay_link(mapping.ifindex) {
                    Err(BaseboxError::LinkNotFound(_)) => Ok(()),
                    other => other,
                }
            }
            PortReason::Delete => self.remove_port(&desc),
            PortReason::Modify => {
                info!(port_no = desc.port_no, link_up = desc.is_link_up(), "port modified");
                Ok(())
            }
        }
    }

    fn remove_port(&self, desc: &PortDesc) -> Result<()> {
        let mapping = self
            .ctx
            .ports
            .resolve(PortKey::SwitchPort(SwitchPortNo::new(desc.port_no)))?;
        self.release_port(mapping)?;
        info!(port_no = desc.port_no, "port removed");
        Ok(())
    }

    /// Retracts the port's flows, destroys its tap and unregisters it.
    fn release_port(&self, mapping: PortMapping) -> Result<()> {
        let ctx = &self.ctx;
        let retracted = ctx.programmer.retract_port(mapping.id)?;
        ctx.bridge.forget_port(mapping.id);
        if let Err(e) = ctx.taps.destroy(&mapping.devname) {
            e.log("tap destroy");
        }
        for endpoint in ctx.config.endpoints.iter().filter(|e| e.devname == mapping.devname) {
            if let Some(address) = endpoint.address {
                if let Err(e) = ctx.kernel.addr_del(mapping.ifindex, address) {
                    e.log("endpoint address");
                }
            }
        }
        ctx.ports.unregister(mapping.id, retracted)?;
        Ok(())
    }

    /// Answers a flow state query and resends everything installed.
    fn experimenter(&self, xid: u32, msg: ExperimenterMsg) -> Result<()> {
        let query = msg.experimenter == BISDN_EXPERIMENTER_ID
            && BisdnExperimenter::from_type(msg.exp_type) == Some(BisdnExperimenter::QueryFlowEntries);
        if !query {
            debug!(
                experimenter = format_args!("{:#010x}", msg.experimenter),
                exp_type = msg.exp_type,
                "experimenter message ignored"
            );
            return Ok(());
        }
        if !self.is_attached() {
            return Err(BaseboxError::NotConnected);
        }

        self.channel.reply(
            xid,
            OfMessage::Experimenter(ExperimenterMsg {
                experimenter: BISDN_EXPERIMENTER_ID,
                exp_type: BisdnExperimenter::ReceivedFlowEntriesQuery as u32,
                data: Vec::new(),
            }),
        )?;
        let resent = self.ctx.programmer.resend_installed()?;
        info!(xid, resent, "flow state query answered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseboxConfig;
    use crate::testing::{RecordingChannel, TestBed};
    use basebox_ofdpa::{FeaturesReply, OfdpaTable};
    use basebox_types::MacAddress;
    use pretty_assertions::assert_eq;

    fn port(no: u32) -> PortDesc {
        PortDesc::new(no, format!("port{}", no), MacAddress::new([2, 0, 0, 0, 0, no as u8]))
    }

    #[test]
    fn test_handshake_with_multipart_port_desc() {
        let bed = TestBed::new(BaseboxConfig::default());
        let channel = Arc::new(RecordingChannel::new());
        let mut session = bed.ctx.session(channel.clone());

        session.start().unwrap();
        assert_eq!(channel.take(), vec![OfMessage::Hello, OfMessage::FeaturesRequest]);

        session
            .handle(OfFrame::new(
                5,
                OfMessage::FeaturesReply(FeaturesReply {
                    datapath_id: 0x42,
                    n_buffers: 0,
                    n_tables: 255,
                    auxiliary_id: 0,
                    capabilities: 0,
                }),
            ))
            .unwrap();
        assert_eq!(channel.take(), vec![OfMessage::PortDescRequest]);

        session
            .handle(OfFrame::new(6, OfMessage::PortDescReply { ports: vec![port(1)], more: true }))
            .unwrap();
        assert!(!session.is_attached());
        session
            .handle(OfFrame::new(7, OfMessage::PortDescReply { ports: vec![port(2)], more: false }))
            .unwrap();

        assert_eq!(session.phase(), &SessionPhase::Attached { dpid: 0x42 });
        assert_eq!(bed.ctx.connection.dpid(), Some(0x42));
        assert_eq!(bed.taps.devnames(), vec!["port1".to_string(), "port2".to_string()]);
        assert_eq!(bed.ctx.ports.len(), 2);
        assert_eq!(
            bed.ctx
                .programmer
                .installed_intents()
                .flows_in(OfdpaTable::AclPolicy)
                .count(),
            1
        );
    }

    #[test]
    fn test_echo_request_is_answered_with_same_xid() {
        let bed = TestBed::new(BaseboxConfig::default());
        let channel = Arc::new(RecordingChannel::new());
        let mut session = bed.ctx.session(channel.clone());
        session
            .handle(OfFrame::new(99, OfMessage::EchoRequest(vec![1, 2])))
            .unwrap();
        assert_eq!(
            channel.take_frames(),
            vec![OfFrame::new(99, OfMessage::EchoReply(vec![1, 2]))]
        );
    }

    #[test]
    fn test_detach_sends_nothing() {
        let bed = TestBed::new(BaseboxConfig::default());
        let channel = Arc::new(RecordingChannel::new());
        let mut session = bed.attach(1, channel.clone(), vec![port(1)]).unwrap();
        channel.take();

        session.detach();
        assert!(channel.is_empty());
        assert!(!bed.ctx.connection.is_attached());
        assert!(bed.ctx.programmer.installed_intents().is_empty());
        assert_eq!(session.phase(), &SessionPhase::Closed);
    }

    #[test]
    fn test_reattach_with_changed_ports_rebinds() {
        let bed = TestBed::new(BaseboxConfig::default());
        bed.taps.assign_ifindex("port1", 101);
        let channel = Arc::new(RecordingChannel::new());
        let mut session = bed.attach(1, channel.clone(), vec![port(1), port(2)]).unwrap();
        session.detach();

        // port1 came back as switch port 3, port2 is gone
        let renumbered = PortDesc::new(3, "port1", MacAddress::new([2, 0, 0, 0, 0, 1]));
        let channel = Arc::new(RecordingChannel::new());
        let session = bed.attach(1, channel, vec![renumbered]).unwrap();

        assert!(session.is_attached());
        assert!(!bed.ctx.shutdown.is_halted());
        assert_eq!(
            bed.ctx.ports.switch_port(PortKey::DevName("port1")).unwrap(),
            SwitchPortNo::new(3)
        );
        assert_eq!(bed.ctx.ports.resolve(PortKey::DevName("port1")).unwrap().ifindex, 101);
        assert!(bed
            .ctx
            .ports
            .resolve(PortKey::SwitchPort(SwitchPortNo::new(1)))
            .is_err());
        assert!(bed.ctx.ports.resolve(PortKey::DevName("port2")).is_err());
        assert_eq!(bed.taps.devnames(), vec!["port1".to_string()]);
        assert_eq!(bed.ctx.ports.len(), 1);
    }

    #[test]
    fn test_port_delete_retracts_and_unregisters() {
        let bed = TestBed::new(BaseboxConfig::default());
        let channel = Arc::new(RecordingChannel::new());
        let mut session = bed.attach(1, channel.clone(), vec![port(1), port(2)]).unwrap();
        let id = bed.ctx.ports.resolve(PortKey::DevName("port2")).unwrap().id;
        bed.ctx.programmer.egress_vlan_accept_all(id).unwrap();

        session
            .handle(OfFrame::new(
                3,
                OfMessage::PortStatus(PortStatus {
                    reason: PortReason::Delete,
                    desc: port(2),
                }),
            ))
            .unwrap();

        assert!(bed.ctx.ports.resolve(PortKey::DevName("port2")).is_err());
        assert!(bed.taps.tap("port2").is_none());
        assert!(bed.ctx.programmer.installed_intents().groups.is_empty());

        session
            .handle(OfFrame::new(
                4,
                OfMessage::PortStatus(PortStatus {
                    reason: PortReason::Add,
                    desc: port(2),
                }),
            ))
            .unwrap();
        assert_eq!(
            bed.ctx
                .ports
                .switch_port(PortKey::DevName("port2"))
                .unwrap(),
            SwitchPortNo::new(2)
        );
    }
}
