//! In-memory collaborators for tests: datapath channel, tap devices, LAG
//! backend, kernel writer and a scripted kernel source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use basebox_ofdpa::{ChannelError, DatapathChannel, FlowMod, GroupMod, OfFrame, OfMessage};
use basebox_types::{IpPrefix, MacAddress, SwitchPortNo, VlanId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::error::{BaseboxError, Result};
use crate::lag::LagBackend;
use crate::netlink::{KernelEvent, KernelSnapshot, KernelSource, KernelWriter};
use crate::ports::{FrameHandler, TapDevice, TapManager};

/// Records every message instead of writing it to a socket.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    frames: Mutex<Vec<OfFrame>>,
    next_xid: AtomicU32,
    failure: Mutex<Option<ChannelError>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self {
            next_xid: AtomicU32::new(1),
            ..Self::default()
        }
    }

    /// Makes every following send fail with `failure` until cleared.
    pub fn fail_with(&self, failure: Option<ChannelError>) {
        *self.failure.lock() = failure;
    }

    /// Drains the recorded messages.
    pub fn take(&self) -> Vec<OfMessage> {
        self.take_frames().into_iter().map(|frame| frame.message).collect()
    }

    pub fn take_frames(&self) -> Vec<OfFrame> {
        std::mem::take(&mut *self.frames.lock())
    }

    pub fn flow_mods(&self) -> Vec<FlowMod> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| match &frame.message {
                OfMessage::FlowMod(flow) => Some(flow.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn group_mods(&self) -> Vec<GroupMod> {
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| match &frame.message {
                OfMessage::GroupMod(group) => Some(group.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    fn record(&self, frame: OfFrame) -> std::result::Result<(), ChannelError> {
        if let Some(failure) = *self.failure.lock() {
            return Err(failure);
        }
        self.frames.lock().push(frame);
        Ok(())
    }
}

impl DatapathChannel for RecordingChannel {
    fn send(&self, message: OfMessage) -> std::result::Result<(), ChannelError> {
        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        self.record(OfFrame::new(xid, message))
    }

    fn reply(&self, xid: u32, message: OfMessage) -> std::result::Result<(), ChannelError> {
        self.record(OfFrame::new(xid, message))
    }
}

/// Tap device that keeps the frames handed to the kernel side.
#[derive(Debug)]
pub struct MemoryTap {
    devname: String,
    ifindex: u32,
    hwaddr: MacAddress,
    frames: Mutex<Vec<Vec<u8>>>,
}

impl MemoryTap {
    pub fn hwaddr(&self) -> MacAddress {
        self.hwaddr
    }

    /// Frames delivered so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }
}

impl TapDevice for MemoryTap {
    fn devname(&self) -> &str {
        &self.devname
    }

    fn ifindex(&self) -> u32 {
        self.ifindex
    }

    fn enqueue(&self, frame: &[u8]) -> Result<()> {
        self.frames.lock().push(frame.to_vec());
        Ok(())
    }
}

/// Tap manager without kernel devices. Ifindexes are allocated from 100
/// unless assigned up front with [`MemoryTapManager::assign_ifindex`].
pub struct MemoryTapManager {
    taps: RwLock<HashMap<String, Arc<MemoryTap>>>,
    ifindexes: Mutex<HashMap<String, u32>>,
    next_ifindex: AtomicU32,
    handler: RwLock<Option<FrameHandler>>,
}

impl Default for MemoryTapManager {
    fn default() -> Self {
        Self {
            taps: RwLock::new(HashMap::new()),
            ifindexes: Mutex::new(HashMap::new()),
            next_ifindex: AtomicU32::new(100),
            handler: RwLock::new(None),
        }
    }
}

impl MemoryTapManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_ifindex(&self, devname: &str, ifindex: u32) {
        self.ifindexes.lock().insert(devname.to_string(), ifindex);
    }

    pub fn tap(&self, devname: &str) -> Option<Arc<MemoryTap>> {
        self.taps.read().get(devname).cloned()
    }

    pub fn devnames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.taps.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Simulates the kernel transmitting `frame` on `devname`.
    pub fn inject(&self, devname: &str, frame: &[u8]) -> Result<()> {
        let tap = self
            .tap(devname)
            .ok_or_else(|| BaseboxError::port_not_found(devname))?;
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(tap.as_ref(), frame);
        }
        Ok(())
    }
}

impl TapManager for MemoryTapManager {
    fn create(&self, devname: &str, hwaddr: MacAddress) -> Result<Arc<dyn TapDevice>> {
        let mut taps = self.taps.write();
        if let Some(tap) = taps.get(devname) {
            return Ok(Arc::clone(tap) as Arc<dyn TapDevice>);
        }
        let ifindex = match self.ifindexes.lock().get(devname) {
            Some(ifindex) => *ifindex,
            None => self.next_ifindex.fetch_add(1, Ordering::Relaxed),
        };
        let tap = Arc::new(MemoryTap {
            devname: devname.to_string(),
            ifindex,
            hwaddr,
            frames: Mutex::new(Vec::new()),
        });
        taps.insert(devname.to_string(), Arc::clone(&tap));
        Ok(tap)
    }

    fn destroy(&self, devname: &str) -> Result<()> {
        self.taps
            .write()
            .remove(devname)
            .map(|_| ())
            .ok_or_else(|| BaseboxError::port_not_found(devname))
    }

    fn get(&self, devname: &str) -> Option<Arc<dyn TapDevice>> {
        self.tap(devname).map(|tap| tap as Arc<dyn TapDevice>)
    }

    fn set_frame_handler(&self, handler: FrameHandler) {
        *self.handler.write() = Some(handler);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LagCall {
    Create { bond: u32, lag_id: u32 },
    Remove(u32),
    AddMember { lag_id: u32, port: SwitchPortNo },
    RemoveMember { lag_id: u32, port: SwitchPortNo },
}

/// LAG backend recording the hardware calls.
#[derive(Debug)]
pub struct RecordingLagBackend {
    next_id: AtomicU32,
    calls: Mutex<Vec<LagCall>>,
}

impl Default for RecordingLagBackend {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingLagBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<LagCall> {
        self.calls.lock().clone()
    }
}

impl LagBackend for RecordingLagBackend {
    fn lag_create(&self, bond: u32) -> Result<u32> {
        let lag_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(LagCall::Create { bond, lag_id });
        Ok(lag_id)
    }

    fn lag_remove(&self, lag_id: u32) -> Result<()> {
        self.calls.lock().push(LagCall::Remove(lag_id));
        Ok(())
    }

    fn lag_add_member(&self, lag_id: u32, port: SwitchPortNo) -> Result<()> {
        self.calls.lock().push(LagCall::AddMember { lag_id, port });
        Ok(())
    }

    fn lag_remove_member(&self, lag_id: u32, port: SwitchPortNo) -> Result<()> {
        self.calls.lock().push(LagCall::RemoveMember { lag_id, port });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelWrite {
    FdbAdd { ifindex: u32, vid: VlanId, lladdr: MacAddress },
    FdbDel { ifindex: u32, vid: VlanId, lladdr: MacAddress },
    AddrAdd { ifindex: u32, prefix: IpPrefix },
    AddrDel { ifindex: u32, prefix: IpPrefix },
}

/// Kernel writer recording the requested changes.
#[derive(Debug, Default)]
pub struct RecordingKernelWriter {
    writes: Mutex<Vec<KernelWrite>>,
}

impl RecordingKernelWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<KernelWrite> {
        self.writes.lock().clone()
    }
}

impl KernelWriter for RecordingKernelWriter {
    fn fdb_add(&self, ifindex: u32, vid: VlanId, lladdr: MacAddress) -> Result<()> {
        self.writes.lock().push(KernelWrite::FdbAdd { ifindex, vid, lladdr });
        Ok(())
    }

    fn fdb_del(&self, ifindex: u32, vid: VlanId, lladdr: MacAddress) -> Result<()> {
        self.writes.lock().push(KernelWrite::FdbDel { ifindex, vid, lladdr });
        Ok(())
    }

    fn addr_add(&self, ifindex: u32, prefix: IpPrefix) -> Result<()> {
        self.writes.lock().push(KernelWrite::AddrAdd { ifindex, prefix });
        Ok(())
    }

    fn addr_del(&self, ifindex: u32, prefix: IpPrefix) -> Result<()> {
        self.writes.lock().push(KernelWrite::AddrDel { ifindex, prefix });
        Ok(())
    }
}

/// Feeds a [`ScriptedKernelSource`] from the test.
#[derive(Debug, Clone)]
pub struct KernelScript {
    events: mpsc::UnboundedSender<Result<Vec<KernelEvent>>>,
    snapshot: Arc<Mutex<KernelSnapshot>>,
    dump_failure: Arc<Mutex<Option<String>>>,
    dumps: Arc<AtomicUsize>,
}

impl KernelScript {
    pub fn push(&self, batch: Vec<KernelEvent>) {
        // the source may already be gone at the end of a test
        let _ = self.events.send(Ok(batch));
    }

    /// Makes the next receive fail with `err`, as a socket overrun does.
    pub fn push_error(&self, err: BaseboxError) {
        let _ = self.events.send(Err(err));
    }

    /// Makes every following dump fail with a netlink error until cleared.
    pub fn fail_dumps(&self, reason: Option<&str>) {
        *self.dump_failure.lock() = reason.map(str::to_string);
    }

    /// Content of every following dump.
    pub fn set_snapshot(&self, snapshot: KernelSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn dumps(&self) -> usize {
        self.dumps.load(Ordering::Relaxed)
    }
}

/// Kernel source replaying scripted notification batches and dumps.
#[derive(Debug)]
pub struct ScriptedKernelSource {
    events: mpsc::UnboundedReceiver<Result<Vec<KernelEvent>>>,
    snapshot: Arc<Mutex<KernelSnapshot>>,
    dump_failure: Arc<Mutex<Option<String>>>,
    dumps: Arc<AtomicUsize>,
}

pub fn scripted_kernel(snapshot: KernelSnapshot) -> (KernelScript, ScriptedKernelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    let snapshot = Arc::new(Mutex::new(snapshot));
    let dump_failure = Arc::new(Mutex::new(None));
    let dumps = Arc::new(AtomicUsize::new(0));
    (
        KernelScript {
            events: tx,
            snapshot: Arc::clone(&snapshot),
            dump_failure: Arc::clone(&dump_failure),
            dumps: Arc::clone(&dumps),
        },
        ScriptedKernelSource {
            events: rx,
            snapshot,
            dump_failure,
            dumps,
        },
    )
}

#[async_trait]
impl KernelSource for ScriptedKernelSource {
    async fn next_events(&mut self) -> Result<Vec<KernelEvent>> {
        match self.events.recv().await {
            Some(batch) => batch,
            None => std::future::pending().await,
        }
    }

    async fn dump(&mut self) -> Result<KernelSnapshot> {
        self.dumps.fetch_add(1, Ordering::Relaxed);
        if let Some(reason) = self.dump_failure.lock().clone() {
            return Err(BaseboxError::Netlink(reason));
        }
        Ok(self.snapshot.lock().clone())
    }
}

/// A context wired to in-memory collaborators.
pub struct TestBed {
    pub ctx: Arc<crate::context::BaseboxContext>,
    pub taps: Arc<MemoryTapManager>,
    pub kernel: Arc<RecordingKernelWriter>,
    pub lags: Arc<RecordingLagBackend>,
}

impl TestBed {
    pub fn new(config: crate::config::BaseboxConfig) -> Self {
        let taps = Arc::new(MemoryTapManager::new());
        let kernel = Arc::new(RecordingKernelWriter::new());
        let lags = Arc::new(RecordingLagBackend::new());
        let ctx = crate::context::BaseboxContext::new(
            config,
            taps.clone(),
            kernel.clone(),
            lags.clone(),
        );
        Self {
            ctx,
            taps,
            kernel,
            lags,
        }
    }

    /// Runs the handshake of a new session on `channel` announcing `ports`
    /// and returns the attached session.
    pub fn attach(
        &self,
        dpid: u64,
        channel: Arc<RecordingChannel>,
        ports: Vec<basebox_ofdpa::PortDesc>,
    ) -> Result<crate::session::SwitchSession> {
        let mut session = self.ctx.session(channel);
        session.start()?;
        session.handle(OfFrame::new(
            1,
            OfMessage::FeaturesReply(basebox_ofdpa::FeaturesReply {
                datapath_id: dpid,
                n_buffers: 0,
                n_tables: 255,
                auxiliary_id: 0,
                capabilities: 0,
            }),
        ))?;
        session.handle(OfFrame::new(
            2,
            OfMessage::PortDescReply { ports, more: false },
        ))?;
        Ok(session)
    }
}
