//! Attachment state of the logical switch.

use std::fmt;
use std::sync::Arc;

use basebox_ofdpa::DatapathChannel;
use parking_lot::RwLock;
use tracing::info;

#[derive(Clone, Default)]
pub enum ConnectionState {
    #[default]
    Detached,
    Attached {
        dpid: u64,
        channel: Arc<dyn DatapathChannel>,
    },
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached => write!(f, "Detached"),
            Self::Attached { dpid, .. } => write!(f, "Attached({:#018x})", dpid),
        }
    }
}

/// One per logical switch. Holds the outbound channel while attached.
#[derive(Debug, Default)]
pub struct SwitchConnection {
    state: RwLock<ConnectionState>,
}

impl SwitchConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, dpid: u64, channel: Arc<dyn DatapathChannel>) {
        *self.state.write() = ConnectionState::Attached { dpid, channel };
        info!(dpid = format_args!("{:#018x}", dpid), "datapath attached");
    }

    /// Returns the dpid that was attached, if any.
    pub fn detach(&self) -> Option<u64> {
        let previous = std::mem::take(&mut *self.state.write());
        match previous {
            ConnectionState::Attached { dpid, .. } => {
                info!(dpid = format_args!("{:#018x}", dpid), "datapath detached");
                Some(dpid)
            }
            ConnectionState::Detached => None,
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(*self.state.read(), ConnectionState::Attached { .. })
    }

    pub fn dpid(&self) -> Option<u64> {
        match *self.state.read() {
            ConnectionState::Attached { dpid, .. } => Some(dpid),
            ConnectionState::Detached => None,
        }
    }

    /// Outbound channel; `None` while detached.
    pub fn channel(&self) -> Option<Arc<dyn DatapathChannel>> {
        match &*self.state.read() {
            ConnectionState::Attached { channel, .. } => Some(Arc::clone(channel)),
            ConnectionState::Detached => None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }
}
