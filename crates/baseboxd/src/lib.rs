//! baseboxd keeps an OF-DPA switch in sync with the Linux kernel.
//!
//! Every switch port is mirrored by a tap device. Kernel state observed over
//! route netlink (links, bridge slaves, bonds, FDB and IP neighbors) is
//! translated into OF-DPA flow and group entries, and traffic punted by the
//! switch is delivered to the matching tap.
//!
//! Components are created once per process in a [`BaseboxContext`]:
//!
//! - [`netlink::LinkStateCache`]: owned mirror of kernel link state
//! - [`ports::PortIdentityMap`]: kernel ifindex to switch port translation
//! - [`lag::LagAggregator`]: bond to single-member LAG mapping
//! - [`flow::FlowTableProgrammer`]: intent-tracked flow and group programming
//! - [`dispatch::PacketDispatcher`]: packet-in and tap traffic
//! - [`daemon::BridgeAgent`]: kernel events to flow programming
//! - [`session::SwitchSession`]: datapath attach/detach

pub mod config;
pub mod context;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod lag;
pub mod netlink;
pub mod ports;
pub mod session;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{BaseboxConfig, DEFAULT_CONFIG_PATH};
pub use context::{BaseboxContext, ShutdownSignal};
pub use error::{BaseboxError, ErrorKind, Result};
