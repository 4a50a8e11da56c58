//! Kernel network state: owned snapshots, the link state cache and the
//! route netlink transport.

mod cache;
#[cfg(target_os = "linux")]
mod linux;
pub mod types;

use async_trait::async_trait;
use basebox_types::{IpPrefix, MacAddress, VlanId};

pub use cache::LinkStateCache;
#[cfg(target_os = "linux")]
pub use linux::{NetlinkSource, NetlinkWriter};
pub use types::{
    KernelEvent, KernelSnapshot, LinkEvent, LinkKind, LinkState, NeighborEntry, NeighborKey,
    NeighborState,
};

use crate::error::Result;

/// Stream of kernel state notifications plus on-demand full dumps.
#[async_trait]
pub trait KernelSource: Send {
    /// Waits for the next batch of notifications.
    async fn next_events(&mut self) -> Result<Vec<KernelEvent>>;

    /// Dumps links, addresses and neighbors.
    async fn dump(&mut self) -> Result<KernelSnapshot>;
}

/// Writes that baseboxd performs on kernel state.
pub trait KernelWriter: Send + Sync {
    /// Adds a bridge FDB entry for `lladdr` in `vid` on `ifindex`.
    fn fdb_add(&self, ifindex: u32, vid: VlanId, lladdr: MacAddress) -> Result<()>;

    fn fdb_del(&self, ifindex: u32, vid: VlanId, lladdr: MacAddress) -> Result<()>;

    fn addr_add(&self, ifindex: u32, prefix: IpPrefix) -> Result<()>;

    fn addr_del(&self, ifindex: u32, prefix: IpPrefix) -> Result<()>;
}
