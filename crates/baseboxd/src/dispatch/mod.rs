//! Packet-in, flow-removed and tap traffic handling.

mod dispatcher;
mod pool;

pub use dispatcher::PacketDispatcher;
pub use pool::{PacketBuffer, PacketPool};
