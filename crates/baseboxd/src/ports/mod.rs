//! Switch ports: identity translation and the tap devices backing them.

mod identity;
mod tap;

pub use identity::{FlowsRetracted, PortIdentityMap, PortKey, PortMapping};
#[cfg(target_os = "linux")]
pub use tap::{LinuxTap, LinuxTapManager};
pub use tap::{FrameHandler, TapDevice, TapManager};
