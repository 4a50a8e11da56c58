//! Common types for the basebox switch control plane.
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers
//! - [`IpPrefix`]: IPv4/IPv6 prefixes as assigned to kernel interfaces
//! - [`SwitchPortNo`] and [`LogicalPortId`]: the two switch-side port keys

mod ip;
mod mac;
mod port;
mod vlan;

pub use ip::IpPrefix;
pub use mac::MacAddress;
pub use port::{LogicalPortId, SwitchPortNo};
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid VLAN: {0}")]
    InvalidVlanName(String),
}
