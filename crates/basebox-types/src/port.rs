//! Switch-side port identifiers.
//!
//! The kernel side is keyed by ifindex (`u32`) and device name; the switch
//! side has two keys of its own which are kept as distinct types so they
//! cannot be swapped by accident.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical port number as reported by the datapath in its port
/// description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwitchPortNo(u32);

impl SwitchPortNo {
    pub const fn new(port_no: u32) -> Self {
        SwitchPortNo(port_no)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SwitchPortNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SwitchPortNo {
    fn from(port_no: u32) -> Self {
        SwitchPortNo(port_no)
    }
}

/// Internal port id handed to upper layers. Allocated by the port identity
/// map; 0 is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalPortId(u32);

impl LogicalPortId {
    pub const fn new(id: u32) -> Self {
        LogicalPortId(id)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for LogicalPortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_port_display() {
        assert_eq!(SwitchPortNo::new(3).to_string(), "3");
        assert_eq!(LogicalPortId::new(17).to_string(), "17");
    }

    #[test]
    fn test_port_ordering() {
        assert!(SwitchPortNo::new(1) < SwitchPortNo::new(2));
        assert_eq!(SwitchPortNo::from(9).as_u32(), 9);
    }
}
