//! VLAN ID type with validation and the encodings the switch and the
//! kernel use for it.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// IEEE 802.1Q VLAN identifier (1-4094).
///
/// ```
/// use basebox_types::VlanId;
///
/// let vlan = VlanId::new(100).unwrap();
/// assert_eq!(vlan.as_u16(), 100);
/// assert_eq!(vlan.tagged(), 0x1064);
/// assert!(VlanId::new(0).is_err());
/// assert!(VlanId::new(4095).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    /// Minimum valid VLAN ID.
    pub const MIN: u16 = 1;

    /// Maximum valid VLAN ID.
    pub const MAX: u16 = 4094;

    /// VLAN 1, the PVID a port gets when none is configured.
    pub const DEFAULT: VlanId = VlanId(1);

    /// Bit marking a tagged VLAN_VID in OpenFlow matches and set-fields.
    pub const TAG_PRESENT: u16 = 0x1000;

    /// Creates a new VLAN ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the VLAN ID is not in the valid range (1-4094).
    pub const fn new(id: u16) -> Result<Self, ParseError> {
        if id >= Self::MIN && id <= Self::MAX {
            Ok(VlanId(id))
        } else {
            Err(ParseError::InvalidVlanId(id))
        }
    }

    /// Decodes an OpenFlow VLAN_VID value. The present bit is required.
    pub const fn from_tag(raw: u16) -> Result<Self, ParseError> {
        if raw & Self::TAG_PRESENT == 0 {
            return Err(ParseError::InvalidVlanId(raw));
        }
        Self::new(raw & 0x0fff)
    }

    /// VLAN of a kernel bridge entry. The kernel reports untagged traffic
    /// without a VLAN or as VLAN 0; both map to the port's `pvid`.
    pub const fn from_kernel(vid: Option<u16>, pvid: VlanId) -> Result<Self, ParseError> {
        match vid {
            None | Some(0) => Ok(pvid),
            Some(vid) => Self::new(vid),
        }
    }

    /// Returns the VLAN ID as a u16.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// OpenFlow VLAN_VID value with the present bit set.
    pub const fn tagged(&self) -> u16 {
        self.0 | Self::TAG_PRESENT
    }

    /// Returns true if this is the default VLAN (VLAN 1).
    pub const fn is_default(&self) -> bool {
        self.0 == 1
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VlanId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u16 = s
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidVlanName(s.to_string()))?;
        VlanId::new(id)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = ParseError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        VlanId::new(id)
    }
}

impl From<VlanId> for u16 {
    fn from(vlan: VlanId) -> u16 {
        vlan.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_range() {
        assert!(VlanId::new(1).is_ok());
        assert!(VlanId::new(4094).is_ok());
        assert!(VlanId::new(0).is_err());
        assert!(VlanId::new(4095).is_err());
    }

    #[test]
    fn test_tag_encoding() {
        let vlan = VlanId::new(10).unwrap();
        assert_eq!(vlan.tagged(), 0x100a);
        assert_eq!(VlanId::from_tag(0x100a).unwrap(), vlan);
        // priority bits above the present bit are ignored
        assert_eq!(VlanId::from_tag(0x300a).unwrap(), vlan);
        assert_eq!(VlanId::from_tag(0x000a), Err(ParseError::InvalidVlanId(0x000a)));
        assert!(VlanId::from_tag(VlanId::TAG_PRESENT).is_err());
    }

    #[test]
    fn test_kernel_vlan_zero_is_pvid() {
        let pvid = VlanId::new(20).unwrap();
        assert_eq!(VlanId::from_kernel(None, pvid).unwrap(), pvid);
        assert_eq!(VlanId::from_kernel(Some(0), pvid).unwrap(), pvid);
        assert_eq!(VlanId::from_kernel(Some(30), pvid).unwrap().as_u16(), 30);
        assert!(VlanId::from_kernel(Some(4095), pvid).is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!("200".parse::<VlanId>().unwrap().as_u16(), 200);
        assert_eq!(
            "Vlan100".parse::<VlanId>(),
            Err(ParseError::InvalidVlanName("Vlan100".to_string()))
        );
        assert_eq!("0".parse::<VlanId>(), Err(ParseError::InvalidVlanId(0)));
    }

    #[test]
    fn test_deserialize_checks_range() {
        #[derive(Deserialize)]
        struct Port {
            pvid: VlanId,
        }
        assert!(toml::from_str::<Port>("pvid = 4095").is_err());
        assert_eq!(toml::from_str::<Port>("pvid = 7").unwrap().pvid.as_u16(), 7);
    }
}
