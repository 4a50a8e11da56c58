//! Translation between kernel interfaces, switch ports and logical port ids.

use std::collections::HashMap;
use std::fmt;

use basebox_types::{LogicalPortId, SwitchPortNo};
use parking_lot::RwLock;
use tracing::{debug, info, instrument};

use crate::error::{BaseboxError, Result};

/// Any of the keys a port can be looked up by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKey<'a> {
    Logical(LogicalPortId),
    SwitchPort(SwitchPortNo),
    IfIndex(u32),
    DevName(&'a str),
}

impl fmt::Display for PortKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logical(id) => write!(f, "logical port {}", id),
            Self::SwitchPort(port) => write!(f, "switch port {}", port),
            Self::IfIndex(ifindex) => write!(f, "ifindex {}", ifindex),
            Self::DevName(name) => write!(f, "device {}", name),
        }
    }
}

/// One row of the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub id: LogicalPortId,
    pub ifindex: u32,
    pub devname: String,
    /// Unset until the datapath reports the port.
    pub switch_port: Option<SwitchPortNo>,
}

/// Proof that no installed flow references `port` any more.
///
/// Only the flow programmer hands these out, which makes
/// [`PortIdentityMap::unregister`] impossible to call before the port's
/// flows are gone.
#[derive(Debug, PartialEq, Eq)]
pub struct FlowsRetracted {
    port: LogicalPortId,
}

impl FlowsRetracted {
    pub(crate) fn new(port: LogicalPortId) -> Self {
        Self { port }
    }

    pub fn port(&self) -> LogicalPortId {
        self.port
    }
}

#[derive(Debug)]
struct Inner {
    next_id: u32,
    entries: HashMap<LogicalPortId, PortMapping>,
    by_ifindex: HashMap<u32, LogicalPortId>,
    by_name: HashMap<String, LogicalPortId>,
    by_switch_port: HashMap<SwitchPortNo, LogicalPortId>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            // 0 means "no port"
            next_id: 1,
            entries: HashMap::new(),
            by_ifindex: HashMap::new(),
            by_name: HashMap::new(),
            by_switch_port: HashMap::new(),
        }
    }
}

/// Bijection among logical port id, switch port number and kernel
/// ifindex/devname.
///
/// Every index is a hash map so resolution is O(1) in each direction.
/// Collisions are reported as [`BaseboxError::InvariantViolation`] and never
/// overwrite an existing row.
#[derive(Debug, Default)]
pub struct PortIdentityMap {
    inner: RwLock<Inner>,
}

impl PortIdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kernel interface and returns its logical id.
    #[instrument(skip(self))]
    pub fn register(&self, ifindex: u32, devname: &str) -> Result<LogicalPortId> {
        let mut inner = self.inner.write();

        let by_index = inner.by_ifindex.get(&ifindex).copied();
        let by_name = inner.by_name.get(devname).copied();
        match (by_index, by_name) {
            (Some(a), Some(b)) if a == b => return Ok(a),
            (None, None) => {}
            _ => {
                return Err(BaseboxError::InvariantViolation(format!(
                    "{}({}) collides with registered port",
                    devname, ifindex
                )))
            }
        }

        let id = LogicalPortId::new(inner.next_id);
        inner.next_id += 1;
        inner.by_ifindex.insert(ifindex, id);
        inner.by_name.insert(devname.to_string(), id);
        inner.entries.insert(
            id,
            PortMapping {
                id,
                ifindex,
                devname: devname.to_string(),
                switch_port: None,
            },
        );
        info!(port = %devname, ifindex, %id, "port registered");
        Ok(id)
    }

    /// Binds the switch port number reported by the datapath.
    #[instrument(skip(self))]
    pub fn bind_switch_port(&self, id: LogicalPortId, port_no: SwitchPortNo) -> Result<()> {
        let mut inner = self.inner.write();

        let bound = inner
            .entries
            .get(&id)
            .ok_or_else(|| BaseboxError::port_not_found(PortKey::Logical(id)))?
            .switch_port;
        let owner = inner.by_switch_port.get(&port_no).copied();

        match (bound, owner) {
            (Some(bound), Some(owner)) if bound == port_no && owner == id => return Ok(()),
            (None, None) => {}
            _ => {
                return Err(BaseboxError::InvariantViolation(format!(
                    "cannot bind switch port {} to logical port {}",
                    port_no, id
                )))
            }
        }

        inner.by_switch_port.insert(port_no, id);
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.switch_port = Some(port_no);
        }
        debug!(%id, %port_no, "switch port bound");
        Ok(())
    }

    pub fn resolve(&self, key: PortKey<'_>) -> Result<PortMapping> {
        let inner = self.inner.read();
        let id = match key {
            PortKey::Logical(id) => Some(id),
            PortKey::SwitchPort(port_no) => inner.by_switch_port.get(&port_no).copied(),
            PortKey::IfIndex(ifindex) => inner.by_ifindex.get(&ifindex).copied(),
            PortKey::DevName(name) => inner.by_name.get(name).copied(),
        };
        id.and_then(|id| inner.entries.get(&id))
            .cloned()
            .ok_or_else(|| BaseboxError::port_not_found(key))
    }

    /// Switch port bound to `key`; NotFound when unmapped or not yet bound.
    pub fn switch_port(&self, key: PortKey<'_>) -> Result<SwitchPortNo> {
        self.resolve(key)?
            .switch_port
            .ok_or_else(|| BaseboxError::port_not_found(key))
    }

    /// Removes a port whose flows have been retracted.
    #[instrument(skip(self))]
    pub fn unregister(&self, id: LogicalPortId, proof: FlowsRetracted) -> Result<PortMapping> {
        if proof.port() != id {
            return Err(BaseboxError::InvalidArgument(format!(
                "flows retracted for port {}, not {}",
                proof.port(),
                id
            )));
        }

        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .remove(&id)
            .ok_or_else(|| BaseboxError::port_not_found(PortKey::Logical(id)))?;
        inner.by_ifindex.remove(&entry.ifindex);
        inner.by_name.remove(&entry.devname);
        if let Some(port_no) = entry.switch_port {
            inner.by_switch_port.remove(&port_no);
        }
        info!(port = %entry.devname, %id, "port unregistered");
        Ok(entry)
    }

    /// All rows ordered by logical id.
    pub fn mappings(&self) -> Vec<PortMapping> {
        let mut rows: Vec<PortMapping> = self.inner.read().entries.values().cloned().collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ids_start_at_one() {
        let map = PortIdentityMap::new();
        assert_eq!(map.register(7, "port3").unwrap(), LogicalPortId::new(1));
        assert_eq!(map.register(8, "port4").unwrap(), LogicalPortId::new(2));
    }

    #[test]
    fn test_register_is_idempotent() {
        let map = PortIdentityMap::new();
        let id = map.register(7, "port3").unwrap();
        assert_eq!(map.register(7, "port3").unwrap(), id);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_register_collision() {
        let map = PortIdentityMap::new();
        map.register(7, "port3").unwrap();
        assert!(map.register(7, "port9").unwrap_err().is_fatal());
        assert!(map.register(9, "port3").unwrap_err().is_fatal());
    }

    #[test]
    fn test_bijection() {
        let map = PortIdentityMap::new();
        for (ifindex, port) in [(7u32, 3u32), (8, 4), (11, 9)] {
            let id = map.register(ifindex, &format!("port{}", port)).unwrap();
            map.bind_switch_port(id, SwitchPortNo::new(port)).unwrap();
        }

        for row in map.mappings() {
            let port_no = row.switch_port.unwrap();
            assert_eq!(map.resolve(PortKey::SwitchPort(port_no)).unwrap().id, row.id);
            assert_eq!(map.resolve(PortKey::IfIndex(row.ifindex)).unwrap().id, row.id);
            assert_eq!(map.resolve(PortKey::DevName(&row.devname)).unwrap().id, row.id);
        }
    }

    #[test]
    fn test_bind_rules() {
        let map = PortIdentityMap::new();
        let a = map.register(7, "port3").unwrap();
        let b = map.register(8, "port4").unwrap();

        assert!(matches!(
            map.bind_switch_port(LogicalPortId::new(42), SwitchPortNo::new(3)),
            Err(BaseboxError::PortNotFound(_))
        ));

        map.bind_switch_port(a, SwitchPortNo::new(3)).unwrap();
        map.bind_switch_port(a, SwitchPortNo::new(3)).unwrap();
        assert!(map.bind_switch_port(b, SwitchPortNo::new(3)).unwrap_err().is_fatal());
        assert!(map.bind_switch_port(a, SwitchPortNo::new(5)).unwrap_err().is_fatal());
        assert_eq!(map.switch_port(PortKey::Logical(a)).unwrap(), SwitchPortNo::new(3));
        assert!(map.switch_port(PortKey::Logical(b)).is_err());
    }

    #[test]
    fn test_unregister_requires_matching_proof() {
        let map = PortIdentityMap::new();
        let a = map.register(7, "port3").unwrap();
        map.bind_switch_port(a, SwitchPortNo::new(3)).unwrap();

        let wrong = FlowsRetracted::new(LogicalPortId::new(99));
        assert!(map.unregister(a, wrong).is_err());

        let row = map.unregister(a, FlowsRetracted::new(a)).unwrap();
        assert_eq!(row.devname, "port3");
        assert!(map.resolve(PortKey::SwitchPort(SwitchPortNo::new(3))).is_err());
        assert!(map.is_empty());

        // the switch port is free again
        let c = map.register(7, "port3").unwrap();
        map.bind_switch_port(c, SwitchPortNo::new(3)).unwrap();
    }
}
