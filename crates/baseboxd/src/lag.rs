//! Kernel bond/team interfaces mapped onto hardware LAG groups.
//!
//! The target silicon supports a single member per LAG. Adding a second
//! member fails with [`BaseboxError::AlreadyHasMember`] and leaves the
//! existing member in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use basebox_types::SwitchPortNo;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::{BaseboxError, Result};
use crate::netlink::LinkStateCache;
use crate::ports::{PortIdentityMap, PortKey};

/// Hardware side of LAG management.
pub trait LagBackend: Send + Sync {
    /// Allocates a LAG for `bond` and returns its id.
    fn lag_create(&self, bond: u32) -> Result<u32>;

    fn lag_remove(&self, lag_id: u32) -> Result<()>;

    fn lag_add_member(&self, lag_id: u32, port: SwitchPortNo) -> Result<()>;

    fn lag_remove_member(&self, lag_id: u32, port: SwitchPortNo) -> Result<()>;
}

/// OF-DPA backend. A single-member LAG is programmed as its member port, so
/// ids only need to be unique locally.
#[derive(Debug)]
pub struct OfdpaLagBackend {
    next_id: AtomicU32,
}

impl OfdpaLagBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
        }
    }
}

impl Default for OfdpaLagBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LagBackend for OfdpaLagBackend {
    fn lag_create(&self, bond: u32) -> Result<u32> {
        let lag_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(bond, lag_id, "lag allocated");
        Ok(lag_id)
    }

    fn lag_remove(&self, lag_id: u32) -> Result<()> {
        debug!(lag_id, "lag released");
        Ok(())
    }

    fn lag_add_member(&self, lag_id: u32, port: SwitchPortNo) -> Result<()> {
        debug!(lag_id, %port, "lag member added");
        Ok(())
    }

    fn lag_remove_member(&self, lag_id: u32, port: SwitchPortNo) -> Result<()> {
        debug!(lag_id, %port, "lag member removed");
        Ok(())
    }
}

/// The single member of a LAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LagMember {
    pub ifindex: u32,
    pub port: SwitchPortNo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagGroup {
    pub lag_id: u32,
    pub bond: u32,
    pub member: Option<LagMember>,
}

pub struct LagAggregator {
    ports: Arc<PortIdentityMap>,
    links: Arc<LinkStateCache>,
    backend: Arc<dyn LagBackend>,
    lags: RwLock<HashMap<u32, LagGroup>>,
}

impl LagAggregator {
    pub fn new(
        ports: Arc<PortIdentityMap>,
        links: Arc<LinkStateCache>,
        backend: Arc<dyn LagBackend>,
    ) -> Self {
        Self {
            ports,
            links,
            backend,
            lags: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the LAG of `bond`, allocating one if needed.
    #[instrument(skip(self))]
    pub fn create_lag(&self, bond: u32) -> Result<u32> {
        let allocated = self.backend.lag_create(bond)?;

        let mut lags = self.lags.write();
        if let Some(existing) = lags.get(&bond) {
            let lag_id = existing.lag_id;
            drop(lags);
            if allocated != lag_id {
                debug!(bond, lag_id, duplicate = allocated, "releasing duplicate lag");
                self.backend.lag_remove(allocated)?;
            }
            return Ok(lag_id);
        }

        lags.insert(
            bond,
            LagGroup {
                lag_id: allocated,
                bond,
                member: None,
            },
        );
        info!(bond, lag_id = allocated, "lag created");
        Ok(allocated)
    }

    #[instrument(skip(self))]
    pub fn add_member(&self, bond: u32, member: u32) -> Result<()> {
        let port = self.member_port(member)?;

        if !self.lags.read().contains_key(&bond) {
            self.create_lag(bond)?;
        }

        {
            let mut lags = self.lags.write();
            let lag = lags.get_mut(&bond).ok_or(BaseboxError::LagNotFound(bond))?;
            if let Some(existing) = lag.member {
                warn!(bond, member, existing = existing.ifindex, "lag already has a member");
                return Err(BaseboxError::AlreadyHasMember { bond, member });
            }
            self.backend.lag_add_member(lag.lag_id, port)?;
            lag.member = Some(LagMember {
                ifindex: member,
                port,
            });
            info!(bond, member, %port, lag_id = lag.lag_id, "lag member added");
        }

        // a bond already in a bridge has to be re-evaluated with its new port
        match self.links.get_link(bond) {
            Ok(link) if link.master != 0 => self.links.renotify_link(bond)?,
            Ok(_) => {}
            Err(e) => e.log("lag bridge re-evaluation"),
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn remove_member(&self, bond: u32, member: u32) -> Result<()> {
        let mut lags = self.lags.write();
        let lag = lags.get_mut(&bond).ok_or_else(|| {
            BaseboxError::InvariantViolation(format!("member {} removed from bond {} without lag", member, bond))
        })?;

        let port = match lag.member {
            Some(current) if current.ifindex == member => current.port,
            _ => {
                return Err(BaseboxError::InvalidPort(format!(
                    "ifindex {} is not the member of bond {}",
                    member, bond
                )))
            }
        };

        self.backend.lag_remove_member(lag.lag_id, port)?;
        lag.member = None;
        let lag_id = lag.lag_id;

        // last member gone
        lags.remove(&bond);
        drop(lags);
        self.backend.lag_remove(lag_id)?;
        info!(bond, member, lag_id, "lag member removed, lag destroyed");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn remove_lag(&self, bond: u32) -> Result<()> {
        let lag = self
            .lags
            .write()
            .remove(&bond)
            .ok_or(BaseboxError::LagNotFound(bond))?;

        if let Some(member) = lag.member {
            self.backend.lag_remove_member(lag.lag_id, member.port)?;
        }
        self.backend.lag_remove(lag.lag_id)?;
        info!(bond, lag_id = lag.lag_id, "lag removed");
        Ok(())
    }

    /// Switch port of the member of `bond`, 0 when there is none.
    pub fn lookup_port_id(&self, bond: u32) -> u32 {
        self.lags
            .read()
            .get(&bond)
            .and_then(|lag| lag.member)
            .map_or(0, |member| member.port.as_u32())
    }

    pub fn lag(&self, bond: u32) -> Option<LagGroup> {
        self.lags.read().get(&bond).cloned()
    }

    pub fn len(&self) -> usize {
        self.lags.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lags.read().is_empty()
    }

    fn member_port(&self, member: u32) -> Result<SwitchPortNo> {
        self.ports
            .switch_port(PortKey::IfIndex(member))
            .map_err(|_| BaseboxError::InvalidPort(format!("ifindex {} has no switch port", member)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::{KernelEvent, LinkState};
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<PortIdentityMap>, Arc<LinkStateCache>, LagAggregator) {
        let ports = Arc::new(PortIdentityMap::new());
        let id = ports.register(7, "port3").unwrap();
        ports.bind_switch_port(id, SwitchPortNo::new(3)).unwrap();
        let id = ports.register(9, "port4").unwrap();
        ports.bind_switch_port(id, SwitchPortNo::new(4)).unwrap();

        let links = Arc::new(LinkStateCache::new());
        let lags = LagAggregator::new(
            Arc::clone(&ports),
            Arc::clone(&links),
            Arc::new(OfdpaLagBackend::new()),
        );
        (ports, links, lags)
    }

    #[test]
    fn test_create_lag_is_idempotent() {
        let (_, _, lags) = setup();
        let id = lags.create_lag(5).unwrap();
        assert_eq!(lags.create_lag(5).unwrap(), id);
        assert_eq!(lags.len(), 1);
    }

    #[test]
    fn test_single_member() {
        let (_, _, lags) = setup();
        lags.add_member(5, 7).unwrap();
        assert_eq!(lags.lookup_port_id(5), 3);

        assert!(matches!(
            lags.add_member(5, 9),
            Err(BaseboxError::AlreadyHasMember { bond: 5, member: 9 })
        ));
        assert_eq!(lags.lookup_port_id(5), 3);
        assert_eq!(lags.lag(5).unwrap().member.unwrap().ifindex, 7);
    }

    #[test]
    fn test_unresolvable_member() {
        let (_, _, lags) = setup();
        assert!(matches!(lags.add_member(5, 42), Err(BaseboxError::InvalidPort(_))));
        assert!(lags.is_empty());
    }

    #[test]
    fn test_remove_member_without_lag_is_fatal() {
        let (_, _, lags) = setup();
        let err = lags.remove_member(5, 7).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_remove_last_member_destroys_lag() {
        let (_, _, lags) = setup();
        lags.add_member(5, 7).unwrap();
        assert!(matches!(lags.remove_member(5, 9), Err(BaseboxError::InvalidPort(_))));
        lags.remove_member(5, 7).unwrap();
        assert!(lags.lag(5).is_none());
        assert_eq!(lags.lookup_port_id(5), 0);
    }

    #[test]
    fn test_remove_lag() {
        let (_, _, lags) = setup();
        assert!(matches!(lags.remove_lag(5), Err(BaseboxError::LagNotFound(5))));
        lags.add_member(5, 7).unwrap();
        lags.remove_lag(5).unwrap();
        assert!(lags.is_empty());
    }

    #[test]
    fn test_bridged_bond_is_renotified() {
        let (_, links, lags) = setup();
        links
            .apply(KernelEvent::NewLink(LinkState::new(5, "bond0").with_master(10)))
            .unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        links.subscribe(move |event| sink.lock().push(event.ifindex()));

        lags.add_member(5, 7).unwrap();
        assert_eq!(*seen.lock(), vec![5]);
    }
}
