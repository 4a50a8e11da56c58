//! Canonical view of kernel interfaces, addresses and neighbors.

use std::collections::BTreeMap;
use std::time::Duration;

use basebox_common::{SubscriptionId, Subscribers};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::types::{KernelEvent, KernelSnapshot, LinkEvent, LinkState, NeighborEntry};
use super::KernelSource;
use crate::error::{BaseboxError, Result};

/// Owns the link table; every other component works on owned clones.
///
/// Mutations collect their notifications while holding the table lock and
/// publish them, in kernel order, after the lock is released.
#[derive(Debug, Default)]
pub struct LinkStateCache {
    links: RwLock<BTreeMap<u32, LinkState>>,
    subscribers: Subscribers<LinkEvent>,
}

impl LinkStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&LinkEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn get_link(&self, ifindex: u32) -> Result<LinkState> {
        self.links
            .read()
            .get(&ifindex)
            .cloned()
            .ok_or(BaseboxError::LinkNotFound(ifindex))
    }

    pub fn get_link_by_name(&self, devname: &str) -> Result<LinkState> {
        self.links
            .read()
            .values()
            .find(|link| link.devname == devname)
            .cloned()
            .ok_or_else(|| BaseboxError::port_not_found(devname))
    }

    /// All links ordered by ifindex.
    pub fn get_links(&self) -> Vec<LinkState> {
        self.links.read().values().cloned().collect()
    }

    pub fn get_neighbors(&self, ifindex: u32) -> Result<Vec<NeighborEntry>> {
        self.links
            .read()
            .get(&ifindex)
            .map(|link| link.neighbors.values().cloned().collect())
            .ok_or(BaseboxError::LinkNotFound(ifindex))
    }

    /// Links enslaved to `master`.
    pub fn slaves_of(&self, master: u32) -> Vec<LinkState> {
        self.links
            .read()
            .values()
            .filter(|link| link.master == master)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    /// Current content, comparable with a kernel dump.
    pub fn snapshot(&self) -> KernelSnapshot {
        self.links.read().clone()
    }

    /// Applies one kernel notification.
    pub fn apply(&self, event: KernelEvent) -> Result<()> {
        let events = {
            let mut links = self.links.write();
            apply_locked(&mut links, event)?
        };
        self.publish(&events);
        Ok(())
    }

    /// Replaces the cache content with `kernel`, emitting the events that
    /// take observers from the cached state to the kernel state.
    #[instrument(skip(self, kernel), fields(links = kernel.len()))]
    pub fn resync(&self, kernel: KernelSnapshot) {
        let events = {
            let mut links = self.links.write();
            let events = diff(&links, &kernel);
            *links = kernel;
            events
        };
        if !events.is_empty() {
            info!(changes = events.len(), "resync found diverged link state");
        }
        self.publish(&events);
    }

    /// Re-emits `LinkCreated` for a known link so observers re-evaluate it.
    pub fn renotify_link(&self, ifindex: u32) -> Result<()> {
        let link = self.get_link(ifindex)?;
        debug!(link = %link, "re-notifying link");
        self.subscribers.publish(&LinkEvent::LinkCreated(link));
        Ok(())
    }

    /// Consumes `source` until `shutdown` fires, resynchronizing from a full
    /// dump at start, every `resync_interval` and after a failed receive.
    /// Returns early only when a dump fails.
    pub async fn run<S: KernelSource>(
        &self,
        source: &mut S,
        resync_interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.resync(source.dump().await?);

        let mut timer = tokio::time::interval(resync_interval);
        // the first tick completes immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("link state cache stopped");
                    return Ok(());
                }
                _ = timer.tick() => {
                    match source.dump().await {
                        Ok(kernel) => self.resync(kernel),
                        Err(e) => e.log("kernel dump"),
                    }
                }
                events = source.next_events() => match events {
                    Ok(events) => {
                        for event in events {
                            if let Err(e) = self.apply(event) {
                                e.log("kernel event");
                            }
                        }
                    }
                    Err(e) => {
                        // notifications may have been lost
                        e.log("kernel events");
                        self.resync(source.dump().await?);
                        timer.reset();
                    }
                },
            }
        }
    }

    fn publish(&self, events: &[LinkEvent]) {
        for event in events {
            trace!(?event, "link event");
            self.subscribers.publish(event);
        }
    }
}

fn apply_locked(links: &mut BTreeMap<u32, LinkState>, event: KernelEvent) -> Result<Vec<LinkEvent>> {
    let mut events = Vec::new();
    match event {
        KernelEvent::NewLink(new) => match links.get_mut(&new.ifindex) {
            Some(cached) if cached.same_attributes(&new) => {
                trace!(link = %new, "duplicate link notification");
            }
            Some(cached) => {
                let old = cached.attributes();
                let addrs = std::mem::take(&mut cached.addrs);
                let neighbors = std::mem::take(&mut cached.neighbors);
                *cached = LinkState {
                    addrs,
                    neighbors,
                    ..new.attributes()
                };
                events.push(LinkEvent::LinkUpdated {
                    old,
                    new: cached.attributes(),
                });
            }
            None => {
                let new = new.attributes();
                events.push(LinkEvent::LinkCreated(new.clone()));
                links.insert(new.ifindex, new);
            }
        },
        KernelEvent::DelLink(ifindex) => {
            let old = links
                .remove(&ifindex)
                .ok_or(BaseboxError::LinkNotFound(ifindex))?;
            events.push(LinkEvent::LinkDeleted(old));
        }
        KernelEvent::NewAddr { ifindex, prefix } => {
            let link = links
                .get_mut(&ifindex)
                .ok_or(BaseboxError::LinkNotFound(ifindex))?;
            if link.addrs.insert(prefix) {
                events.push(LinkEvent::AddrCreated { ifindex, prefix });
            }
        }
        KernelEvent::DelAddr { ifindex, prefix } => {
            let link = links
                .get_mut(&ifindex)
                .ok_or(BaseboxError::LinkNotFound(ifindex))?;
            if link.addrs.remove(&prefix) {
                events.push(LinkEvent::AddrDeleted { ifindex, prefix });
            }
        }
        KernelEvent::NewNeigh(neigh) => {
            let link = links
                .get_mut(&neigh.ifindex)
                .ok_or(BaseboxError::LinkNotFound(neigh.ifindex))?;
            let Some(key) = neigh.key() else {
                warn!(ifindex = neigh.ifindex, "neighbor without address ignored");
                return Ok(events);
            };
            match link.neighbors.insert(key, neigh.clone()) {
                Some(old) if old == neigh => {}
                Some(old) => events.push(LinkEvent::NeighUpdated { old, new: neigh }),
                None => events.push(LinkEvent::NeighCreated(neigh)),
            }
        }
        KernelEvent::DelNeigh(neigh) => {
            let link = links
                .get_mut(&neigh.ifindex)
                .ok_or(BaseboxError::LinkNotFound(neigh.ifindex))?;
            if let Some(old) = neigh.key().and_then(|key| link.neighbors.remove(&key)) {
                events.push(LinkEvent::NeighDeleted(old));
            }
        }
    }
    Ok(events)
}

/// Events turning `cached` into `kernel`.
fn diff(cached: &BTreeMap<u32, LinkState>, kernel: &KernelSnapshot) -> Vec<LinkEvent> {
    let mut events = Vec::new();

    for (ifindex, old) in cached {
        if !kernel.contains_key(ifindex) {
            events.push(LinkEvent::LinkDeleted(old.clone()));
        }
    }

    for (ifindex, new) in kernel {
        let old = cached.get(ifindex);
        match old {
            Some(old) if old.same_attributes(new) => {}
            Some(old) => events.push(LinkEvent::LinkUpdated {
                old: old.attributes(),
                new: new.attributes(),
            }),
            None => events.push(LinkEvent::LinkCreated(new.attributes())),
        }

        let empty = LinkState::new(*ifindex, "");
        let old = old.unwrap_or(&empty);

        for prefix in old.addrs.difference(&new.addrs) {
            events.push(LinkEvent::AddrDeleted {
                ifindex: *ifindex,
                prefix: *prefix,
            });
        }
        for prefix in new.addrs.difference(&old.addrs) {
            events.push(LinkEvent::AddrCreated {
                ifindex: *ifindex,
                prefix: *prefix,
            });
        }

        for (key, neigh) in &old.neighbors {
            if !new.neighbors.contains_key(key) {
                events.push(LinkEvent::NeighDeleted(neigh.clone()));
            }
        }
        for (key, neigh) in &new.neighbors {
            match old.neighbors.get(key) {
                Some(prev) if prev == neigh => {}
                Some(prev) => events.push(LinkEvent::NeighUpdated {
                    old: prev.clone(),
                    new: neigh.clone(),
                }),
                None => events.push(LinkEvent::NeighCreated(neigh.clone())),
            }
        }
    }

    events
}
