//! Shared server state
//!
//! The bus registry and device catalog both front-ends work against. Reads
//! vastly outnumber writes, so the registry sits behind a read-biased lock.

use crate::bus::{DeviceCtx, VirtualBus};
use common::{Error, Result};
use devices::Catalog;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ServerState {
    buses: RwLock<BTreeMap<u32, Arc<VirtualBus>>>,
    pub catalog: Arc<Catalog>,
    pub connect_timeout: Duration,
    /// Root of the cancellation tree.
    pub cancel: CancellationToken,
    next_session: AtomicU64,
}

impl ServerState {
    pub fn new(catalog: Arc<Catalog>, connect_timeout: Duration) -> Self {
        Self {
            buses: RwLock::new(BTreeMap::new()),
            catalog,
            connect_timeout,
            cancel: CancellationToken::new(),
            next_session: AtomicU64::new(1),
        }
    }

    /// Create a bus. `bus_id` 0 auto-assigns the smallest free id; a
    /// non-zero id must not collide.
    pub fn create_bus(&self, bus_id: u32) -> Result<Arc<VirtualBus>> {
        let mut buses = self.buses.write().unwrap();
        let id = if bus_id == 0 {
            let mut candidate = 1u32;
            while buses.contains_key(&candidate) {
                candidate += 1;
            }
            candidate
        } else {
            if buses.contains_key(&bus_id) {
                return Err(Error::Conflict(format!("bus {} already allocated", bus_id)));
            }
            bus_id
        };
        let bus = Arc::new(VirtualBus::new(id, self.connect_timeout, &self.cancel));
        buses.insert(id, bus.clone());
        Ok(bus)
    }

    /// Close and remove a bus; every device on it is cancelled first.
    pub fn remove_bus(&self, bus_id: u32) -> Result<()> {
        let bus = self
            .buses
            .write()
            .unwrap()
            .remove(&bus_id)
            .ok_or_else(|| Error::NotFound(format!("bus {}", bus_id)))?;
        bus.close();
        Ok(())
    }

    pub fn get_bus(&self, bus_id: u32) -> Option<Arc<VirtualBus>> {
        self.buses.read().unwrap().get(&bus_id).cloned()
    }

    pub fn list_buses(&self) -> Vec<u32> {
        self.buses.read().unwrap().keys().copied().collect()
    }

    /// Every exported device across all buses, in (bus, device) order.
    pub fn all_devices(&self) -> Vec<(Arc<VirtualBus>, DeviceCtx)> {
        let buses: Vec<Arc<VirtualBus>> =
            self.buses.read().unwrap().values().cloned().collect();
        let mut out = Vec::new();
        for bus in buses {
            for ctx in bus.all_devices() {
                out.push((bus.clone(), ctx));
            }
        }
        out
    }

    /// Resolve a USB/IP bus id string ("<bus>-<dev>").
    pub fn find_by_busid(&self, busid: &str) -> Option<(Arc<VirtualBus>, DeviceCtx)> {
        let (bus_part, dev_part) = busid.split_once('-')?;
        let bus_id: u32 = bus_part.parse().ok()?;
        let dev_id: u32 = dev_part.parse().ok()?;
        let bus = self.get_bus(bus_id)?;
        let ctx = bus.get_device_by_id(dev_id)?;
        Some((bus, ctx))
    }

    /// Fresh id for a USB/IP import session.
    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Tear down everything below the server root.
    pub fn shutdown(&self) {
        let buses: Vec<Arc<VirtualBus>> = {
            let mut map = self.buses.write().unwrap();
            std::mem::take(&mut *map).into_values().collect()
        };
        for bus in buses {
            bus.close();
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> ServerState {
        ServerState::new(Arc::new(Catalog::with_builtin()), Duration::from_secs(60))
    }

    #[test]
    fn test_auto_assign_smallest_free_id() {
        let state = test_state();
        assert_eq!(state.create_bus(0).unwrap().bus_id(), 1);
        assert_eq!(state.create_bus(0).unwrap().bus_id(), 2);
        state.remove_bus(1).unwrap();
        assert_eq!(state.create_bus(0).unwrap().bus_id(), 1);
    }

    #[test]
    fn test_explicit_id_collision() {
        let state = test_state();
        state.create_bus(5).unwrap();
        assert!(matches!(state.create_bus(5), Err(Error::Conflict(_))));
        assert_eq!(state.list_buses(), vec![5]);
    }

    #[test]
    fn test_remove_unknown_bus() {
        let state = test_state();
        assert!(state.remove_bus(9).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_find_by_busid() {
        let state = test_state();
        let bus = state.create_bus(1).unwrap();
        let reg = state.catalog.get("mouse").unwrap();
        bus.add((reg.factory)()).unwrap();

        let (found_bus, ctx) = state.find_by_busid("1-1").unwrap();
        assert_eq!(found_bus.bus_id(), 1);
        assert_eq!(ctx.dev.type_name(), "mouse");

        assert!(state.find_by_busid("1-9").is_none());
        assert!(state.find_by_busid("2-1").is_none());
        assert!(state.find_by_busid("bogus").is_none());
    }

    #[test]
    fn test_removed_bus_not_listed() {
        let state = test_state();
        state.create_bus(3).unwrap();
        state.create_bus(4).unwrap();
        state.remove_bus(3).unwrap();
        assert_eq!(state.list_buses(), vec![4]);
    }
}
