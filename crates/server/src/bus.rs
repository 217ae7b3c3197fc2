//! Virtual bus
//!
//! A bus owns its devices, hands out device numbers monotonically (a slot
//! is never reused while the bus lives), and carries the per-device
//! cancellation context and connect timer. Cancellation forms a tree:
//! server root -> bus -> device; cancelling a parent unblocks every waiter
//! below it.

use common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use usb::device::{Device, ExportMeta};

/// Handle to a device living on a bus.
#[derive(Clone)]
pub struct DeviceCtx {
    pub dev: Arc<dyn Device>,
    pub dev_id: u32,
    /// Child of the bus token; cancelled when the device is removed.
    pub cancel: CancellationToken,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DeviceCtx {
    pub fn meta(&self) -> ExportMeta {
        self.dev
            .io()
            .export_meta()
            .cloned()
            .unwrap_or_else(|| ExportMeta::new(0, self.dev_id, 0))
    }
}

struct BusInner {
    devices: BTreeMap<u32, DeviceCtx>,
    next_dev_id: u32,
    closed: bool,
}

pub struct VirtualBus {
    bus_id: u32,
    connect_timeout: Duration,
    cancel: CancellationToken,
    inner: Mutex<BusInner>,
}

impl VirtualBus {
    /// Create a bus under `parent` with the given id.
    pub fn new(bus_id: u32, connect_timeout: Duration, parent: &CancellationToken) -> Self {
        Self {
            bus_id,
            connect_timeout,
            cancel: parent.child_token(),
            inner: Mutex::new(BusInner {
                devices: BTreeMap::new(),
                next_dev_id: 1,
                closed: false,
            }),
        }
    }

    pub fn bus_id(&self) -> u32 {
        self.bus_id
    }

    /// Add a device: assign the next device number, attach the export meta,
    /// wire up cancellation, and arm the connect timer.
    pub fn add(self: &Arc<Self>, dev: Arc<dyn Device>) -> Result<DeviceCtx> {
        let ctx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(Error::Conflict(format!("bus {} is closed", self.bus_id)));
            }
            let dev_id = inner.next_dev_id;
            inner.next_dev_id += 1;

            let speed = dev.descriptor().device.speed;
            dev.io()
                .set_export_meta(ExportMeta::new(self.bus_id, dev_id, speed));

            let ctx = DeviceCtx {
                dev: dev.clone(),
                dev_id,
                cancel: self.cancel.child_token(),
                timer: Arc::new(Mutex::new(None)),
            };
            inner.devices.insert(dev_id, ctx.clone());
            ctx
        };

        // Propagate context cancellation into the device's own machinery.
        let cancel = ctx.cancel.clone();
        let watched = dev.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            watched.io().cancel();
        });

        self.arm_connect_timer(&ctx);
        debug!(bus = self.bus_id, dev = ctx.dev_id, "device added");
        Ok(ctx)
    }

    /// Arm (or re-arm) the single-shot connect timer: if it fires before a
    /// stream shows up, the device is removed.
    pub fn arm_connect_timer(self: &Arc<Self>, ctx: &DeviceCtx) {
        let mut slot = ctx.timer.lock().unwrap();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let bus = self.clone();
        let cancel = ctx.cancel.clone();
        let dev_id = ctx.dev_id;
        let timeout = self.connect_timeout;
        *slot = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    match bus.remove_device_by_id(dev_id) {
                        Ok(()) => info!(
                            bus = bus.bus_id,
                            dev = dev_id,
                            "connect timeout: removed device (no connection)"
                        ),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => debug!(
                            bus = bus.bus_id,
                            dev = dev_id,
                            error = %e,
                            "connect timeout: failed to remove device"
                        ),
                    }
                }
            }
        }));
    }

    /// Stop the connect timer (a stream has attached).
    pub fn stop_connect_timer(&self, ctx: &DeviceCtx) {
        if let Some(handle) = ctx.timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Cancel and remove a device. In-flight URBs complete with the
    /// cancelled outcome before this returns.
    pub fn remove_device_by_id(&self, dev_id: u32) -> Result<()> {
        let ctx = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .devices
                .remove(&dev_id)
                .ok_or_else(|| Error::NotFound(format!("device {}", dev_id)))?
        };
        if let Some(handle) = ctx.timer.lock().unwrap().take() {
            handle.abort();
        }
        ctx.cancel.cancel();
        ctx.dev.io().cancel();
        debug!(bus = self.bus_id, dev = dev_id, "device removed");
        Ok(())
    }

    pub fn get_device_by_id(&self, dev_id: u32) -> Option<DeviceCtx> {
        self.inner.lock().unwrap().devices.get(&dev_id).cloned()
    }

    /// All devices on the bus in device-number order.
    pub fn all_devices(&self) -> Vec<DeviceCtx> {
        self.inner.lock().unwrap().devices.values().cloned().collect()
    }

    /// Cancel and remove every device, then mark the bus closed.
    pub fn close(&self) {
        let devices: Vec<DeviceCtx> = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            std::mem::take(&mut inner.devices).into_values().collect()
        };
        for ctx in devices {
            if let Some(handle) = ctx.timer.lock().unwrap().take() {
                handle.abort();
            }
            ctx.cancel.cancel();
            ctx.dev.io().cancel();
        }
        self.cancel.cancel();
        debug!(bus = self.bus_id, "bus closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devices::Keyboard;

    fn test_bus(timeout_ms: u64) -> Arc<VirtualBus> {
        Arc::new(VirtualBus::new(
            1,
            Duration::from_millis(timeout_ms),
            &CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_dev_ids_are_monotonic() {
        let bus = test_bus(60_000);
        let a = bus.add(Arc::new(Keyboard::new())).unwrap();
        let b = bus.add(Arc::new(Keyboard::new())).unwrap();
        assert_eq!(a.dev_id, 1);
        assert_eq!(b.dev_id, 2);

        bus.remove_device_by_id(1).unwrap();
        let c = bus.add(Arc::new(Keyboard::new())).unwrap();
        // Slot 1 is never reused.
        assert_eq!(c.dev_id, 3);
    }

    #[tokio::test]
    async fn test_export_meta_assigned_on_add() {
        let bus = test_bus(60_000);
        let ctx = bus.add(Arc::new(Keyboard::new())).unwrap();
        let meta = ctx.meta();
        assert_eq!(meta.bus_id, 1);
        assert_eq!(meta.dev_id, 1);
        assert_eq!(meta.busid, "1-1");
    }

    #[tokio::test]
    async fn test_remove_unknown_device() {
        let bus = test_bus(60_000);
        assert!(bus.remove_device_by_id(7).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_cancels_in_flight_urbs() {
        let bus = test_bus(60_000);
        let ctx = bus.add(Arc::new(Keyboard::new())).unwrap();
        let ticket = ctx.dev.io().submit_in(1).unwrap();
        bus.remove_device_by_id(ctx.dev_id).unwrap();
        assert!(matches!(ticket.wait().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_connect_timer_removes_idle_device() {
        let bus = test_bus(20);
        let ctx = bus.add(Arc::new(Keyboard::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(bus.get_device_by_id(ctx.dev_id).is_none());
        // The expiry fires exactly once; a second remove reports not-found.
        assert!(bus.remove_device_by_id(ctx.dev_id).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stopped_timer_keeps_device() {
        let bus = test_bus(20);
        let ctx = bus.add(Arc::new(Keyboard::new())).unwrap();
        bus.stop_connect_timer(&ctx);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(bus.get_device_by_id(ctx.dev_id).is_some());
    }

    #[tokio::test]
    async fn test_close_cancels_all_devices() {
        let bus = test_bus(60_000);
        let a = bus.add(Arc::new(Keyboard::new())).unwrap();
        let b = bus.add(Arc::new(Keyboard::new())).unwrap();
        bus.close();
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert!(bus.all_devices().is_empty());
        assert!(bus.add(Arc::new(Keyboard::new())).is_err());
    }
}
