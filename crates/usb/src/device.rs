//! The device capability contract and shared endpoint machinery
//!
//! Every emulated device implements [`Device`] and embeds a [`DeviceIo`].
//! The trait carries the per-type behavior (descriptors, report building,
//! class requests); `DeviceIo` carries what all devices share: interrupt-IN
//! queueing, the bounded device-to-client output queue, stream and import
//! ownership, and the cancellation handle.
//!
//! Interrupt-IN semantics: each IN endpoint holds at most one pending report
//! and at most one waiter. An input frame builds a fresh report and either
//! wakes the waiter or overwrites the pending slot; it never queues more
//! than one report. A second concurrent waiter on the same endpoint fails
//! with `busy`.

use crate::desc::{
    CONFIG_DESC_TYPE, DEVICE_DESC_TYPE, Descriptor, HID_DESC_TYPE, REPORT_DESC_TYPE,
    STRING_DESC_TYPE,
};
use crate::setup::{self, SetupPacket};
use common::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Maximum buffered output frames per device before the oldest is dropped.
const OUTPUT_QUEUE_DEPTH: usize = 32;

/// Placement of a device on the virtual topology as advertised to USB/IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportMeta {
    pub bus_id: u32,
    pub dev_id: u32,
    /// Sysfs-style path advertised in OP_REP_DEVLIST
    pub path: String,
    /// Bus id string ("<bus>-<dev>") clients import by
    pub busid: String,
    /// USB/IP speed code
    pub speed: u32,
}

impl ExportMeta {
    pub fn new(bus_id: u32, dev_id: u32, speed: u32) -> Self {
        let busid = format!("{}-{}", bus_id, dev_id);
        Self {
            bus_id,
            dev_id,
            path: format!("/sys/devices/virtual/usb/{}", busid),
            busid,
            speed,
        }
    }

    /// USB/IP devid: busnum in the high 16 bits, devnum in the low.
    pub fn devid(&self) -> u32 {
        (self.bus_id << 16) | (self.dev_id & 0xFFFF)
    }
}

/// A device capable of being exported over USB/IP and driven by a client
/// stream. Adding a device type means implementing this trait and
/// registering a factory with the catalog.
pub trait Device: Send + Sync + 'static {
    /// The full static descriptor tree.
    fn descriptor(&self) -> &Descriptor;

    /// Shared endpoint machinery.
    fn io(&self) -> &DeviceIo;

    /// Registered type tag ("keyboard", "mouse", ...).
    fn type_name(&self) -> &'static str;

    /// Size in bytes of one client input frame.
    fn input_frame_len(&self) -> usize;

    /// Size in bytes of one device output frame, if the device emits output.
    fn output_frame_len(&self) -> Option<usize>;

    /// Apply one input frame: update internal state and complete the
    /// pending IN request (if any) through [`DeviceIo::complete_in`].
    fn handle_input_frame(&self, frame: &[u8]);

    /// Class- or vendor-specific EP0 request. `data` carries the OUT data
    /// stage. Standard requests never reach this method.
    fn handle_class_control(&self, setup: &SetupPacket, data: &[u8]) -> Result<Vec<u8>>;

    /// OUT transfer on a non-control endpoint.
    fn handle_out(&self, ep: u8, data: &[u8]) -> Result<()>;
}

/// Outcome of an IN submission: either a report was already pending, or the
/// caller must wait for the next input frame.
pub enum InTicket {
    Ready(Vec<u8>),
    Wait(oneshot::Receiver<Vec<u8>>),
}

impl InTicket {
    /// Resolve to the report bytes. A dropped producer (device cancelled or
    /// the waiter was cleared) surfaces as `cancelled`.
    pub async fn wait(self) -> Result<Vec<u8>> {
        match self {
            InTicket::Ready(report) => Ok(report),
            InTicket::Wait(rx) => rx.await.map_err(|_| Error::Cancelled),
        }
    }
}

#[derive(Default)]
struct InEndpoint {
    /// Latest report not yet consumed by an IN request
    pending: Option<Vec<u8>>,
    /// The single parked IN request
    waiter: Option<oneshot::Sender<Vec<u8>>>,
}

/// Endpoint queues, ownership flags and the cancellation handle shared by
/// all device types.
pub struct DeviceIo {
    ins: Mutex<HashMap<u8, InEndpoint>>,
    output: Mutex<VecDeque<Vec<u8>>>,
    output_ready: Notify,
    output_dropped: AtomicU64,
    meta: OnceLock<ExportMeta>,
    cancel: CancellationToken,
    stream: Mutex<Option<(u64, CancellationToken)>>,
    stream_epoch: AtomicU64,
    imported_by: Mutex<Option<u64>>,
}

impl DeviceIo {
    pub fn new() -> Self {
        Self {
            ins: Mutex::new(HashMap::new()),
            output: Mutex::new(VecDeque::new()),
            output_ready: Notify::new(),
            output_dropped: AtomicU64::new(0),
            meta: OnceLock::new(),
            cancel: CancellationToken::new(),
            stream: Mutex::new(None),
            stream_epoch: AtomicU64::new(0),
            imported_by: Mutex::new(None),
        }
    }

    /// Cancellation handle; children of this token guard every blocking
    /// operation against the device.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Set once by the bus when the device is added.
    pub fn set_export_meta(&self, meta: ExportMeta) {
        let _ = self.meta.set(meta);
    }

    pub fn export_meta(&self) -> Option<&ExportMeta> {
        self.meta.get()
    }

    /// Enqueue an IN request on `ep`. Completes immediately when a report is
    /// pending; otherwise parks until the next input frame. Fails `busy`
    /// when the endpoint already has a waiter.
    pub fn submit_in(&self, ep: u8) -> Result<InTicket> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut ins = self.ins.lock().unwrap();
        let endpoint = ins.entry(ep).or_default();
        if let Some(report) = endpoint.pending.take() {
            return Ok(InTicket::Ready(report));
        }
        if endpoint.waiter.is_some() {
            return Err(Error::Busy(format!("endpoint {:#04x}", ep)));
        }
        let (tx, rx) = oneshot::channel();
        endpoint.waiter = Some(tx);
        Ok(InTicket::Wait(rx))
    }

    /// Deliver a freshly built report to `ep`: wake the waiter, or replace
    /// the pending slot (interrupt-IN keeps only the latest report).
    pub fn complete_in(&self, ep: u8, report: Vec<u8>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut ins = self.ins.lock().unwrap();
        let endpoint = ins.entry(ep).or_default();
        if let Some(waiter) = endpoint.waiter.take() {
            // A receiver dropped by an unlinked URB loses the report, which
            // matches a host that no longer wants it.
            let _ = waiter.send(report);
        } else {
            endpoint.pending = Some(report);
        }
    }

    /// Drop the parked waiter on `ep` (CMD_UNLINK); the next frame goes to
    /// the pending slot instead.
    pub fn clear_in_waiter(&self, ep: u8) {
        let mut ins = self.ins.lock().unwrap();
        if let Some(endpoint) = ins.get_mut(&ep) {
            endpoint.waiter = None;
        }
    }

    /// Queue one device-to-client output frame, dropping the oldest when the
    /// buffer is full.
    pub fn push_output(&self, frame: Vec<u8>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut q = self.output.lock().unwrap();
        if q.len() >= OUTPUT_QUEUE_DEPTH {
            q.pop_front();
            let dropped = self.output_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "output queue overflow, dropped oldest frame (total dropped: {})",
                dropped
            );
        }
        q.push_back(frame);
        drop(q);
        self.output_ready.notify_one();
    }

    /// Next output frame for the stream writer half; None once the device is
    /// cancelled.
    pub async fn next_output(&self) -> Option<Vec<u8>> {
        loop {
            if let Some(frame) = self.output.lock().unwrap().pop_front() {
                return Some(frame);
            }
            tokio::select! {
                _ = self.output_ready.notified() => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    /// Attach a stream, closing any previous one. Returns the epoch and the
    /// per-stream cancellation token (a child of the device token).
    pub fn begin_stream(&self) -> (u64, CancellationToken) {
        let epoch = self.stream_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.cancel.child_token();
        let mut slot = self.stream.lock().unwrap();
        if let Some((_, prev)) = slot.replace((epoch, token.clone())) {
            prev.cancel();
        }
        (epoch, token)
    }

    /// Detach the stream identified by `epoch`; a newer stream stays
    /// untouched.
    pub fn end_stream(&self, epoch: u64) {
        let mut slot = self.stream.lock().unwrap();
        if slot.as_ref().is_some_and(|(e, _)| *e == epoch) {
            *slot = None;
        }
    }

    pub fn has_stream(&self) -> bool {
        self.stream.lock().unwrap().is_some()
    }

    /// Bind the device to one USB/IP import session.
    pub fn try_import(&self, session: u64) -> Result<()> {
        let mut imported = self.imported_by.lock().unwrap();
        if imported.is_some() {
            return Err(Error::Conflict("device already imported".into()));
        }
        *imported = Some(session);
        Ok(())
    }

    /// Release the import held by `session`, if it still holds it.
    pub fn release_import(&self, session: u64) {
        let mut imported = self.imported_by.lock().unwrap();
        if *imported == Some(session) {
            *imported = None;
        }
    }

    pub fn is_imported(&self) -> bool {
        self.imported_by.lock().unwrap().is_some()
    }

    /// Cancel everything: unblock all waiters, drop queued output, fire the
    /// cancellation token. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let mut ins = self.ins.lock().unwrap();
        for endpoint in ins.values_mut() {
            endpoint.waiter = None;
            endpoint.pending = None;
        }
        drop(ins);
        self.output.lock().unwrap().clear();
        self.output_ready.notify_waiters();
    }
}

impl Default for DeviceIo {
    fn default() -> Self {
        Self::new()
    }
}

/// Service an EP0 request for `dev`. Standard requests (GET_DESCRIPTOR,
/// SET_CONFIGURATION, ...) are resolved here through the descriptor codec;
/// class and vendor requests are delegated to the device. The returned data
/// stage is already truncated to `wLength`.
pub fn handle_control_request(dev: &dyn Device, setup: &SetupPacket, data: &[u8]) -> Result<Vec<u8>> {
    if !setup.is_standard() {
        let reply = dev.handle_class_control(setup, data)?;
        return Ok(truncate_to(reply, setup.length));
    }

    let desc = dev.descriptor();
    match setup.request {
        setup::REQ_GET_DESCRIPTOR => {
            let desc_type = (setup.value >> 8) as u8;
            let index = setup.value as u8;
            let bytes = match desc_type {
                DEVICE_DESC_TYPE => desc.device_bytes(),
                CONFIG_DESC_TYPE => desc.config_bytes()?,
                STRING_DESC_TYPE => desc
                    .string_bytes(index)
                    .ok_or_else(|| Error::NotFound(format!("string descriptor {}", index)))?,
                HID_DESC_TYPE => desc
                    .hid_bytes(setup.index as u8)
                    .ok_or_else(|| {
                        Error::NotFound(format!("HID descriptor on interface {}", setup.index))
                    })??,
                REPORT_DESC_TYPE => desc
                    .report_bytes(setup.index as u8)
                    .ok_or_else(|| {
                        Error::NotFound(format!("report descriptor on interface {}", setup.index))
                    })??,
                other => {
                    return Err(Error::NotFound(format!("descriptor type {:#04x}", other)));
                }
            };
            Ok(truncate_to(bytes, setup.length))
        }
        setup::REQ_GET_STATUS => Ok(truncate_to(vec![0, 0], setup.length)),
        setup::REQ_GET_CONFIGURATION => Ok(vec![desc.config.configuration_value]),
        setup::REQ_GET_INTERFACE => Ok(vec![0]),
        setup::REQ_SET_CONFIGURATION
        | setup::REQ_SET_INTERFACE
        | setup::REQ_CLEAR_FEATURE
        | setup::REQ_SET_FEATURE
        | setup::REQ_SET_ADDRESS => Ok(Vec::new()),
        other => Err(Error::NotFound(format!(
            "standard request {:#04x}",
            other
        ))),
    }
}

fn truncate_to(mut data: Vec<u8>, length: u16) -> Vec<u8> {
    data.truncate(length as usize);
    data
}
