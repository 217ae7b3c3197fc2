//! USB/IP server front-end
//!
//! Accepts USB/IP TCP connections, answers OP_REQ_DEVLIST / OP_REQ_IMPORT,
//! and after a successful import runs the connection in URB mode: the read
//! side consumes submissions in arrival order, completions flow through a
//! response queue drained by a dedicated writer task so that out-of-order
//! completion never interleaves bytes on the socket.

use crate::bus::{DeviceCtx, VirtualBus};
use crate::state::ServerState;
use common::Error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use usb::device::handle_control_request;
use usb::setup::SetupPacket;
use usbip::types::{ExportedDevice, InterfaceInfo, RetSubmit, RetUnlink, UrbHeader};
use usbip::{OpRequest, UrbReply, UrbRequest};

pub struct UsbIpServer {
    state: Arc<ServerState>,
    submit_write_timeout: Duration,
}

impl UsbIpServer {
    pub fn new(state: Arc<ServerState>, submit_write_timeout: Duration) -> Self {
        Self {
            state,
            submit_write_timeout,
        }
    }

    /// Accept connections until the server root is cancelled.
    pub async fn run(self, listener: TcpListener) -> common::Result<()> {
        let addr = listener.local_addr()?;
        info!("USB/IP listening on {}", addr);

        loop {
            let accepted = tokio::select! {
                _ = self.state.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("USB/IP accept error: {}", e);
                    continue;
                }
            };
            debug!("USB/IP connection from {}", peer);

            let state = self.state.clone();
            let write_timeout = self.submit_write_timeout;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, socket, write_timeout).await {
                    debug!("USB/IP connection error: {}", e);
                }
            });
        }
        Ok(())
    }
}

/// Build the OP_REP device block for one exported device.
fn exported_device(ctx: &DeviceCtx) -> ExportedDevice {
    let meta = ctx.meta();
    let desc = ctx.dev.descriptor();
    ExportedDevice {
        path: meta.path.clone(),
        busid: meta.busid.clone(),
        busnum: meta.bus_id,
        devnum: meta.dev_id,
        speed: meta.speed,
        id_vendor: desc.device.id_vendor,
        id_product: desc.device.id_product,
        bcd_device: desc.device.bcd_device,
        device_class: desc.device.device_class,
        device_sub_class: desc.device.device_sub_class,
        device_protocol: desc.device.device_protocol,
        configuration_value: desc.config.configuration_value,
        num_configurations: desc.device.num_configurations,
        interfaces: desc
            .interfaces
            .iter()
            .map(|i| InterfaceInfo {
                interface_class: i.descriptor.interface_class,
                interface_sub_class: i.descriptor.interface_sub_class,
                interface_protocol: i.descriptor.interface_protocol,
            })
            .collect(),
    }
}

async fn handle_connection(
    state: Arc<ServerState>,
    socket: TcpStream,
    write_timeout: Duration,
) -> common::Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    // Op mode: serve devlist requests until the client imports a device or
    // goes away.
    loop {
        let (_, request) = match usbip::read_op_request(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!("malformed op request: {}", e);
                return Ok(());
            }
        };

        match request {
            OpRequest::DevList => {
                let devices: Vec<ExportedDevice> = state
                    .all_devices()
                    .iter()
                    .map(|(_, ctx)| exported_device(ctx))
                    .collect();
                debug!("devlist: {} exported device(s)", devices.len());
                usbip::write_devlist_reply(&mut writer, &devices)
                    .await
                    .map_err(wire_to_io)?;
            }
            OpRequest::Import { busid } => {
                let session = state.next_session_id();
                let Some((bus, ctx)) = state.find_by_busid(&busid) else {
                    debug!("import of unknown busid {:?}", busid);
                    usbip::write_import_reply(&mut writer, usbip::ST_NA, None)
                        .await
                        .map_err(wire_to_io)?;
                    return Ok(());
                };
                if ctx.dev.io().try_import(session).is_err() {
                    debug!("import conflict on busid {:?}", busid);
                    usbip::write_import_reply(&mut writer, usbip::ST_NA, None)
                        .await
                        .map_err(wire_to_io)?;
                    return Ok(());
                }
                info!(busid = %busid, session, "device imported");
                let device = exported_device(&ctx);
                if let Err(e) =
                    usbip::write_import_reply(&mut writer, usbip::ST_OK, Some(&device)).await
                {
                    ctx.dev.io().release_import(session);
                    return Err(wire_to_io(e));
                }
                urb_session(reader, writer, bus, ctx, session, write_timeout).await;
                return Ok(());
            }
        }
    }
}

fn wire_to_io(e: usbip::WireError) -> Error {
    match e {
        usbip::WireError::Io(io) => Error::Io(io),
        other => Error::Protocol(other.to_string()),
    }
}

struct LiveUrb {
    ep: u8,
    task: JoinHandle<()>,
}

type LiveMap = Arc<Mutex<HashMap<u32, LiveUrb>>>;

/// URB mode for one import session. Returns when the client disconnects,
/// sends garbage, or the device goes away.
async fn urb_session(
    mut reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    bus: Arc<VirtualBus>,
    ctx: DeviceCtx,
    session: u64,
    write_timeout: Duration,
) {
    let (reply_tx, reply_rx) = mpsc::channel::<UrbReply>(64);
    let writer_task = tokio::spawn(write_replies(writer, reply_rx, write_timeout));
    let live: LiveMap = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let request = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            request = usbip::read_urb_request(&mut reader) => request,
        };
        match request {
            Ok(Some(UrbRequest::Submit { header, cmd, data })) => {
                if !handle_submit(&ctx, &live, &reply_tx, header, cmd, data).await {
                    break;
                }
            }
            Ok(Some(UrbRequest::Unlink {
                header,
                unlink_seqnum,
            })) => {
                handle_unlink(&ctx, &live, &reply_tx, header, unlink_seqnum).await;
            }
            Ok(None) => break,
            Err(e) => {
                debug!("malformed URB message: {}", e);
                break;
            }
        }
    }

    // Cancel whatever is still in flight for this session.
    for (_, urb) in live.lock().unwrap().drain() {
        urb.task.abort();
        ctx.dev.io().clear_in_waiter(urb.ep);
    }
    drop(reply_tx);
    let _ = writer_task.await;

    ctx.dev.io().release_import(session);
    info!(session, "import session closed");

    // Without a live stream the device is back on the connect-timer clock.
    if bus.get_device_by_id(ctx.dev_id).is_some() && !ctx.dev.io().has_stream() {
        bus.arm_connect_timer(&ctx);
    }
}

/// Serialize replies onto the socket; completions may arrive in any order.
async fn write_replies(
    mut writer: OwnedWriteHalf,
    mut replies: mpsc::Receiver<UrbReply>,
    write_timeout: Duration,
) {
    while let Some(reply) = replies.recv().await {
        match tokio::time::timeout(write_timeout, usbip::write_urb_reply(&mut writer, &reply))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("URB reply write failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("URB reply write timed out");
                break;
            }
        }
    }
}

fn ret_header(header: &UrbHeader, command: u32) -> UrbHeader {
    UrbHeader {
        command,
        seqnum: header.seqnum,
        devid: header.devid,
        direction: header.direction,
        ep: header.ep,
    }
}

fn status_for(e: &Error) -> i32 {
    match e {
        Error::Busy(_) => usbip::EBUSY,
        Error::Cancelled => usbip::ECONNRESET,
        _ => usbip::EPIPE,
    }
}

/// Dispatch one CMD_SUBMIT. Returns false when the connection must drop
/// (seqnum reuse is a protocol violation).
async fn handle_submit(
    ctx: &DeviceCtx,
    live: &LiveMap,
    reply_tx: &mpsc::Sender<UrbReply>,
    header: UrbHeader,
    cmd: usbip::CmdSubmit,
    data: Vec<u8>,
) -> bool {
    // Endpoint 0: control request, completes inline.
    if header.ep == 0 {
        let setup = SetupPacket::parse(cmd.setup);
        let reply = match handle_control_request(ctx.dev.as_ref(), &setup, &data) {
            Ok(reply_data) => {
                let (actual, body) = if header.direction == usbip::DIR_IN {
                    (reply_data.len() as u32, reply_data)
                } else {
                    (data.len() as u32, Vec::new())
                };
                UrbReply::Submit {
                    header: ret_header(&header, usbip::RET_SUBMIT),
                    ret: RetSubmit {
                        setup: cmd.setup,
                        ..RetSubmit::success(actual)
                    },
                    data: body,
                }
            }
            Err(e) => {
                if matches!(e, Error::Encoding(_)) {
                    error!("descriptor encoding failed: {}", e);
                } else {
                    debug!(seqnum = header.seqnum, "control request failed: {}", e);
                }
                UrbReply::Submit {
                    header: ret_header(&header, usbip::RET_SUBMIT),
                    ret: RetSubmit {
                        setup: cmd.setup,
                        ..RetSubmit::error(status_for(&e))
                    },
                    data: Vec::new(),
                }
            }
        };
        let _ = reply_tx.send(reply).await;
        return true;
    }

    // Non-zero endpoint, OUT: hand the buffer to the device.
    if header.is_out() {
        let reply = match ctx.dev.handle_out(header.ep as u8, &data) {
            Ok(()) => UrbReply::Submit {
                header: ret_header(&header, usbip::RET_SUBMIT),
                ret: RetSubmit {
                    setup: cmd.setup,
                    ..RetSubmit::success(data.len() as u32)
                },
                data: Vec::new(),
            },
            Err(e) => UrbReply::Submit {
                header: ret_header(&header, usbip::RET_SUBMIT),
                ret: RetSubmit {
                    setup: cmd.setup,
                    ..RetSubmit::error(status_for(&e))
                },
                data: Vec::new(),
            },
        };
        let _ = reply_tx.send(reply).await;
        return true;
    }

    // Non-zero endpoint, IN: park on the device's input queue. A live
    // seqnum must not be reused by the same session.
    {
        let live_guard = live.lock().unwrap();
        if live_guard.contains_key(&header.seqnum) {
            warn!(
                seqnum = header.seqnum,
                "seqnum reused while live, dropping connection"
            );
            return false;
        }
    }

    match ctx.dev.io().submit_in(header.ep as u8) {
        Ok(ticket) => {
            let reply_tx = reply_tx.clone();
            let live_map = live.clone();
            let requested = cmd.transfer_buffer_length as usize;
            let setup = cmd.setup;
            // The map entry must exist before the completion task can race
            // to remove it, so the insert happens under the same lock.
            let mut live_guard = live.lock().unwrap();
            let task = tokio::spawn(async move {
                let reply = match ticket.wait().await {
                    Ok(mut report) => {
                        report.truncate(requested);
                        UrbReply::Submit {
                            header: ret_header(&header, usbip::RET_SUBMIT),
                            ret: RetSubmit {
                                setup,
                                ..RetSubmit::success(report.len() as u32)
                            },
                            data: report,
                        }
                    }
                    Err(_) => UrbReply::Submit {
                        header: ret_header(&header, usbip::RET_SUBMIT),
                        ret: RetSubmit {
                            setup,
                            ..RetSubmit::error(usbip::ECONNRESET)
                        },
                        data: Vec::new(),
                    },
                };
                live_map.lock().unwrap().remove(&header.seqnum);
                let _ = reply_tx.send(reply).await;
            });
            live_guard.insert(
                header.seqnum,
                LiveUrb {
                    ep: header.ep as u8,
                    task,
                },
            );
        }
        Err(e) => {
            let reply = UrbReply::Submit {
                header: ret_header(&header, usbip::RET_SUBMIT),
                ret: RetSubmit {
                    setup: cmd.setup,
                    ..RetSubmit::error(status_for(&e))
                },
                data: Vec::new(),
            };
            let _ = reply_tx.send(reply).await;
        }
    }
    true
}

/// CMD_UNLINK: cancel the referenced URB if it is still live; an unknown or
/// already-completed seqnum answers with status 0.
async fn handle_unlink(
    ctx: &DeviceCtx,
    live: &LiveMap,
    reply_tx: &mpsc::Sender<UrbReply>,
    header: UrbHeader,
    unlink_seqnum: u32,
) {
    let removed = live.lock().unwrap().remove(&unlink_seqnum);
    let status = match removed {
        Some(urb) => {
            urb.task.abort();
            ctx.dev.io().clear_in_waiter(urb.ep);
            debug!(seqnum = unlink_seqnum, "URB unlinked");
            usbip::ECONNRESET
        }
        None => 0,
    };
    let reply = UrbReply::Unlink {
        header: ret_header(&header, usbip::RET_UNLINK),
        ret: RetUnlink { status },
    };
    let _ = reply_tx.send(reply).await;
}
