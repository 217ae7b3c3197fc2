//! Management API server
//!
//! Line-oriented TCP protocol: one request per line, one JSON line back.
//! A request matching the stream route upgrades the connection into the
//! device's binary stream and no further lines are accepted.
//!
//! Lines are read unbuffered (byte at a time) so that an upgrade hands the
//! socket over without swallowing any stream bytes the client may already
//! have sent.

pub mod handlers;
pub mod router;

use crate::bus::{DeviceCtx, VirtualBus};
use crate::state::ServerState;
use handlers::error_line;
use router::{Request, Router};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Hard cap on one request line.
const MAX_LINE_LEN: usize = 4096;

pub struct ApiServer {
    state: Arc<ServerState>,
    router: Arc<Router>,
    read_timeout: Duration,
}

impl ApiServer {
    pub fn new(state: Arc<ServerState>, read_timeout: Duration) -> Self {
        let mut router = Router::new();
        handlers::register_core_routes(&mut router, state.clone());
        Self {
            state,
            router: Arc::new(router),
            read_timeout,
        }
    }

    /// Accept connections until the server root is cancelled.
    pub async fn run(self, listener: TcpListener) -> common::Result<()> {
        let addr = listener.local_addr()?;
        info!("API listening on {}", addr);

        loop {
            let accepted = tokio::select! {
                _ = self.state.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("API accept error: {}", e);
                    continue;
                }
            };
            debug!("API connection from {}", peer);

            let state = self.state.clone();
            let router = self.router.clone();
            let read_timeout = self.read_timeout;
            tokio::spawn(async move {
                if let Err(e) = handle_conn(state, router, socket, read_timeout).await {
                    debug!("API connection error: {}", e);
                }
            });
        }
        Ok(())
    }
}

async fn handle_conn(
    state: Arc<ServerState>,
    router: Arc<Router>,
    mut socket: TcpStream,
    read_timeout: Duration,
) -> common::Result<()> {
    let conn_cancel = state.cancel.child_token();

    loop {
        let line = tokio::select! {
            _ = conn_cancel.cancelled() => return Ok(()),
            line = tokio::time::timeout(read_timeout, read_line(&mut socket)) => match line {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!("API read timeout, closing connection");
                    return Ok(());
                }
            },
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(cmd = line, "api cmd");

        let mut fields = line.split_whitespace();
        let Some(path) = fields.next() else {
            socket.write_all(format!("{}\n", error_line("empty")).as_bytes()).await?;
            continue;
        };
        let path = path.to_ascii_lowercase();
        let args: Vec<String> = fields.map(str::to_string).collect();

        if let Some((handler, params)) = router.match_handler(&path) {
            let request = Request {
                params,
                args,
                cancel: conn_cancel.clone(),
            };
            let reply = match handler(request).await {
                Ok(value) => value.to_string(),
                Err(e) => {
                    debug!(path = %path, error = %e, "api handler error");
                    error_line(&e.to_string())
                }
            };
            socket.write_all(format!("{}\n", reply).as_bytes()).await?;
            continue;
        }

        if let Some(params) = router.match_stream(&path) {
            // Control transfers to the stream broker; the socket never
            // comes back to line processing.
            run_stream(state, socket, params).await;
            return Ok(());
        }

        debug!(path = %path, "api unknown path");
        socket
            .write_all(format!("{}\n", error_line("unknown path")).as_bytes())
            .await?;
    }
}

/// Resolve the stream route target and hand the socket to the device's
/// stream handler, managing the connect timer around it.
async fn run_stream(
    state: Arc<ServerState>,
    mut socket: TcpStream,
    params: HashMap<String, String>,
) {
    let (bus, ctx) = match resolve_stream_target(&state, &params) {
        Ok(found) => found,
        Err(message) => {
            let _ = socket
                .write_all(format!("{}\n", error_line(&message)).as_bytes())
                .await;
            return;
        }
    };

    let Some(registration) = state.catalog.get(ctx.dev.type_name()) else {
        let _ = socket
            .write_all(
                format!(
                    "{}\n",
                    error_line(&format!("no handler for device type: {}", ctx.dev.type_name()))
                )
                .as_bytes(),
            )
            .await;
        return;
    };

    bus.stop_connect_timer(&ctx);
    info!(busid = %ctx.meta().busid, "device stream begin");

    if let Err(e) = (registration.stream_handler)(socket, ctx.dev.clone()).await {
        debug!("device stream handler error: {}", e);
    }

    info!(busid = %ctx.meta().busid, "device stream end");

    // Back on the clock: if no reconnection shows up, the device goes away.
    if bus.get_device_by_id(ctx.dev_id).is_some() {
        bus.arm_connect_timer(&ctx);
    }
}

fn resolve_stream_target(
    state: &ServerState,
    params: &HashMap<String, String>,
) -> Result<(Arc<VirtualBus>, DeviceCtx), String> {
    let bus_id: u32 = params
        .get("busId")
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| "invalid busId".to_string())?;
    let dev_id: u32 = params
        .get("deviceid")
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| "invalid deviceid".to_string())?;
    let bus = state.get_bus(bus_id).ok_or_else(|| "bus not found".to_string())?;
    let ctx = bus
        .get_device_by_id(dev_id)
        .ok_or_else(|| "device not found".to_string())?;
    Ok((bus, ctx))
}

/// Read one `\n`-terminated line without buffering past it.
async fn read_line(socket: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if socket.read(&mut byte).await? == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        if byte[0] == b'\n' {
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request line too long",
            ));
        }
    }
}
