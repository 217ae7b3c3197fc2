//! VIIPER management API client
//!
//! Speaks the line-oriented management protocol: one request line out, one
//! JSON line back. `connect_device` upgrades a connection into the raw
//! device stream for pushing input frames and reading device output.

pub mod error;
pub mod stream;

pub use common::apitypes::{
    ApiDevice, BusCreateResponse, BusListResponse, BusRemoveResponse, DeviceAddResponse,
    DeviceRemoveResponse, DevicesListResponse, PingResponse,
};
pub use error::{ClientError, Result};
pub use stream::DeviceStream;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Client for one VIIPER management endpoint.
///
/// Each request uses a fresh connection; the server answers one JSON line
/// per request line.
#[derive(Debug, Clone)]
pub struct ApiClient {
    addr: String,
}

impl ApiClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub async fn ping(&self) -> Result<PingResponse> {
        self.request("ping").await
    }

    pub async fn bus_list(&self) -> Result<BusListResponse> {
        self.request("bus/list").await
    }

    /// Create a bus; `bus_id` None lets the server pick the smallest free
    /// id.
    pub async fn bus_create(&self, bus_id: Option<u32>) -> Result<BusCreateResponse> {
        match bus_id {
            Some(id) => self.request(&format!("bus/create {}", id)).await,
            None => self.request("bus/create").await,
        }
    }

    pub async fn bus_remove(&self, bus_id: u32) -> Result<BusRemoveResponse> {
        self.request(&format!("bus/remove {}", bus_id)).await
    }

    pub async fn bus_devices_list(&self, bus_id: u32) -> Result<DevicesListResponse> {
        self.request(&format!("bus/{}/list", bus_id)).await
    }

    pub async fn bus_device_add(
        &self,
        bus_id: u32,
        device_type: &str,
    ) -> Result<DeviceAddResponse> {
        self.request(&format!("bus/{}/add {}", bus_id, device_type))
            .await
    }

    pub async fn bus_device_remove(
        &self,
        bus_id: u32,
        dev_id: &str,
    ) -> Result<DeviceRemoveResponse> {
        self.request(&format!("bus/{}/remove {}", bus_id, dev_id))
            .await
    }

    /// Upgrade a fresh connection into the device's binary stream. The
    /// server sends no confirmation line; a bad target surfaces as an error
    /// line followed by a close, which the first read reports.
    pub async fn connect_device(&self, bus_id: u32, dev_id: &str) -> Result<DeviceStream> {
        let mut socket = TcpStream::connect(&self.addr).await?;
        socket
            .write_all(format!("bus/{}/{}\n", bus_id, dev_id).as_bytes())
            .await?;
        Ok(DeviceStream::new(socket))
    }

    /// Add a device and immediately open its stream.
    pub async fn add_device_and_connect(
        &self,
        bus_id: u32,
        device_type: &str,
    ) -> Result<(DeviceStream, DeviceAddResponse)> {
        let added = self.bus_device_add(bus_id, device_type).await?;
        let dev_id = added
            .id
            .split_once('-')
            .map(|(_, dev)| dev.to_string())
            .ok_or_else(|| ClientError::Protocol(format!("malformed device id: {}", added.id)))?;
        let stream = self.connect_device(bus_id, &dev_id).await?;
        Ok((stream, added))
    }

    async fn request<T: DeserializeOwned>(&self, line: &str) -> Result<T> {
        let mut socket = TcpStream::connect(&self.addr).await?;
        debug!(line, "api request");
        socket.write_all(format!("{}\n", line).as_bytes()).await?;

        let reply = read_line(&mut socket).await?;
        let value: serde_json::Value = serde_json::from_str(&reply)
            .map_err(|e| ClientError::Protocol(format!("invalid response JSON: {}", e)))?;
        if let Some(message) = value.get("error").and_then(|v| v.as_str()) {
            return Err(ClientError::Api(message.to_string()));
        }
        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("unexpected response shape: {}", e)))
    }
}

async fn read_line(socket: &mut TcpStream) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if socket.read(&mut byte).await? == 0 {
            return Err(ClientError::Protocol("connection closed mid-response".into()));
        }
        if byte[0] == b'\n' {
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        line.push(byte[0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one connection, read the request line, answer with `reply`
    /// verbatim, then close.
    async fn one_shot_server(reply: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 256];
            let _ = socket.read(&mut request).await;
            socket.write_all(reply.as_bytes()).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_ping_parses_response() {
        let addr = one_shot_server("{\"server\":\"VIIPER\",\"version\":\"1.2.3\"}\n").await;
        let pong = ApiClient::new(addr).ping().await.unwrap();
        assert_eq!(pong.server, "VIIPER");
        assert_eq!(pong.version, "1.2.3");
    }

    #[tokio::test]
    async fn test_error_envelope_maps_to_api_error() {
        let addr = one_shot_server("{\"error\":\"bus 9 not found\"}\n").await;
        let err = ApiClient::new(addr).bus_remove(9).await.unwrap_err();
        assert!(matches!(err, ClientError::Api(ref m) if m == "bus 9 not found"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_protocol_error() {
        let addr = one_shot_server("not json at all\n").await;
        let err = ApiClient::new(addr).ping().await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_unexpected_response_shape_is_protocol_error() {
        // Valid JSON, but not a ping response.
        let addr = one_shot_server("{\"buses\":[1,2]}\n").await;
        let err = ApiClient::new(addr).ping().await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_close_mid_response_is_protocol_error() {
        // Response cut off before the newline.
        let addr = one_shot_server("{\"server\":\"VIIPER\"").await;
        let err = ApiClient::new(addr).ping().await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_io_error() {
        // Nothing listens on port 1.
        let err = ApiClient::new("127.0.0.1:1").ping().await.unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
    }

    #[tokio::test]
    async fn test_malformed_device_id_rejected() {
        let addr = one_shot_server("{\"id\":\"nodash\"}\n").await;
        let err = ApiClient::new(addr)
            .add_device_and_connect(1, "keyboard")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_request_line_format() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                socket.read_exact(&mut byte).await.unwrap();
                if byte[0] == b'\n' {
                    break;
                }
                request.push(byte[0]);
            }
            socket.write_all(b"{\"id\":\"1-1\"}\n").await.unwrap();
            String::from_utf8(request).unwrap()
        });

        ApiClient::new(addr).bus_device_add(1, "mouse").await.unwrap();
        assert_eq!(server.await.unwrap(), "bus/1/add mouse");
    }
}
