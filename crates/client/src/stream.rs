//! Device stream handle
//!
//! After the upgrade line, the socket is a raw full-duplex pipe: fixed-size
//! input frames go to the device, fixed-size output frames come back. Frame
//! sizes are defined per device type; this handle moves bytes without
//! interpreting them.

use crate::error::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug)]
pub struct DeviceStream {
    socket: TcpStream,
}

impl DeviceStream {
    pub(crate) fn new(socket: TcpStream) -> Self {
        Self { socket }
    }

    /// Send one input frame to the device.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.socket.write_all(frame).await?;
        Ok(())
    }

    /// Read exactly one output frame of `len` bytes from the device.
    pub async fn read_frame(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; len];
        self.socket.read_exact(&mut frame).await?;
        Ok(frame)
    }

    /// Close the stream; the server re-arms the device's connect timer.
    pub async fn close(mut self) -> Result<()> {
        self.socket.shutdown().await?;
        Ok(())
    }
}
