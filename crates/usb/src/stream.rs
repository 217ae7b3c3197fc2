//! Device stream pump
//!
//! Once a management connection is upgraded, its socket becomes the
//! device's stream: a full-duplex binary pipe with no framing beyond the
//! fixed per-device record sizes. The reader half feeds input frames into
//! the device; the writer half drains the device's output queue. Neither
//! half interprets the bytes.

use crate::device::Device;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Run the stream until the client disconnects, the device is cancelled, or
/// a newer stream displaces this one. The device's previous stream (if any)
/// is closed on entry.
pub async fn run_device_stream(stream: TcpStream, dev: Arc<dyn Device>) -> common::Result<()> {
    let (epoch, token) = dev.io().begin_stream();
    let frame_len = dev.input_frame_len();
    let (mut reader, mut writer) = stream.into_split();

    debug!(
        device = dev.type_name(),
        frame_len, "device stream attached"
    );

    let read_half = async {
        let mut frame = vec![0u8; frame_len];
        loop {
            if let Err(e) = reader.read_exact(&mut frame).await {
                return e;
            }
            trace!(device = dev.type_name(), "input frame");
            dev.handle_input_frame(&frame);
        }
    };

    let write_half = async {
        while let Some(frame) = dev.io().next_output().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    };

    let result = tokio::select! {
        e = read_half => {
            // EOF is a normal client disconnect.
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Ok(())
            } else {
                Err(common::Error::Io(e))
            }
        }
        _ = write_half => Ok(()),
        _ = token.cancelled() => Ok(()),
    };

    dev.io().end_stream(epoch);
    debug!(device = dev.type_name(), "device stream detached");
    result
}
