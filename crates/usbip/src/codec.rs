//! Async reading and writing of USB/IP messages
//!
//! Thin wrappers that pull whole messages off a socket and hand the byte
//! layout to [`crate::types`]. Server-side and client-side helpers are both
//! provided; the test suites and the proxy use the client half.

use crate::error::{Result, WireError};
use crate::types::{ExportedDevice, OpHeader, OpRequest, UrbReply, UrbRequest};
use crate::{
    BUSID_SIZE, CMD_SUBMIT, MAX_TRANSFER_SIZE, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_IMPORT,
    ST_OK, URB_HEADER_SIZE,
};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one op-mode request. Returns None on a clean connection close.
pub async fn read_op_request<R>(reader: &mut R) -> Result<Option<(OpHeader, OpRequest)>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 8];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = OpHeader::read_from(&mut Cursor::new(&head))?;

    let request = match header.code {
        OP_REQ_IMPORT => {
            let mut busid = [0u8; BUSID_SIZE];
            reader.read_exact(&mut busid).await?;
            let mut body = Cursor::new(&busid[..]);
            OpRequest::read_body(&header, &mut body)?
        }
        _ => OpRequest::read_body(&header, &mut Cursor::new(&[][..]))?,
    };
    Ok(Some((header, request)))
}

/// Write an OP_REP_DEVLIST reply listing `devices`.
pub async fn write_devlist_reply<W>(writer: &mut W, devices: &[ExportedDevice]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    OpHeader::new(OP_REP_DEVLIST, ST_OK).write_to(&mut buf)?;
    buf.extend_from_slice(&(devices.len() as u32).to_be_bytes());
    for dev in devices {
        dev.write_to(&mut buf, true)?;
    }
    writer.write_all(&buf).await?;
    Ok(())
}

/// Write an OP_REP_IMPORT reply. `device` is present exactly when `status`
/// is [`ST_OK`].
pub async fn write_import_reply<W>(
    writer: &mut W,
    status: u32,
    device: Option<&ExportedDevice>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    OpHeader::new(OP_REP_IMPORT, status).write_to(&mut buf)?;
    if let Some(dev) = device {
        dev.write_to(&mut buf, false)?;
    }
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read one URB-mode request. Returns None on a connection close at a
/// message boundary.
pub async fn read_urb_request<R>(reader: &mut R) -> Result<Option<UrbRequest>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; URB_HEADER_SIZE];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    // Peek at the command and OUT length to know how much data follows.
    let mut cursor = Cursor::new(&head[..]);
    let command = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
    let mut message = head.to_vec();
    if command == CMD_SUBMIT {
        cursor.set_position(12);
        let direction = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
        cursor.set_position(24);
        let buffer_length = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
        if direction == crate::DIR_OUT {
            if buffer_length > MAX_TRANSFER_SIZE {
                return Err(WireError::TransferTooLarge(buffer_length));
            }
            let mut data = vec![0u8; buffer_length as usize];
            reader.read_exact(&mut data).await?;
            message.extend_from_slice(&data);
        }
    }

    UrbRequest::unmarshal(&message).map(Some)
}

/// Write one URB-mode reply.
pub async fn write_urb_reply<W>(writer: &mut W, reply: &UrbReply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&reply.marshal()).await?;
    Ok(())
}

// --- Client-side helpers -------------------------------------------------

/// Write an op-mode request (client side).
pub async fn write_op_request<W>(writer: &mut W, request: &OpRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    match request {
        OpRequest::DevList => {
            OpHeader::new(crate::OP_REQ_DEVLIST, 0).write_to(&mut buf)?;
        }
        OpRequest::Import { busid } => {
            OpHeader::new(OP_REQ_IMPORT, 0).write_to(&mut buf)?;
            let mut fixed = [0u8; BUSID_SIZE];
            let bytes = busid.as_bytes();
            let n = bytes.len().min(BUSID_SIZE);
            fixed[..n].copy_from_slice(&bytes[..n]);
            buf.extend_from_slice(&fixed);
        }
    }
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read an OP_REP_DEVLIST reply (client side).
pub async fn read_devlist_reply<R>(reader: &mut R) -> Result<Vec<ExportedDevice>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 12];
    reader.read_exact(&mut head).await?;
    let mut cursor = Cursor::new(&head[..]);
    let header = OpHeader::read_from(&mut cursor)?;
    if header.code != OP_REP_DEVLIST {
        return Err(WireError::UnknownOp(header.code));
    }
    let count = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;

    // Fixed part of one device block; the last byte is the interface count.
    const FIXED_LEN: usize = crate::PATH_SIZE + BUSID_SIZE + 12 + 6 + 6;
    let mut devices = Vec::new();
    for _ in 0..count {
        let mut block = vec![0u8; FIXED_LEN];
        reader.read_exact(&mut block).await?;
        let num_interfaces = block[FIXED_LEN - 1] as usize;
        let mut ifaces = vec![0u8; num_interfaces * 4];
        reader.read_exact(&mut ifaces).await?;
        block.extend_from_slice(&ifaces);
        devices.push(ExportedDevice::read_from(&mut Cursor::new(&block), true)?);
    }
    Ok(devices)
}

/// Read an OP_REP_IMPORT reply (client side). Returns the status and, on
/// success, the imported device block.
pub async fn read_import_reply<R>(reader: &mut R) -> Result<(u32, Option<ExportedDevice>)>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 8];
    reader.read_exact(&mut head).await?;
    let header = OpHeader::read_from(&mut Cursor::new(&head))?;
    if header.code != OP_REP_IMPORT {
        return Err(WireError::UnknownOp(header.code));
    }
    if header.status != ST_OK {
        return Ok((header.status, None));
    }
    let mut block = vec![0u8; crate::PATH_SIZE + BUSID_SIZE + 12 + 6 + 6];
    reader.read_exact(&mut block).await?;
    let device = ExportedDevice::read_from(&mut Cursor::new(&block), false)?;
    Ok((ST_OK, Some(device)))
}

/// Write a URB-mode request (client side).
pub async fn write_urb_request<W>(writer: &mut W, request: &UrbRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&request.marshal()).await?;
    Ok(())
}

/// Read one URB-mode reply (client side).
pub async fn read_urb_reply<R>(reader: &mut R) -> Result<UrbReply>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; URB_HEADER_SIZE];
    reader.read_exact(&mut head).await?;

    let mut cursor = Cursor::new(&head[..]);
    let command = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
    let mut message = head.to_vec();
    if command == crate::RET_SUBMIT {
        cursor.set_position(12);
        let direction = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
        cursor.set_position(20);
        let _status = ReadBytesExt::read_i32::<BigEndian>(&mut cursor)?;
        let actual_length = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
        if direction == crate::DIR_IN {
            if actual_length > MAX_TRANSFER_SIZE {
                return Err(WireError::TransferTooLarge(actual_length));
            }
            let mut data = vec![0u8; actual_length as usize];
            reader.read_exact(&mut data).await?;
            message.extend_from_slice(&data);
        }
    }

    UrbReply::unmarshal(&message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CmdSubmit, InterfaceInfo, RetSubmit, UrbHeader};
    use crate::{DIR_IN, DIR_OUT};
    use std::io::Cursor as SyncCursor;

    fn sample_device() -> ExportedDevice {
        ExportedDevice {
            path: "/sys/devices/virtual/usb/1-1".into(),
            busid: "1-1".into(),
            busnum: 1,
            devnum: 1,
            speed: 2,
            id_vendor: 0x045e,
            id_product: 0x028e,
            bcd_device: 0x0114,
            device_class: 0xFF,
            device_sub_class: 0xFF,
            device_protocol: 0xFF,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![InterfaceInfo {
                interface_class: 0xFF,
                interface_sub_class: 0x5D,
                interface_protocol: 0x01,
            }],
        }
    }

    #[tokio::test]
    async fn test_devlist_exchange() {
        let mut wire = Vec::new();
        write_op_request(&mut wire, &OpRequest::DevList).await.unwrap();
        let mut reader = SyncCursor::new(wire);
        let (header, request) = read_op_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(header.version, crate::USBIP_VERSION);
        assert_eq!(request, OpRequest::DevList);

        let mut reply = Vec::new();
        write_devlist_reply(&mut reply, &[sample_device()]).await.unwrap();
        let mut reader = SyncCursor::new(reply);
        let devices = read_devlist_reply(&mut reader).await.unwrap();
        assert_eq!(devices, vec![sample_device()]);
    }

    #[tokio::test]
    async fn test_import_exchange() {
        let mut wire = Vec::new();
        write_op_request(&mut wire, &OpRequest::Import { busid: "1-1".into() })
            .await
            .unwrap();
        let mut reader = SyncCursor::new(wire);
        let (_, request) = read_op_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request, OpRequest::Import { busid: "1-1".into() });

        let mut reply = Vec::new();
        write_import_reply(&mut reply, ST_OK, Some(&sample_device()))
            .await
            .unwrap();
        let mut reader = SyncCursor::new(reply);
        let (status, device) = read_import_reply(&mut reader).await.unwrap();
        assert_eq!(status, ST_OK);
        let device = device.unwrap();
        assert_eq!(device.busid, "1-1");
        assert!(device.interfaces.is_empty());
    }

    #[tokio::test]
    async fn test_import_failure_has_no_device_block() {
        let mut reply = Vec::new();
        write_import_reply(&mut reply, crate::ST_NA, None).await.unwrap();
        assert_eq!(reply.len(), 8);
        let mut reader = SyncCursor::new(reply);
        let (status, device) = read_import_reply(&mut reader).await.unwrap();
        assert_eq!(status, crate::ST_NA);
        assert!(device.is_none());
    }

    #[tokio::test]
    async fn test_urb_request_roundtrip_over_wire() {
        let request = UrbRequest::Submit {
            header: UrbHeader {
                command: CMD_SUBMIT,
                seqnum: 1,
                devid: (1 << 16) | 1,
                direction: DIR_OUT,
                ep: 1,
            },
            cmd: CmdSubmit {
                transfer_flags: 0,
                transfer_buffer_length: 2,
                start_frame: 0,
                number_of_packets: 0,
                interval: 0,
                setup: [0; 8],
            },
            data: vec![0xFF, 0x20],
        };
        let mut wire = Vec::new();
        write_urb_request(&mut wire, &request).await.unwrap();
        let mut reader = SyncCursor::new(wire);
        let decoded = read_urb_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn test_urb_reply_roundtrip_over_wire() {
        let reply = UrbReply::Submit {
            header: UrbHeader {
                command: crate::RET_SUBMIT,
                seqnum: 1,
                devid: (1 << 16) | 1,
                direction: DIR_IN,
                ep: 1,
            },
            ret: RetSubmit::success(4),
            data: vec![1, 2, 3, 4],
        };
        let mut wire = Vec::new();
        write_urb_reply(&mut wire, &reply).await.unwrap();
        let mut reader = SyncCursor::new(wire);
        let decoded = read_urb_reply(&mut reader).await.unwrap();
        assert_eq!(decoded, reply);
    }

    #[tokio::test]
    async fn test_eof_at_message_boundary() {
        let mut reader = SyncCursor::new(Vec::new());
        assert!(read_urb_request(&mut reader).await.unwrap().is_none());
        let mut reader = SyncCursor::new(Vec::new());
        assert!(read_op_request(&mut reader).await.unwrap().is_none());
    }
}
