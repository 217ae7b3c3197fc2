//! USB/IP message types and their binary layout
//!
//! Every struct encodes to and decodes from the exact wire layout; marshal
//! and unmarshal are inverses for all known message shapes.

use crate::error::{Result, WireError};
use crate::{
    BUSID_SIZE, CMD_SUBMIT, CMD_UNLINK, DIR_OUT, MAX_TRANSFER_SIZE, OP_REQ_DEVLIST,
    OP_REQ_IMPORT, PATH_SIZE, RET_SUBMIT, RET_UNLINK, USBIP_VERSION,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Common 8-byte prefix of op-mode messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    pub fn new(code: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status,
        }
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            version: r.read_u16::<BigEndian>()?,
            code: r.read_u16::<BigEndian>()?,
            status: r.read_u32::<BigEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u16::<BigEndian>(self.version)?;
        w.write_u16::<BigEndian>(self.code)?;
        w.write_u32::<BigEndian>(self.status)?;
        Ok(())
    }
}

/// A parsed op-mode request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRequest {
    DevList,
    Import { busid: String },
}

impl OpRequest {
    /// Parse the request following an already-read [`OpHeader`].
    pub fn read_body<R: Read>(header: &OpHeader, r: &mut R) -> Result<Self> {
        match header.code {
            OP_REQ_DEVLIST => Ok(OpRequest::DevList),
            OP_REQ_IMPORT => {
                let busid = read_fixed_str(r, BUSID_SIZE)?;
                Ok(OpRequest::Import { busid })
            }
            other => Err(WireError::UnknownOp(other)),
        }
    }
}

/// One interface entry of an OP_REP_DEVLIST device block (4 bytes with
/// padding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
}

impl InterfaceInfo {
    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let info = Self {
            interface_class: r.read_u8()?,
            interface_sub_class: r.read_u8()?,
            interface_protocol: r.read_u8()?,
        };
        r.read_u8()?; // padding
        Ok(info)
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u8(self.interface_class)?;
        w.write_u8(self.interface_sub_class)?;
        w.write_u8(self.interface_protocol)?;
        w.write_u8(0)?;
        Ok(())
    }
}

/// Device block of OP_REP_DEVLIST / OP_REP_IMPORT. The import reply carries
/// the same block without the trailing interface list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

impl ExportedDevice {
    pub fn write_to<W: Write>(&self, w: &mut W, with_interfaces: bool) -> Result<()> {
        write_fixed_str(w, &self.path, PATH_SIZE)?;
        write_fixed_str(w, &self.busid, BUSID_SIZE)?;
        w.write_u32::<BigEndian>(self.busnum)?;
        w.write_u32::<BigEndian>(self.devnum)?;
        w.write_u32::<BigEndian>(self.speed)?;
        w.write_u16::<BigEndian>(self.id_vendor)?;
        w.write_u16::<BigEndian>(self.id_product)?;
        w.write_u16::<BigEndian>(self.bcd_device)?;
        w.write_u8(self.device_class)?;
        w.write_u8(self.device_sub_class)?;
        w.write_u8(self.device_protocol)?;
        w.write_u8(self.configuration_value)?;
        w.write_u8(self.num_configurations)?;
        w.write_u8(self.interfaces.len() as u8)?;
        if with_interfaces {
            for iface in &self.interfaces {
                iface.write_to(w)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R, with_interfaces: bool) -> Result<Self> {
        let path = read_fixed_str(r, PATH_SIZE)?;
        let busid = read_fixed_str(r, BUSID_SIZE)?;
        let busnum = r.read_u32::<BigEndian>()?;
        let devnum = r.read_u32::<BigEndian>()?;
        let speed = r.read_u32::<BigEndian>()?;
        let id_vendor = r.read_u16::<BigEndian>()?;
        let id_product = r.read_u16::<BigEndian>()?;
        let bcd_device = r.read_u16::<BigEndian>()?;
        let device_class = r.read_u8()?;
        let device_sub_class = r.read_u8()?;
        let device_protocol = r.read_u8()?;
        let configuration_value = r.read_u8()?;
        let num_configurations = r.read_u8()?;
        let num_interfaces = r.read_u8()?;
        let mut interfaces = Vec::new();
        if with_interfaces {
            for _ in 0..num_interfaces {
                interfaces.push(InterfaceInfo::read_from(r)?);
            }
        }
        Ok(Self {
            path,
            busid,
            busnum,
            devnum,
            speed,
            id_vendor,
            id_product,
            bcd_device,
            device_class,
            device_sub_class,
            device_protocol,
            configuration_value,
            num_configurations,
            interfaces,
        })
    }
}

/// The 20 meaningful bytes at the front of every URB-mode message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbHeader {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    /// 0 = OUT, 1 = IN
    pub direction: u32,
    pub ep: u32,
}

impl UrbHeader {
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            command: r.read_u32::<BigEndian>()?,
            seqnum: r.read_u32::<BigEndian>()?,
            devid: r.read_u32::<BigEndian>()?,
            direction: r.read_u32::<BigEndian>()?,
            ep: r.read_u32::<BigEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<BigEndian>(self.command)?;
        w.write_u32::<BigEndian>(self.seqnum)?;
        w.write_u32::<BigEndian>(self.devid)?;
        w.write_u32::<BigEndian>(self.direction)?;
        w.write_u32::<BigEndian>(self.ep)?;
        Ok(())
    }

    pub fn is_out(&self) -> bool {
        self.direction == DIR_OUT
    }
}

/// CMD_SUBMIT tail (28 bytes after the common header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSubmit {
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    /// Raw USB setup packet (little-endian fields)
    pub setup: [u8; 8],
}

impl CmdSubmit {
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let transfer_flags = r.read_u32::<BigEndian>()?;
        let transfer_buffer_length = r.read_u32::<BigEndian>()?;
        let start_frame = r.read_u32::<BigEndian>()?;
        let number_of_packets = r.read_u32::<BigEndian>()?;
        let interval = r.read_u32::<BigEndian>()?;
        let mut setup = [0u8; 8];
        r.read_exact(&mut setup)?;
        Ok(Self {
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<BigEndian>(self.transfer_flags)?;
        w.write_u32::<BigEndian>(self.transfer_buffer_length)?;
        w.write_u32::<BigEndian>(self.start_frame)?;
        w.write_u32::<BigEndian>(self.number_of_packets)?;
        w.write_u32::<BigEndian>(self.interval)?;
        w.write_all(&self.setup)?;
        Ok(())
    }
}

/// RET_SUBMIT tail (28 bytes after the common header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmit {
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    pub setup: [u8; 8],
}

impl RetSubmit {
    pub fn success(actual_length: u32) -> Self {
        Self {
            status: 0,
            actual_length,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            setup: [0; 8],
        }
    }

    pub fn error(status: i32) -> Self {
        Self {
            status,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            setup: [0; 8],
        }
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let status = r.read_i32::<BigEndian>()?;
        let actual_length = r.read_u32::<BigEndian>()?;
        let start_frame = r.read_u32::<BigEndian>()?;
        let number_of_packets = r.read_u32::<BigEndian>()?;
        let error_count = r.read_u32::<BigEndian>()?;
        let mut setup = [0u8; 8];
        r.read_exact(&mut setup)?;
        Ok(Self {
            status,
            actual_length,
            start_frame,
            number_of_packets,
            error_count,
            setup,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<BigEndian>(self.status)?;
        w.write_u32::<BigEndian>(self.actual_length)?;
        w.write_u32::<BigEndian>(self.start_frame)?;
        w.write_u32::<BigEndian>(self.number_of_packets)?;
        w.write_u32::<BigEndian>(self.error_count)?;
        w.write_all(&self.setup)?;
        Ok(())
    }
}

/// CMD_UNLINK tail: the seqnum to cancel, then 24 bytes of padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    pub unlink_seqnum: u32,
}

impl CmdUnlink {
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let unlink_seqnum = r.read_u32::<BigEndian>()?;
        let mut pad = [0u8; 24];
        r.read_exact(&mut pad)?;
        Ok(Self { unlink_seqnum })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<BigEndian>(self.unlink_seqnum)?;
        w.write_all(&[0u8; 24])?;
        Ok(())
    }
}

/// RET_UNLINK tail: the unlink status, then 24 bytes of padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub status: i32,
}

impl RetUnlink {
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let status = r.read_i32::<BigEndian>()?;
        let mut pad = [0u8; 24];
        r.read_exact(&mut pad)?;
        Ok(Self { status })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<BigEndian>(self.status)?;
        w.write_all(&[0u8; 24])?;
        Ok(())
    }
}

/// A complete URB-mode request as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbRequest {
    Submit {
        header: UrbHeader,
        cmd: CmdSubmit,
        /// OUT data stage; empty for IN submissions
        data: Vec<u8>,
    },
    Unlink {
        header: UrbHeader,
        unlink_seqnum: u32,
    },
}

impl UrbRequest {
    /// Decode a request from a full message buffer.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(bytes);
        let header = UrbHeader::read_from(&mut r)?;
        match header.command {
            CMD_SUBMIT => {
                let cmd = CmdSubmit::read_from(&mut r)?;
                let mut data = Vec::new();
                if header.is_out() {
                    if cmd.transfer_buffer_length > MAX_TRANSFER_SIZE {
                        return Err(WireError::TransferTooLarge(cmd.transfer_buffer_length));
                    }
                    data = vec![0u8; cmd.transfer_buffer_length as usize];
                    r.read_exact(&mut data)?;
                }
                Ok(UrbRequest::Submit { header, cmd, data })
            }
            CMD_UNLINK => {
                let unlink = CmdUnlink::read_from(&mut r)?;
                Ok(UrbRequest::Unlink {
                    header,
                    unlink_seqnum: unlink.unlink_seqnum,
                })
            }
            other => Err(WireError::UnknownCommand(other)),
        }
    }

    /// Encode the request to its wire form.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            UrbRequest::Submit { header, cmd, data } => {
                header.write_to(&mut buf).expect("vec write");
                cmd.write_to(&mut buf).expect("vec write");
                if header.is_out() {
                    buf.extend_from_slice(data);
                }
            }
            UrbRequest::Unlink {
                header,
                unlink_seqnum,
            } => {
                header.write_to(&mut buf).expect("vec write");
                CmdUnlink {
                    unlink_seqnum: *unlink_seqnum,
                }
                .write_to(&mut buf)
                .expect("vec write");
            }
        }
        buf
    }
}

/// A complete URB-mode reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbReply {
    Submit {
        header: UrbHeader,
        ret: RetSubmit,
        /// IN data stage; empty for OUT completions
        data: Vec<u8>,
    },
    Unlink { header: UrbHeader, ret: RetUnlink },
}

impl UrbReply {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            UrbReply::Submit { header, ret, data } => {
                header.write_to(&mut buf).expect("vec write");
                ret.write_to(&mut buf).expect("vec write");
                buf.extend_from_slice(data);
            }
            UrbReply::Unlink { header, ret } => {
                header.write_to(&mut buf).expect("vec write");
                ret.write_to(&mut buf).expect("vec write");
            }
        }
        buf
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(bytes);
        let header = UrbHeader::read_from(&mut r)?;
        match header.command {
            RET_SUBMIT => {
                let ret = RetSubmit::read_from(&mut r)?;
                let mut data = Vec::new();
                if header.direction == crate::DIR_IN {
                    if ret.actual_length > MAX_TRANSFER_SIZE {
                        return Err(WireError::TransferTooLarge(ret.actual_length));
                    }
                    data = vec![0u8; ret.actual_length as usize];
                    r.read_exact(&mut data)?;
                }
                Ok(UrbReply::Submit { header, ret, data })
            }
            RET_UNLINK => {
                let ret = RetUnlink::read_from(&mut r)?;
                Ok(UrbReply::Unlink { header, ret })
            }
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

fn write_fixed_str<W: Write>(w: &mut W, s: &str, len: usize) -> Result<()> {
    let mut buf = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    buf[..n].copy_from_slice(&bytes[..n]);
    w.write_all(&buf)?;
    Ok(())
}

fn read_fixed_str<R: Read>(r: &mut R, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8(buf[..end].to_vec()).map_err(|_| WireError::BadBusId)
}
