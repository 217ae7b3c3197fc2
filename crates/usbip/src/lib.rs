//! USB/IP wire protocol
//!
//! Message types and codecs for the USB/IP protocol as spoken by the Linux
//! vhci_hcd driver (kernel: drivers/usb/usbip/usbip_common.h). All integers
//! are big-endian on the wire, with one exception: the 8-byte control setup
//! packet travels raw and keeps its little-endian USB field layout.
//!
//! A connection starts in *op mode* (`OP_REQ_DEVLIST` / `OP_REQ_IMPORT`
//! exchanges prefixed with the protocol version) and, after a successful
//! import, switches to *URB mode* (48-byte-header `CMD_SUBMIT` /
//! `CMD_UNLINK` traffic answered by `RET_SUBMIT` / `RET_UNLINK`).

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    read_devlist_reply, read_import_reply, read_op_request, read_urb_reply, read_urb_request,
    write_devlist_reply, write_import_reply, write_op_request, write_urb_reply, write_urb_request,
};
pub use error::{Result, WireError};
pub use types::{
    CmdSubmit, CmdUnlink, ExportedDevice, InterfaceInfo, OpHeader, OpRequest, RetSubmit,
    RetUnlink, UrbHeader, UrbReply, UrbRequest,
};

/// Protocol version prefix of op-mode messages.
pub const USBIP_VERSION: u16 = 0x0111;

// Op-mode codes.
pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;
pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;

// URB-mode commands.
pub const CMD_SUBMIT: u32 = 0x0000_0001;
pub const CMD_UNLINK: u32 = 0x0000_0002;
pub const RET_SUBMIT: u32 = 0x0000_0003;
pub const RET_UNLINK: u32 = 0x0000_0004;

// URB direction codes.
pub const DIR_OUT: u32 = 0;
pub const DIR_IN: u32 = 1;

/// Op-mode status: success.
pub const ST_OK: u32 = 0;
/// Op-mode status: device not available.
pub const ST_NA: u32 = 1;

// URB status codes (negated Linux errno values).
pub const EPIPE: i32 = -32;
pub const ECONNRESET: i32 = -104;
pub const EBUSY: i32 = -16;
pub const ENODEV: i32 = -19;

/// Fixed size of the busid field in op-mode messages.
pub const BUSID_SIZE: usize = 32;
/// Fixed size of the path field in exported-device blocks.
pub const PATH_SIZE: usize = 256;
/// Size of the URB-mode common header.
pub const URB_HEADER_SIZE: usize = 48;

/// Upper bound on a single transfer buffer; larger requests are rejected as
/// malformed rather than allocated.
pub const MAX_TRANSFER_SIZE: u32 = 1024 * 1024;
