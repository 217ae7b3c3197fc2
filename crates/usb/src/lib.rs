//! USB device model for the VIIPER emulator
//!
//! This crate carries everything a synthetic device is made of: byte-exact
//! encoders for standard USB and HID report descriptors, the setup-packet
//! codec, the [`Device`] capability trait together with the shared endpoint
//! machinery every device embeds, and the stream pump that bridges a client
//! TCP connection to a device.

pub mod desc;
pub mod device;
pub mod hid;
pub mod setup;
pub mod stream;

pub use desc::{
    ClassSpecificDescriptor, ConfigHeader, Descriptor, DescriptorError, DeviceDescriptor,
    EndpointDescriptor, HidDescriptor, HidFunction, HidSubDescriptor, InterfaceConfig,
    InterfaceDescriptor, encode_string_descriptor,
};
pub use device::{Device, DeviceIo, ExportMeta, InTicket, handle_control_request};
pub use setup::SetupPacket;
pub use stream::run_device_stream;
