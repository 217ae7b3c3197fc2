//! Byte-exact builders for USB standard descriptors
//!
//! The value types mirror the USB 2.0 descriptor layouts. `bLength` and
//! `bDescriptorType` are filled automatically; multi-byte fields are
//! little-endian. The configuration descriptor is serialized with a
//! `wTotalLength` placeholder that is back-patched once all interface
//! blocks have been written.

use crate::hid;
use std::collections::BTreeMap;
use thiserror::Error;

// USB descriptor type constants.
pub const DEVICE_DESC_TYPE: u8 = 0x01;
pub const CONFIG_DESC_TYPE: u8 = 0x02;
pub const STRING_DESC_TYPE: u8 = 0x03;
pub const INTERFACE_DESC_TYPE: u8 = 0x04;
pub const ENDPOINT_DESC_TYPE: u8 = 0x05;
pub const HID_DESC_TYPE: u8 = 0x21;
pub const REPORT_DESC_TYPE: u8 = 0x22;

// Fixed descriptor lengths from the USB spec.
pub const DEVICE_DESC_LEN: u8 = 18;
pub const CONFIG_DESC_LEN: u8 = 9;
pub const INTERFACE_DESC_LEN: u8 = 9;
pub const ENDPOINT_DESC_LEN: u8 = 7;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("HID descriptor has no subordinate descriptors")]
    NoSubordinates,

    #[error("HID report descriptor too large: {0} bytes")]
    ReportTooLarge(usize),

    #[error("HID report encoding failed: {0}")]
    Report(#[from] hid::EncodeError),
}

impl From<DescriptorError> for common::Error {
    fn from(e: DescriptorError) -> Self {
        common::Error::Encoding(e.to_string())
    }
}

/// All static descriptor/config data for one device.
#[derive(Debug, Clone, Default)]
pub struct Descriptor {
    pub device: DeviceDescriptor,
    pub config: ConfigHeader,
    pub interfaces: Vec<InterfaceConfig>,
    pub strings: BTreeMap<u8, String>,
}

impl Descriptor {
    /// The 18-byte device descriptor.
    pub fn device_bytes(&self) -> Vec<u8> {
        let d = &self.device;
        let mut b = Vec::with_capacity(DEVICE_DESC_LEN as usize);
        b.push(DEVICE_DESC_LEN);
        b.push(DEVICE_DESC_TYPE);
        b.extend_from_slice(&d.bcd_usb.to_le_bytes());
        b.push(d.device_class);
        b.push(d.device_sub_class);
        b.push(d.device_protocol);
        b.push(d.max_packet_size0);
        b.extend_from_slice(&d.id_vendor.to_le_bytes());
        b.extend_from_slice(&d.id_product.to_le_bytes());
        b.extend_from_slice(&d.bcd_device.to_le_bytes());
        b.push(d.i_manufacturer);
        b.push(d.i_product);
        b.push(d.i_serial_number);
        b.push(d.num_configurations);
        b
    }

    /// The full configuration descriptor: header, then per interface the
    /// interface descriptor, class-specific blobs, HID class descriptor and
    /// endpoint descriptors. `wTotalLength` is back-patched at the end.
    pub fn config_bytes(&self) -> Result<Vec<u8>, DescriptorError> {
        let mut b = Vec::new();
        self.config.write(&mut b, self.interfaces.len() as u8);

        for iface in &self.interfaces {
            iface.descriptor.write(&mut b, iface.endpoints.len() as u8);
            for cd in &iface.class_descriptors {
                b.extend_from_slice(&cd.bytes());
            }
            if let Some(hid_fn) = &iface.hid {
                let report_len = hid_fn.report_len()?;
                hid_fn.descriptor.write(&mut b, report_len)?;
            }
            for ep in &iface.endpoints {
                ep.write(&mut b);
            }
        }

        let total = b.len() as u16;
        b[2..4].copy_from_slice(&total.to_le_bytes());
        Ok(b)
    }

    /// String descriptor for `index`, or None if the device does not carry
    /// one. Index 0 is the language id table (US English).
    pub fn string_bytes(&self, index: u8) -> Option<Vec<u8>> {
        if index == 0 {
            return Some(vec![4, STRING_DESC_TYPE, 0x09, 0x04]);
        }
        self.strings
            .get(&index)
            .map(|s| encode_string_descriptor(s))
    }

    /// Report descriptor bytes of the HID function on `interface`.
    pub fn report_bytes(&self, interface: u8) -> Option<Result<Vec<u8>, DescriptorError>> {
        self.interfaces
            .get(interface as usize)
            .and_then(|i| i.hid.as_ref())
            .map(|f| f.report_bytes())
    }

    /// HID class descriptor (0x21) bytes of the HID function on `interface`.
    pub fn hid_bytes(&self, interface: u8) -> Option<Result<Vec<u8>, DescriptorError>> {
        self.interfaces
            .get(interface as usize)
            .and_then(|i| i.hid.as_ref())
            .map(|f| f.descriptor_bytes())
    }

    pub fn num_interfaces(&self) -> u8 {
        self.interfaces.len() as u8
    }
}

/// Converts a UTF-8 string to a USB string descriptor:
/// `{bLength, 0x03, UTF-16LE code units…}`.
pub fn encode_string_descriptor(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut buf = Vec::with_capacity(2 + units.len() * 2);
    buf.push((2 + units.len() * 2) as u8);
    buf.push(STRING_DESC_TYPE);
    for u in units {
        buf.extend_from_slice(&u.to_le_bytes());
    }
    buf
}

/// Standard USB device descriptor. `bLength`/`bDescriptorType` are implied;
/// `speed` is the USB/IP speed code advertised to importers, not serialized.
#[derive(Debug, Clone, Default)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub num_configurations: u8,
    /// USB speed: 1=low, 2=full, 3=high, 4=super
    pub speed: u32,
}

/// Configuration descriptor header (9 bytes). `wTotalLength` and
/// `bNumInterfaces` are filled at serialization time.
#[derive(Debug, Clone)]
pub struct ConfigHeader {
    pub configuration_value: u8,
    pub i_configuration: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl Default for ConfigHeader {
    fn default() -> Self {
        Self {
            configuration_value: 1,
            i_configuration: 0,
            attributes: 0x80,
            max_power: 50,
        }
    }
}

impl ConfigHeader {
    fn write(&self, b: &mut Vec<u8>, num_interfaces: u8) {
        b.push(CONFIG_DESC_LEN);
        b.push(CONFIG_DESC_TYPE);
        b.extend_from_slice(&0u16.to_le_bytes()); // wTotalLength placeholder
        b.push(num_interfaces);
        b.push(self.configuration_value);
        b.push(self.i_configuration);
        b.push(self.attributes);
        b.push(self.max_power);
    }
}

/// All descriptors of a single interface.
#[derive(Debug, Clone, Default)]
pub struct InterfaceConfig {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,

    /// HID function of a HID-class interface (bInterfaceClass=0x03). If set,
    /// the HID class descriptor (0x21) is emitted inside the configuration
    /// descriptor and the report descriptor (0x22) is served via
    /// GET_DESCRIPTOR.
    pub hid: Option<HidFunction>,

    /// Additional interface-level class-specific descriptors, emitted after
    /// the interface descriptor and before the endpoints. Also used for
    /// vendor interfaces exposing opaque blobs (e.g. the 0x21 blob on
    /// Xbox360).
    pub class_descriptors: Vec<ClassSpecificDescriptor>,
}

/// Interface descriptor (9 bytes). `bNumEndpoints` is filled at
/// serialization time.
#[derive(Debug, Clone, Default)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    fn write(&self, b: &mut Vec<u8>, num_endpoints: u8) {
        b.push(INTERFACE_DESC_LEN);
        b.push(INTERFACE_DESC_TYPE);
        b.push(self.interface_number);
        b.push(self.alternate_setting);
        b.push(num_endpoints);
        b.push(self.interface_class);
        b.push(self.interface_sub_class);
        b.push(self.interface_protocol);
        b.push(self.i_interface);
    }
}

/// Endpoint descriptor (7 bytes).
#[derive(Debug, Clone, Default)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    fn write(&self, b: &mut Vec<u8>) {
        b.push(ENDPOINT_DESC_LEN);
        b.push(ENDPOINT_DESC_TYPE);
        b.push(self.endpoint_address);
        b.push(self.attributes);
        b.extend_from_slice(&self.max_packet_size.to_le_bytes());
        b.push(self.interval);
    }

    /// True for IN endpoints (high bit of the address).
    pub fn is_in(&self) -> bool {
        self.endpoint_address & 0x80 != 0
    }

    pub fn number(&self) -> u8 {
        self.endpoint_address & 0x0F
    }
}

/// One subordinate entry in the HID class descriptor.
///
/// If `descriptor_type` is 0x22 and `length` is 0, the length is auto-filled
/// from the sibling report descriptor at serialization time.
#[derive(Debug, Clone)]
pub struct HidSubDescriptor {
    pub descriptor_type: u8,
    pub length: u16,
}

/// HID class descriptor (0x21). `bLength` is 6 + 3*N where N is the number
/// of subordinate descriptors.
#[derive(Debug, Clone)]
pub struct HidDescriptor {
    pub bcd_hid: u16,
    pub country_code: u8,
    pub descriptors: Vec<HidSubDescriptor>,
}

impl HidDescriptor {
    fn write(&self, b: &mut Vec<u8>, report_len: u16) -> Result<(), DescriptorError> {
        if self.descriptors.is_empty() {
            return Err(DescriptorError::NoSubordinates);
        }
        b.push(6 + 3 * self.descriptors.len() as u8);
        b.push(HID_DESC_TYPE);
        b.extend_from_slice(&self.bcd_hid.to_le_bytes());
        b.push(self.country_code);
        b.push(self.descriptors.len() as u8);
        for sd in &self.descriptors {
            b.push(sd.descriptor_type);
            let len = if sd.descriptor_type == REPORT_DESC_TYPE && sd.length == 0 {
                report_len
            } else {
                sd.length
            };
            b.extend_from_slice(&len.to_le_bytes());
        }
        Ok(())
    }
}

/// Opaque class-specific interface descriptor. `bLength` is auto-filled;
/// `payload` contains all bytes after the (bLength, bDescriptorType) header.
#[derive(Debug, Clone)]
pub struct ClassSpecificDescriptor {
    pub descriptor_type: u8,
    pub payload: Vec<u8>,
}

impl ClassSpecificDescriptor {
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.push((2 + self.payload.len()) as u8);
        out.push(self.descriptor_type);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Bundles the HID class descriptor (0x21) and the report descriptor (0x22)
/// of a HID-class interface.
#[derive(Debug, Clone)]
pub struct HidFunction {
    pub descriptor: HidDescriptor,
    pub report: hid::Report,
}

impl HidFunction {
    fn report_len(&self) -> Result<u16, DescriptorError> {
        let bytes = self.report.bytes()?;
        if bytes.len() > 0xFFFF {
            return Err(DescriptorError::ReportTooLarge(bytes.len()));
        }
        Ok(bytes.len() as u16)
    }

    /// The HID class descriptor (0x21) bytes.
    pub fn descriptor_bytes(&self) -> Result<Vec<u8>, DescriptorError> {
        let report_len = self.report_len()?;
        let mut b = Vec::new();
        self.descriptor.write(&mut b, report_len)?;
        Ok(b)
    }

    /// The HID report descriptor (0x22) bytes.
    pub fn report_bytes(&self) -> Result<Vec<u8>, DescriptorError> {
        Ok(self.report.bytes()?)
    }
}
