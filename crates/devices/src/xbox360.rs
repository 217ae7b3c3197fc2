//! Xbox 360 wired controller
//!
//! Input frame (client -> device, 14 bytes, little-endian):
//! buttons u32, LT u8, RT u8, LX i16, LY i16, RX i16, RY i16.
//!
//! The IN report is the 20-byte xinput-style message the wired controller
//! emits. Rumble commands arriving on the OUT endpoint are forwarded to the
//! stream client as a 2-byte output frame (left motor, right motor).
//!
//! The interface is vendor-specific (0xFF/0x5D/0x01) and exposes the opaque
//! 0x21 class descriptor the real controller carries; there is no HID
//! function.

use common::{Error, Result};
use std::sync::Mutex;
use usb::desc::{
    ClassSpecificDescriptor, ConfigHeader, Descriptor, DeviceDescriptor, EndpointDescriptor,
    InterfaceConfig, InterfaceDescriptor,
};
use usb::device::{Device, DeviceIo};
use usb::setup::SetupPacket;

pub const INPUT_FRAME_LEN: usize = 14;
pub const REPORT_LEN: usize = 20;
pub const OUTPUT_FRAME_LEN: usize = 2;

/// Interrupt-IN endpoint number carrying input reports.
pub const EP_IN: u8 = 1;
/// Interrupt-OUT endpoint number receiving rumble/LED commands.
pub const EP_OUT: u8 = 1;

// Button bits (xinput layout).
pub const BTN_DPAD_UP: u32 = 0x0001;
pub const BTN_DPAD_DOWN: u32 = 0x0002;
pub const BTN_DPAD_LEFT: u32 = 0x0004;
pub const BTN_DPAD_RIGHT: u32 = 0x0008;
pub const BTN_START: u32 = 0x0010;
pub const BTN_BACK: u32 = 0x0020;
pub const BTN_LEFT_THUMB: u32 = 0x0040;
pub const BTN_RIGHT_THUMB: u32 = 0x0080;
pub const BTN_LB: u32 = 0x0100;
pub const BTN_RB: u32 = 0x0200;
pub const BTN_GUIDE: u32 = 0x0400;
pub const BTN_A: u32 = 0x1000;
pub const BTN_B: u32 = 0x2000;
pub const BTN_X: u32 = 0x4000;
pub const BTN_Y: u32 = 0x8000;

/// One snapshot of controller state as sent by stream clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputState {
    pub buttons: u32,
    pub lt: u8,
    pub rt: u8,
    pub lx: i16,
    pub ly: i16,
    pub rx: i16,
    pub ry: i16,
}

impl InputState {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < INPUT_FRAME_LEN {
            return None;
        }
        Some(Self {
            buttons: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            lt: data[4],
            rt: data[5],
            lx: i16::from_le_bytes([data[6], data[7]]),
            ly: i16::from_le_bytes([data[8], data[9]]),
            rx: i16::from_le_bytes([data[10], data[11]]),
            ry: i16::from_le_bytes([data[12], data[13]]),
        })
    }

    pub fn bytes(&self) -> [u8; INPUT_FRAME_LEN] {
        let mut b = [0u8; INPUT_FRAME_LEN];
        b[0..4].copy_from_slice(&self.buttons.to_le_bytes());
        b[4] = self.lt;
        b[5] = self.rt;
        b[6..8].copy_from_slice(&self.lx.to_le_bytes());
        b[8..10].copy_from_slice(&self.ly.to_le_bytes());
        b[10..12].copy_from_slice(&self.rx.to_le_bytes());
        b[12..14].copy_from_slice(&self.ry.to_le_bytes());
        b
    }

    /// The 20-byte wired-controller report: message type 0x00, length 0x14,
    /// button bitfield, triggers, then the four stick axes.
    pub fn build_report(&self) -> Vec<u8> {
        let mut b = vec![0u8; REPORT_LEN];
        b[0] = 0x00;
        b[1] = 0x14;
        b[2..4].copy_from_slice(&((self.buttons & 0xFFFF) as u16).to_le_bytes());
        b[8] = self.lt;
        b[9] = self.rt;
        b[10..12].copy_from_slice(&self.lx.to_le_bytes());
        b[12..14].copy_from_slice(&self.ly.to_le_bytes());
        b[14..16].copy_from_slice(&self.rx.to_le_bytes());
        b[16..18].copy_from_slice(&self.ry.to_le_bytes());
        b
    }
}

/// Rumble output frame (device -> client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RumbleState {
    pub left_motor: u8,
    pub right_motor: u8,
}

impl RumbleState {
    /// Decode a rumble command from an OUT transfer. An 8-byte xinput
    /// rumble message (`00 08 00 LL RR ...`) carries the motors at offsets
    /// 3 and 4; any other payload of at least two bytes is taken raw.
    pub fn from_out_transfer(data: &[u8]) -> Option<Self> {
        if data.len() >= 8 && data[0] == 0x00 && data[1] == 0x08 {
            return Some(Self {
                left_motor: data[3],
                right_motor: data[4],
            });
        }
        if data.len() >= 2 {
            return Some(Self {
                left_motor: data[0],
                right_motor: data[1],
            });
        }
        None
    }

    pub fn bytes(&self) -> [u8; OUTPUT_FRAME_LEN] {
        [self.left_motor, self.right_motor]
    }
}

pub struct Xbox360 {
    descriptor: Descriptor,
    io: DeviceIo,
    state: Mutex<InputState>,
}

impl Xbox360 {
    pub fn new() -> Self {
        Self {
            descriptor: build_descriptor(),
            io: DeviceIo::new(),
            state: Mutex::new(InputState::default()),
        }
    }
}

impl Default for Xbox360 {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Xbox360 {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn io(&self) -> &DeviceIo {
        &self.io
    }

    fn type_name(&self) -> &'static str {
        "xbox360"
    }

    fn input_frame_len(&self) -> usize {
        INPUT_FRAME_LEN
    }

    fn output_frame_len(&self) -> Option<usize> {
        Some(OUTPUT_FRAME_LEN)
    }

    fn handle_input_frame(&self, frame: &[u8]) {
        let Some(state) = InputState::parse(frame) else {
            return;
        };
        *self.state.lock().unwrap() = state;
        self.io.complete_in(EP_IN, state.build_report());
    }

    fn handle_class_control(&self, setup: &SetupPacket, _data: &[u8]) -> Result<Vec<u8>> {
        // The wired controller answers a couple of vendor IN requests during
        // driver init; an empty data stage keeps the importer going.
        if setup.is_vendor() && setup.is_in() {
            return Ok(vec![0; setup.length as usize]);
        }
        Err(Error::NotFound(format!(
            "control request {:#04x}",
            setup.request
        )))
    }

    fn handle_out(&self, ep: u8, data: &[u8]) -> Result<()> {
        if ep != EP_OUT {
            return Err(Error::NotFound(format!("endpoint {}", ep)));
        }
        if let Some(rumble) = RumbleState::from_out_transfer(data) {
            self.io.push_output(rumble.bytes().to_vec());
        }
        Ok(())
    }
}

fn build_descriptor() -> Descriptor {
    Descriptor {
        device: DeviceDescriptor {
            bcd_usb: 0x0200,
            device_class: 0xFF,
            device_sub_class: 0xFF,
            device_protocol: 0xFF,
            max_packet_size0: 8,
            id_vendor: 0x045e,
            id_product: 0x028e,
            bcd_device: 0x0114,
            i_manufacturer: 1,
            i_product: 2,
            i_serial_number: 3,
            num_configurations: 1,
            speed: 2,
        },
        config: ConfigHeader {
            attributes: 0xA0, // bus powered, remote wakeup
            max_power: 250,
            ..Default::default()
        },
        interfaces: vec![InterfaceConfig {
            descriptor: InterfaceDescriptor {
                interface_class: 0xFF,
                interface_sub_class: 0x5D,
                interface_protocol: 0x01,
                ..Default::default()
            },
            endpoints: vec![
                EndpointDescriptor {
                    endpoint_address: 0x80 | EP_IN,
                    attributes: 0x03,
                    max_packet_size: 32,
                    interval: 4,
                },
                EndpointDescriptor {
                    endpoint_address: EP_OUT,
                    attributes: 0x03,
                    max_packet_size: 32,
                    interval: 8,
                },
            ],
            hid: None,
            class_descriptors: vec![ClassSpecificDescriptor {
                descriptor_type: 0x21,
                payload: vec![
                    0x00, 0x01, 0x01, 0x25, 0x81, 0x14, 0x00, 0x00, 0x00, 0x00, 0x13, 0x01,
                    0x08, 0x00, 0x00,
                ],
            }],
        }],
        strings: [
            (1, "©Microsoft Corporation".to_string()),
            (2, "Controller".to_string()),
            (3, "08FEC93".to_string()),
        ]
        .into(),
    }
}
