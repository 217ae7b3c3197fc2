//! NKRO USB keyboard
//!
//! Input frame (client -> device, 33 bytes, little-endian):
//! modifiers u8, key bitmap [u8; 32] (one bit per HID usage 0..=255).
//!
//! IN report (34 bytes): modifiers, reserved 0x00, key bitmap.
//! Output frame (device -> client, 1 byte): LED bitmap, produced by either
//! an interrupt-OUT transfer or a HID SET_REPORT(Output).

use common::{Error, Result};
use std::sync::Mutex;
use usb::desc::{
    ConfigHeader, Descriptor, DeviceDescriptor, EndpointDescriptor, HidDescriptor, HidFunction,
    HidSubDescriptor, InterfaceConfig, InterfaceDescriptor, REPORT_DESC_TYPE,
};
use usb::device::{Device, DeviceIo};
use usb::hid::{
    self, CollectionKind, Item, MAIN_ABS, MAIN_CONST, MAIN_DATA, MAIN_VAR, Report,
};
use usb::setup::{
    self, HID_REPORT_TYPE_INPUT, HID_REPORT_TYPE_OUTPUT, SetupPacket,
};

pub const INPUT_FRAME_LEN: usize = 33;
pub const REPORT_LEN: usize = 34;
pub const OUTPUT_FRAME_LEN: usize = 1;

/// Interrupt-IN endpoint number carrying input reports.
pub const EP_IN: u8 = 1;
/// Interrupt-OUT endpoint number carrying LED reports.
pub const EP_OUT: u8 = 1;

// Modifier bits (HID usages 0xE0..=0xE7).
pub const MOD_LEFT_CTRL: u8 = 0x01;
pub const MOD_LEFT_SHIFT: u8 = 0x02;
pub const MOD_LEFT_ALT: u8 = 0x04;
pub const MOD_LEFT_GUI: u8 = 0x08;
pub const MOD_RIGHT_CTRL: u8 = 0x10;
pub const MOD_RIGHT_SHIFT: u8 = 0x20;
pub const MOD_RIGHT_ALT: u8 = 0x40;
pub const MOD_RIGHT_GUI: u8 = 0x80;

// LED bits of the output report.
pub const LED_NUM_LOCK: u8 = 0x01;
pub const LED_CAPS_LOCK: u8 = 0x02;
pub const LED_SCROLL_LOCK: u8 = 0x04;
pub const LED_COMPOSE: u8 = 0x08;
pub const LED_KANA: u8 = 0x10;

// Keyboard usage ids (HID Usage Tables, page 0x07).
pub const KEY_A: u8 = 0x04;
pub const KEY_B: u8 = 0x05;
pub const KEY_C: u8 = 0x06;
pub const KEY_D: u8 = 0x07;
pub const KEY_E: u8 = 0x08;
pub const KEY_F: u8 = 0x09;
pub const KEY_G: u8 = 0x0A;
pub const KEY_H: u8 = 0x0B;
pub const KEY_I: u8 = 0x0C;
pub const KEY_J: u8 = 0x0D;
pub const KEY_K: u8 = 0x0E;
pub const KEY_L: u8 = 0x0F;
pub const KEY_M: u8 = 0x10;
pub const KEY_N: u8 = 0x11;
pub const KEY_O: u8 = 0x12;
pub const KEY_P: u8 = 0x13;
pub const KEY_Q: u8 = 0x14;
pub const KEY_R: u8 = 0x15;
pub const KEY_S: u8 = 0x16;
pub const KEY_T: u8 = 0x17;
pub const KEY_U: u8 = 0x18;
pub const KEY_V: u8 = 0x19;
pub const KEY_W: u8 = 0x1A;
pub const KEY_X: u8 = 0x1B;
pub const KEY_Y: u8 = 0x1C;
pub const KEY_Z: u8 = 0x1D;
pub const KEY_1: u8 = 0x1E;
pub const KEY_2: u8 = 0x1F;
pub const KEY_3: u8 = 0x20;
pub const KEY_4: u8 = 0x21;
pub const KEY_5: u8 = 0x22;
pub const KEY_6: u8 = 0x23;
pub const KEY_7: u8 = 0x24;
pub const KEY_8: u8 = 0x25;
pub const KEY_9: u8 = 0x26;
pub const KEY_0: u8 = 0x27;
pub const KEY_ENTER: u8 = 0x28;
pub const KEY_ESCAPE: u8 = 0x29;
pub const KEY_BACKSPACE: u8 = 0x2A;
pub const KEY_TAB: u8 = 0x2B;
pub const KEY_SPACE: u8 = 0x2C;
pub const KEY_MINUS: u8 = 0x2D;
pub const KEY_EQUAL: u8 = 0x2E;
pub const KEY_F1: u8 = 0x3A;
pub const KEY_F12: u8 = 0x45;
pub const KEY_RIGHT: u8 = 0x4F;
pub const KEY_LEFT: u8 = 0x50;
pub const KEY_DOWN: u8 = 0x51;
pub const KEY_UP: u8 = 0x52;

/// One snapshot of keyboard state as sent by stream clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputState {
    pub modifiers: u8,
    pub key_bitmap: [u8; 32],
}

impl InputState {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < INPUT_FRAME_LEN {
            return None;
        }
        let mut key_bitmap = [0u8; 32];
        key_bitmap.copy_from_slice(&data[1..33]);
        Some(Self {
            modifiers: data[0],
            key_bitmap,
        })
    }

    pub fn bytes(&self) -> [u8; INPUT_FRAME_LEN] {
        let mut b = [0u8; INPUT_FRAME_LEN];
        b[0] = self.modifiers;
        b[1..33].copy_from_slice(&self.key_bitmap);
        b
    }

    /// The 34-byte interrupt-IN report: modifiers, reserved, bitmap.
    pub fn build_report(&self) -> Vec<u8> {
        let mut report = Vec::with_capacity(REPORT_LEN);
        report.push(self.modifiers);
        report.push(0x00);
        report.extend_from_slice(&self.key_bitmap);
        report
    }
}

/// State with the given keys held, no modifiers.
pub fn press_key(keys: &[u8]) -> InputState {
    press_key_with_mod(0, keys)
}

/// State with the given keys held under `modifiers`.
pub fn press_key_with_mod(modifiers: u8, keys: &[u8]) -> InputState {
    let mut state = InputState {
        modifiers,
        ..Default::default()
    };
    for &key in keys {
        state.key_bitmap[(key >> 3) as usize] |= 1 << (key & 7);
    }
    state
}

pub struct Keyboard {
    descriptor: Descriptor,
    io: DeviceIo,
    state: Mutex<InputState>,
}

impl Keyboard {
    pub fn new() -> Self {
        Self {
            descriptor: build_descriptor(),
            io: DeviceIo::new(),
            state: Mutex::new(InputState::default()),
        }
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Keyboard {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn io(&self) -> &DeviceIo {
        &self.io
    }

    fn type_name(&self) -> &'static str {
        "keyboard"
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

    fn handle_class_control(&self, setup: &SetupPacket, data: &[u8]) -> Result<Vec<u8>> {
        match setup.request {
            setup::HID_REQ_GET_REPORT => match (setup.value >> 8) as u8 {
                HID_REPORT_TYPE_INPUT => Ok(self.state.lock().unwrap().build_report()),
                other => Err(Error::NotFound(format!("report type {:#04x}", other))),
            },
            setup::HID_REQ_SET_REPORT => {
                if (setup.value >> 8) as u8 == HID_REPORT_TYPE_OUTPUT && !data.is_empty() {
                    self.io.push_output(vec![data[0]]);
                }
                Ok(Vec::new())
            }
            setup::HID_REQ_SET_IDLE | setup::HID_REQ_SET_PROTOCOL => Ok(Vec::new()),
            setup::HID_REQ_GET_IDLE => Ok(vec![0]),
            setup::HID_REQ_GET_PROTOCOL => Ok(vec![1]),
            other => Err(Error::NotFound(format!("class request {:#04x}", other))),
        }
    }

    fn handle_out(&self, ep: u8, data: &[u8]) -> Result<()> {
        if ep != EP_OUT {
            return Err(Error::NotFound(format!("endpoint {}", ep)));
        }
        if !data.is_empty() {
            self.io.push_output(vec![data[0]]);
        }
        Ok(())
    }
}

fn build_descriptor() -> Descriptor {
    Descriptor {
        device: DeviceDescriptor {
            bcd_usb: 0x0200,
            max_packet_size0: 64,
            id_vendor: 0x16c0,
            id_product: 0x27db,
            bcd_device: 0x0100,
            i_manufacturer: 1,
            i_product: 2,
            i_serial_number: 0,
            num_configurations: 1,
            speed: 2,
            ..Default::default()
        },
        config: ConfigHeader::default(),
        interfaces: vec![InterfaceConfig {
            descriptor: InterfaceDescriptor {
                interface_class: 0x03,
                interface_sub_class: 0x01, // boot interface
                interface_protocol: 0x01,  // keyboard
                ..Default::default()
            },
            endpoints: vec![
                EndpointDescriptor {
                    endpoint_address: 0x80 | EP_IN,
                    attributes: 0x03,
                    max_packet_size: 64,
                    interval: 10,
                },
                EndpointDescriptor {
                    endpoint_address: EP_OUT,
                    attributes: 0x03,
                    max_packet_size: 8,
                    interval: 10,
                },
            ],
            hid: Some(HidFunction {
                descriptor: HidDescriptor {
                    bcd_hid: 0x0111,
                    country_code: 0,
                    descriptors: vec![HidSubDescriptor {
                        descriptor_type: REPORT_DESC_TYPE,
                        length: 0,
                    }],
                },
                report: report_descriptor(),
            }),
            class_descriptors: vec![],
        }],
        strings: [(1, "VIIPER".to_string()), (2, "VIIPER Keyboard".to_string())].into(),
    }
}

fn report_descriptor() -> Report {
    Report::new(vec![
        Item::UsagePage(hid::USAGE_PAGE_GENERIC_DESKTOP),
        Item::Usage(hid::USAGE_KEYBOARD),
        Item::Collection(
            CollectionKind::Application,
            vec![
                // Modifier byte
                Item::UsagePage(hid::USAGE_PAGE_KEYBOARD),
                Item::UsageMinimum(0xE0),
                Item::UsageMaximum(0xE7),
                Item::LogicalMinimum(0),
                Item::LogicalMaximum(1),
                Item::ReportSize(1),
                Item::ReportCount(8),
                Item::Input(MAIN_DATA | MAIN_VAR | MAIN_ABS),
                // Reserved byte
                Item::ReportSize(8),
                Item::ReportCount(1),
                Item::Input(MAIN_CONST),
                // LED output report
                Item::UsagePage(hid::USAGE_PAGE_LEDS),
                Item::UsageMinimum(1),
                Item::UsageMaximum(5),
                Item::ReportSize(1),
                Item::ReportCount(5),
                Item::Output(MAIN_DATA | MAIN_VAR | MAIN_ABS),
                Item::ReportSize(3),
                Item::ReportCount(1),
                Item::Output(MAIN_CONST),
                // 256-bit key bitmap
                Item::UsagePage(hid::USAGE_PAGE_KEYBOARD),
                Item::UsageMinimum(0),
                Item::UsageMaximum(255),
                Item::LogicalMinimum(0),
                Item::LogicalMaximum(1),
                Item::ReportSize(1),
                Item::ReportCount(256),
                Item::Input(MAIN_DATA | MAIN_VAR | MAIN_ABS),
            ],
        ),
    ])
}
