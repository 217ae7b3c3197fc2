//! USB mouse with 16-bit relative axes
//!
//! Input frame (client -> device, 9 bytes, little-endian):
//! buttons u8, dx i16, dy i16, wheel i16, pan i16.
//!
//! The IN report uses the identical 9-byte layout. The mouse produces no
//! output frames.

use common::{Error, Result};
use std::sync::Mutex;
use usb::desc::{
    ConfigHeader, Descriptor, DeviceDescriptor, EndpointDescriptor, HidDescriptor, HidFunction,
    HidSubDescriptor, InterfaceConfig, InterfaceDescriptor, REPORT_DESC_TYPE,
};
use usb::device::{Device, DeviceIo};
use usb::hid::{self, CollectionKind, Item, MAIN_ABS, MAIN_CONST, MAIN_DATA, MAIN_REL, MAIN_VAR, Report};
use usb::setup::{self, HID_REPORT_TYPE_INPUT, SetupPacket};

pub const INPUT_FRAME_LEN: usize = 9;
pub const REPORT_LEN: usize = 9;

/// Interrupt-IN endpoint number carrying input reports.
pub const EP_IN: u8 = 1;

// Button bits.
pub const BTN_LEFT: u8 = 0x01;
pub const BTN_RIGHT: u8 = 0x02;
pub const BTN_MIDDLE: u8 = 0x04;
pub const BTN_BACK: u8 = 0x08;
pub const BTN_FORWARD: u8 = 0x10;

/// One snapshot of mouse state as sent by stream clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputState {
    pub buttons: u8,
    pub dx: i16,
    pub dy: i16,
    pub wheel: i16,
    pub pan: i16,
}

impl InputState {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < INPUT_FRAME_LEN {
            return None;
        }
        Some(Self {
            buttons: data[0],
            dx: i16::from_le_bytes([data[1], data[2]]),
            dy: i16::from_le_bytes([data[3], data[4]]),
            wheel: i16::from_le_bytes([data[5], data[6]]),
            pan: i16::from_le_bytes([data[7], data[8]]),
        })
    }

    pub fn bytes(&self) -> [u8; INPUT_FRAME_LEN] {
        let mut b = [0u8; INPUT_FRAME_LEN];
        b[0] = self.buttons;
        b[1..3].copy_from_slice(&self.dx.to_le_bytes());
        b[3..5].copy_from_slice(&self.dy.to_le_bytes());
        b[5..7].copy_from_slice(&self.wheel.to_le_bytes());
        b[7..9].copy_from_slice(&self.pan.to_le_bytes());
        b
    }

    /// The 9-byte interrupt-IN report (same layout as the input frame).
    pub fn build_report(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }
}

pub struct Mouse {
    descriptor: Descriptor,
    io: DeviceIo,
    state: Mutex<InputState>,
}

impl Mouse {
    pub fn new() -> Self {
        Self {
            descriptor: build_descriptor(),
            io: DeviceIo::new(),
            state: Mutex::new(InputState::default()),
        }
    }
}

impl Default for Mouse {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Mouse {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn io(&self) -> &DeviceIo {
        &self.io
    }

    fn type_name(&self) -> &'static str {
        "mouse"
    }

    fn input_frame_len(&self) -> usize {
        INPUT_FRAME_LEN
    }

    fn output_frame_len(&self) -> Option<usize> {
        None
    }

    fn handle_input_frame(&self, frame: &[u8]) {
        let Some(state) = InputState::parse(frame) else {
            return;
        };
        *self.state.lock().unwrap() = state;
        self.io.complete_in(EP_IN, state.build_report());
    }

    fn handle_class_control(&self, setup: &SetupPacket, _data: &[u8]) -> Result<Vec<u8>> {
        match setup.request {
            setup::HID_REQ_GET_REPORT => match (setup.value >> 8) as u8 {
                HID_REPORT_TYPE_INPUT => Ok(self.state.lock().unwrap().build_report()),
                other => Err(Error::NotFound(format!("report type {:#04x}", other))),
            },
            setup::HID_REQ_SET_IDLE | setup::HID_REQ_SET_PROTOCOL => Ok(Vec::new()),
            setup::HID_REQ_GET_IDLE => Ok(vec![0]),
            setup::HID_REQ_GET_PROTOCOL => Ok(vec![1]),
            other => Err(Error::NotFound(format!("class request {:#04x}", other))),
        }
    }

    fn handle_out(&self, ep: u8, _data: &[u8]) -> Result<()> {
        Err(Error::NotFound(format!("endpoint {}", ep)))
    }
}

fn build_descriptor() -> Descriptor {
    Descriptor {
        device: DeviceDescriptor {
            bcd_usb: 0x0200,
            max_packet_size0: 64,
            id_vendor: 0x16c0,
            id_product: 0x27da,
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
                interface_protocol: 0x02,  // mouse
                ..Default::default()
            },
            endpoints: vec![EndpointDescriptor {
                endpoint_address: 0x80 | EP_IN,
                attributes: 0x03,
                max_packet_size: 16,
                interval: 10,
            }],
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
        strings: [(1, "VIIPER".to_string()), (2, "VIIPER Mouse".to_string())].into(),
    }
}

fn report_descriptor() -> Report {
    Report::new(vec![
        Item::UsagePage(hid::USAGE_PAGE_GENERIC_DESKTOP),
        Item::Usage(hid::USAGE_MOUSE),
        Item::Collection(
            CollectionKind::Application,
            vec![
                Item::Usage(hid::USAGE_POINTER),
                Item::Collection(
                    CollectionKind::Physical,
                    vec![
                        // Five buttons
                        Item::UsagePage(hid::USAGE_PAGE_BUTTON),
                        Item::UsageMinimum(1),
                        Item::UsageMaximum(5),
                        Item::LogicalMinimum(0),
                        Item::LogicalMaximum(1),
                        Item::ReportSize(1),
                        Item::ReportCount(5),
                        Item::Input(MAIN_DATA | MAIN_VAR | MAIN_ABS),
                        Item::ReportSize(3),
                        Item::ReportCount(1),
                        Item::Input(MAIN_CONST),
                        // 16-bit relative X/Y
                        Item::UsagePage(hid::USAGE_PAGE_GENERIC_DESKTOP),
                        Item::Usage(hid::USAGE_X),
                        Item::Usage(hid::USAGE_Y),
                        Item::LogicalMinimum(-32767),
                        Item::LogicalMaximum(32767),
                        Item::ReportSize(16),
                        Item::ReportCount(2),
                        Item::Input(MAIN_DATA | MAIN_VAR | MAIN_REL),
                        // 16-bit wheel
                        Item::Usage(hid::USAGE_WHEEL),
                        Item::LogicalMinimum(-32767),
                        Item::LogicalMaximum(32767),
                        Item::ReportSize(16),
                        Item::ReportCount(1),
                        Item::Input(MAIN_DATA | MAIN_VAR | MAIN_REL),
                        // 16-bit horizontal pan
                        Item::UsagePage(hid::USAGE_PAGE_CONSUMER),
                        Item::Usage(hid::USAGE_AC_PAN),
                        Item::LogicalMinimum(-32767),
                        Item::LogicalMaximum(32767),
                        Item::ReportSize(16),
                        Item::ReportCount(1),
                        Item::Input(MAIN_DATA | MAIN_VAR | MAIN_REL),
                    ],
                ),
            ],
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_idle() {
        assert_eq!(InputState::default().build_report(), vec![0u8; REPORT_LEN]);
    }

    #[test]
    fn test_report_buttons() {
        let state = InputState {
            buttons: BTN_LEFT | BTN_RIGHT | BTN_MIDDLE | BTN_BACK | BTN_FORWARD,
            ..Default::default()
        };
        assert_eq!(
            state.build_report(),
            vec![0x1f, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_report_motion() {
        let state = InputState {
            buttons: BTN_LEFT,
            dx: 100,
            dy: 50,
            ..Default::default()
        };
        assert_eq!(
            state.build_report(),
            vec![0x01, 0x64, 0x00, 0x32, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_report_negative_motion() {
        let state = InputState {
            dx: -50,
            dy: -50,
            ..Default::default()
        };
        assert_eq!(
            state.build_report(),
            vec![0x00, 0xce, 0xff, 0xce, 0xff, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_report_wheel_and_pan() {
        let wheel_up = InputState {
            wheel: 1,
            ..Default::default()
        };
        assert_eq!(
            wheel_up.build_report(),
            vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );

        let wheel_down = InputState {
            wheel: -1,
            ..Default::default()
        };
        assert_eq!(
            wheel_down.build_report(),
            vec![0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0x00, 0x00]
        );

        let pan_right = InputState {
            pan: 1,
            ..Default::default()
        };
        assert_eq!(
            pan_right.build_report(),
            vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn test_frame_roundtrip() {
        let state = InputState {
            buttons: BTN_MIDDLE,
            dx: -1234,
            dy: 4321,
            wheel: -2,
            pan: 7,
        };
        assert_eq!(InputState::parse(&state.bytes()), Some(state));
    }

    #[test]
    fn test_no_out_endpoint() {
        let mouse = Mouse::new();
        assert!(mouse.handle_out(1, &[0]).is_err());
        assert!(mouse.output_frame_len().is_none());
    }

    #[test]
    fn test_descriptor_encodes() {
        let mouse = Mouse::new();
        let config = mouse.descriptor().config_bytes().unwrap();
        let total = u16::from_le_bytes([config[2], config[3]]);
        assert_eq!(total as usize, config.len());
    }
}
