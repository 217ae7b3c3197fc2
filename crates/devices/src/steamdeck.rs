//! Steam Deck (Jupiter/LCD) controller
//!
//! Input frame (client -> device, 52 bytes, little-endian): the SDL
//! `SteamDeckStatePacket_t` fields minus the packet number, in SDL order:
//! buttons u64, pad X/Y pairs, accelerometer, gyro, gyro quaternion,
//! raw triggers, stick X/Y pairs, pad pressures.
//!
//! IN report (64 bytes): Valve report header `01 00 09 40` (version 0x0001,
//! type 0x09 deck state, length 64), a monotonically increasing packet
//! counter at offset 4, the state fields from offset 8, zero padding to 64.
//!
//! Output frame (device -> client, 64 bytes): raw forwarding of whatever
//! the host sends via the OUT endpoint or SET_REPORT, zero-padded.

use common::{Error, Result};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use usb::desc::{
    ConfigHeader, Descriptor, DeviceDescriptor, EndpointDescriptor, HidDescriptor, HidFunction,
    HidSubDescriptor, InterfaceConfig, InterfaceDescriptor, REPORT_DESC_TYPE,
};
use usb::device::{Device, DeviceIo};
use usb::hid::{CollectionKind, Item, MAIN_ABS, MAIN_DATA, MAIN_VAR, Report};
use usb::setup::{self, SetupPacket};

pub const INPUT_FRAME_LEN: usize = 52;
pub const REPORT_LEN: usize = 64;
pub const OUTPUT_FRAME_LEN: usize = 64;

/// Interrupt-IN endpoint number carrying input reports.
pub const EP_IN: u8 = 1;
/// Interrupt-OUT endpoint number receiving host commands.
pub const EP_OUT: u8 = 1;

// Valve in-report header.
pub const REPORT_MSG_VERSION: u16 = 0x0001;
pub const REPORT_TYPE_DECK_STATE: u8 = 0x09;
/// Offset of the packet counter inside the report.
pub const REPORT_PACKET_NUM_OFF: usize = 4;
/// Offset of the state payload inside the report.
pub const REPORT_PAYLOAD_OFF: usize = 8;

// Button bits of the 64-bit button field.
pub const BTN_R2: u64 = 1 << 0;
pub const BTN_L2: u64 = 1 << 1;
pub const BTN_R1: u64 = 1 << 2;
pub const BTN_L1: u64 = 1 << 3;
pub const BTN_Y: u64 = 1 << 4;
pub const BTN_B: u64 = 1 << 5;
pub const BTN_X: u64 = 1 << 6;
pub const BTN_A: u64 = 1 << 7;
pub const BTN_DPAD_UP: u64 = 1 << 8;
pub const BTN_DPAD_RIGHT: u64 = 1 << 9;
pub const BTN_DPAD_LEFT: u64 = 1 << 10;
pub const BTN_DPAD_DOWN: u64 = 1 << 11;
pub const BTN_OPTIONS: u64 = 1 << 12;
pub const BTN_STEAM: u64 = 1 << 13;
pub const BTN_MENU: u64 = 1 << 14;
pub const BTN_L5: u64 = 1 << 15;
pub const BTN_R5: u64 = 1 << 16;
pub const BTN_LEFT_PAD_CLICK: u64 = 1 << 17;
pub const BTN_RIGHT_PAD_CLICK: u64 = 1 << 18;
pub const BTN_LEFT_PAD_TOUCH: u64 = 1 << 19;
pub const BTN_RIGHT_PAD_TOUCH: u64 = 1 << 20;
pub const BTN_L3: u64 = 1 << 22;
pub const BTN_R3: u64 = 1 << 26;
pub const BTN_L4: u64 = 1 << 41;
pub const BTN_R4: u64 = 1 << 42;
pub const BTN_L3_TOUCH: u64 = 1 << 46;
pub const BTN_R3_TOUCH: u64 = 1 << 47;
pub const BTN_QUICK_ACCESS: u64 = 1 << 50;

/// One snapshot of deck state as sent by stream clients. Mirrors SDL's
/// `SteamDeckStatePacket_t` minus the packet number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputState {
    pub buttons: u64,

    pub left_pad_x: i16,
    pub left_pad_y: i16,
    pub right_pad_x: i16,
    pub right_pad_y: i16,

    pub accel_x: i16,
    pub accel_y: i16,
    pub accel_z: i16,

    pub gyro_x: i16,
    pub gyro_y: i16,
    pub gyro_z: i16,

    pub gyro_quat_w: i16,
    pub gyro_quat_x: i16,
    pub gyro_quat_y: i16,
    pub gyro_quat_z: i16,

    pub trigger_raw_l: u16,
    pub trigger_raw_r: u16,

    pub left_stick_x: i16,
    pub left_stick_y: i16,
    pub right_stick_x: i16,
    pub right_stick_y: i16,

    pub pressure_pad_left: u16,
    pub pressure_pad_right: u16,
}

impl InputState {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < INPUT_FRAME_LEN {
            return None;
        }
        let mut o = 8;
        let mut next = || {
            let v = u16::from_le_bytes([data[o], data[o + 1]]);
            o += 2;
            v
        };
        Some(Self {
            buttons: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            left_pad_x: next() as i16,
            left_pad_y: next() as i16,
            right_pad_x: next() as i16,
            right_pad_y: next() as i16,
            accel_x: next() as i16,
            accel_y: next() as i16,
            accel_z: next() as i16,
            gyro_x: next() as i16,
            gyro_y: next() as i16,
            gyro_z: next() as i16,
            gyro_quat_w: next() as i16,
            gyro_quat_x: next() as i16,
            gyro_quat_y: next() as i16,
            gyro_quat_z: next() as i16,
            trigger_raw_l: next(),
            trigger_raw_r: next(),
            left_stick_x: next() as i16,
            left_stick_y: next() as i16,
            right_stick_x: next() as i16,
            right_stick_y: next() as i16,
            pressure_pad_left: next(),
            pressure_pad_right: next(),
        })
    }

    pub fn bytes(&self) -> [u8; INPUT_FRAME_LEN] {
        let mut b = [0u8; INPUT_FRAME_LEN];
        b[0..8].copy_from_slice(&self.buttons.to_le_bytes());
        let mut o = 8;
        let mut put = |v: u16| {
            b[o..o + 2].copy_from_slice(&v.to_le_bytes());
            o += 2;
        };
        put(self.left_pad_x as u16);
        put(self.left_pad_y as u16);
        put(self.right_pad_x as u16);
        put(self.right_pad_y as u16);
        put(self.accel_x as u16);
        put(self.accel_y as u16);
        put(self.accel_z as u16);
        put(self.gyro_x as u16);
        put(self.gyro_y as u16);
        put(self.gyro_z as u16);
        put(self.gyro_quat_w as u16);
        put(self.gyro_quat_x as u16);
        put(self.gyro_quat_y as u16);
        put(self.gyro_quat_z as u16);
        put(self.trigger_raw_l);
        put(self.trigger_raw_r);
        put(self.left_stick_x as u16);
        put(self.left_stick_y as u16);
        put(self.right_stick_x as u16);
        put(self.right_stick_y as u16);
        put(self.pressure_pad_left);
        put(self.pressure_pad_right);
        b
    }

    /// The 64-byte Valve deck-state report.
    pub fn build_report(&self, packet_num: u32) -> Vec<u8> {
        let mut b = vec![0u8; REPORT_LEN];
        b[0..2].copy_from_slice(&REPORT_MSG_VERSION.to_le_bytes());
        b[2] = REPORT_TYPE_DECK_STATE;
        b[3] = REPORT_LEN as u8;
        b[REPORT_PACKET_NUM_OFF..REPORT_PAYLOAD_OFF]
            .copy_from_slice(&packet_num.to_le_bytes());
        b[REPORT_PAYLOAD_OFF..REPORT_PAYLOAD_OFF + INPUT_FRAME_LEN]
            .copy_from_slice(&self.bytes());
        b
    }
}

pub struct SteamDeck {
    descriptor: Descriptor,
    io: DeviceIo,
    state: Mutex<InputState>,
    packet_num: AtomicU32,
}

impl SteamDeck {
    pub fn new() -> Self {
        Self {
            descriptor: build_descriptor(),
            io: DeviceIo::new(),
            state: Mutex::new(InputState::default()),
            packet_num: AtomicU32::new(0),
        }
    }
}

impl Default for SteamDeck {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for SteamDeck {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn io(&self) -> &DeviceIo {
        &self.io
    }

    fn type_name(&self) -> &'static str {
        "steamdeck"
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
        let packet_num = self.packet_num.fetch_add(1, Ordering::Relaxed) + 1;
        self.io.complete_in(EP_IN, state.build_report(packet_num));
    }

    fn handle_class_control(&self, setup: &SetupPacket, data: &[u8]) -> Result<Vec<u8>> {
        match setup.request {
            setup::HID_REQ_SET_REPORT => {
                // Host feature/output reports are forwarded raw.
                if !data.is_empty() {
                    self.io.push_output(pad_frame(data));
                }
                Ok(Vec::new())
            }
            setup::HID_REQ_GET_REPORT => Ok(vec![0; REPORT_LEN]),
            setup::HID_REQ_SET_IDLE | setup::HID_REQ_SET_PROTOCOL => Ok(Vec::new()),
            setup::HID_REQ_GET_IDLE => Ok(vec![0]),
            other => Err(Error::NotFound(format!("class request {:#04x}", other))),
        }
    }

    fn handle_out(&self, ep: u8, data: &[u8]) -> Result<()> {
        if ep != EP_OUT {
            return Err(Error::NotFound(format!("endpoint {}", ep)));
        }
        if !data.is_empty() {
            self.io.push_output(pad_frame(data));
        }
        Ok(())
    }
}

fn pad_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; OUTPUT_FRAME_LEN];
    let n = data.len().min(OUTPUT_FRAME_LEN);
    frame[..n].copy_from_slice(&data[..n]);
    frame
}

fn build_descriptor() -> Descriptor {
    Descriptor {
        device: DeviceDescriptor {
            bcd_usb: 0x0200,
            max_packet_size0: 64,
            id_vendor: 0x28de,
            id_product: 0x1205,
            bcd_device: 0x0300,
            i_manufacturer: 1,
            i_product: 2,
            i_serial_number: 0,
            num_configurations: 1,
            speed: 3,
            ..Default::default()
        },
        config: ConfigHeader {
            attributes: 0x80,
            max_power: 250,
            ..Default::default()
        },
        interfaces: vec![InterfaceConfig {
            descriptor: InterfaceDescriptor {
                interface_class: 0x03,
                interface_sub_class: 0x00,
                interface_protocol: 0x00,
                ..Default::default()
            },
            endpoints: vec![
                EndpointDescriptor {
                    endpoint_address: 0x80 | EP_IN,
                    attributes: 0x03,
                    max_packet_size: 64,
                    interval: 1,
                },
                EndpointDescriptor {
                    endpoint_address: EP_OUT,
                    attributes: 0x03,
                    max_packet_size: 64,
                    interval: 1,
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
        strings: [(1, "Valve Software".to_string()), (2, "Steam Controller".to_string())]
            .into(),
    }
}

fn report_descriptor() -> Report {
    // Vendor-defined page with opaque 64-byte input/output/feature reports,
    // the shape the real Jupiter controller interface exposes.
    Report::new(vec![
        Item::UsagePage(0xFFFF),
        Item::Usage(0x0001),
        Item::Collection(
            CollectionKind::Application,
            vec![
                Item::LogicalMinimum(0),
                Item::LogicalMaximum(255),
                Item::ReportSize(8),
                Item::ReportCount(64),
                Item::Usage(0x0001),
                Item::Input(MAIN_DATA | MAIN_VAR | MAIN_ABS),
                Item::Usage(0x0001),
                Item::Output(MAIN_DATA | MAIN_VAR | MAIN_ABS),
                Item::Usage(0x0001),
                Item::Feature(MAIN_DATA | MAIN_VAR | MAIN_ABS),
            ],
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_header() {
        let report = InputState::default().build_report(0);
        assert_eq!(report.len(), REPORT_LEN);
        assert_eq!(&report[0..4], &[0x01, 0x00, 0x09, 0x40]);
        assert!(report[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_report_buttons_a_b() {
        let state = InputState {
            buttons: BTN_A | BTN_B,
            ..Default::default()
        };
        let report = state.build_report(1);
        assert_eq!(report[8], 0xA0);
        assert!(report[9..16].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_report_dpad_up_and_steam() {
        let state = InputState {
            buttons: BTN_DPAD_UP | BTN_STEAM,
            left_stick_x: -32768,
            left_stick_y: 32767,
            ..Default::default()
        };
        let report = state.build_report(1);
        assert_eq!(report[8], 0x00);
        assert_eq!(report[9], 0x21);
        assert_eq!(&report[48..52], &[0x00, 0x80, 0xFF, 0x7F]);
    }

    #[test]
    fn test_report_left_stick_offsets() {
        let state = InputState {
            left_stick_x: 1234,
            left_stick_y: -2345,
            ..Default::default()
        };
        let report = state.build_report(1);
        assert_eq!(&report[48..52], &[0xD2, 0x04, 0xD7, 0xF6]);
        // Everything before the sticks stays zero (counter aside).
        assert!(report[8..48].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_packet_counter_increments() {
        let deck = SteamDeck::new();
        let frame = InputState::default().bytes();
        deck.handle_input_frame(&frame);
        deck.handle_input_frame(&frame);
        let ticket = deck.io().submit_in(EP_IN).unwrap();
        match ticket {
            usb::device::InTicket::Ready(report) => {
                let counter = u32::from_le_bytes(
                    report[REPORT_PACKET_NUM_OFF..REPORT_PAYLOAD_OFF]
                        .try_into()
                        .unwrap(),
                );
                assert_eq!(counter, 2);
            }
            usb::device::InTicket::Wait(_) => panic!("report should be pending"),
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let state = InputState {
            buttons: BTN_STEAM | BTN_QUICK_ACCESS,
            right_pad_y: -77,
            gyro_z: 1024,
            trigger_raw_r: 0x7FFF,
            pressure_pad_left: 3,
            ..Default::default()
        };
        assert_eq!(InputState::parse(&state.bytes()), Some(state));
    }

    #[tokio::test]
    async fn test_out_transfer_padded_to_64() {
        let deck = SteamDeck::new();
        deck.handle_out(EP_OUT, &[0xAA, 0xBB]).unwrap();
        let frame = deck.io().next_output().await.unwrap();
        assert_eq!(frame.len(), OUTPUT_FRAME_LEN);
        assert_eq!(&frame[..2], &[0xAA, 0xBB]);
        assert!(frame[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_descriptor_encodes() {
        let deck = SteamDeck::new();
        let config = deck.descriptor().config_bytes().unwrap();
        let total = u16::from_le_bytes([config[2], config[3]]);
        assert_eq!(total as usize, config.len());
    }
}
