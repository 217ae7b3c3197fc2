//! HID report descriptors as a structured tree
//!
//! A HID report descriptor is a byte-coded DSL. This module models it as a
//! tree of [`Item`] values (including nested collections) and encodes it to
//! the exact descriptor byte stream.
//!
//! Short items encode as `(tag << 4) | (type << 2) | sizeCode` followed by
//! 0/1/2/4 data bytes; numeric data is always emitted in the smallest lawful
//! width. `Collection` implicitly emits the matching End Collection item
//! after its children.

pub mod constants;

pub use constants::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("short item data must be 0/1/2/4 bytes, got {0}")]
    BadShortLength(usize),

    #[error("long item too large: {0} bytes")]
    LongTooLarge(usize),
}

/// HID short item "type" field (HID 1.11 §6.2.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemType {
    Main = 0,
    Global = 1,
    Local = 2,
    Reserved = 3,
}

/// One node in a HID report descriptor.
#[derive(Debug, Clone)]
pub enum Item {
    /// Current usage page (Global, tag 0x0)
    UsagePage(u16),
    /// Usage within the current page (Local, tag 0x0)
    Usage(u16),
    /// Usage minimum (Local, tag 0x1)
    UsageMinimum(u16),
    /// Usage maximum (Local, tag 0x2)
    UsageMaximum(u16),
    /// Logical minimum (Global, tag 0x1)
    LogicalMinimum(i32),
    /// Logical maximum (Global, tag 0x2)
    LogicalMaximum(i32),
    /// Report size in bits (Global, tag 0x7)
    ReportSize(u8),
    /// Report ID prefix (Global, tag 0x8)
    ReportId(u8),
    /// Report count (Global, tag 0x9)
    ReportCount(u16),
    /// Input main item (tag 0x8)
    Input(MainFlags),
    /// Output main item (tag 0x9)
    Output(MainFlags),
    /// Feature main item (tag 0xB)
    Feature(MainFlags),
    /// Collection (Main, tag 0xA); ends itself with End Collection (0xC)
    Collection(CollectionKind, Vec<Item>),
    /// Escape hatch for rarely used or vendor-defined short items
    Short {
        item_type: ItemType,
        tag: u8,
        data: Vec<u8>,
    },
    /// HID long item (rare): 0xFE, len, tag, data
    Long { tag: u8, data: Vec<u8> },
}

/// A complete HID report descriptor (type 0x22).
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub items: Vec<Item>,
}

impl Report {
    pub fn new(items: Vec<Item>) -> Self {
        Self { items }
    }

    /// Encode the report descriptor.
    pub fn bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::new();
        for item in &self.items {
            encode_item(&mut buf, item)?;
        }
        Ok(buf)
    }
}

fn encode_item(buf: &mut Vec<u8>, item: &Item) -> Result<(), EncodeError> {
    match item {
        Item::UsagePage(page) => short(buf, 0x0, ItemType::Global, &data_u32(*page as u32)),
        Item::Usage(usage) => short(buf, 0x0, ItemType::Local, &data_u32(*usage as u32)),
        Item::UsageMinimum(min) => short(buf, 0x1, ItemType::Local, &data_u32(*min as u32)),
        Item::UsageMaximum(max) => short(buf, 0x2, ItemType::Local, &data_u32(*max as u32)),
        Item::LogicalMinimum(min) => short(buf, 0x1, ItemType::Global, &data_i32(*min)),
        Item::LogicalMaximum(max) => short(buf, 0x2, ItemType::Global, &data_i32(*max)),
        Item::ReportSize(bits) => short(buf, 0x7, ItemType::Global, &[*bits]),
        Item::ReportId(id) => short(buf, 0x8, ItemType::Global, &[*id]),
        Item::ReportCount(count) => short(buf, 0x9, ItemType::Global, &data_u32(*count as u32)),
        Item::Input(flags) => short(buf, 0x8, ItemType::Main, &[*flags]),
        Item::Output(flags) => short(buf, 0x9, ItemType::Main, &[*flags]),
        Item::Feature(flags) => short(buf, 0xB, ItemType::Main, &[*flags]),
        Item::Collection(kind, items) => {
            short(buf, 0xA, ItemType::Main, &[*kind as u8])?;
            for it in items {
                encode_item(buf, it)?;
            }
            // End Collection (Main, tag 0xC) carries no data.
            short(buf, 0xC, ItemType::Main, &[])
        }
        Item::Short {
            item_type,
            tag,
            data,
        } => short(buf, *tag, *item_type, data),
        Item::Long { tag, data } => {
            if data.len() > 255 {
                return Err(EncodeError::LongTooLarge(data.len()));
            }
            buf.push(0xFE);
            buf.push(data.len() as u8);
            buf.push(*tag);
            buf.extend_from_slice(data);
            Ok(())
        }
    }
}

fn short(buf: &mut Vec<u8>, tag: u8, item_type: ItemType, data: &[u8]) -> Result<(), EncodeError> {
    let size_code: u8 = match data.len() {
        0 => 0,
        1 => 1,
        2 => 2,
        4 => 3,
        n => return Err(EncodeError::BadShortLength(n)),
    };
    buf.push((tag << 4) | ((item_type as u8) << 2) | size_code);
    buf.extend_from_slice(data);
    Ok(())
}

/// Unsigned data in minimum width (1, 2 or 4 bytes, little-endian).
fn data_u32(v: u32) -> Vec<u8> {
    if v <= 0xFF {
        vec![v as u8]
    } else if v <= 0xFFFF {
        vec![v as u8, (v >> 8) as u8]
    } else {
        v.to_le_bytes().to_vec()
    }
}

/// Signed data in minimum width (i8 if it fits, else i16, else i32).
fn data_i32(v: i32) -> Vec<u8> {
    if (-128..=127).contains(&v) {
        vec![v as u8]
    } else if (-32768..=32767).contains(&v) {
        (v as i16).to_le_bytes().to_vec()
    } else {
        v.to_le_bytes().to_vec()
    }
}
