//! Emulated device implementations
//!
//! Each module is one device type built on the `usb` crate's descriptor
//! codec and device machinery: the descriptor tree, the client input-frame
//! layout, the IN-report builder, and the device-to-client output path.
//! The [`catalog`] maps type names to factories so the management API can
//! instantiate devices by name.

pub mod catalog;
pub mod keyboard;
pub mod mouse;
pub mod steamdeck;
pub mod xbox360;

pub use catalog::{Catalog, Registration};
pub use keyboard::Keyboard;
pub use mouse::Mouse;
pub use steamdeck::SteamDeck;
pub use xbox360::Xbox360;
