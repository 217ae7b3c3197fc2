//! VIIPER server
//!
//! Ties the pieces together: the virtual bus topology (`bus`, `state`), the
//! USB/IP front-end (`usbipd`), the management API with its device-stream
//! upgrade (`api`), the pass-through proxy (`proxy`), and configuration
//! loading (`config`). The `viiper` binary in `main.rs` is a thin CLI on
//! top of this crate.

pub mod api;
pub mod bus;
pub mod config;
pub mod proxy;
pub mod state;
pub mod usbipd;

pub use api::ApiServer;
pub use bus::{DeviceCtx, VirtualBus};
pub use config::Config;
pub use proxy::ProxyServer;
pub use state::ServerState;
pub use usbipd::UsbIpServer;
