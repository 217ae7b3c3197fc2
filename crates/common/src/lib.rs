//! Shared building blocks for the VIIPER workspace
//!
//! Error kinds every crate reports, logging setup for the binaries, and the
//! API key file used by deployments to gate management access.

pub mod apitypes;
pub mod error;
pub mod keyfile;
pub mod logging;

pub use error::{Error, Result};
pub use keyfile::{default_api_key_path, load_or_generate_api_key};
pub use logging::setup_logging;
