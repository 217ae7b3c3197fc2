//! Management API response payloads
//!
//! Shared by the server handlers and the API client so both sides agree on
//! the JSON shape.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub server: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusListResponse {
    pub buses: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusCreateResponse {
    #[serde(rename = "busId")]
    pub bus_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusRemoveResponse {
    #[serde(rename = "busId")]
    pub bus_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDevice {
    #[serde(rename = "busId")]
    pub bus_id: u32,
    #[serde(rename = "devId")]
    pub dev_id: String,
    pub vid: String,
    pub pid: String,
    #[serde(rename = "type")]
    pub device_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesListResponse {
    pub devices: Vec<ApiDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAddResponse {
    /// Format: "<busId>-<devId>"
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRemoveResponse {
    #[serde(rename = "busId")]
    pub bus_id: u32,
    #[serde(rename = "devId")]
    pub dev_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
