//! Management API behavior: bus/device lifecycle, error envelopes, the
//! connect timer, and stream ownership.

mod support;

use client::{ApiClient, ClientError};
use std::time::Duration;
use support::start_test_server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_ping() {
    let server = start_test_server(Duration::from_secs(60)).await;
    let pong = ApiClient::new(&server.api_addr).ping().await.unwrap();
    assert_eq!(pong.server, "VIIPER");
    assert!(!pong.version.is_empty());
}

#[tokio::test]
async fn test_bus_lifecycle() {
    let server = start_test_server(Duration::from_secs(60)).await;
    let api = ApiClient::new(&server.api_addr);

    assert!(api.bus_list().await.unwrap().buses.is_empty());

    // Auto-assigned ids fill the smallest free slot.
    assert_eq!(api.bus_create(None).await.unwrap().bus_id, 1);
    assert_eq!(api.bus_create(None).await.unwrap().bus_id, 2);
    assert_eq!(api.bus_create(Some(5)).await.unwrap().bus_id, 5);
    assert_eq!(api.bus_list().await.unwrap().buses, vec![1, 2, 5]);

    // Creating a taken id is a conflict.
    assert!(matches!(
        api.bus_create(Some(5)).await,
        Err(ClientError::Api(_))
    ));

    api.bus_remove(2).await.unwrap();
    assert_eq!(api.bus_list().await.unwrap().buses, vec![1, 5]);

    // Removing twice reports the error envelope.
    assert!(matches!(
        api.bus_remove(2).await,
        Err(ClientError::Api(_))
    ));
}

#[tokio::test]
async fn test_device_lifecycle() {
    let server = start_test_server(Duration::from_secs(60)).await;
    let api = ApiClient::new(&server.api_addr);
    api.bus_create(Some(1)).await.unwrap();

    let added = api.bus_device_add(1, "MOUSE").await.unwrap();
    assert_eq!(added.id, "1-1");

    let list = api.bus_devices_list(1).await.unwrap();
    assert_eq!(list.devices.len(), 1);
    assert_eq!(list.devices[0].device_type, "mouse");
    assert_eq!(list.devices[0].dev_id, "1");
    assert_eq!(list.devices[0].vid, "0x16c0");
    assert_eq!(list.devices[0].pid, "0x27da");

    let removed = api.bus_device_remove(1, "1").await.unwrap();
    assert_eq!(removed.bus_id, 1);
    assert_eq!(removed.dev_id, "1");
    assert!(api.bus_devices_list(1).await.unwrap().devices.is_empty());

    assert!(matches!(
        api.bus_device_remove(1, "1").await,
        Err(ClientError::Api(_))
    ));
    assert!(matches!(
        api.bus_device_add(1, "gamecube").await,
        Err(ClientError::Api(_))
    ));
    assert!(matches!(
        api.bus_device_add(9, "mouse").await,
        Err(ClientError::Api(_))
    ));
}

#[tokio::test]
async fn test_unknown_path_keeps_connection_open() {
    let server = start_test_server(Duration::from_secs(60)).await;
    let mut socket = TcpStream::connect(&server.api_addr).await.unwrap();

    socket.write_all(b"frobnicate\n").await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = socket.read(&mut buf).await.unwrap();
    let reply = String::from_utf8_lossy(&buf[..n]);
    assert!(reply.contains("error"), "got {:?}", reply);

    // The same connection still serves requests.
    socket.write_all(b"PING\n").await.unwrap();
    let n = socket.read(&mut buf).await.unwrap();
    let reply = String::from_utf8_lossy(&buf[..n]);
    assert!(reply.contains("VIIPER"), "got {:?}", reply);
}

#[tokio::test]
async fn test_connect_timer_auto_cleanup() {
    let server = start_test_server(Duration::from_millis(200)).await;
    let api = ApiClient::new(&server.api_addr);
    api.bus_create(Some(1)).await.unwrap();
    api.bus_device_add(1, "keyboard").await.unwrap();

    // Nobody opens a stream: the device disappears after the timeout.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(api.bus_devices_list(1).await.unwrap().devices.is_empty());
}

#[tokio::test]
async fn test_stream_stops_connect_timer() {
    let server = start_test_server(Duration::from_millis(200)).await;
    let api = ApiClient::new(&server.api_addr);
    api.bus_create(Some(1)).await.unwrap();
    let (stream, _) = api.add_device_and_connect(1, "keyboard").await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(api.bus_devices_list(1).await.unwrap().devices.len(), 1);

    // Closing the stream re-arms the timer; the device is cleaned up.
    stream.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(api.bus_devices_list(1).await.unwrap().devices.is_empty());
}

#[tokio::test]
async fn test_bus_remove_cancels_devices() {
    let server = start_test_server(Duration::from_secs(60)).await;
    let api = ApiClient::new(&server.api_addr);
    api.bus_create(Some(1)).await.unwrap();
    let (_stream, _) = api.add_device_and_connect(1, "keyboard").await.unwrap();

    api.bus_remove(1).await.unwrap();
    assert!(api.bus_list().await.unwrap().buses.is_empty());

    // The bus is gone for the stream route as well.
    assert!(matches!(
        api.bus_devices_list(1).await,
        Err(ClientError::Api(_))
    ));
}

#[tokio::test]
async fn test_stream_to_unknown_device_reports_error() {
    let server = start_test_server(Duration::from_secs(60)).await;
    let api = ApiClient::new(&server.api_addr);
    api.bus_create(Some(1)).await.unwrap();

    let mut socket = TcpStream::connect(&server.api_addr).await.unwrap();
    socket.write_all(b"bus/1/7\n").await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = socket.read(&mut buf).await.unwrap();
    let reply = String::from_utf8_lossy(&buf[..n]);
    assert!(reply.contains("device not found"), "got {:?}", reply);
}
