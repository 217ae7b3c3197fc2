//! Management API handlers
//!
//! One closure per route, all working against the shared [`ServerState`].
//! Handlers only return values or errors; logging and the error envelope
//! are centralized in the connection loop.

use crate::api::router::{Handler, Request, Router};
use crate::state::ServerState;
use common::apitypes::{
    ApiDevice, BusCreateResponse, BusListResponse, BusRemoveResponse, DeviceAddResponse,
    DeviceRemoveResponse, DevicesListResponse, PingResponse,
};
use common::{Error, Result};
use serde_json::json;
use std::sync::Arc;

/// Register the core route set.
pub fn register_core_routes(router: &mut Router, state: Arc<ServerState>) {
    router.register("ping", ping());
    router.register("bus/list", bus_list(state.clone()));
    router.register("bus/create", bus_create(state.clone()));
    router.register("bus/remove", bus_remove(state.clone()));
    router.register("bus/{id}/list", bus_devices_list(state.clone()));
    router.register("bus/{id}/add", bus_device_add(state.clone()));
    router.register("bus/{id}/remove", bus_device_remove(state));
    router.register_stream("bus/{busId}/{deviceid}");
}

fn to_json<T: serde::Serialize>(value: T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| Error::Protocol(e.to_string()))
}

fn parse_bus_id(raw: &str) -> Result<u32> {
    raw.parse::<u32>()
        .map_err(|_| Error::Protocol(format!("invalid busId: {}", raw)))
}

fn ping() -> Handler {
    Arc::new(move |_req: Request| {
        Box::pin(async move {
            to_json(PingResponse {
                server: "VIIPER".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
        })
    })
}

fn bus_list(state: Arc<ServerState>) -> Handler {
    Arc::new(move |_req: Request| {
        let state = state.clone();
        Box::pin(async move {
            to_json(BusListResponse {
                buses: state.list_buses(),
            })
        })
    })
}

fn bus_create(state: Arc<ServerState>) -> Handler {
    Arc::new(move |req: Request| {
        let state = state.clone();
        Box::pin(async move {
            let bus_id = match req.args.first() {
                Some(raw) => parse_bus_id(raw)?,
                None => 0,
            };
            let bus = state.create_bus(bus_id)?;
            to_json(BusCreateResponse {
                bus_id: bus.bus_id(),
            })
        })
    })
}

fn bus_remove(state: Arc<ServerState>) -> Handler {
    Arc::new(move |req: Request| {
        let state = state.clone();
        Box::pin(async move {
            let raw = req
                .args
                .first()
                .ok_or_else(|| Error::Protocol("missing busId".into()))?;
            let bus_id = parse_bus_id(raw)?;
            state.remove_bus(bus_id)?;
            to_json(BusRemoveResponse { bus_id })
        })
    })
}

fn bus_devices_list(state: Arc<ServerState>) -> Handler {
    Arc::new(move |req: Request| {
        let state = state.clone();
        Box::pin(async move {
            let bus_id = parse_bus_id(req.params.get("id").map(String::as_str).unwrap_or(""))?;
            let bus = state
                .get_bus(bus_id)
                .ok_or_else(|| Error::NotFound(format!("bus {}", bus_id)))?;
            let devices = bus
                .all_devices()
                .iter()
                .map(|ctx| {
                    let desc = ctx.dev.descriptor();
                    ApiDevice {
                        bus_id,
                        dev_id: ctx.dev_id.to_string(),
                        vid: format!("0x{:04x}", desc.device.id_vendor),
                        pid: format!("0x{:04x}", desc.device.id_product),
                        device_type: ctx.dev.type_name().to_string(),
                    }
                })
                .collect();
            to_json(DevicesListResponse { devices })
        })
    })
}

fn bus_device_add(state: Arc<ServerState>) -> Handler {
    Arc::new(move |req: Request| {
        let state = state.clone();
        Box::pin(async move {
            let bus_id = parse_bus_id(req.params.get("id").map(String::as_str).unwrap_or(""))?;
            let bus = state
                .get_bus(bus_id)
                .ok_or_else(|| Error::NotFound(format!("bus {}", bus_id)))?;
            let type_name = req
                .args
                .first()
                .ok_or_else(|| Error::Protocol("missing device type".into()))?;
            let registration = state
                .catalog
                .get(type_name)
                .ok_or_else(|| Error::NotFound(format!("device type {}", type_name)))?;

            let ctx = bus.add((registration.factory)())?;
            to_json(DeviceAddResponse {
                id: format!("{}-{}", bus_id, ctx.dev_id),
            })
        })
    })
}

fn bus_device_remove(state: Arc<ServerState>) -> Handler {
    Arc::new(move |req: Request| {
        let state = state.clone();
        Box::pin(async move {
            let bus_id = parse_bus_id(req.params.get("id").map(String::as_str).unwrap_or(""))?;
            let bus = state
                .get_bus(bus_id)
                .ok_or_else(|| Error::NotFound(format!("bus {}", bus_id)))?;
            let raw = req
                .args
                .first()
                .ok_or_else(|| Error::Protocol("missing device number".into()))?;
            let dev_id = raw
                .parse::<u32>()
                .map_err(|_| Error::Protocol(format!("invalid device number: {}", raw)))?;
            bus.remove_device_by_id(dev_id)?;
            to_json(DeviceRemoveResponse {
                bus_id,
                dev_id: raw.clone(),
            })
        })
    })
}

/// The one JSON line sent for a failed request.
pub fn error_line(message: &str) -> String {
    json!({ "error": message }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use devices::Catalog;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn test_state() -> Arc<ServerState> {
        Arc::new(ServerState::new(
            Arc::new(Catalog::with_builtin()),
            Duration::from_secs(60),
        ))
    }

    fn request(params: &[(&str, &str)], args: &[&str]) -> Request {
        Request {
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let value = ping()(request(&[], &[])).await.unwrap();
        assert_eq!(value["server"], "VIIPER");
        assert!(!value["version"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bus_create_and_list() {
        let state = test_state();
        let value = bus_create(state.clone())(request(&[], &[])).await.unwrap();
        assert_eq!(value["busId"], 1);

        let value = bus_create(state.clone())(request(&[], &["7"])).await.unwrap();
        assert_eq!(value["busId"], 7);

        let value = bus_list(state.clone())(request(&[], &[])).await.unwrap();
        assert_eq!(value["buses"], json!([1, 7]));

        // Colliding id surfaces as an error.
        assert!(bus_create(state)(request(&[], &["7"])).await.is_err());
    }

    #[tokio::test]
    async fn test_device_add_list_remove() {
        let state = test_state();
        state.create_bus(1).unwrap();

        let value = bus_device_add(state.clone())(request(&[("id", "1")], &["KeyBoard"]))
            .await
            .unwrap();
        assert_eq!(value["id"], "1-1");

        let value = bus_devices_list(state.clone())(request(&[("id", "1")], &[]))
            .await
            .unwrap();
        let devices = value["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["type"], "keyboard");
        assert_eq!(devices[0]["vid"], "0x16c0");
        assert_eq!(devices[0]["devId"], "1");

        let value = bus_device_remove(state.clone())(request(&[("id", "1")], &["1"]))
            .await
            .unwrap();
        assert_eq!(value["busId"], 1);
        assert_eq!(value["devId"], "1");

        let value = bus_devices_list(state)(request(&[("id", "1")], &[]))
            .await
            .unwrap();
        assert_eq!(value["devices"], json!([]));
    }

    #[tokio::test]
    async fn test_catalog_override_reaches_device_add() {
        let state = test_state();
        // A deployment overriding a builtin type sees its own factory used
        // all the way through bus population.
        state.catalog.register(devices::Registration::new("keyboard", || {
            Arc::new(devices::Mouse::new())
        }));
        state.create_bus(1).unwrap();

        let value = bus_device_add(state.clone())(request(&[("id", "1")], &["keyboard"]))
            .await
            .unwrap();
        assert_eq!(value["id"], "1-1");

        let value = bus_devices_list(state.clone())(request(&[("id", "1")], &[]))
            .await
            .unwrap();
        assert_eq!(value["devices"][0]["type"], "mouse");
        assert_eq!(value["devices"][0]["pid"], "0x27da");

        // The overridden device is the one living on the bus.
        let (_, ctx) = state.find_by_busid("1-1").unwrap();
        assert_eq!(ctx.dev.type_name(), "mouse");
    }

    #[tokio::test]
    async fn test_unknown_bus_and_type() {
        let state = test_state();
        assert!(
            bus_devices_list(state.clone())(request(&[("id", "9")], &[]))
                .await
                .is_err()
        );
        state.create_bus(1).unwrap();
        assert!(
            bus_device_add(state)(request(&[("id", "1")], &["gamecube"]))
                .await
                .is_err()
        );
    }

    #[test]
    fn test_error_line_shape() {
        assert_eq!(error_line("unknown path"), r#"{"error":"unknown path"}"#);
    }
}
