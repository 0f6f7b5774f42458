use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_modbus::prelude::*;
use tower::ServiceExt;

use fieldgate_core::{Gateway, GatewayConfig};
use fieldgate_server::http::create_router;
use fieldgate_server::{ModbusServer, RegisterImage};

const W1_SLAVE: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                        72 01 4b 46 7f ff 0e 10 57 t=23125\n";

/// Gateway with 1-Wire sensor `T1` (dev_id 2) on `OW` and relays
/// `D1_01`/`D1_02` of slave `D1` on the unreachable bus `M1`.
async fn start_gateway(dir: &tempfile::TempDir) -> Arc<Gateway> {
    let sensor_dir = dir.path().join("28-000001");
    std::fs::create_dir(&sensor_dir).unwrap();
    std::fs::write(sensor_dir.join("w1_slave"), W1_SLAVE).unwrap();

    let json = format!(
        r#"{{
            hw_definitions: {{ M: {{ blocks: [ {{ type: "relay", start: 0, count: 2 }} ] }} }},
            hw_tree: {{
                OW: {{
                    type: "OWBUS",
                    sysfs_root: "{root}",
                    interval: 0.05,
                    devices: {{ T1: {{ type: "DS18B20", address: "28-000001" }} }},
                }},
                M1: {{
                    type: "MODBUSTCP",
                    hostname: "127.0.0.1",
                    port: 1,
                    timeout_ms: 200,
                    devices: {{ D1: {{ model: "M" }} }},
                }},
            }},
        }}"#,
        root = dir.path().display(),
    );

    let config: GatewayConfig = fieldgate_common::parse_config(&json).unwrap();
    let gateway = Arc::new(Gateway::start(config).await.unwrap());
    tokio::time::sleep(Duration::from_millis(300)).await;
    gateway
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_rest_reads() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(&dir).await;
    let router = create_router(Arc::clone(&gateway));

    let response = router
        .clone()
        .oneshot(Request::get("/rest/sensor/T1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["dev"], "sensor");
    assert_eq!(body["value"], 23.125);

    let response = router
        .clone()
        .oneshot(Request::get("/rest/sensor/T1/value").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(response).await, json!(23.125));

    let response = router
        .clone()
        .oneshot(Request::get("/json/relay/D1_02").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["circuit"], "D1_02");
    assert_eq!(body["result"]["group"], "D1");

    let response = router
        .clone()
        .oneshot(Request::get("/rest/relay/D9_01").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = router
        .oneshot(Request::get("/rest/all").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), gateway.registry().len());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_rest_writes() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(&dir).await;
    let router = create_router(Arc::clone(&gateway));

    // Bus M1 never came up
    let response = router
        .clone()
        .oneshot(
            Request::post("/rest/relay/D1_01")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from("value=1"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["errors"]["DriverError"].is_string());

    let response = router
        .clone()
        .oneshot(post_json("/json/sensor/T1", json!({ "value": 1 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["errors"]["UnknownOperationError"].is_string());

    let response = router
        .oneshot(post_json("/json/relay/D1_01", json!({ "value": "maybe" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["errors"]["ValidationError"].is_string());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_bulk_route() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(&dir).await;
    let router = create_router(Arc::clone(&gateway));

    let request = json!({
        "group_queries": [ { "device_types": ["sensor"] } ],
        "individual_assignments": [
            { "device_type": "relay", "device_circuit": "D1_01", "assigned_values": { "value": 1 } },
            { "device_type": "relay", "device_circuit": "nope", "assigned_values": { "value": 1 } },
        ],
    });
    let response = router.oneshot(post_json("/bulk", request)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["group_queries"][0]["success"], true);
    assert_eq!(body["individual_assignments"][0]["success"], false);
    assert!(body["individual_assignments"][0]["errors"]["DriverError"].is_string());
    assert_eq!(body["individual_assignments"][1]["success"], false);
    assert!(body.get("group_assignments").is_none());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_modbus_server_serves_sensor() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(&dir).await;

    let image = Arc::new(RegisterImage::new());
    image.seed(gateway.registry());
    gateway.set_modbus_context(image.clone());
    assert_eq!(image.input_registers(2, 1), vec![23]);

    let addr: SocketAddr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(ModbusServer::new(image, addr).run(shutdown_rx));

    let mut ctx = None;
    for _ in 0..20 {
        match tcp::connect(addr).await {
            Ok(c) => {
                ctx = Some(c);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let mut ctx = ctx.expect("Modbus server did not come up");

    let registers = ctx.read_input_registers(2, 1).await.unwrap().unwrap();
    assert_eq!(registers, vec![23]);

    // Relays are published as coils at their dev_id; never read, so off
    let coils = ctx.read_coils(5, 2).await.unwrap().unwrap();
    assert_eq!(coils, vec![false, false]);

    let exception = ctx.write_single_coil(5, true).await.unwrap();
    assert_eq!(exception, Err(ExceptionCode::IllegalFunction));

    shutdown_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
    gateway.shutdown().await;
}
