use std::time::Duration;

use fieldgate_core::{DeviceType, Gateway, GatewayConfig};

const W1_SLAVE: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                        72 01 4b 46 7f ff 0e 10 57 t=23125\n";

#[tokio::test]
async fn test_start_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let sensor_dir = dir.path().join("28-000001");
    std::fs::create_dir(&sensor_dir).unwrap();
    std::fs::write(sensor_dir.join("w1_slave"), W1_SLAVE).unwrap();

    let alias_path = dir.path().join("aliases.json5");
    std::fs::write(
        &alias_path,
        r#"{
            version: 1.0,
            aliases: [
                { dev_type: "sensor", circuit: "T1", name: "boiler" },
                { dev_type: "relay", circuit: "nope", name: "ghost" },
                { dev_type: "relay", circuit: "D1_01", name: "boiler" },
            ],
        }"#,
    )
    .unwrap();

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
                X: {{ type: "CANBUS" }},
            }},
            alias_files: ["{alias}", "{missing}"],
        }}"#,
        root = dir.path().display(),
        alias = alias_path.display(),
        missing = dir.path().join("missing.json5").display(),
    );

    let config: GatewayConfig = fieldgate_common::parse_config(&json).unwrap();
    let gateway = Gateway::start(config).await.unwrap();
    let registry = gateway.registry();

    let ow = registry.lookup_by_circuit(DeviceType::OwBus, "OW").unwrap();
    assert!(ow.as_bus().unwrap().is_active());
    let m1 = registry.lookup_by_circuit(DeviceType::TcpBus, "M1").unwrap();
    assert!(!m1.as_bus().unwrap().is_active());
    assert_eq!(m1.dev_id(), 3);

    // Devices on an unreachable bus are still registered
    let relay = registry.lookup_by_circuit(DeviceType::Relay, "D1_02").unwrap();
    assert_eq!(relay.dev_id(), 6);
    let slave = registry.lookup_by_circuit(DeviceType::ModbusSlave, "D1").unwrap();
    assert!(!slave.as_slave().unwrap().is_scanning());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let sensor = gateway.commands().get("sensor", "boiler", None).unwrap();
    assert_eq!(sensor["circuit"], "T1");
    assert_eq!(sensor["value"], 23.125);
    assert_eq!(sensor["lost"], false);

    // "boiler" was taken by the sensor first
    assert!(relay.alias().is_none());

    gateway.shutdown().await;
    assert!(!ow.as_bus().unwrap().is_active());
}

#[tokio::test]
async fn test_start_rejects_invalid_config() {
    let config: GatewayConfig =
        fieldgate_common::parse_config(r#"{ webhook: { device_mask: ["flux"] } }"#).unwrap();
    let err = Gateway::start(config).await.err().unwrap();
    assert_eq!(err.name(), "ConfigError");
}
