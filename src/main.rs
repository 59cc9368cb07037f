//! Minimal demo binary: loads a small in-repo config, drives a couple
//! of writes through the hub, and prints the resulting metrics dump.
//! The HTTP/SocketIO surface a real deployment would sit behind is an
//! external collaborator (see `DESIGN.md`) and isn't built here.

use log::info;
use sensor_hub::hub::Hub;
use sensor_hub::value::Value;

const DEMO_CONFIG: &str = r#"
home:
  kitchen:
    addr: "10.0.0.5"
    sensors:
      temperature:
        type: gauge
        ttl: 300
        default:
          value: 0.0
        debounce:
          changed: true
      temperature_f:
        type: gauge
        eval:
          code: "temperature * 9 / 5 + 32"
          require:
            temperature: ["temperature", "value"]
    actuators:
      heater:
        type: binary
        key: "heater_relay"
"#;

#[tokio::main]
async fn main() {
    env_logger::init();
    info!("sensor-hubd starting up");

    let doc: serde_yaml::Value = serde_yaml::from_str(DEMO_CONFIG).expect("embedded demo config is valid YAML");
    let hub = Hub::new(
        Box::new(sensor_hub::ports::LogSink),
        Box::new(sensor_hub::ports::LogSink),
    );

    hub.load_config(&doc).await.expect("demo config loads");

    hub.set_node_values("kitchen", vec![("temperature".to_string(), Value::Number(21.5))], false)
        .await
        .expect("kitchen is a known node");

    let dump = hub.get_sensors_dump_dict().await;
    println!("{}", serde_json::to_string_pretty(&dump).unwrap());

    info!("sensor-hubd demo run complete");
}
