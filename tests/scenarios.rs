//! End-to-end scenarios exercising the hub as a whole: config loading,
//! debounce, cascading derivation, depth bounding, actuator fanout, and
//! template instantiation.

use sensor_hub::hub::Hub;
use sensor_hub::ports::{ActuatorSink, EventSink, LogSink, NullSink};
use sensor_hub::value::Value;
use std::sync::{Arc, Mutex};

fn hub_with_sinks(
    actuator_sink: Box<dyn ActuatorSink>,
) -> Hub {
    Hub::new(Box::new(LogSink), actuator_sink)
}

#[tokio::test]
async fn debounce_changed_drops_repeated_writes() {
    let hub = hub_with_sinks(Box::new(NullSink));
    let doc: serde_yaml::Value = serde_yaml::from_str(
        r#"
gw:
  room:
    sensors:
      temp:
        type: gauge
        debounce:
          changed: true
"#,
    )
    .unwrap();
    hub.load_config(&doc).await.unwrap();

    let diff = hub
        .set_node_values("room", vec![("temp".to_string(), Value::Number(20.0))], false)
        .await
        .unwrap();
    assert!(diff.contains_key("room"));

    let diff = hub
        .set_node_values("room", vec![("temp".to_string(), Value::Number(20.0))], false)
        .await
        .unwrap();
    assert!(diff.is_empty(), "repeated identical write must not re-dispatch");

    let diff = hub
        .set_node_values("room", vec![("temp".to_string(), Value::Number(21.0))], false)
        .await
        .unwrap();
    assert!(diff.contains_key("room"));
}

#[tokio::test]
async fn cascading_eval_updates_the_dependent_sensor() {
    let hub = hub_with_sinks(Box::new(NullSink));
    let doc: serde_yaml::Value = serde_yaml::from_str(
        r#"
gw:
  room:
    sensors:
      celsius:
        type: gauge
      fahrenheit:
        type: gauge
        eval:
          code: "celsius * 9 / 5 + 32"
          require:
            celsius: ["celsius", "value"]
"#,
    )
    .unwrap();
    hub.load_config(&doc).await.unwrap();

    hub.set_node_values("room", vec![("celsius".to_string(), Value::Number(0.0))], false)
        .await
        .unwrap();

    let dump = hub.get_metrics_of_node("room").await;
    let fahrenheit = dump.get("fahrenheit").unwrap().get("value").unwrap();
    assert_eq!(fahrenheit, &serde_json::json!(32.0));
}

#[tokio::test]
async fn propagation_stops_at_the_depth_bound() {
    let hub = hub_with_sinks(Box::new(NullSink));

    // A 10-sensor chain: s0 -> s1 -> s2 -> ... -> s9, each requiring
    // the previous one's value. Only the first 8 hops beyond the root
    // write should actually fire.
    let mut yaml = String::from("gw:\n  room:\n    sensors:\n      s0:\n        type: gauge\n");
    for i in 1..10 {
        yaml.push_str(&format!(
            "      s{i}:\n        type: gauge\n        eval:\n          code: \"s{prev} + 1\"\n          require:\n            s{prev}: [\"s{prev}\", \"value\"]\n",
            i = i,
            prev = i - 1
        ));
    }
    let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
    hub.load_config(&doc).await.unwrap();

    hub.set_node_values("room", vec![("s0".to_string(), Value::Number(1.0))], false)
        .await
        .unwrap();

    let dump = hub.get_metrics_of_node("room").await;
    for i in 1..=8 {
        let v = dump.get(&format!("s{i}")).unwrap().get("value").unwrap();
        assert_eq!(v, &serde_json::json!(1.0 + i as f64), "s{i} should have updated");
    }
    // s9 is beyond MAX_DEPTH (8 hops from the root write) and keeps its
    // implicit default (no numeric default for a gauge => null).
    let s9 = dump.get("s9").unwrap().get("value").unwrap();
    assert_eq!(s9, &serde_json::Value::Null);
}

#[derive(Default)]
struct CapturingActuatorSink {
    by_node: Mutex<Vec<(String, String, String, Value)>>,
    by_addr: Mutex<Vec<(String, String, String, Value)>>,
}

impl ActuatorSink for CapturingActuatorSink {
    fn write_actuator_by_node(&self, gateway: &str, node_id: &str, sensor_id: &str, value: &Value) {
        self.by_node.lock().unwrap().push((
            gateway.to_string(),
            node_id.to_string(),
            sensor_id.to_string(),
            value.clone(),
        ));
    }

    fn write_actuator_by_addr(&self, gateway: &str, node_addr: &str, key: &str, value: &Value) {
        self.by_addr.lock().unwrap().push((
            gateway.to_string(),
            node_addr.to_string(),
            key.to_string(),
            value.clone(),
        ));
    }
}

#[tokio::test]
async fn actuator_writes_fan_out_to_the_gateway_sink() {
    let sink = Arc::new(CapturingActuatorSink::default());

    struct Forwarding(Arc<CapturingActuatorSink>);
    impl ActuatorSink for Forwarding {
        fn write_actuator_by_node(&self, gateway: &str, node_id: &str, sensor_id: &str, value: &Value) {
            self.0.write_actuator_by_node(gateway, node_id, sensor_id, value);
        }
        fn write_actuator_by_addr(&self, gateway: &str, node_addr: &str, key: &str, value: &Value) {
            self.0.write_actuator_by_addr(gateway, node_addr, key, value);
        }
    }

    let hub = hub_with_sinks(Box::new(Forwarding(sink.clone())));
    let doc: serde_yaml::Value = serde_yaml::from_str(
        r#"
gw1:
  room:
    addr: "10.0.0.9"
    actuators:
      heater:
        type: binary
        key: "relay1"
      fan:
        type: binary
"#,
    )
    .unwrap();
    hub.load_config(&doc).await.unwrap();

    hub.set_node_values(
        "room",
        vec![
            ("heater".to_string(), Value::Bool(true)),
            ("fan".to_string(), Value::Bool(true)),
        ],
        false,
    )
    .await
    .unwrap();

    let by_node = sink.by_node.lock().unwrap();
    assert_eq!(by_node.len(), 2, "both actuators fan out by node/sensor identity");
    assert!(by_node.iter().any(|w| w.1 == "room" && w.2 == "fan"));

    let by_addr = sink.by_addr.lock().unwrap();
    assert_eq!(by_addr.len(), 1, "only the addr/key-wired actuator fans out by addr");
    assert_eq!(by_addr[0].0, "gw1");
    assert_eq!(by_addr[0].1, "10.0.0.9");
    assert_eq!(by_addr[0].2, "relay1");
    assert_eq!(by_addr[0].3, Value::Bool(true));
}

#[tokio::test]
async fn unknown_node_instantiates_from_a_matching_template() {
    let hub = hub_with_sinks(Box::new(NullSink));
    let doc: serde_yaml::Value = serde_yaml::from_str(
        r#"
gw:
  1:
    sensors:
      humidity:
        type: gauge
        ttl: 60
"#,
    )
    .unwrap();
    hub.load_config(&doc).await.unwrap();

    // "room9" has never been seen before; humidity is a known template
    // sensor_id, so the whole template node is cloned under room9.
    hub.set_node_values("room9", vec![("humidity".to_string(), Value::Number(55.0))], false)
        .await
        .unwrap();

    let dump = hub.get_metrics_of_node("room9").await;
    assert_eq!(
        dump.get("humidity").unwrap().get("value").unwrap(),
        &serde_json::json!(55.0)
    );
}

#[tokio::test]
async fn unknown_sensor_with_no_template_is_rejected() {
    let hub = hub_with_sinks(Box::new(NullSink));
    let doc: serde_yaml::Value = serde_yaml::from_str(
        r#"
gw:
  room:
    sensors:
      temp:
        type: gauge
"#,
    )
    .unwrap();
    hub.load_config(&doc).await.unwrap();

    let result = hub
        .set_node_values("room", vec![("ghost".to_string(), Value::Number(1.0))], false)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn reset_values_returns_every_sensor_to_its_configured_default() {
    let hub = hub_with_sinks(Box::new(NullSink));
    let doc: serde_yaml::Value = serde_yaml::from_str(
        r#"
gw:
  room:
    sensors:
      temp:
        type: gauge
        default:
          value: 18.0
"#,
    )
    .unwrap();
    hub.load_config(&doc).await.unwrap();

    hub.set_node_values("room", vec![("temp".to_string(), Value::Number(30.0))], false)
        .await
        .unwrap();
    hub.reset_values().await.unwrap();

    let dump = hub.get_metrics_of_node("room").await;
    assert_eq!(
        dump.get("temp").unwrap().get("value").unwrap(),
        &serde_json::json!(18.0)
    );
}

#[tokio::test]
async fn default_values_soft_resets_without_zeroing_hit_counters() {
    let hub = hub_with_sinks(Box::new(NullSink));
    let doc: serde_yaml::Value = serde_yaml::from_str(
        r#"
gw:
  room:
    sensors:
      door:
        type: binary
"#,
    )
    .unwrap();
    hub.load_config(&doc).await.unwrap();

    hub.set_node_values("room", vec![("door".to_string(), Value::Bool(true))], false)
        .await
        .unwrap();
    let before = hub.get_metrics_of_node("room").await;
    let hits_before = before
        .get("door")
        .unwrap()
        .get("hits_total")
        .unwrap()
        .as_u64()
        .unwrap();

    hub.default_values().await.unwrap();

    let after = hub.get_metrics_of_node("room").await;
    let door = after.get("door").unwrap();
    assert_eq!(door.get("value").unwrap(), &serde_json::json!(false));
    assert!(
        door.get("hits_total").unwrap().as_u64().unwrap() > hits_before,
        "a soft reset on a binary sensor counts a hit rather than zeroing the total"
    );
}

#[tokio::test]
async fn ttl_expiry_clears_the_armed_timestamp_and_resets_the_value() {
    let hub = hub_with_sinks(Box::new(NullSink));
    let doc: serde_yaml::Value = serde_yaml::from_str(
        r#"
gw:
  room:
    sensors:
      motion:
        type: binary
        ttl: 0
"#,
    )
    .unwrap();
    hub.load_config(&doc).await.unwrap();

    hub.set_node_values("room", vec![("motion".to_string(), Value::Bool(true))], false)
        .await
        .unwrap();

    let armed = hub.get_sensors_dump_dict().await;
    let motion = armed.get("room").unwrap().get("motion").unwrap();
    assert!(motion.get("exp_timestamp").unwrap().is_number());

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let expired = hub.get_sensors_dump_dict().await;
    let motion = expired.get("room").unwrap().get("motion").unwrap();
    assert_eq!(motion.get("exp_timestamp").unwrap(), &serde_json::Value::Null);
    assert_eq!(motion.get("value").unwrap(), &serde_json::json!(false));
}

#[allow(dead_code)]
fn assert_event_sink_is_object_safe(_: &dyn EventSink) {}
