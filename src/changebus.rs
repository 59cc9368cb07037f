//! Change detection and fanout: a three-level sparse diff between
//! consecutive metric snapshots, dispatched through a sink trait the
//! transport layer implements, kept generic over delivery mechanism.

use crate::registry::{MetricMap, NodeMap, Registry, Snapshot};
use std::collections::BTreeMap;

pub mod ports {
    use crate::value::Value;

    /// Receives node-level change notifications bound for UI/event
    /// subscribers. The realtime transport (rooms, framing, delivery
    /// guarantees) lives outside this crate; implementors just need to
    /// accept a diff.
    pub trait EventSink: Send + Sync {
        fn node_changed(&self, gateway: &str, node_id: &str, metrics: &serde_json::Value);
    }

    /// Receives actuator writes bound for a gateway. Every changed
    /// actuator fires `write_actuator_by_node` regardless of how it's
    /// wired; `write_actuator_by_addr` additionally fires when the
    /// sensor carries a wire-level `(node_addr, key)` alias, for
    /// gateways that route by address rather than identity.
    pub trait ActuatorSink: Send + Sync {
        fn write_actuator_by_node(&self, gateway: &str, node_id: &str, sensor_id: &str, value: &Value);
        fn write_actuator_by_addr(&self, gateway: &str, node_addr: &str, key: &str, value: &Value);
    }

    /// No-op sink, useful for embedding the hub without a transport.
    pub struct NullSink;
    impl EventSink for NullSink {
        fn node_changed(&self, _gateway: &str, _node_id: &str, _metrics: &serde_json::Value) {}
    }
    impl ActuatorSink for NullSink {
        fn write_actuator_by_node(&self, _gateway: &str, _node_id: &str, _sensor_id: &str, _value: &Value) {}
        fn write_actuator_by_addr(&self, _gateway: &str, _node_addr: &str, _key: &str, _value: &Value) {}
    }

    /// Logs what would have been dispatched; handy for demos and tests.
    pub struct LogSink;
    impl EventSink for LogSink {
        fn node_changed(&self, gateway: &str, node_id: &str, metrics: &serde_json::Value) {
            log::info!("{gateway}/{node_id} changed: {metrics}");
        }
    }
    impl ActuatorSink for LogSink {
        fn write_actuator_by_node(&self, gateway: &str, node_id: &str, sensor_id: &str, value: &Value) {
            log::info!("{gateway}: actuator {node_id}.{sensor_id} = {value}");
        }
        fn write_actuator_by_addr(&self, gateway: &str, node_addr: &str, key: &str, value: &Value) {
            log::info!("{gateway}: write {node_addr}.{key} = {value}");
        }
    }
}

/// A diff between two metric snapshots, keyed the same three levels
/// deep as the registry itself: node → sensor → metric.
pub type Diff = BTreeMap<String, NodeMap>;

fn metric_map_diff(before: &MetricMap, after: &MetricMap) -> Option<MetricMap> {
    let mut out = MetricMap::new();
    for (metric, value) in after {
        if before.get(metric) != Some(value) {
            out.insert(metric.clone(), value.clone());
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn node_map_diff(before: &NodeMap, after: &NodeMap) -> Option<NodeMap> {
    let mut out = NodeMap::new();
    for (sensor_id, after_metrics) in after {
        let empty = MetricMap::new();
        let before_metrics = before.get(sensor_id).unwrap_or(&empty);
        if let Some(d) = metric_map_diff(before_metrics, after_metrics) {
            out.insert(sensor_id.clone(), d);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Compares two full-registry snapshots and returns only the nodes
/// (and within them, only the sensors and metrics) that actually
/// changed.
pub fn diff_snapshots(before: &Snapshot, after: &Snapshot) -> Diff {
    let mut out = Diff::new();
    for (node_id, after_node) in after {
        let empty = NodeMap::new();
        let before_node = before.get(node_id).unwrap_or(&empty);
        if let Some(d) = node_map_diff(before_node, after_node) {
            out.insert(node_id.clone(), d);
        }
    }
    out
}

/// Tracks the last-dispatched snapshot and fans a new one out to
/// registered sinks, emitting only the sparse diff.
pub struct ChangeBus {
    prev: Snapshot,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self { prev: Snapshot::new() }
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt `registry`'s current by-node view as the baseline without
    /// publishing anything — used right after a config load so the
    /// first real write only reports what it actually changed.
    pub fn seed(&mut self, registry: &Registry) {
        self.prev = registry.get_metrics_dict_by_node(false);
    }

    /// Diff `registry`'s current by-node view against the last
    /// dispatched snapshot, publish node-level notifications for what
    /// changed, and remember the new snapshot as the baseline for next
    /// time. Using `skip_none=false` means a metric reverting to
    /// absent (TTL disarm) still surfaces as an explicit `null`.
    pub fn dispatch(&mut self, registry: &Registry, sink: &dyn ports::EventSink) -> Diff {
        let current = registry.get_metrics_dict_by_node(false);
        let diff = diff_snapshots(&self.prev, &current);

        for (node_id, metrics) in &diff {
            let gateway = diff_gateway_of(registry, node_id).unwrap_or_default();
            let payload = serde_json::to_value(metrics).unwrap_or(serde_json::Value::Null);
            sink.node_changed(&gateway, node_id, &payload);
        }

        self.prev = current;
        diff
    }
}

fn diff_gateway_of(registry: &Registry, node_id: &str) -> Option<String> {
    registry
        .order()
        .iter()
        .find(|k| k.0 == node_id)
        .and_then(|k| registry.get(k))
        .map(|s| s.gateway.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str, i64)]) -> Snapshot {
        let mut out = Snapshot::new();
        for (node, sensor, value) in pairs {
            out.entry(node.to_string())
                .or_default()
                .entry(sensor.to_string())
                .or_default()
                .insert("value".to_string(), serde_json::json!(value));
        }
        out
    }

    #[test]
    fn diff_is_empty_when_nothing_changed() {
        let before = map(&[("n1", "s1", 1)]);
        let after = map(&[("n1", "s1", 1)]);
        assert!(diff_snapshots(&before, &after).is_empty());
    }

    #[test]
    fn diff_reports_only_the_changed_sensor() {
        let before = map(&[("n1", "s1", 1), ("n1", "s2", 2)]);
        let after = map(&[("n1", "s1", 1), ("n1", "s2", 99)]);
        let diff = diff_snapshots(&before, &after);
        assert_eq!(diff.len(), 1);
        let node = &diff["n1"];
        assert_eq!(node.len(), 1);
        assert!(node.contains_key("s2"));
    }

    #[test]
    fn diff_reports_a_brand_new_node() {
        let before = map(&[("n1", "s1", 1)]);
        let after = map(&[("n1", "s1", 1), ("n2", "s1", 5)]);
        let diff = diff_snapshots(&before, &after);
        assert_eq!(diff.len(), 1);
        assert!(diff.contains_key("n2"));
    }
}
