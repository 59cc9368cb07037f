//! Dependency resolution and bounded propagation across the sensor
//! graph: resolving an `eval.require` map into a symbol table, finding
//! a sensor's dependents, and walking those dependents to a bounded
//! depth.

use crate::registry::{Registry, SensorKey};
use crate::sensor::Sensor;
use crate::value::Value;
use std::collections::HashMap;

/// Propagation never recurses past this depth.
pub const MAX_DEPTH: usize = 8;

fn read_metric(sensor: &Sensor, metric: &str) -> Option<Value> {
    match metric {
        "value" => sensor.state.value.clone(),
        "prev_value" => sensor.state.prev_value.clone(),
        "hits_total" => Some(Value::Number(sensor.state.hits_total as f64)),
        "hit_timestamp" => sensor.state.hit_timestamp.map(Value::Number),
        "duration_seconds" => sensor.state.duration_seconds.map(Value::Number),
        _ => None,
    }
}

/// Resolve a sensor's `eval.require` map into a symbol table, or `None`
/// if any referenced sensor/metric isn't ready yet (the eval is skipped
/// for this cycle, not treated as an error).
pub fn collect_required_vars(
    registry: &Registry,
    key: &SensorKey,
) -> Option<(HashMap<String, Value>, Vec<SensorKey>)> {
    let sensor = registry.get(key)?;
    let eval = sensor.config.eval.as_ref()?;
    if eval.require.is_empty() {
        return Some((HashMap::new(), Vec::new()));
    }

    let mut vars = HashMap::new();
    let mut used = Vec::new();
    for (var, refs) in &eval.require {
        let (ref_node, ref_sensor, metric) = match refs.as_slice() {
            [sensor_id, metric] => (key.0.clone(), sensor_id.clone(), metric.clone()),
            [node_id, sensor_id, metric] => (node_id.clone(), sensor_id.clone(), metric.clone()),
            _ => {
                log::error!(
                    "{}.{}: malformed eval.require entry for `{}`",
                    key.0,
                    key.1,
                    var
                );
                return None;
            }
        };
        let ref_key = (ref_node.clone(), ref_sensor.clone());
        let ref_sensor_obj = registry.get(&ref_key)?;

        if ref_sensor_obj.config.debounce.dataset && !ref_sensor_obj.state.dataset_ready {
            log::debug!(
                "{}.{}: skip eval, {}.{} not ready in dataset",
                key.0,
                key.1,
                ref_node,
                ref_sensor
            );
            return None;
        }

        let value = read_metric(ref_sensor_obj, &metric)?;
        vars.insert(var.clone(), value);
        used.push(ref_key);
    }
    Some((vars, used))
}

/// All sensors whose `eval.require` points (directly) at `key`, each
/// listed at most once.
pub fn dependents(registry: &Registry, key: &SensorKey) -> Vec<SensorKey> {
    let mut out = Vec::new();
    for candidate in registry.order() {
        if let Some(s) = registry.get(candidate) {
            let Some(eval) = &s.config.eval else { continue };
            let hit = eval.require.values().any(|refs| match refs.as_slice() {
                [sensor_id, _] => candidate.0 == key.0 && sensor_id == &key.1,
                [node_id, sensor_id, _] => node_id == &key.0 && sensor_id == &key.1,
                _ => false,
            });
            if hit {
                out.push(candidate.clone());
            }
        }
    }
    out
}

/// Walk the reverse-dependency edges of `key`, evaluating each
/// dependent and recursing into its own dependents, bounded by
/// [`MAX_DEPTH`] and short-circuited by a matching `break_value`.
/// Returns every `(node_id, sensor_id)` that actually changed.
pub fn propagate(
    registry: &mut Registry,
    key: &SensorKey,
    depth: usize,
    origin: &[(String, String)],
    now: f64,
) -> Vec<SensorKey> {
    let mut changed = Vec::new();
    if depth >= MAX_DEPTH {
        log::warn!("{}.{}: propagation depth limit reached", key.0, key.1);
        return changed;
    }

    let (value, break_value) = match registry.get(key) {
        Some(s) => (s.state.value.clone(), s.eval_break_value().cloned()),
        None => return changed,
    };
    if break_value.is_some() && value == break_value {
        return changed;
    }

    let mut new_origin = origin.to_vec();
    new_origin.push(key.clone());

    for dep in dependents(registry, key) {
        let Some((vars, used)) = collect_required_vars(registry, &dep) else {
            continue;
        };
        let accepted = match registry.get_mut(&dep) {
            Some(s) => s.do_eval(&vars, &new_origin, true, now),
            None => false,
        };
        for u in &used {
            if let Some(s) = registry.get_mut(u) {
                s.dataset_use();
            }
        }
        if accepted {
            changed.push(dep.clone());
            changed.extend(propagate(registry, &dep, depth + 1, &new_origin, now));
        }
    }
    changed
}

/// Clear `dataset_used`/`dataset_ready` on any sensor whose dataset
/// flag was consumed this cycle, so the next wire update starts fresh.
pub fn reset_used_datasets(registry: &mut Registry) {
    for key in registry.order().to_vec() {
        if let Some(s) = registry.get_mut(&key) {
            if s.state.dataset_used {
                s.dataset_reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{Role, SensorConfig};
    use crate::value::Kind;

    fn make_registry() -> Registry {
        Registry::new()
    }

    #[test]
    fn dependents_resolves_two_element_refs_against_same_node() {
        let mut reg = make_registry();
        let mut upstream = Sensor::new("gw", "n1", "raw", Kind::Gauge, Role::Sensor, SensorConfig::default());
        upstream.state.value = Some(Value::Number(1.0));
        reg.insert_concrete(upstream);

        let mut cfg = SensorConfig::default();
        cfg.eval = Some(crate::sensor::EvalConfig {
            code: "raw * 2".into(),
            require: HashMap::from([("raw".to_string(), vec!["raw".to_string(), "value".to_string()])]),
            skip_expired: false,
            break_value: None,
        });
        let derived = Sensor::new("gw", "n1", "derived", Kind::Gauge, Role::Sensor, cfg);
        reg.insert_concrete(derived);

        let deps = dependents(&reg, &("n1".to_string(), "raw".to_string()));
        assert_eq!(deps, vec![("n1".to_string(), "derived".to_string())]);
    }

    #[test]
    fn propagate_applies_and_recurses_one_hop() {
        let mut reg = make_registry();
        let upstream = Sensor::new("gw", "n1", "raw", Kind::Gauge, Role::Sensor, SensorConfig::default());
        reg.insert_concrete(upstream);

        let mut cfg = SensorConfig::default();
        cfg.eval = Some(crate::sensor::EvalConfig {
            code: "raw * 2".into(),
            require: HashMap::from([("raw".to_string(), vec!["raw".to_string(), "value".to_string()])]),
            skip_expired: false,
            break_value: None,
        });
        let derived = Sensor::new("gw", "n1", "derived", Kind::Gauge, Role::Sensor, cfg);
        reg.insert_concrete(derived);

        let key = ("n1".to_string(), "raw".to_string());
        reg.get_mut(&key).unwrap().set(Value::Number(4.0), true, false, 1.0);
        let changed = propagate(&mut reg, &key, 0, &[], 1.0);
        assert_eq!(changed, vec![("n1".to_string(), "derived".to_string())]);
        assert_eq!(
            reg.get(&("n1".to_string(), "derived".to_string())).unwrap().state.value,
            Some(Value::Number(8.0))
        );
    }
}
