//! The sensor graph index: insertion, template instantiation, node
//! writes, and the read views exposed to gateways/UIs.

use crate::config::{node_key_is_template, node_key_to_string, NodeConfigDoc, SensorConfigDoc};
use crate::error::{HubError, Result};
use crate::eval;
use crate::sensor::{
    DebounceConfig, EvalConfig, ExportConfig, LabelSpec, Role, Sensor, SensorConfig,
};
use crate::value::{Kind, Value};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

pub type SensorKey = (String, String);

/// A cron registration a config load or template instantiation wants
/// the scheduler to pick up; `Registry` only records the request, it
/// never touches the clock itself.
#[derive(Debug, Clone)]
pub struct CronRegistration {
    pub node_id: String,
    pub sensor_id: String,
    pub cron_spec: String,
    pub value: Option<Value>,
}

#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub cron_registrations: Vec<CronRegistration>,
}

/// A sensor's wiring, not its live state — what `get_config_of_gw`
/// hands a gateway so it can map wire addresses back to identities.
#[derive(Debug, Clone, Serialize)]
pub struct SensorSetup {
    pub node_id: String,
    pub sensor_id: String,
    pub mode: Role,
    pub node_addr: Option<String>,
    pub key: Option<String>,
}

pub type MetricMap = BTreeMap<String, serde_json::Value>;
pub type NodeMap = BTreeMap<String, MetricMap>;
pub type Snapshot = BTreeMap<String, NodeMap>;

#[derive(Default)]
pub struct Registry {
    sensors: HashMap<SensorKey, Sensor>,
    order: Vec<SensorKey>,
    by_gateway: HashMap<String, Vec<SensorKey>>,
    by_addr: HashMap<(String, String), SensorKey>,
    node_template_index: HashMap<String, HashMap<String, Sensor>>,
    sensor_template_index: HashMap<String, String>,
    pub(crate) exp_timestamp: HashMap<SensorKey, f64>,
    pub(crate) cron_timestamp: HashMap<SensorKey, f64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn get(&self, key: &SensorKey) -> Option<&Sensor> {
        self.sensors.get(key)
    }

    pub fn get_mut(&mut self, key: &SensorKey) -> Option<&mut Sensor> {
        self.sensors.get_mut(key)
    }

    pub fn order(&self) -> &[SensorKey] {
        &self.order
    }

    pub fn contains(&self, key: &SensorKey) -> bool {
        self.sensors.contains_key(key)
    }

    pub(crate) fn insert_concrete(&mut self, sensor: Sensor) {
        let key = (sensor.node_id.clone(), sensor.sensor_id.clone());
        if let Some(addr) = &sensor.node_addr {
            if let Some(k) = &sensor.key {
                self.by_addr.insert((addr.clone(), k.clone()), key.clone());
            }
        }
        self.by_gateway
            .entry(sensor.gateway.clone())
            .or_default()
            .push(key.clone());
        if !self.sensors.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.sensors.insert(key, sensor);
    }

    fn cron_registrations_for(sensor: &Sensor) -> Vec<CronRegistration> {
        sensor
            .config
            .cron
            .iter()
            .map(|(spec, value)| CronRegistration {
                node_id: sensor.node_id.clone(),
                sensor_id: sensor.sensor_id.clone(),
                cron_spec: spec.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Instantiate every sensor of a template node under a new concrete
    /// `node_id`, inserting them live and returning their cron jobs.
    fn instantiate_template_node(
        &mut self,
        template_node_id: &str,
        new_node_id: &str,
    ) -> Vec<CronRegistration> {
        let mut registrations = Vec::new();
        let Some(template_sensors) = self.node_template_index.get(template_node_id) else {
            return registrations;
        };
        let clones: Vec<Sensor> = template_sensors
            .values()
            .map(|s| s.cloned_for_node(new_node_id))
            .collect();
        for clone in clones {
            registrations.extend(Self::cron_registrations_for(&clone));
            self.insert_concrete(clone);
        }
        registrations
    }

    /// Resolve a template sensor_id to its instantiating template node,
    /// materializing the node under `node_id` if needed.
    fn ensure_concrete(&mut self, node_id: &str, sensor_id: &str) -> Result<Vec<CronRegistration>> {
        let key = (node_id.to_string(), sensor_id.to_string());
        if self.sensors.contains_key(&key) {
            return Ok(Vec::new());
        }
        let Some(template_node_id) = self.sensor_template_index.get(sensor_id).cloned() else {
            return Err(HubError::NotFound {
                node_id: node_id.to_string(),
                sensor_id: sensor_id.to_string(),
            });
        };
        let registrations = self.instantiate_template_node(&template_node_id, node_id);
        if !self.sensors.contains_key(&key) {
            return Err(HubError::NotFound {
                node_id: node_id.to_string(),
                sensor_id: sensor_id.to_string(),
            });
        }
        Ok(registrations)
    }

    // ---- configuration loading --------------------------------------

    fn build_sensor_config(node_doc: &NodeConfigDoc, sensor_doc: &SensorConfigDoc) -> SensorConfig {
        let debounce = DebounceConfig {
            changed: sensor_doc.debounce.changed,
            time: sensor_doc.debounce.time,
            hits: sensor_doc.debounce.hits,
            dataset: sensor_doc.debounce.dataset,
            value: sensor_doc.debounce.value.clone(),
        };
        let eval = sensor_doc.eval.as_ref().map(|e| EvalConfig {
            code: e.code.clone(),
            require: e.require.clone(),
            skip_expired: e.skip_expired,
            break_value: e.break_value.clone(),
        });

        let export_doc = sensor_doc.export.clone().or_else(|| node_doc.export.clone());
        let export = export_doc
            .map(|e| ExportConfig {
                hidden: e.hidden.unwrap_or(false),
                prefix: e.prefix,
                labels: e
                    .labels
                    .into_iter()
                    .map(|(k, v)| {
                        let spec = match v {
                            crate::config::LabelSpecDoc::Index(i) => LabelSpec::Index(i),
                            crate::config::LabelSpecDoc::Literal(s) => LabelSpec::Literal(s),
                        };
                        (k, spec)
                    })
                    .collect(),
            })
            .unwrap_or_default();

        SensorConfig {
            default_value: sensor_doc.default.as_ref().and_then(|d| d.value.clone()),
            default_return_ttl: sensor_doc
                .default
                .as_ref()
                .map(|d| d.default_return_ttl)
                .unwrap_or(false),
            ttl: sensor_doc.ttl.or(node_doc.ttl),
            debounce,
            eval,
            cron: sensor_doc.cron.clone(),
            export,
            group: sensor_doc.group.clone(),
            desc: sensor_doc.desc.clone(),
        }
    }

    /// Walk an opaque nested mapping (gateway → node →
    /// {sensors|actuators} → sensor_id → config) and populate the
    /// registry. Template nodes (numeric config keys) are recorded but
    /// not instantiated.
    pub fn load_config(&mut self, doc: &serde_yaml::Value) -> Result<LoadOutcome> {
        let mut outcome = LoadOutcome::default();
        let top = doc
            .as_mapping()
            .ok_or_else(|| HubError::Config("top-level config must be a mapping".into()))?;

        for (gw_key, gw_val) in top {
            let gateway = gw_key
                .as_str()
                .ok_or_else(|| HubError::Config("gateway keys must be strings".into()))?
                .to_string();
            let nodes = gw_val
                .as_mapping()
                .ok_or_else(|| HubError::Config(format!("gateway `{gateway}` must map to nodes")))?;

            for (node_key, node_val) in nodes {
                let is_template = node_key_is_template(node_key);
                let node_id = node_key_to_string(node_key);
                let node_doc: NodeConfigDoc = serde_yaml::from_value(node_val.clone())
                    .map_err(|e| HubError::Config(format!("node `{node_id}`: {e}")))?;

                let mut roles: Vec<(Role, &HashMap<String, SensorConfigDoc>)> = vec![
                    (Role::Sensor, &node_doc.sensors),
                    (Role::Actuator, &node_doc.actuators),
                ];
                roles.retain(|(_, m)| !m.is_empty());

                for (role, sensor_docs) in roles {
                    for (sensor_id, sensor_doc) in sensor_docs {
                        let kind = sensor_doc
                            .kind
                            .as_deref()
                            .and_then(|k| match k.to_ascii_lowercase().as_str() {
                                "gauge" => Some(Kind::Gauge),
                                "counter" => Some(Kind::Counter),
                                "binary" => Some(Kind::Binary),
                                "message" => Some(Kind::Message),
                                _ => None,
                            })
                            .unwrap_or_default();

                        let config = Self::build_sensor_config(&node_doc, sensor_doc);
                        let mut sensor = Sensor::new(
                            gateway.as_str(),
                            node_id.as_str(),
                            sensor_id.as_str(),
                            kind,
                            role,
                            config,
                        );
                        sensor.node_addr = node_doc.addr.clone();
                        sensor.key = sensor_doc.key.clone();

                        if is_template {
                            self.sensor_template_index
                                .insert(sensor_id.clone(), node_id.clone());
                            self.node_template_index
                                .entry(node_id.clone())
                                .or_default()
                                .insert(sensor_id.clone(), sensor);
                        } else {
                            outcome
                                .cron_registrations
                                .extend(Self::cron_registrations_for(&sensor));
                            self.insert_concrete(sensor);
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    // ---- writes -------------------------------------------------------

    fn run_own_eval(&mut self, key: &SensorKey, now: f64) {
        let has_eval = self.get(key).map(|s| s.has_eval()).unwrap_or(false);
        if !has_eval {
            return;
        }
        let Some((vars, used)) = eval::collect_required_vars(self, key) else {
            return;
        };
        if let Some(s) = self.get_mut(key) {
            s.do_eval(&vars, &[], false, now);
        }
        for u in &used {
            if let Some(s) = self.get_mut(u) {
                s.dataset_use();
            }
        }
    }

    /// Apply a batch of writes to one node. `values` preserves caller
    /// order so debounce/increment effects are deterministic. Template
    /// instantiation happens lazily on first write to an unknown
    /// sensor_id that matches a known template.
    pub fn set_node_values(
        &mut self,
        node_id: &str,
        values: &[(String, Value)],
        increment: bool,
        now: f64,
    ) -> Result<(Vec<SensorKey>, Vec<CronRegistration>)> {
        let mut changed = Vec::new();
        let mut cron_registrations = Vec::new();

        for (sensor_id, value) in values {
            cron_registrations.extend(self.ensure_concrete(node_id, sensor_id)?);

            let key = (node_id.to_string(), sensor_id.clone());
            let accepted = self
                .get_mut(&key)
                .expect("ensure_concrete guarantees presence")
                .set(value.clone(), true, increment, now);

            if accepted {
                changed.push(key.clone());
                self.run_own_eval(&key, now);
                changed.extend(eval::propagate(self, &key, 0, &[], now));
                eval::reset_used_datasets(self);
            }
        }
        Ok((changed, cron_registrations))
    }

    /// Resolve `(addr, key)` pairs to sensor keys, carrying the raw
    /// value through, so a gateway payload can be converted and applied
    /// in one pass. Unresolved pairs are dropped with a warning rather
    /// than failing the whole batch.
    pub fn convert_addr_values(&self, entries: &[(String, String, Value)]) -> Vec<(SensorKey, Value)> {
        let mut out = Vec::new();
        for (addr, key, value) in entries {
            match self.by_addr.get(&(addr.clone(), key.clone())) {
                Some(sensor_key) => out.push((sensor_key.clone(), value.clone())),
                None => log::warn!("no sensor bound to addr={addr} key={key}, dropping"),
            }
        }
        out
    }

    /// Called by the scheduler when a TTL job fires.
    pub fn sensor_expire(&mut self, key: &SensorKey, now: f64) -> Vec<SensorKey> {
        let mut changed = Vec::new();
        let did_change = match self.get_mut(key) {
            Some(s) => s.reset(now),
            None => return changed,
        };
        if did_change {
            changed.push(key.clone());
            self.run_own_eval(key, now);
            changed.extend(eval::propagate(self, key, 0, &[], now));
            eval::reset_used_datasets(self);
        }
        changed
    }

    /// Called by the scheduler when a cron job fires.
    pub fn sensor_cron_trigger(&mut self, key: &SensorKey, value: Option<Value>, now: f64) -> Vec<SensorKey> {
        let accepted = match (self.get_mut(key), value) {
            (Some(s), Some(v)) => s.set(v, true, false, now),
            (Some(s), None) => s.reset(now),
            (None, _) => return Vec::new(),
        };
        let mut changed = Vec::new();
        if accepted {
            changed.push(key.clone());
            self.run_own_eval(key, now);
            changed.extend(eval::propagate(self, key, 0, &[], now));
            eval::reset_used_datasets(self);
        }
        changed
    }

    /// Hard-reset every concrete sensor: state is rebuilt from scratch
    /// (hit counters zeroed, debounce state forgotten) rather than just
    /// the value reverting. Returns every sensor key, since a full
    /// rebuild touches metrics beyond `value` even where `value` itself
    /// lands unchanged, plus the cron registrations that need
    /// re-arming (every sensor carrying a `cron` map).
    pub fn reset_values(&mut self, now: f64) -> (Vec<SensorKey>, Vec<CronRegistration>) {
        let mut registrations = Vec::new();
        for key in self.order.clone() {
            if let Some(sensor) = self.sensors.get_mut(&key) {
                let default_value = sensor
                    .config
                    .default_value
                    .clone()
                    .or_else(|| sensor.kind.implicit_default());
                sensor.state = Default::default();
                sensor.state.value = default_value;
                if sensor.kind == Kind::Binary {
                    sensor.state.hits_total = 1;
                }
                registrations.extend(Self::cron_registrations_for(sensor));
            }
        }
        self.exp_timestamp.clear();
        (self.order.clone(), registrations)
    }

    /// Soft-reset every concrete sensor to its configured default via
    /// `Sensor::reset`, leaving identity, config, and hit counters
    /// otherwise alone. Returns the sensors whose value actually moved.
    pub fn default_values(&mut self, now: f64) -> Vec<SensorKey> {
        let mut changed = Vec::new();
        for key in self.order.clone() {
            if let Some(sensor) = self.sensors.get_mut(&key) {
                if sensor.reset(now) {
                    changed.push(key);
                }
            }
        }
        changed
    }

    pub fn set_hold(&mut self, key: &SensorKey, release: bool) -> Result<()> {
        self.get_mut(key)
            .ok_or_else(|| HubError::NotFound {
                node_id: key.0.clone(),
                sensor_id: key.1.clone(),
            })?
            .set_hold(release);
        Ok(())
    }

    // ---- read views -----------------------------------------------------

    /// Project one sensor's live metrics: `value`, `hits_total`,
    /// `hit_timestamp`, `duration_seconds`, `exp_timestamp`, and
    /// `cron_timestamp`. When `skip_none` is set, any metric whose
    /// value is absent is omitted rather than reported as `null`.
    fn metric_view(&self, key: &SensorKey, sensor: &Sensor, skip_none: bool) -> MetricMap {
        let mut m = MetricMap::new();
        insert_metric(
            &mut m,
            "value",
            sensor.state.value.as_ref().map(value_to_json),
            skip_none,
        );
        m.insert("hits_total".into(), sensor.state.hits_total.into());
        insert_metric(
            &mut m,
            "hit_timestamp",
            sensor.state.hit_timestamp.map(Into::into),
            skip_none,
        );
        insert_metric(
            &mut m,
            "duration_seconds",
            sensor.state.duration_seconds.map(Into::into),
            skip_none,
        );
        insert_metric(
            &mut m,
            "exp_timestamp",
            self.exp_timestamp.get(key).copied().map(Into::into),
            skip_none,
        );
        insert_metric(
            &mut m,
            "cron_timestamp",
            self.cron_timestamp.get(key).copied().map(Into::into),
            skip_none,
        );
        m
    }

    pub fn get_metrics_of_node(&self, node_id: &str) -> NodeMap {
        let mut out = NodeMap::new();
        for key in &self.order {
            if key.0 == node_id {
                if let Some(s) = self.sensors.get(key) {
                    if !s.config.export.hidden {
                        out.insert(key.1.clone(), self.metric_view(key, s, false));
                    }
                }
            }
        }
        out
    }

    pub fn get_metrics_dict_by_gw(&self, gateway: &str) -> Snapshot {
        let mut out = Snapshot::new();
        if let Some(keys) = self.by_gateway.get(gateway) {
            for key in keys {
                if let Some(s) = self.sensors.get(key) {
                    if s.config.export.hidden {
                        continue;
                    }
                    out.entry(key.0.clone())
                        .or_default()
                        .insert(key.1.clone(), self.metric_view(key, s, false));
                }
            }
        }
        out
    }

    /// All gateways at once, keyed `node_id -> sensor_id -> metrics`.
    /// This is the baseline `ChangeBus` diffs against, always with
    /// `skip_none=false` so a metric reverting to absent still shows up
    /// as an explicit `null` in the diff.
    pub fn get_metrics_dict_by_node(&self, skip_none: bool) -> Snapshot {
        let mut out = Snapshot::new();
        for key in &self.order {
            if let Some(s) = self.sensors.get(key) {
                if s.config.export.hidden {
                    continue;
                }
                out.entry(key.0.clone())
                    .or_default()
                    .insert(key.1.clone(), self.metric_view(key, s, skip_none));
            }
        }
        out
    }

    /// All gateways at once, keyed `sensor_id -> node_id -> metrics` —
    /// the same data as `get_metrics_dict_by_node` with the outer two
    /// levels swapped, for callers that group by sensor identity.
    pub fn get_metrics_dict_by_sensor(&self, skip_none: bool) -> Snapshot {
        let mut out = Snapshot::new();
        for key in &self.order {
            if let Some(s) = self.sensors.get(key) {
                if s.config.export.hidden {
                    continue;
                }
                out.entry(key.1.clone())
                    .or_default()
                    .insert(key.0.clone(), self.metric_view(key, s, skip_none));
            }
        }
        out
    }

    /// The full, unfiltered dump used for administrative inspection:
    /// every sensor including hidden ones, metrics always present.
    pub fn get_sensors_dump_dict(&self) -> Snapshot {
        let mut out = Snapshot::new();
        for key in &self.order {
            if let Some(s) = self.sensors.get(key) {
                out.entry(key.0.clone())
                    .or_default()
                    .insert(key.1.clone(), self.metric_view(key, s, false));
            }
        }
        out
    }

    /// Wiring only (no live state) for every sensor on a gateway, used
    /// to hand a transport the addr/key identities it needs to route
    /// incoming writes.
    pub fn get_config_of_gw(&self, gateway: &str) -> Vec<SensorSetup> {
        let mut out = Vec::new();
        if let Some(keys) = self.by_gateway.get(gateway) {
            for key in keys {
                if let Some(s) = self.sensors.get(key) {
                    out.push(SensorSetup {
                        node_id: s.node_id.clone(),
                        sensor_id: s.sensor_id.clone(),
                        mode: s.role,
                        node_addr: s.node_addr.clone(),
                        key: s.key.clone(),
                    });
                }
            }
        }
        out
    }

    pub fn get_sensor(&self, key: &SensorKey) -> Option<&Sensor> {
        self.sensors.get(key)
    }
}

fn insert_metric(
    m: &mut MetricMap,
    name: &str,
    value: Option<serde_json::Value>,
    skip_none: bool,
) {
    match value {
        Some(v) => {
            m.insert(name.into(), v);
        }
        None if !skip_none => {
            m.insert(name.into(), serde_json::Value::Null);
        }
        None => {}
    }
}

fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Number(n) => serde_json::json!(n),
        Value::Bool(b) => serde_json::json!(b),
        Value::Text(s) => serde_json::json!(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> serde_yaml::Value {
        serde_yaml::from_str(
            r#"
gw1:
  room1:
    addr: "1.2.3.4"
    sensors:
      temp:
        type: gauge
        key: "temp_key"
    actuators:
      heater:
        type: binary
  1:
    sensors:
      humidity:
        type: gauge
"#,
        )
        .unwrap()
    }

    #[test]
    fn load_config_separates_concrete_and_template_nodes() {
        let mut reg = Registry::new();
        reg.load_config(&sample_doc()).unwrap();
        assert!(reg.contains(&("room1".to_string(), "temp".to_string())));
        assert!(reg.contains(&("room1".to_string(), "heater".to_string())));
        assert!(!reg.contains(&("1".to_string(), "humidity".to_string())));
        assert!(reg.sensor_template_index.contains_key("humidity"));
    }

    #[test]
    fn set_node_values_instantiates_template_on_first_write() {
        let mut reg = Registry::new();
        reg.load_config(&sample_doc()).unwrap();
        let (changed, regs) = reg
            .set_node_values("room7", &[("humidity".to_string(), Value::Number(55.0))], false, 1.0)
            .unwrap();
        assert!(changed.contains(&("room7".to_string(), "humidity".to_string())));
        assert!(regs.is_empty());
        assert!(reg.contains(&("room7".to_string(), "humidity".to_string())));
    }

    #[test]
    fn set_node_values_rejects_unknown_sensor() {
        let mut reg = Registry::new();
        reg.load_config(&sample_doc()).unwrap();
        let result = reg.set_node_values("room1", &[("ghost".to_string(), Value::Number(1.0))], false, 1.0);
        assert!(result.is_err());
    }

    #[test]
    fn convert_addr_values_drops_unknown_pairs_with_a_warning() {
        let mut reg = Registry::new();
        reg.load_config(&sample_doc()).unwrap();
        let resolved = reg.convert_addr_values(&[
            ("1.2.3.4".to_string(), "temp_key".to_string(), Value::Number(10.0)),
            ("9.9.9.9".to_string(), "nope".to_string(), Value::Number(0.0)),
        ]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].0, ("room1".to_string(), "temp".to_string()));
    }

    #[test]
    fn default_values_resets_value_but_not_every_sensor_unconditionally() {
        let mut reg = Registry::new();
        reg.load_config(&sample_doc()).unwrap();
        reg.set_node_values("room1", &[("temp".to_string(), Value::Number(30.0))], false, 1.0)
            .unwrap();

        let changed = reg.default_values(2.0);
        assert!(changed.contains(&("room1".to_string(), "temp".to_string())));
        assert!(
            !changed.contains(&("room1".to_string(), "heater".to_string())),
            "heater was never written, so its value was already at its default"
        );
        assert_eq!(
            reg.get(&("room1".to_string(), "temp".to_string())).unwrap().state.value,
            None
        );
    }

    #[test]
    fn get_metrics_dict_by_node_reports_an_explicit_null_after_ttl_disarm() {
        let mut reg = Registry::new();
        reg.load_config(&sample_doc()).unwrap();
        let key = ("room1".to_string(), "temp".to_string());
        reg.exp_timestamp.insert(key.clone(), 123.0);
        let before = reg.get_metrics_dict_by_node(false);
        assert_eq!(
            before.get("room1").unwrap().get("temp").unwrap().get("exp_timestamp").unwrap(),
            &serde_json::json!(123.0)
        );

        reg.exp_timestamp.remove(&key);
        let after = reg.get_metrics_dict_by_node(false);
        assert_eq!(
            after.get("room1").unwrap().get("temp").unwrap().get("exp_timestamp").unwrap(),
            &serde_json::Value::Null
        );
    }

    #[test]
    fn hidden_sensors_are_excluded_from_metrics_views() {
        let mut reg = Registry::new();
        reg.load_config(&sample_doc()).unwrap();
        reg.get_mut(&("room1".to_string(), "temp".to_string()))
            .unwrap()
            .config
            .export
            .hidden = true;
        let view = reg.get_metrics_of_node("room1");
        assert!(!view.contains_key("temp"));
        assert!(view.contains_key("heater"));
    }
}
