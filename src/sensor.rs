//! The sensor value cell: identity, config, and state.

use crate::expr::{self, ExprValue, SymbolTable};
use crate::value::{Kind, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sensor,
    Actuator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LabelSpec {
    Index(usize),
    Literal(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    pub hidden: bool,
    pub prefix: Option<String>,
    pub labels: HashMap<String, LabelSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebounceConfig {
    pub changed: bool,
    pub time: Option<f64>,
    pub hits: Option<u32>,
    pub dataset: bool,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    pub code: String,
    pub require: HashMap<String, Vec<String>>,
    pub skip_expired: bool,
    pub break_value: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorConfig {
    pub default_value: Option<Value>,
    pub default_return_ttl: bool,
    pub ttl: Option<u64>,
    pub debounce: DebounceConfig,
    pub eval: Option<EvalConfig>,
    pub cron: HashMap<String, Option<Value>>,
    pub export: ExportConfig,
    pub group: Option<String>,
    pub desc: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorState {
    pub value: Option<Value>,
    pub prev_value: Option<Value>,
    pub hits_total: u64,
    pub hit_timestamp: Option<f64>,
    pub duration_seconds: Option<f64>,
    pub dataset_ready: bool,
    pub dataset_used: bool,
    pub debounce_hits_remaining: u32,
    pub hold: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub gateway: String,
    pub node_id: String,
    pub sensor_id: String,
    pub node_addr: Option<String>,
    pub key: Option<String>,
    pub kind: Kind,
    pub role: Role,
    pub config: SensorConfig,
    pub state: SensorState,
}

impl Sensor {
    pub fn new(
        gateway: impl Into<String>,
        node_id: impl Into<String>,
        sensor_id: impl Into<String>,
        kind: Kind,
        role: Role,
        config: SensorConfig,
    ) -> Self {
        let default_value = config
            .default_value
            .clone()
            .or_else(|| kind.implicit_default());
        let mut sensor = Self {
            gateway: gateway.into(),
            node_id: node_id.into(),
            sensor_id: sensor_id.into(),
            node_addr: None,
            key: None,
            kind,
            role,
            config,
            state: SensorState::default(),
        };
        sensor.config.default_value = default_value;
        sensor.state.value = sensor.config.default_value.clone();
        // Binary sensors count an initial hit at construction, matching
        // `Switch.__init__`'s unconditional `hits_total = 0` followed by
        // an immediate `reset()` that (for Switch alone) calls `count_hit`.
        if kind == Kind::Binary {
            sensor.state.hits_total = 1;
        }
        sensor
    }

    /// Clone this sensor (a template instance or a plain copy) under a
    /// new concrete `node_id`, matching `Sensor.clone` — identity moves,
    /// state and config are carried over unchanged.
    pub fn cloned_for_node(&self, new_node_id: &str) -> Self {
        let mut clone = self.clone();
        clone.node_id = new_node_id.to_string();
        clone
    }

    pub fn is_actuator(&self) -> bool {
        self.role == Role::Actuator
    }

    /// Coerce and apply an incoming write, honoring debounce and hold.
    /// Returns whether the write was accepted.
    pub fn set(&mut self, value: Value, update: bool, increment: bool, now: f64) -> bool {
        if self.state.hold {
            return false;
        }

        let coerced = match self.kind.coerce(&value) {
            Some(v) => v,
            None => {
                log::debug!(
                    "{}.{}: rejected uncoercible value {:?}",
                    self.node_id,
                    self.sensor_id,
                    value
                );
                return false;
            }
        };

        if let Some(dv) = &self.config.debounce.value {
            if *dv == coerced {
                return false;
            }
        }

        if self.config.debounce.changed {
            if let Some(current) = &self.state.value {
                if *current == coerced {
                    return false;
                }
            }
        }

        if let Some(min_interval) = self.config.debounce.time {
            if let Some(last) = self.state.hit_timestamp {
                if now < last + min_interval {
                    return false;
                }
            }
        }

        if self.state.debounce_hits_remaining > 0 {
            self.state.debounce_hits_remaining -= 1;
            return false;
        }
        if let Some(hits) = self.config.debounce.hits {
            self.state.debounce_hits_remaining = hits;
        }

        let mut coerced = coerced;
        if increment {
            if let (Some(current), Some(delta)) = (
                self.state.value.as_ref().and_then(Value::as_f64),
                coerced.as_f64(),
            ) {
                coerced = Value::Number(current + delta);
            } else {
                log::warn!(
                    "{}.{}: increment requested on non-numeric value, ignoring increment",
                    self.node_id,
                    self.sensor_id
                );
            }
        }

        if update {
            self.state.prev_value = self.state.value.clone();
        }
        self.state.value = Some(coerced.clone());

        if update {
            self.count_hit(now);

            if self.config.debounce.dataset {
                self.state.dataset_ready = true;
            }

            if self.config.ttl.is_some()
                && !self.config.default_return_ttl
                && self.config.default_value.as_ref() == Some(&coerced)
            {
                self.state.dataset_ready = false;
                self.state.dataset_used = false;
                self.state.debounce_hits_remaining = 0;
            }
        }

        true
    }

    fn count_hit(&mut self, now: f64) {
        self.state.hits_total += 1;
        if let Some(last) = self.state.hit_timestamp {
            self.state.duration_seconds = Some(now - last);
        }
        self.state.hit_timestamp = Some(now);
    }

    /// Run this sensor's own expression against the given symbol table
    /// and apply the result as a write.
    pub fn do_eval(
        &mut self,
        vars: &HashMap<String, Value>,
        origin: &[(String, String)],
        update: bool,
        now: f64,
    ) -> bool {
        let eval = match &self.config.eval {
            Some(e) => e,
            None => return false,
        };
        if !eval.require.is_empty() && vars.is_empty() {
            return false;
        }

        let mut symbols: SymbolTable = HashMap::new();
        for (k, v) in vars {
            symbols.insert(k.clone(), ExprValue::from(v));
        }
        symbols.insert(
            "value".into(),
            self.state
                .value
                .as_ref()
                .map(ExprValue::from)
                .unwrap_or(ExprValue::Null),
        );
        symbols.insert(
            "prev_value".into(),
            self.state
                .prev_value
                .as_ref()
                .map(ExprValue::from)
                .unwrap_or(ExprValue::Null),
        );
        symbols.insert(
            "hits_total".into(),
            ExprValue::Number(self.state.hits_total as f64),
        );
        symbols.insert(
            "hit_timestamp".into(),
            self.state
                .hit_timestamp
                .map(ExprValue::Number)
                .unwrap_or(ExprValue::Null),
        );
        symbols.insert(
            "duration_seconds".into(),
            self.state
                .duration_seconds
                .map(ExprValue::Number)
                .unwrap_or(ExprValue::Null),
        );
        symbols.insert("origin".into(), expr::origin_to_expr_value(origin));

        let code = eval.code.clone();
        match expr::evaluate(&code, &symbols) {
            Ok(Some(result)) => self.set(result, update, false, now),
            Ok(None) => false,
            Err(e) => {
                log::error!("{}.{}: eval error: {}", self.node_id, self.sensor_id, e);
                false
            }
        }
    }

    /// Reinitialize state from configured defaults without forgetting
    /// identity or config.
    pub fn reset(&mut self, now: f64) -> bool {
        let changed = self.state.value != self.config.default_value;
        self.state.value = self.config.default_value.clone();
        self.state.dataset_ready = false;
        self.state.dataset_used = false;
        self.state.debounce_hits_remaining = 0;
        if self.kind == Kind::Binary {
            self.count_hit(now);
        }
        changed
    }

    pub fn set_hold(&mut self, release: bool) {
        self.state.hold = !release;
    }

    pub fn dataset_use(&mut self) {
        if self.config.debounce.dataset {
            self.state.dataset_used = true;
        }
    }

    pub fn dataset_reset(&mut self) {
        if self.config.debounce.dataset {
            self.state.dataset_ready = false;
            self.state.dataset_used = false;
        }
    }

    pub fn eval_break_value(&self) -> Option<&Value> {
        self.config.eval.as_ref().and_then(|e| e.break_value.as_ref())
    }

    pub fn eval_skip_expired(&self) -> bool {
        self.config.eval.as_ref().map(|e| e.skip_expired).unwrap_or(false)
    }

    pub fn has_eval(&self) -> bool {
        self.config.eval.is_some()
    }
}
