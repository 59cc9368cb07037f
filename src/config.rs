//! Configuration data model.
//!
//! `Registry::load_config` takes an already-parsed nested mapping — the
//! YAML/Jinja file-loading pipeline itself stays an external
//! collaborator. This module only defines the shape of that mapping
//! and how to read it out of a `serde_yaml::Value`.

use crate::value::Value;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DefaultDoc {
    pub value: Option<Value>,
    #[serde(default)]
    pub default_return_ttl: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DebounceDoc {
    #[serde(default)]
    pub changed: bool,
    pub time: Option<f64>,
    pub hits: Option<u32>,
    #[serde(default)]
    pub dataset: bool,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LabelSpecDoc {
    Index(usize),
    Literal(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExportDoc {
    pub hidden: Option<bool>,
    pub prefix: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, LabelSpecDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvalDoc {
    pub code: String,
    #[serde(default)]
    pub require: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub skip_expired: bool,
    pub break_value: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SensorConfigDoc {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub default: Option<DefaultDoc>,
    #[serde(default)]
    pub debounce: DebounceDoc,
    pub ttl: Option<u64>,
    pub export: Option<ExportDoc>,
    pub eval: Option<EvalDoc>,
    #[serde(default)]
    pub cron: HashMap<String, Option<Value>>,
    pub group: Option<String>,
    pub desc: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NodeConfigDoc {
    pub addr: Option<String>,
    pub ttl: Option<u64>,
    pub export: Option<ExportDoc>,
    #[serde(default)]
    pub sensors: HashMap<String, SensorConfigDoc>,
    #[serde(default)]
    pub actuators: HashMap<String, SensorConfigDoc>,
}

/// True when a YAML mapping key denotes a template node: any numeric
/// config key indicates a template, any string key a concrete node.
pub fn node_key_is_template(key: &serde_yaml::Value) -> bool {
    matches!(key, serde_yaml::Value::Number(_))
}

pub fn node_key_to_string(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_node_keys_are_numeric() {
        let doc: serde_yaml::Value = serde_yaml::from_str(
            "1:\n  sensors:\n    humidity:\n      type: gauge\n",
        )
        .unwrap();
        let map = doc.as_mapping().unwrap();
        let (key, _) = map.iter().next().unwrap();
        assert!(node_key_is_template(key));
    }

    #[test]
    fn concrete_node_keys_are_strings() {
        let doc: serde_yaml::Value = serde_yaml::from_str(
            "room42:\n  sensors:\n    humidity:\n      type: gauge\n",
        )
        .unwrap();
        let map = doc.as_mapping().unwrap();
        let (key, _) = map.iter().next().unwrap();
        assert!(!node_key_is_template(key));
        assert_eq!(node_key_to_string(key), "room42");
    }
}
