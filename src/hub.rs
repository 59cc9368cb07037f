//! The public facade: one cooperative-writer lock around the sensor
//! graph, wiring `Registry`, `Scheduler`, and `ChangeBus` together.
//! One struct behind an `Arc`; every mutating method holds the
//! registry lock for the whole call.

use crate::changebus::{ports::ActuatorSink, ports::EventSink, ChangeBus, Diff};
use crate::error::Result;
use crate::registry::{CronRegistration, Registry, SensorKey};
use crate::scheduler::{JobId, Scheduler};
use crate::value::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

fn now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

struct HubInner {
    registry: Mutex<Registry>,
    scheduler: Arc<Scheduler>,
    changebus: Mutex<ChangeBus>,
    event_sink: Box<dyn EventSink>,
    actuator_sink: Box<dyn ActuatorSink>,
}

/// Cheaply cloneable handle to the sensor graph. All mutating calls
/// hold the registry lock for their full duration — one logical
/// writer at a time, not per-field locking.
#[derive(Clone)]
pub struct Hub(Arc<HubInner>);

impl Hub {
    pub fn new(event_sink: Box<dyn EventSink>, actuator_sink: Box<dyn ActuatorSink>) -> Self {
        Self(Arc::new(HubInner {
            registry: Mutex::new(Registry::new()),
            scheduler: Arc::new(Scheduler::new()),
            changebus: Mutex::new(ChangeBus::new()),
            event_sink,
            actuator_sink,
        }))
    }

    /// Load a configuration document. Seeds the change-bus baseline without
    /// emitting spurious "everything changed" notifications, and arms
    /// every cron job the config declares on concrete sensors.
    pub async fn load_config(&self, doc: &serde_yaml::Value) -> Result<()> {
        let mut registry = self.0.registry.lock().await;
        let outcome = registry.load_config(doc)?;
        {
            let mut bus = self.0.changebus.lock().await;
            bus.seed(&registry);
        }
        for reg in outcome.cron_registrations {
            Self::arm_cron_registration(&self.0, reg).await;
        }
        Ok(())
    }

    /// Apply a batch of writes to one node's sensors, re-arming TTL/cron
    /// jobs and dispatching the resulting diff.
    pub async fn set_node_values(
        &self,
        node_id: &str,
        values: Vec<(String, Value)>,
        increment: bool,
    ) -> Result<Diff> {
        let now = now();
        let mut registry = self.0.registry.lock().await;
        let (changed, cron_registrations) =
            registry.set_node_values(node_id, &values, increment, now)?;

        Self::rearm_ttls(&self.0, &mut registry, &changed, now).await;
        for reg in cron_registrations {
            Self::arm_cron_registration(&self.0, reg).await;
        }

        Self::fanout_actuators(&self.0, &registry, &changed);
        let mut bus = self.0.changebus.lock().await;
        Ok(bus.dispatch(&registry, self.0.event_sink.as_ref()))
    }

    /// Resolve `(addr, key)` pairs to sensors and apply the writes,
    /// grouped by node so template instantiation still works.
    pub async fn apply_by_addr(
        &self,
        entries: Vec<(String, String, Value)>,
    ) -> Result<Diff> {
        let now = now();
        let mut registry = self.0.registry.lock().await;
        let resolved = registry.convert_addr_values(&entries);

        let mut by_node: std::collections::BTreeMap<String, Vec<(String, Value)>> =
            std::collections::BTreeMap::new();
        for ((node_id, sensor_id), value) in resolved {
            by_node.entry(node_id).or_default().push((sensor_id, value));
        }

        let mut all_changed = Vec::new();
        for (node_id, values) in by_node {
            let (changed, cron_registrations) =
                registry.set_node_values(&node_id, &values, false, now)?;
            Self::rearm_ttls(&self.0, &mut registry, &changed, now).await;
            for reg in cron_registrations {
                Self::arm_cron_registration(&self.0, reg).await;
            }
            all_changed.extend(changed);
        }

        Self::fanout_actuators(&self.0, &registry, &all_changed);
        let mut bus = self.0.changebus.lock().await;
        Ok(bus.dispatch(&registry, self.0.event_sink.as_ref()))
    }

    /// Hard-reset every sensor to its configured default (state rebuilt
    /// from scratch, cron jobs re-armed) and dispatch the resulting
    /// diff.
    pub async fn reset_values(&self) -> Result<Diff> {
        let now = now();
        let mut registry = self.0.registry.lock().await;
        let (changed, cron_registrations) = registry.reset_values(now);
        Self::rearm_ttls(&self.0, &mut registry, &changed, now).await;
        for reg in cron_registrations {
            Self::arm_cron_registration(&self.0, reg).await;
        }
        Self::fanout_actuators(&self.0, &registry, &changed);
        let mut bus = self.0.changebus.lock().await;
        Ok(bus.dispatch(&registry, self.0.event_sink.as_ref()))
    }

    /// Soft-reset every sensor to its configured default via
    /// `Sensor::reset` (hit counters and debounce state untouched
    /// beyond what `reset` itself clears) and dispatch the resulting
    /// diff.
    pub async fn default_values(&self) -> Result<Diff> {
        let now = now();
        let mut registry = self.0.registry.lock().await;
        let changed = registry.default_values(now);
        Self::rearm_ttls(&self.0, &mut registry, &changed, now).await;
        Self::fanout_actuators(&self.0, &registry, &changed);
        let mut bus = self.0.changebus.lock().await;
        Ok(bus.dispatch(&registry, self.0.event_sink.as_ref()))
    }

    pub async fn set_hold(&self, key: SensorKey, release: bool) -> Result<()> {
        let mut registry = self.0.registry.lock().await;
        registry.set_hold(&key, release)
    }

    pub async fn get_metrics_of_node(&self, node_id: &str) -> crate::registry::NodeMap {
        self.0.registry.lock().await.get_metrics_of_node(node_id)
    }

    pub async fn get_metrics_dict_by_gw(&self, gateway: &str) -> crate::registry::Snapshot {
        self.0.registry.lock().await.get_metrics_dict_by_gw(gateway)
    }

    pub async fn get_sensors_dump_dict(&self) -> crate::registry::Snapshot {
        self.0.registry.lock().await.get_sensors_dump_dict()
    }

    pub async fn get_config_of_gw(&self, gateway: &str) -> Vec<crate::registry::SensorSetup> {
        self.0.registry.lock().await.get_config_of_gw(gateway)
    }

    /// Fan a batch of changed sensors out to the actuator sink: every
    /// changed actuator fires the by-node/sensor stream unconditionally,
    /// and additionally the by-addr/key stream when the sensor carries
    /// a wire alias.
    fn fanout_actuators(inner: &Arc<HubInner>, registry: &Registry, changed: &[SensorKey]) {
        for key in changed {
            let Some(sensor) = registry.get(key) else { continue };
            if !sensor.is_actuator() {
                continue;
            }
            let Some(value) = &sensor.state.value else { continue };
            inner.actuator_sink.write_actuator_by_node(
                &sensor.gateway,
                &sensor.node_id,
                &sensor.sensor_id,
                value,
            );
            if let (Some(addr), Some(k)) = (&sensor.node_addr, &sensor.key) {
                inner
                    .actuator_sink
                    .write_actuator_by_addr(&sensor.gateway, addr, k, value);
            }
        }
    }

    /// Arm or disarm a changed sensor's TTL job: a write that lands on
    /// the default value disarms it (the sensor has already expired,
    /// there's nothing more to wait for); any other write re-arms the
    /// countdown from now. Clearing `exp_timestamp` on disarm (rather
    /// than leaving the stale entry) is what lets the next dispatch
    /// surface the transition as an explicit `null`.
    async fn rearm_ttls(
        inner: &Arc<HubInner>,
        registry: &mut Registry,
        changed: &[SensorKey],
        now: f64,
    ) {
        for key in changed {
            let Some(sensor) = registry.get(key) else { continue };
            let Some(ttl) = sensor.config.ttl else { continue };
            let job_id: JobId = key.clone();
            if sensor.state.value == sensor.config.default_value {
                inner.scheduler.cancel(&job_id).await;
                registry.exp_timestamp.remove(key);
                continue;
            }
            let weak = Arc::downgrade(inner);
            let job_key = key.clone();
            let run: Arc<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync> =
                Arc::new(move || {
                    let weak = weak.clone();
                    let job_key = job_key.clone();
                    Box::pin(async move {
                        let Some(inner) = weak.upgrade() else { return };
                        let now = now_from_inner();
                        let mut registry = inner.registry.lock().await;
                        registry.exp_timestamp.remove(&job_key);
                        let changed = registry.sensor_expire(&job_key, now);
                        Hub::rearm_ttls(&inner, &mut registry, &changed, now).await;
                        Hub::fanout_actuators(&inner, &registry, &changed);
                        let mut bus = inner.changebus.lock().await;
                        bus.dispatch(&registry, inner.event_sink.as_ref());
                    })
                });
            inner.scheduler.arm_after(job_id, ttl, now, run).await;
            registry.exp_timestamp.insert(key.clone(), now + ttl as f64);
        }
    }

    async fn arm_cron_registration(inner: &Arc<HubInner>, reg: CronRegistration) {
        let cron = match Scheduler::parse_cron(&reg.cron_spec) {
            Ok(c) => c,
            Err(e) => {
                log::error!(
                    "{}.{}: dropping cron job, {e}",
                    reg.node_id,
                    reg.sensor_id
                );
                return;
            }
        };
        let job_id: JobId = (reg.node_id.clone(), reg.sensor_id.clone());
        let weak = Arc::downgrade(inner);
        let value = reg.value.clone();
        let job_key = job_id.clone();
        let run: Arc<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync> =
            Arc::new(move || {
                let weak = weak.clone();
                let job_key = job_key.clone();
                let value = value.clone();
                Box::pin(async move {
                    let Some(inner) = weak.upgrade() else { return };
                    let now = now_from_inner();
                    let mut registry = inner.registry.lock().await;
                    registry.cron_timestamp.insert(job_key.clone(), now);
                    let changed = registry.sensor_cron_trigger(&job_key, value, now);
                    Hub::rearm_ttls(&inner, &mut registry, &changed, now).await;
                    Hub::fanout_actuators(&inner, &registry, &changed);
                    let mut bus = inner.changebus.lock().await;
                    bus.dispatch(&registry, inner.event_sink.as_ref());
                })
            });
        inner.scheduler.arm_cron(job_id, cron, run).await;
    }
}

fn now_from_inner() -> f64 {
    now()
}
