//! A sensor/actuator state hub: typed value cells, a dependency graph
//! of derived sensors, TTL/cron scheduling, and sparse change dispatch
//! (see the module docs on `sensor`, `registry`, `eval`, `scheduler`,
//! `changebus`, and `hub`).

pub mod changebus;
pub mod config;
pub mod error;
pub mod eval;
pub mod expr;
pub mod hub;
pub mod registry;
pub mod scheduler;
pub mod sensor;
pub mod value;

pub use changebus::{ports, Diff};
pub use error::{HubError, Result};
pub use hub::Hub;
pub use registry::{CronRegistration, MetricMap, NodeMap, Registry, SensorSetup, Snapshot};
pub use sensor::{Role, Sensor, SensorConfig};
pub use value::{Kind, Value};
