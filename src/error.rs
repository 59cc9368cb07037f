//! Typed error kinds for the sensor graph core.
//!
//! Only the outcomes spec'd as user/caller-visible become `Err` variants
//! here (`ErrNotFound`, `ErrConfig`, `ErrInvalidCron`). The remaining
//! kinds named in the design (`ErrDebounced`, `ErrEvalRuntime`,
//! `ErrInvalidAddr`) never propagate as errors — they are silent,
//! logged control flow, matched by a `bool`/`Option` return or a
//! `log::warn!`/`log::debug!` call at the point they occur.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("node or sensor not found: {node_id}.{sensor_id}")]
    NotFound { node_id: String, sensor_id: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid cron spec `{spec}`: {reason}")]
    InvalidCron { spec: String, reason: String },
}

pub type Result<T> = std::result::Result<T, HubError>;
