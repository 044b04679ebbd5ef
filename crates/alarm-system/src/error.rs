//! Error types for alarm system operations

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlarmError {
    #[error("alarm system not found: {0}")]
    NotFound(u32),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid code")]
    InvalidCode,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}
