use serde::Serialize;
use thiserror::Error;

/// Errors the daemon reports back over D-Bus, serialized to JSON so the
/// frontend can match on the variant.
#[derive(Debug, Error, Serialize)]
pub enum ArchkitError {
    #[error("Field {0} is not set")]
    NotSet(String),
    #[error("Unknown config field: {0}")]
    UnknownField(String),
    #[error("Failed to serialize config: {0}")]
    GetConfig(String),
    #[error("Invalid value for field {0}: {1}")]
    SetValue(String, String),
    #[error("Failed to inspect block devices: {0}")]
    InspectDevices(String),
    #[error("Failed to start install: {0}")]
    Install(String),
}

impl ArchkitError {
    pub fn not_set(field: &str) -> Self {
        Self::NotSet(field.to_string())
    }

    pub fn unknown_field(field: &str) -> Self {
        Self::UnknownField(field.to_string())
    }

    pub fn get_config(err: serde_json::Error) -> Self {
        Self::GetConfig(err.to_string())
    }
}
