use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Runtime permissions the engine depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Write access to the device settings store (brightness)
    WriteSettings,
    /// Access to aggregated foreground usage statistics
    UsageStats,
    /// Drawing a system-level overlay above other applications
    Overlay,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::WriteSettings => "write-settings",
            Permission::UsageStats => "usage-stats",
            Permission::Overlay => "overlay",
        };
        f.write_str(name)
    }
}

/// Failures reported by a platform backend
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("permission not granted: {0}")]
    PermissionDenied(Permission),

    #[error("setting unavailable: {0}")]
    Unavailable(String),

    /// No foreground window to apply a visual override to
    #[error("no foreground context to apply override")]
    NoForegroundContext,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    /// Stable error code for bridge layers
    pub fn code(&self) -> &'static str {
        match self {
            PlatformError::PermissionDenied(_) => "PERMISSION_DENIED",
            PlatformError::Unavailable(_) => "UNAVAILABLE",
            PlatformError::NoForegroundContext => "NO_FOREGROUND_CONTEXT",
            PlatformError::Io(_) => "IO",
        }
    }

    /// Map an I/O failure on a settings file, keeping permission problems distinguishable
    pub fn from_io(err: std::io::Error, permission: Permission) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            PlatformError::PermissionDenied(permission)
        } else {
            PlatformError::Io(err)
        }
    }
}

/// Errors returned through the control surface
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("permission not granted: {0}")]
    Permission(Permission),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Platform(PlatformError),

    #[error("failed to persist state: {0:#}")]
    Persistence(#[source] anyhow::Error),

    #[error("enforcement process is not running")]
    ProcessUnavailable,
}

impl ControlError {
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::Permission(_) => "PERMISSION_DENIED",
            ControlError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ControlError::Platform(e) => e.code(),
            ControlError::Persistence(_) => "PERSISTENCE",
            ControlError::ProcessUnavailable => "PROCESS_UNAVAILABLE",
        }
    }
}

impl From<PlatformError> for ControlError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::PermissionDenied(permission) => ControlError::Permission(permission),
            other => ControlError::Platform(other),
        }
    }
}
