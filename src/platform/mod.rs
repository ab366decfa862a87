//! Host platform seams: setting stores, usage statistics, the lock surface
//! and the liveness indicator.

pub mod common;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod memory;

use anyhow::Result;
use std::any::Any;
use tokio::sync::mpsc;

use crate::config::{EngineConfig, EnginePaths};
use crate::curve::{BrightnessRange, PlatformCapabilities};
use crate::error::PlatformError;
use crate::process::ProcessStatus;

/// A push-notification subscription for one setting
///
/// Fires zero or more times per external change and may miss changes
/// entirely; it is always paired with a poll.
pub struct ChangeSubscription {
    receiver: mpsc::UnboundedReceiver<()>,
    _guard: Box<dyn Any + Send>,
}

impl ChangeSubscription {
    /// `guard` is kept alive for as long as the subscription; dropping the
    /// subscription drops it, which is how backends unsubscribe.
    pub fn new(receiver: mpsc::UnboundedReceiver<()>, guard: impl Any + Send) -> Self {
        Self {
            receiver,
            _guard: Box::new(guard),
        }
    }

    /// Wait for the next notification. Returns `false` once the sender is gone.
    pub async fn changed(&mut self) -> bool {
        self.receiver.recv().await.is_some()
    }

    /// Swallow notifications already queued so a burst becomes one check
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.receiver.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

/// A watched integer setting (brightness or volume) in native units
pub trait SettingBackend: Send {
    /// Native bounds of the setting
    fn native_range(&mut self) -> Result<BrightnessRange, PlatformError>;

    fn read_native(&mut self) -> Result<i64, PlatformError>;

    fn write_native(&mut self, value: u32) -> Result<(), PlatformError>;

    /// Switch off automatic adjustment so written values stick
    fn pin_manual_mode(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }

    /// Apply (`Some(level)`) or release (`None`) a window-level override in
    /// linear units
    fn apply_override(&mut self, _level: Option<f64>) -> Result<(), PlatformError> {
        Err(PlatformError::NoForegroundContext)
    }

    /// Subscribe to external changes, if the backend has a push channel
    fn subscribe(&mut self) -> Option<ChangeSubscription> {
        None
    }
}

/// Aggregated foreground usage statistics
pub trait UsageStatsSource: Send {
    fn has_permission(&self) -> bool;

    /// Total foreground seconds between `since_ms` and `now_ms`
    fn foreground_seconds(&self, since_ms: i64, now_ms: i64) -> Result<i64, PlatformError>;
}

/// Opaque token for a shown overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlayHandle(pub u64);

/// Full-screen lock presentation surfaces
pub trait LockSurface: Send {
    fn can_draw_overlays(&self) -> bool;

    fn show_overlay(&mut self) -> Result<OverlayHandle, PlatformError>;

    fn remove_overlay(&mut self, handle: OverlayHandle) -> Result<(), PlatformError>;

    /// Bring the lock screen to the front, clearing anything stacked above it
    fn launch_lock_screen(&mut self) -> Result<(), PlatformError>;

    fn finish_lock_screen(&mut self) -> Result<(), PlatformError>;

    /// Whether the lock screen is the foreground-most surface
    fn is_lock_screen_foreground(&self) -> bool;

    /// Identifier of the foreground application, when the platform knows it
    fn foreground_package(&self) -> Option<String>;

    fn launch_dialer(&mut self) -> Result<(), PlatformError>;

    /// Short user-facing feedback such as a toast
    fn show_feedback(&mut self, _message: &str) {}
}

/// The persistent indicator that keeps the process from being reclaimed
pub trait LivenessIndicator: Send {
    fn publish(&mut self, status: &ProcessStatus) -> Result<(), PlatformError>;

    fn withdraw(&mut self) -> Result<(), PlatformError>;
}

/// Everything the enforcement process needs from the host
pub struct Platform {
    pub capabilities: PlatformCapabilities,
    pub brightness: Box<dyn SettingBackend>,
    pub volume: Box<dyn SettingBackend>,
    pub usage_stats: Option<Box<dyn UsageStatsSource>>,
    pub lock_surface: Box<dyn LockSurface>,
    pub liveness: Box<dyn LivenessIndicator>,
}

impl Platform {
    /// Detect the host platform's backends
    #[cfg(target_os = "linux")]
    pub fn detect(config: &EngineConfig, paths: &EnginePaths) -> Result<Self> {
        linux::detect(config, paths)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn detect(_config: &EngineConfig, _paths: &EnginePaths) -> Result<Self> {
        anyhow::bail!("No native backend for this platform; use --simulated")
    }

    /// In-memory platform with handles for driving it
    pub fn simulated() -> (Self, memory::SimulatedHandles) {
        memory::simulated()
    }
}
