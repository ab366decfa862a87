//! In-memory platform used by tests and by `run --simulated`.
//!
//! Every backend shares its state with a cloneable handle so a test (or the
//! simulated runtime) can play the part of the OS and the user.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{
    ChangeSubscription, LivenessIndicator, LockSurface, OverlayHandle, Platform, SettingBackend,
    UsageStatsSource,
};
use crate::curve::{BrightnessRange, PlatformCapabilities, PlatformGeneration};
use crate::error::{Permission, PlatformError};
use crate::process::ProcessStatus;

fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct SettingState {
    value: i64,
    range: BrightnessRange,
    writable: bool,
    has_foreground: bool,
    manual_mode: bool,
    override_level: Option<f64>,
    writes: usize,
    subscribers: Vec<mpsc::UnboundedSender<()>>,
}

/// Simulated setting store
pub struct MemorySetting {
    shared: Arc<Mutex<SettingState>>,
    push: bool,
}

/// Test-side handle for a [`MemorySetting`]
#[derive(Clone)]
pub struct SettingHandle {
    shared: Arc<Mutex<SettingState>>,
}

impl MemorySetting {
    /// `push` controls whether the setting offers change notifications
    pub fn new(range: BrightnessRange, initial: i64, push: bool) -> (Self, SettingHandle) {
        let shared = Arc::new(Mutex::new(SettingState {
            value: initial,
            range,
            writable: true,
            has_foreground: true,
            manual_mode: false,
            override_level: None,
            writes: 0,
            subscribers: Vec::new(),
        }));
        (
            Self {
                shared: shared.clone(),
                push,
            },
            SettingHandle { shared },
        )
    }
}

impl SettingBackend for MemorySetting {
    fn native_range(&mut self) -> Result<BrightnessRange, PlatformError> {
        Ok(lock(&self.shared).range)
    }

    fn read_native(&mut self) -> Result<i64, PlatformError> {
        Ok(lock(&self.shared).value)
    }

    fn write_native(&mut self, value: u32) -> Result<(), PlatformError> {
        let mut state = lock(&self.shared);
        if !state.writable {
            return Err(PlatformError::PermissionDenied(Permission::WriteSettings));
        }
        state.value = value as i64;
        state.writes += 1;
        Ok(())
    }

    fn pin_manual_mode(&mut self) -> Result<(), PlatformError> {
        lock(&self.shared).manual_mode = true;
        Ok(())
    }

    fn apply_override(&mut self, level: Option<f64>) -> Result<(), PlatformError> {
        let mut state = lock(&self.shared);
        if level.is_some() && !state.has_foreground {
            return Err(PlatformError::NoForegroundContext);
        }
        state.override_level = level;
        Ok(())
    }

    fn subscribe(&mut self) -> Option<ChangeSubscription> {
        if !self.push {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared).subscribers.push(tx);
        Some(ChangeSubscription::new(rx, ()))
    }
}

impl SettingHandle {
    pub fn value(&self) -> i64 {
        lock(&self.shared).value
    }

    /// Change the value from outside and fire change notifications
    pub fn set_external(&self, value: i64) {
        let mut state = lock(&self.shared);
        state.value = value;
        state.subscribers.retain(|tx| tx.send(()).is_ok());
    }

    /// Change the value without notifying, as a missed push event would
    pub fn set_silently(&self, value: i64) {
        lock(&self.shared).value = value;
    }

    pub fn set_writable(&self, writable: bool) {
        lock(&self.shared).writable = writable;
    }

    pub fn set_has_foreground(&self, has_foreground: bool) {
        lock(&self.shared).has_foreground = has_foreground;
    }

    pub fn writes(&self) -> usize {
        lock(&self.shared).writes
    }

    pub fn manual_mode(&self) -> bool {
        lock(&self.shared).manual_mode
    }

    pub fn override_level(&self) -> Option<f64> {
        lock(&self.shared).override_level
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = lock(&self.shared);
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }
}

#[derive(Debug, Default)]
struct UsageState {
    permission: bool,
    seconds: i64,
}

/// Simulated usage statistics
pub struct MemoryUsageStats {
    shared: Arc<Mutex<UsageState>>,
}

#[derive(Clone)]
pub struct UsageHandle {
    shared: Arc<Mutex<UsageState>>,
}

impl MemoryUsageStats {
    pub fn new(permission: bool) -> (Self, UsageHandle) {
        let shared = Arc::new(Mutex::new(UsageState {
            permission,
            seconds: 0,
        }));
        (
            Self {
                shared: shared.clone(),
            },
            UsageHandle { shared },
        )
    }
}

impl UsageStatsSource for MemoryUsageStats {
    fn has_permission(&self) -> bool {
        lock(&self.shared).permission
    }

    fn foreground_seconds(&self, _since_ms: i64, _now_ms: i64) -> Result<i64, PlatformError> {
        let state = lock(&self.shared);
        if !state.permission {
            return Err(PlatformError::PermissionDenied(Permission::UsageStats));
        }
        Ok(state.seconds)
    }
}

impl UsageHandle {
    pub fn set_permission(&self, permission: bool) {
        lock(&self.shared).permission = permission;
    }

    pub fn set_foreground_seconds(&self, seconds: i64) {
        lock(&self.shared).seconds = seconds;
    }
}

#[derive(Debug, Default)]
struct SurfaceState {
    overlay_permission: bool,
    overlay_fails: bool,
    overlays: Vec<OverlayHandle>,
    next_handle: u64,
    lock_screen_open: bool,
    lock_screen_foreground: bool,
    launches: usize,
    foreground_package: Option<String>,
    dialer_launches: usize,
    feedback: Vec<String>,
}

/// Simulated lock surface
pub struct MemoryLockSurface {
    shared: Arc<Mutex<SurfaceState>>,
}

#[derive(Clone)]
pub struct SurfaceHandle {
    shared: Arc<Mutex<SurfaceState>>,
}

impl MemoryLockSurface {
    pub fn new(overlay_permission: bool) -> (Self, SurfaceHandle) {
        let shared = Arc::new(Mutex::new(SurfaceState {
            overlay_permission,
            next_handle: 1,
            ..Default::default()
        }));
        (
            Self {
                shared: shared.clone(),
            },
            SurfaceHandle { shared },
        )
    }
}

impl LockSurface for MemoryLockSurface {
    fn can_draw_overlays(&self) -> bool {
        lock(&self.shared).overlay_permission
    }

    fn show_overlay(&mut self) -> Result<OverlayHandle, PlatformError> {
        let mut state = lock(&self.shared);
        if !state.overlay_permission {
            return Err(PlatformError::PermissionDenied(Permission::Overlay));
        }
        if state.overlay_fails {
            return Err(PlatformError::Unavailable("window manager rejected overlay".into()));
        }
        let handle = OverlayHandle(state.next_handle);
        state.next_handle += 1;
        state.overlays.push(handle);
        Ok(handle)
    }

    fn remove_overlay(&mut self, handle: OverlayHandle) -> Result<(), PlatformError> {
        let mut state = lock(&self.shared);
        state.overlays.retain(|h| *h != handle);
        Ok(())
    }

    fn launch_lock_screen(&mut self) -> Result<(), PlatformError> {
        let mut state = lock(&self.shared);
        state.lock_screen_open = true;
        state.lock_screen_foreground = true;
        state.foreground_package = None;
        state.launches += 1;
        Ok(())
    }

    fn finish_lock_screen(&mut self) -> Result<(), PlatformError> {
        let mut state = lock(&self.shared);
        state.lock_screen_open = false;
        state.lock_screen_foreground = false;
        Ok(())
    }

    fn is_lock_screen_foreground(&self) -> bool {
        lock(&self.shared).lock_screen_foreground
    }

    fn foreground_package(&self) -> Option<String> {
        lock(&self.shared).foreground_package.clone()
    }

    fn launch_dialer(&mut self) -> Result<(), PlatformError> {
        let mut state = lock(&self.shared);
        state.lock_screen_foreground = false;
        state.foreground_package = Some("com.android.dialer".to_string());
        state.dialer_launches += 1;
        Ok(())
    }

    fn show_feedback(&mut self, message: &str) {
        lock(&self.shared).feedback.push(message.to_string());
    }
}

impl SurfaceHandle {
    pub fn set_overlay_permission(&self, granted: bool) {
        lock(&self.shared).overlay_permission = granted;
    }

    pub fn set_overlay_fails(&self, fails: bool) {
        lock(&self.shared).overlay_fails = fails;
    }

    pub fn overlay_showing(&self) -> bool {
        !lock(&self.shared).overlays.is_empty()
    }

    /// Overlays shown and not yet removed
    pub fn live_overlays(&self) -> usize {
        lock(&self.shared).overlays.len()
    }

    pub fn lock_screen_open(&self) -> bool {
        lock(&self.shared).lock_screen_open
    }

    pub fn lock_screen_foreground(&self) -> bool {
        lock(&self.shared).lock_screen_foreground
    }

    pub fn launches(&self) -> usize {
        lock(&self.shared).launches
    }

    pub fn dialer_launches(&self) -> usize {
        lock(&self.shared).dialer_launches
    }

    pub fn feedback(&self) -> Vec<String> {
        lock(&self.shared).feedback.clone()
    }

    /// The user switches to another application
    pub fn switch_to(&self, package: &str) {
        let mut state = lock(&self.shared);
        state.lock_screen_foreground = false;
        state.foreground_package = Some(package.to_string());
    }
}

/// Simulated liveness indicator recording the last published status
pub struct MemoryLiveness {
    shared: Arc<Mutex<Option<ProcessStatus>>>,
}

#[derive(Clone)]
pub struct LivenessHandle {
    shared: Arc<Mutex<Option<ProcessStatus>>>,
}

impl MemoryLiveness {
    pub fn new() -> (Self, LivenessHandle) {
        let shared = Arc::new(Mutex::new(None));
        (
            Self {
                shared: shared.clone(),
            },
            LivenessHandle { shared },
        )
    }
}

impl LivenessIndicator for MemoryLiveness {
    fn publish(&mut self, status: &ProcessStatus) -> Result<(), PlatformError> {
        *lock(&self.shared) = Some(status.clone());
        Ok(())
    }

    fn withdraw(&mut self) -> Result<(), PlatformError> {
        *lock(&self.shared) = None;
        Ok(())
    }
}

impl LivenessHandle {
    pub fn current(&self) -> Option<ProcessStatus> {
        lock(&self.shared).clone()
    }
}

/// Handles for every simulated backend
#[derive(Clone)]
pub struct SimulatedHandles {
    pub brightness: SettingHandle,
    pub volume: SettingHandle,
    pub usage: UsageHandle,
    pub surface: SurfaceHandle,
    pub liveness: LivenessHandle,
}

/// Build a simulated platform: 0..=255 brightness with push notifications,
/// a 15-step volume stream without them, no overlay permission.
pub fn simulated() -> (Platform, SimulatedHandles) {
    let (brightness, brightness_handle) = MemorySetting::new(
        crate::curve::DEFAULT_RANGE,
        128,
        true,
    );
    let (volume, volume_handle) = MemorySetting::new(
        BrightnessRange::new(0, 15).unwrap_or_default(),
        8,
        false,
    );
    let (usage, usage_handle) = MemoryUsageStats::new(true);
    let (surface, surface_handle) = MemoryLockSurface::new(false);
    let (liveness, liveness_handle) = MemoryLiveness::new();

    let platform = Platform {
        capabilities: PlatformCapabilities {
            generation: PlatformGeneration::Gamma,
            native_gamma: true,
        },
        brightness: Box::new(brightness),
        volume: Box::new(volume),
        usage_stats: Some(Box::new(usage)),
        lock_surface: Box::new(surface),
        liveness: Box::new(liveness),
    };

    let handles = SimulatedHandles {
        brightness: brightness_handle,
        volume: volume_handle,
        usage: usage_handle,
        surface: surface_handle,
        liveness: liveness_handle,
    };

    (platform, handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn external_change_notifies_subscribers() {
        let (mut setting, handle) = MemorySetting::new(crate::curve::DEFAULT_RANGE, 10, true);
        let mut sub = setting.subscribe().unwrap();

        handle.set_external(200);
        assert!(sub.changed().await);
        assert_eq!(setting.read_native().unwrap(), 200);
    }

    #[test]
    fn denied_writes_report_permission() {
        let (mut setting, handle) = MemorySetting::new(crate::curve::DEFAULT_RANGE, 10, false);
        handle.set_writable(false);

        let err = setting.write_native(100).unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
        assert_eq!(handle.value(), 10);
        assert!(setting.subscribe().is_none());
    }

    #[test]
    fn dropped_subscription_unsubscribes() {
        let (mut setting, handle) = MemorySetting::new(crate::curve::DEFAULT_RANGE, 10, true);
        let sub = setting.subscribe().unwrap();
        assert_eq!(handle.subscriber_count(), 1);
        drop(sub);
        assert_eq!(handle.subscriber_count(), 0);
    }
}
