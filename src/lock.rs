//! Lock session state machine.
//!
//! `Unlocked -> Locked` when the screen-time limit is exceeded, back to
//! `Unlocked` on the parent PIN or when the lock is no longer required.
//! While locked on the lock-screen presentation an anti-bypass guard keeps
//! bringing the lock screen back to the front. The only exemption is an
//! emergency call, which is allowed for as long as a dialer stays in front.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::PinStore;
use crate::config::LockConfig;
use crate::error::{ControlError, PlatformError};
use crate::events::Presentation;
use crate::platform::{LockSurface, OverlayHandle};

/// Host lifecycle transitions of the lock screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Paused,
    Stopped,
    BackPressed,
    Resumed,
}

/// Result of a PIN submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinOutcome {
    EmptyPin,
    Rejected,
    Unlocked,
}

/// Anti-bypass guard state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Periodically verify the lock screen is in front
    Watching { next_check: Instant },
    /// Navigation away was seen; bring the lock screen back at `due`
    RelaunchPending { due: Instant },
    /// Dialer launched; re-check at `next_check` whether it is still in front
    EmergencyCall { next_check: Instant },
}

impl GuardState {
    fn deadline(&self) -> Instant {
        match *self {
            GuardState::Watching { next_check } => next_check,
            GuardState::RelaunchPending { due } => due,
            GuardState::EmergencyCall { next_check } => next_check,
        }
    }
}

#[derive(Debug)]
struct LockSession {
    presentation: Presentation,
    overlay: Option<OverlayHandle>,
    guard: Option<GuardState>,
}

pub struct LockStateMachine {
    surface: Box<dyn LockSurface>,
    config: LockConfig,
    session: Option<LockSession>,
}

impl LockStateMachine {
    pub fn new(surface: Box<dyn LockSurface>, config: LockConfig) -> Self {
        Self {
            surface,
            config,
            session: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.session.is_some()
    }

    pub fn presentation(&self) -> Option<Presentation> {
        self.session.as_ref().map(|s| s.presentation)
    }

    pub fn guard(&self) -> Option<GuardState> {
        self.session.as_ref().and_then(|s| s.guard)
    }

    /// Enter the locked state. Returns the presentation when a new session
    /// was created and `None` when one already exists.
    pub fn engage(&mut self) -> Option<Presentation> {
        if self.session.is_some() {
            return None;
        }

        let session = match self.try_overlay() {
            Some(handle) => LockSession {
                presentation: Presentation::Overlay,
                overlay: Some(handle),
                guard: None,
            },
            None => {
                if let Err(e) = self.surface.launch_lock_screen() {
                    warn!("Failed to launch lock screen, guard will retry: {}", e);
                }
                LockSession {
                    presentation: Presentation::LockScreen,
                    overlay: None,
                    guard: Some(self.watching()),
                }
            }
        };

        info!("Lock engaged ({:?})", session.presentation);
        let presentation = session.presentation;
        self.session = Some(session);
        Some(presentation)
    }

    fn try_overlay(&mut self) -> Option<OverlayHandle> {
        if !self.surface.can_draw_overlays() {
            debug!("Overlay permission not granted; using lock screen");
            return None;
        }

        match self.surface.show_overlay() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Overlay failed, falling back to lock screen: {}", e);
                None
            }
        }
    }

    /// Dismiss the session. Returns whether one existed.
    pub fn release(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };

        if let Some(handle) = session.overlay
            && let Err(e) = self.surface.remove_overlay(handle)
        {
            warn!("Failed to remove lock overlay: {}", e);
        }

        if session.presentation == Presentation::LockScreen
            && let Err(e) = self.surface.finish_lock_screen()
        {
            warn!("Failed to close lock screen: {}", e);
        }

        info!("Lock released");
        true
    }

    /// Check a PIN entered on the lock surface
    pub fn submit_pin(&mut self, pin: &str, pins: &PinStore) -> PinOutcome {
        if pin.trim().is_empty() {
            self.surface.show_feedback("Please enter PIN");
            return PinOutcome::EmptyPin;
        }

        if !pins.verify_pin(pin) {
            info!("Incorrect PIN entered on lock screen");
            self.surface.show_feedback("Incorrect PIN");
            return PinOutcome::Rejected;
        }

        self.release();
        self.surface.show_feedback("Unlocked");
        PinOutcome::Unlocked
    }

    /// React to a lifecycle transition of the lock screen. `still_required`
    /// is consulted on resume; returns `true` when the session ended.
    pub fn on_lifecycle(&mut self, event: LifecycleEvent, still_required: bool) -> bool {
        let relaunch_delay = self.config.relaunch_delay();
        let watching = self.watching();

        let Some(session) = self.session.as_mut() else {
            return false;
        };

        let in_emergency = matches!(session.guard, Some(GuardState::EmergencyCall { .. }));

        match event {
            LifecycleEvent::BackPressed => {
                self.surface.show_feedback("Only parent can unlock");
            }
            LifecycleEvent::Paused | LifecycleEvent::Stopped
                if session.presentation == Presentation::Overlay =>
            {
                debug!("Lock overlay unaffected by lock screen {:?}", event);
            }
            LifecycleEvent::Paused if !in_emergency => {
                debug!("Lock screen paused; relaunching in {:?}", relaunch_delay);
                session.guard = Some(GuardState::RelaunchPending {
                    due: Instant::now() + relaunch_delay,
                });
            }
            LifecycleEvent::Stopped if !in_emergency => {
                debug!("Lock screen stopped; relaunching");
                self.relaunch();
            }
            LifecycleEvent::Paused | LifecycleEvent::Stopped => {
                debug!("Lock screen left for emergency call");
            }
            LifecycleEvent::Resumed => {
                if !still_required {
                    info!("Lock no longer required on resume");
                    self.release();
                    return true;
                }
                if session.presentation == Presentation::LockScreen {
                    session.guard = Some(watching);
                }
            }
        }

        false
    }

    /// Open the dialer and suspend the guard while it stays in front
    pub fn emergency_call(&mut self) -> Result<(), ControlError> {
        let first_check = Instant::now() + self.config.emergency_first_check();

        let Some(session) = self.session.as_mut() else {
            return Err(ControlError::InvalidArgument(
                "emergency call is only available while locked".to_string(),
            ));
        };

        if let Some(handle) = session.overlay.take()
            && let Err(e) = self.surface.remove_overlay(handle)
        {
            warn!("Failed to lift overlay for emergency call: {}", e);
        }

        if let Err(e) = self.surface.launch_dialer() {
            self.surface.show_feedback("Unable to open dialer");
            self.relaunch();
            return Err(e.into());
        }

        info!("Emergency call started; lock guard suspended");
        session.guard = Some(GuardState::EmergencyCall {
            next_check: first_check,
        });
        Ok(())
    }

    /// Show a message on the lock surface's feedback channel, locked or not
    pub fn announce(&mut self, message: &str) {
        self.surface.show_feedback(message);
    }

    /// Next guard deadline, if the guard is active
    pub fn next_deadline(&self) -> Option<Instant> {
        self.guard().map(|g| g.deadline())
    }

    /// Advance the guard if its deadline has passed
    pub fn on_tick(&mut self) {
        let now = Instant::now();
        let Some(guard) = self.guard() else {
            return;
        };
        if guard.deadline() > now {
            return;
        }

        match guard {
            GuardState::Watching { .. } => {
                if !self.surface.is_lock_screen_foreground() {
                    info!("Lock screen lost foreground; relaunching");
                    self.relaunch();
                } else {
                    self.set_guard(self.watching());
                }
            }
            GuardState::RelaunchPending { .. } => self.relaunch(),
            GuardState::EmergencyCall { .. } => {
                if self.dialer_in_front() {
                    self.set_guard(GuardState::EmergencyCall {
                        next_check: now + self.config.emergency_recheck(),
                    });
                } else {
                    info!("Emergency call ended; restoring lock");
                    self.relaunch();
                }
            }
        }
    }

    fn dialer_in_front(&self) -> bool {
        let Some(package) = self.surface.foreground_package() else {
            return false;
        };
        let package = package.to_lowercase();
        self.config
            .emergency_packages
            .iter()
            .filter(|p| !p.is_empty())
            .any(|p| package.contains(&p.to_lowercase()))
    }

    /// Bring the lock presentation back to the front
    fn relaunch(&mut self) {
        let watching = self.watching();
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let result: Result<(), PlatformError> = match session.presentation {
            Presentation::Overlay if session.overlay.is_some() => {
                debug!("Lock overlay already showing");
                Ok(())
            }
            Presentation::Overlay => match self.surface.show_overlay() {
                Ok(handle) => {
                    session.overlay = Some(handle);
                    Ok(())
                }
                Err(e) => {
                    // Overlay lost; continue on the lock screen
                    warn!("Overlay could not be restored: {}", e);
                    session.presentation = Presentation::LockScreen;
                    self.surface.launch_lock_screen()
                }
            },
            Presentation::LockScreen => self.surface.launch_lock_screen(),
        };

        if let Err(e) = result {
            warn!("Lock relaunch failed, retrying: {}", e);
        }

        session.guard = match session.presentation {
            Presentation::LockScreen => Some(watching),
            Presentation::Overlay => None,
        };
    }

    fn set_guard(&mut self, guard: GuardState) {
        if let Some(session) = self.session.as_mut() {
            session.guard = Some(guard);
        }
    }

    fn watching(&self) -> GuardState {
        GuardState::Watching {
            next_check: Instant::now() + self.config.foreground_check(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::sleep_until_deadline;
    use crate::platform::memory::{MemoryLockSurface, SurfaceHandle};
    use crate::store::PrefsStore;
    use std::time::Duration;
    use tempfile::tempdir;

    fn machine(overlay: bool) -> (LockStateMachine, SurfaceHandle) {
        let (surface, handle) = MemoryLockSurface::new(overlay);
        (
            LockStateMachine::new(Box::new(surface), LockConfig::default()),
            handle,
        )
    }

    fn pins(pin: &str) -> (tempfile::TempDir, PinStore) {
        let dir = tempdir().unwrap();
        let store = PinStore::new(PrefsStore::new(dir.path()));
        store.save_pin(pin).unwrap();
        (dir, store)
    }

    #[tokio::test(start_paused = true)]
    async fn engage_prefers_overlay_and_is_idempotent() {
        let (mut lock, surface) = machine(true);

        assert_eq!(lock.engage(), Some(Presentation::Overlay));
        assert!(surface.overlay_showing());
        assert_eq!(lock.engage(), None);
        assert_eq!(lock.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn engage_falls_back_without_overlay() {
        let (mut lock, surface) = machine(false);
        assert_eq!(lock.engage(), Some(Presentation::LockScreen));
        assert!(surface.lock_screen_open());
        assert!(matches!(lock.guard(), Some(GuardState::Watching { .. })));

        let (mut lock, surface) = machine(true);
        surface.set_overlay_fails(true);
        assert_eq!(lock.engage(), Some(Presentation::LockScreen));
    }

    #[tokio::test(start_paused = true)]
    async fn pin_outcomes() {
        let (_dir, pins) = pins("1234");
        let (mut lock, surface) = machine(false);
        lock.engage();

        assert_eq!(lock.submit_pin("", &pins), PinOutcome::EmptyPin);
        assert_eq!(lock.submit_pin("9999", &pins), PinOutcome::Rejected);
        assert!(lock.is_locked());

        assert_eq!(lock.submit_pin("1234", &pins), PinOutcome::Unlocked);
        assert!(!lock.is_locked());
        assert!(!surface.lock_screen_open());
        assert_eq!(
            surface.feedback(),
            vec!["Please enter PIN", "Incorrect PIN", "Unlocked"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pause_schedules_delayed_relaunch() {
        let (mut lock, surface) = machine(false);
        lock.engage();
        let launches = surface.launches();

        surface.switch_to("com.example.game");
        assert!(!lock.on_lifecycle(LifecycleEvent::Paused, true));
        assert!(matches!(lock.guard(), Some(GuardState::RelaunchPending { .. })));

        tokio::time::advance(Duration::from_millis(50)).await;
        lock.on_tick();
        assert_eq!(surface.launches(), launches);

        tokio::time::advance(Duration::from_millis(60)).await;
        lock.on_tick();
        assert_eq!(surface.launches(), launches + 1);
        assert!(surface.lock_screen_foreground());
        assert!(matches!(lock.guard(), Some(GuardState::Watching { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_relaunches_immediately() {
        let (mut lock, surface) = machine(false);
        lock.engage();
        let launches = surface.launches();

        lock.on_lifecycle(LifecycleEvent::Stopped, true);
        assert_eq!(surface.launches(), launches + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_is_never_stacked() {
        let (_dir, pins) = pins("1234");
        let (mut lock, surface) = machine(true);
        assert_eq!(lock.engage(), Some(Presentation::Overlay));

        lock.on_lifecycle(LifecycleEvent::Stopped, true);
        lock.on_lifecycle(LifecycleEvent::Paused, true);
        assert_eq!(lock.next_deadline(), None);
        assert_eq!(surface.live_overlays(), 1);
        assert_eq!(surface.launches(), 0);

        assert_eq!(lock.submit_pin("1234", &pins), PinOutcome::Unlocked);
        assert_eq!(surface.live_overlays(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_restored_once_after_emergency_call() {
        let (mut lock, surface) = machine(true);
        lock.engage();

        lock.emergency_call().unwrap();
        assert_eq!(surface.live_overlays(), 0);

        surface.switch_to("com.example.game");
        tokio::time::advance(Duration::from_secs(60)).await;
        lock.on_tick();
        assert_eq!(surface.live_overlays(), 1);

        lock.on_lifecycle(LifecycleEvent::Stopped, true);
        assert_eq!(surface.live_overlays(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn back_press_is_blocked() {
        let (mut lock, surface) = machine(false);
        lock.engage();

        assert!(!lock.on_lifecycle(LifecycleEvent::BackPressed, true));
        assert!(lock.is_locked());
        assert_eq!(surface.feedback(), vec!["Only parent can unlock"]);
    }

    #[tokio::test(start_paused = true)]
    async fn guard_relaunches_when_foreground_lost() {
        let (mut lock, surface) = machine(false);
        lock.engage();
        let launches = surface.launches();

        tokio::time::advance(Duration::from_millis(200)).await;
        lock.on_tick();
        assert_eq!(surface.launches(), launches);

        surface.switch_to("com.example.video");
        sleep_until_deadline(lock.next_deadline()).await;
        lock.on_tick();
        assert_eq!(surface.launches(), launches + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_call_is_exempt_until_dialer_leaves() {
        let (mut lock, surface) = machine(false);
        lock.engage();

        lock.emergency_call().unwrap();
        assert_eq!(surface.dialer_launches(), 1);
        let launches = surface.launches();

        // pause while dialing does not bring the lock back
        lock.on_lifecycle(LifecycleEvent::Paused, true);
        assert!(matches!(lock.guard(), Some(GuardState::EmergencyCall { .. })));

        tokio::time::advance(Duration::from_millis(1000)).await;
        lock.on_tick();
        assert_eq!(surface.launches(), launches);

        surface.switch_to("com.example.game");
        tokio::time::advance(Duration::from_millis(500)).await;
        lock.on_tick();
        assert_eq!(surface.launches(), launches + 1);
        assert!(matches!(lock.guard(), Some(GuardState::Watching { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_releases_when_no_longer_required() {
        let (mut lock, surface) = machine(false);
        lock.engage();

        assert!(!lock.on_lifecycle(LifecycleEvent::Resumed, true));
        assert!(lock.is_locked());

        assert!(lock.on_lifecycle(LifecycleEvent::Resumed, false));
        assert!(!lock.is_locked());
        assert!(!surface.lock_screen_open());
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_call_requires_lock() {
        let (mut lock, _surface) = machine(false);
        assert!(lock.emergency_call().is_err());
    }
}
