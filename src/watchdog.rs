//! Drift detection and correction for one watched setting.
//!
//! A watchdog is either idle or enforcing. While enforcing it waits on two
//! trigger sources at once: the backend's change notifications (fast but
//! unreliable) and a fixed-interval poll (slow but guaranteed). Both are
//! consumed from the enforcement process's single event loop, so checks for
//! one setting never overlap.

use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::curve::NativeScale;
use crate::error::PlatformError;
use crate::platform::{ChangeSubscription, SettingBackend};
use crate::target::{EnforcementTarget, TargetKind};

/// Poll interval used when neither a poll nor a push channel is configured
pub const FALLBACK_POLL: Duration = Duration::from_secs(5);

/// What woke the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Notification,
    SubscriptionClosed,
    Poll,
}

/// A correction that was actually applied, in percent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correction {
    pub from: u8,
    pub to: u8,
}

enum WatchState {
    Idle,
    Enforcing {
        subscription: Option<ChangeSubscription>,
        next_poll: Option<Instant>,
    },
}

pub struct SettingWatchdog {
    kind: TargetKind,
    backend: Box<dyn SettingBackend>,
    scale: NativeScale,
    tolerance: u8,
    poll_interval: Option<Duration>,
    state: WatchState,
}

impl SettingWatchdog {
    pub fn new(
        kind: TargetKind,
        backend: Box<dyn SettingBackend>,
        scale: NativeScale,
        tolerance: u8,
        poll_interval: Option<Duration>,
    ) -> Self {
        Self {
            kind,
            backend,
            scale,
            tolerance,
            poll_interval,
            state: WatchState::Idle,
        }
    }

    pub fn is_enforcing(&self) -> bool {
        matches!(self.state, WatchState::Enforcing { .. })
    }

    /// Apply the target now and begin watching. Calling this again while
    /// enforcing re-points the watchdog at the new target.
    pub fn start_enforcing(&mut self, target: &mut EnforcementTarget) {
        let Some(percent) = target.percent() else {
            warn!("Refusing to enforce {} without a target", self.kind);
            return;
        };

        if let Err(e) = self.backend.pin_manual_mode() {
            log_platform_error(self.kind, "pin manual mode", &e);
        }

        if let Err(e) = self.apply(percent) {
            log_platform_error(self.kind, "apply target", &e);
        } else {
            target.touch();
        }

        if self.is_enforcing() {
            info!("{} target updated to {}%", self.kind, percent);
            return;
        }

        let subscription = self.backend.subscribe();
        let interval = match (self.poll_interval, &subscription) {
            (Some(interval), _) => Some(interval),
            (None, None) => Some(FALLBACK_POLL),
            (None, Some(_)) => None,
        };

        info!(
            "Enforcing {} at {}% (push: {}, poll: {:?})",
            self.kind,
            percent,
            subscription.is_some(),
            interval
        );

        self.state = WatchState::Enforcing {
            subscription,
            next_poll: interval.map(|i| Instant::now() + i),
        };
    }

    /// Stop watching. Pending triggers are discarded before this returns.
    pub fn stop_enforcing(&mut self) {
        if !self.is_enforcing() {
            return;
        }

        self.state = WatchState::Idle;

        match self.backend.apply_override(None) {
            Ok(()) | Err(PlatformError::NoForegroundContext) => {}
            Err(e) => log_platform_error(self.kind, "release override", &e),
        }

        info!("Stopped enforcing {}", self.kind);
    }

    /// Wait for the next trigger; never resolves while idle
    pub async fn next_trigger(&mut self) -> Trigger {
        let WatchState::Enforcing {
            subscription,
            next_poll,
        } = &mut self.state
        else {
            return std::future::pending().await;
        };

        let poll_at = *next_poll;
        let poll = async move {
            match poll_at {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        let notification = async {
            match subscription.as_mut() {
                Some(sub) => sub.changed().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            alive = notification => {
                if alive { Trigger::Notification } else { Trigger::SubscriptionClosed }
            }
            _ = poll => Trigger::Poll,
        }
    }

    /// Handle a trigger: reschedule, then compare and correct
    pub fn handle_trigger(
        &mut self,
        trigger: Trigger,
        target: &mut EnforcementTarget,
    ) -> Option<Correction> {
        let WatchState::Enforcing {
            subscription,
            next_poll,
        } = &mut self.state
        else {
            return None;
        };

        match trigger {
            Trigger::Notification => {
                if let Some(sub) = subscription.as_mut() {
                    let coalesced = sub.drain();
                    if coalesced > 0 {
                        debug!("Coalesced {} extra {} notifications", coalesced, self.kind);
                    }
                }
            }
            Trigger::SubscriptionClosed => {
                warn!("{} change notifications stopped; relying on polling", self.kind);
                *subscription = None;
                if next_poll.is_none() {
                    *next_poll = Some(Instant::now() + FALLBACK_POLL);
                }
                return None;
            }
            Trigger::Poll => {
                let interval = self.poll_interval.unwrap_or(FALLBACK_POLL);
                *next_poll = Some(Instant::now() + interval);
            }
        }

        self.check(target)
    }

    /// Compare the current value with the target and correct drift beyond
    /// the tolerance band
    pub fn check(&mut self, target: &mut EnforcementTarget) -> Option<Correction> {
        if !self.is_enforcing() {
            return None;
        }
        let desired = target.percent()?;

        if let Err(e) = self.backend.pin_manual_mode() {
            log_platform_error(self.kind, "pin manual mode", &e);
        }

        let native = match self.backend.read_native() {
            Ok(native) => native,
            Err(e) => {
                log_platform_error(self.kind, "read", &e);
                return None;
            }
        };

        let current = self.scale.native_to_percent(native);
        let desired_native = self.scale.percent_to_native(desired as i32);

        if current.abs_diff(desired) <= self.tolerance {
            return None;
        }

        if self.scale.range.clamp(native) == desired_native {
            debug!(
                "{} at {}% differs from {}% only by native resolution",
                self.kind, current, desired
            );
            return None;
        }

        if let Err(e) = self.apply(desired) {
            log_platform_error(self.kind, "correct", &e);
            return None;
        }

        target.touch();
        info!("Corrected {} drift: {}% -> {}%", self.kind, current, desired);

        Some(Correction {
            from: current,
            to: desired,
        })
    }

    /// One-shot write of a percentage, without changing enforcement
    pub fn set_value(&mut self, percent: i32) -> Result<u8, PlatformError> {
        let percent = crate::curve::clamp_percent(percent);
        self.backend.pin_manual_mode()?;
        self.apply(percent)?;
        Ok(percent)
    }

    pub fn current_percent(&mut self) -> Result<u8, PlatformError> {
        let native = self.backend.read_native()?;
        Ok(self.scale.native_to_percent(native))
    }

    fn apply(&mut self, percent: u8) -> Result<(), PlatformError> {
        let native = self.scale.percent_to_native(percent as i32);
        self.backend.write_native(native)?;

        if self.kind == TargetKind::Brightness {
            let level = self.scale.percent_to_level(percent as i32);
            match self.backend.apply_override(Some(level)) {
                Ok(()) => {}
                Err(PlatformError::NoForegroundContext) => {
                    debug!("No foreground window; brightness set in the store only");
                }
                Err(e) => log_platform_error(self.kind, "apply window override", &e),
            }
        }

        Ok(())
    }
}

fn log_platform_error(kind: TargetKind, action: &str, err: &PlatformError) {
    match err {
        PlatformError::PermissionDenied(permission) => {
            warn!("Cannot {} {}: {} permission not granted", action, kind, permission)
        }
        other => warn!("Failed to {} {}: {}", action, kind, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::{BrightnessCurve, BrightnessRange, DEFAULT_RANGE};
    use crate::platform::memory::{MemorySetting, SettingHandle};

    fn linear_watchdog(push: bool, poll: Option<Duration>) -> (SettingWatchdog, SettingHandle) {
        let range = BrightnessRange::new(0, 100).unwrap();
        let (backend, handle) = MemorySetting::new(range, 50, push);
        let watchdog = SettingWatchdog::new(
            TargetKind::Brightness,
            Box::new(backend),
            NativeScale::new(BrightnessCurve::Linear, range),
            3,
            poll,
        );
        (watchdog, handle)
    }

    fn target(kind: TargetKind, value: i64) -> EnforcementTarget {
        let mut target = EnforcementTarget::idle(kind);
        target.arm(value);
        target
    }

    #[test]
    fn drift_within_tolerance_is_left_alone() {
        let (mut watchdog, handle) = linear_watchdog(false, None);
        let mut target = target(TargetKind::Brightness, 50);
        watchdog.start_enforcing(&mut target);

        handle.set_silently(52);
        assert_eq!(watchdog.check(&mut target), None);
        assert_eq!(handle.value(), 52);
    }

    #[test]
    fn drift_beyond_tolerance_is_corrected() {
        let (mut watchdog, handle) = linear_watchdog(false, None);
        let mut target = target(TargetKind::Brightness, 50);
        watchdog.start_enforcing(&mut target);

        handle.set_silently(54);
        assert_eq!(
            watchdog.check(&mut target),
            Some(Correction { from: 54, to: 50 })
        );
        assert_eq!(handle.value(), 50);
        assert!(target.last_applied_at.is_some());
    }

    #[test]
    fn start_applies_immediately_and_pins_manual_mode() {
        let (mut watchdog, handle) = linear_watchdog(true, None);
        handle.set_silently(10);

        let mut target = target(TargetKind::Brightness, 80);
        watchdog.start_enforcing(&mut target);

        assert!(watchdog.is_enforcing());
        assert_eq!(handle.value(), 80);
        assert!(handle.manual_mode());
        assert_eq!(handle.override_level(), Some(0.8));
    }

    #[test]
    fn denied_write_is_retried_on_next_check() {
        let (mut watchdog, handle) = linear_watchdog(false, None);
        let mut target = target(TargetKind::Brightness, 50);
        watchdog.start_enforcing(&mut target);

        handle.set_writable(false);
        handle.set_silently(90);
        assert_eq!(watchdog.check(&mut target), None);
        assert!(watchdog.is_enforcing());

        handle.set_writable(true);
        assert_eq!(
            watchdog.check(&mut target),
            Some(Correction { from: 90, to: 50 })
        );
    }

    #[test]
    fn missing_foreground_degrades_to_store_only() {
        let (mut watchdog, handle) = linear_watchdog(false, None);
        handle.set_has_foreground(false);

        let mut target = target(TargetKind::Brightness, 30);
        watchdog.start_enforcing(&mut target);
        assert_eq!(handle.value(), 30);
        assert_eq!(handle.override_level(), None);
    }

    #[test]
    fn stop_releases_override_and_unsubscribes() {
        let (mut watchdog, handle) = linear_watchdog(true, None);
        let mut target = target(TargetKind::Brightness, 40);
        watchdog.start_enforcing(&mut target);
        assert_eq!(handle.subscriber_count(), 1);

        watchdog.stop_enforcing();
        assert!(!watchdog.is_enforcing());
        assert_eq!(handle.override_level(), None);
        assert_eq!(handle.subscriber_count(), 0);

        handle.set_silently(90);
        assert_eq!(watchdog.check(&mut target), None);
    }

    #[test]
    fn coarse_native_range_does_not_thrash() {
        let range = BrightnessRange::new(0, 15).unwrap();
        let (backend, handle) = MemorySetting::new(range, 8, false);
        let mut watchdog = SettingWatchdog::new(
            TargetKind::Volume,
            Box::new(backend),
            NativeScale::new(BrightnessCurve::Linear, range),
            2,
            None,
        );

        let mut target = target(TargetKind::Volume, 50);
        watchdog.start_enforcing(&mut target);
        let writes = handle.writes();

        // 8/15 reads back as 53%, outside tolerance but already the closest step
        assert_eq!(watchdog.check(&mut target), None);
        assert_eq!(handle.writes(), writes);
    }

    #[test]
    fn set_value_and_current_percent() {
        let (backend, _handle) = MemorySetting::new(DEFAULT_RANGE, 0, false);
        let mut watchdog = SettingWatchdog::new(
            TargetKind::Brightness,
            Box::new(backend),
            NativeScale::new(BrightnessCurve::Quadratic, DEFAULT_RANGE),
            3,
            None,
        );

        assert_eq!(watchdog.set_value(150).unwrap(), 100);
        assert_eq!(watchdog.current_percent().unwrap(), 100);
        assert!(!watchdog.is_enforcing());
    }

    #[tokio::test(start_paused = true)]
    async fn notification_triggers_correction() {
        let (mut watchdog, handle) = linear_watchdog(true, None);
        let mut target = target(TargetKind::Brightness, 50);
        watchdog.start_enforcing(&mut target);

        handle.set_external(70);
        handle.set_external(75);

        let trigger = watchdog.next_trigger().await;
        assert_eq!(trigger, Trigger::Notification);
        assert_eq!(
            watchdog.handle_trigger(trigger, &mut target),
            Some(Correction { from: 75, to: 50 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_catches_missed_notifications() {
        let (mut watchdog, handle) = linear_watchdog(true, Some(Duration::from_secs(5)));
        let mut target = target(TargetKind::Brightness, 50);
        watchdog.start_enforcing(&mut target);

        handle.set_silently(10);

        let trigger = watchdog.next_trigger().await;
        assert_eq!(trigger, Trigger::Poll);
        assert_eq!(
            watchdog.handle_trigger(trigger, &mut target),
            Some(Correction { from: 10, to: 50 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_push_channel_falls_back_to_polling() {
        let (mut watchdog, _handle) = linear_watchdog(false, None);
        let mut target = target(TargetKind::Brightness, 50);
        watchdog.start_enforcing(&mut target);

        let started = Instant::now();
        assert_eq!(watchdog.next_trigger().await, Trigger::Poll);
        assert!(started.elapsed() >= FALLBACK_POLL);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_watchdog_never_triggers() {
        let (mut watchdog, _handle) = linear_watchdog(true, Some(Duration::from_millis(10)));
        let result =
            tokio::time::timeout(Duration::from_secs(60), watchdog.next_trigger()).await;
        assert!(result.is_err());
    }
}
