use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::curve::clamp_percent;

/// Stored value meaning "no target"
pub const UNSET: i64 = -1;

/// A watched dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Brightness,
    Volume,
    ScreenTime,
}

impl TargetKind {
    /// Clamp a raw value into this kind's domain
    pub fn clamp(self, value: i64) -> i64 {
        match self {
            TargetKind::Brightness | TargetKind::Volume => {
                clamp_percent(value.clamp(i32::MIN as i64, i32::MAX as i64) as i32) as i64
            }
            TargetKind::ScreenTime => value.max(0),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetKind::Brightness => "brightness",
            TargetKind::Volume => "volume",
            TargetKind::ScreenTime => "screen-time",
        };
        f.write_str(name)
    }
}

/// Enforcement intent for one kind
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnforcementTarget {
    pub kind: TargetKind,
    /// Percentage 0-100, limit in seconds, or [`UNSET`]
    pub target_value: i64,
    pub is_enforcing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_at: Option<DateTime<Utc>>,
}

impl EnforcementTarget {
    pub fn idle(kind: TargetKind) -> Self {
        Self {
            kind,
            target_value: UNSET,
            is_enforcing: false,
            last_applied_at: None,
        }
    }

    /// Replace the target with a clamped value and mark it enforcing
    pub fn arm(&mut self, value: i64) {
        self.target_value = self.kind.clamp(value);
        self.is_enforcing = true;
    }

    pub fn clear(&mut self) {
        self.target_value = UNSET;
        self.is_enforcing = false;
        self.last_applied_at = None;
    }

    /// The target as a percentage, if one is set
    pub fn percent(&self) -> Option<u8> {
        match self.kind {
            TargetKind::ScreenTime => None,
            _ if self.target_value == UNSET => None,
            _ => Some(clamp_percent(self.target_value as i32)),
        }
    }

    pub fn touch(&mut self) {
        self.last_applied_at = Some(Utc::now());
    }
}

/// Screen-time limit and timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScreenTimeState {
    pub limit_seconds: i64,
    pub enforcing: bool,
    /// Epoch milliseconds when the timer started; zero iff not enforcing
    pub timer_start_epoch_ms: i64,
}

impl ScreenTimeState {
    pub fn idle() -> Self {
        Self {
            limit_seconds: UNSET,
            enforcing: false,
            timer_start_epoch_ms: 0,
        }
    }

    pub fn start(&mut self, limit_seconds: i64, now_ms: i64) {
        self.limit_seconds = TargetKind::ScreenTime.clamp(limit_seconds);
        self.enforcing = true;
        self.timer_start_epoch_ms = now_ms.max(1);
    }

    /// Stop the timer but keep the configured limit
    pub fn disarm(&mut self) {
        self.enforcing = false;
        self.timer_start_epoch_ms = 0;
    }

    pub fn clear(&mut self) {
        self.disarm();
        self.limit_seconds = UNSET;
    }

    /// Seconds since the timer started, never negative
    pub fn elapsed_seconds(&self, now_ms: i64) -> i64 {
        if !self.enforcing || self.timer_start_epoch_ms == 0 {
            return 0;
        }
        (now_ms - self.timer_start_epoch_ms).max(0) / 1000
    }

    /// Restore the `timer_start == 0 iff !enforcing` invariant after a torn write
    pub fn repair(&mut self, now_ms: i64) -> bool {
        match (self.enforcing, self.timer_start_epoch_ms) {
            (true, 0) => {
                self.timer_start_epoch_ms = now_ms.max(1);
                true
            }
            (false, start) if start != 0 => {
                self.timer_start_epoch_ms = 0;
                true
            }
            _ => false,
        }
    }
}

impl Default for ScreenTimeState {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_clamps_to_domain() {
        let mut target = EnforcementTarget::idle(TargetKind::Brightness);
        target.arm(150);
        assert_eq!(target.target_value, 100);
        assert!(target.is_enforcing);

        let mut limit = EnforcementTarget::idle(TargetKind::ScreenTime);
        limit.arm(-30);
        assert_eq!(limit.target_value, 0);
    }

    #[test]
    fn clear_resets_to_sentinel() {
        let mut target = EnforcementTarget::idle(TargetKind::Volume);
        target.arm(40);
        target.touch();
        target.clear();
        assert_eq!(target.target_value, UNSET);
        assert!(!target.is_enforcing);
        assert!(target.last_applied_at.is_none());
        assert_eq!(target.percent(), None);
    }

    #[test]
    fn elapsed_is_never_negative() {
        let mut state = ScreenTimeState::idle();
        state.start(60, 10_000);
        assert_eq!(state.elapsed_seconds(5_000), 0);
        assert_eq!(state.elapsed_seconds(15_500), 5);
    }

    #[test]
    fn repair_fixes_torn_timer() {
        let mut state = ScreenTimeState {
            limit_seconds: 60,
            enforcing: true,
            timer_start_epoch_ms: 0,
        };
        assert!(state.repair(42_000));
        assert_eq!(state.timer_start_epoch_ms, 42_000);
        assert!(!state.repair(43_000));

        let mut stale = ScreenTimeState {
            limit_seconds: 60,
            enforcing: false,
            timer_start_epoch_ms: 9,
        };
        assert!(stale.repair(1));
        assert_eq!(stale.timer_start_epoch_ms, 0);
    }

    #[test]
    fn disarm_keeps_limit() {
        let mut state = ScreenTimeState::idle();
        state.start(7200, 1_000);
        state.disarm();
        assert_eq!(state.limit_seconds, 7200);
        assert_eq!(state.timer_start_epoch_ms, 0);
    }
}
