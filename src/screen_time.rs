use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::config::ScreenTimeConfig;
use crate::error::{ControlError, Permission};
use crate::platform::UsageStatsSource;
use crate::target::ScreenTimeState;

/// How elapsed screen time is measured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Wall-clock time since enforcement started
    #[default]
    Timer,
    /// Foreground usage since local midnight, from the OS aggregate
    UsageStats,
}

/// Result of evaluating the limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LimitStatus {
    Inactive,
    Within { elapsed: i64, remaining: i64 },
    Exceeded { elapsed: i64 },
}

impl LimitStatus {
    pub fn is_exceeded(&self) -> bool {
        matches!(self, LimitStatus::Exceeded { .. })
    }
}

/// Measures screen time against the configured limit
pub struct ScreenTimeCounter {
    strategy: Strategy,
    source: Option<Box<dyn UsageStatsSource>>,
    clock: Arc<dyn Clock>,
    check_interval: Duration,
    warnings_minutes: Vec<u32>,
    warned: BTreeSet<u32>,
}

impl ScreenTimeCounter {
    pub fn new(
        config: &ScreenTimeConfig,
        source: Option<Box<dyn UsageStatsSource>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut warnings_minutes = config.warnings_minutes.clone();
        warnings_minutes.sort_unstable();
        warnings_minutes.dedup();

        Self {
            strategy: config.strategy,
            source,
            clock,
            check_interval: Duration::from_secs(config.check_interval_secs),
            warnings_minutes,
            warned: BTreeSet::new(),
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Whether enforcement can start with the configured strategy
    pub fn ensure_ready(&self) -> Result<(), ControlError> {
        match self.strategy {
            Strategy::Timer => Ok(()),
            Strategy::UsageStats => match &self.source {
                Some(source) if source.has_permission() => Ok(()),
                _ => Err(ControlError::Permission(Permission::UsageStats)),
            },
        }
    }

    /// Elapsed seconds under the configured strategy; never fails
    pub fn elapsed_seconds(&self, state: &ScreenTimeState) -> i64 {
        let now = self.clock.now_ms();

        match self.strategy {
            Strategy::Timer => state.elapsed_seconds(now),
            Strategy::UsageStats => {
                let Some(source) = &self.source else {
                    return 0;
                };
                match source.foreground_seconds(self.clock.local_midnight_ms(), now) {
                    Ok(seconds) => seconds.max(0),
                    Err(e) => {
                        debug!("Usage statistics unavailable: {}", e);
                        0
                    }
                }
            }
        }
    }

    pub fn check_limit(&self, state: &ScreenTimeState) -> LimitStatus {
        if !state.enforcing || state.limit_seconds < 0 {
            return LimitStatus::Inactive;
        }

        let elapsed = self.elapsed_seconds(state);
        if elapsed >= state.limit_seconds {
            debug!("Screen time over limit: {}s used of {}s", elapsed, state.limit_seconds);
            LimitStatus::Exceeded { elapsed }
        } else {
            LimitStatus::Within {
                elapsed,
                remaining: state.limit_seconds - elapsed,
            }
        }
    }

    /// The warning to announce for this status, if a new threshold was
    /// crossed. When several are crossed at once only the most urgent is
    /// announced; each threshold fires once per enforcement session.
    pub fn due_warning(&mut self, status: &LimitStatus) -> Option<u32> {
        let LimitStatus::Within { remaining, .. } = *status else {
            return None;
        };

        let crossed: Vec<u32> = self
            .warnings_minutes
            .iter()
            .copied()
            .filter(|&minutes| remaining <= minutes as i64 * 60)
            .filter(|minutes| !self.warned.contains(minutes))
            .collect();

        let most_urgent = crossed.first().copied()?;
        self.warned.extend(crossed);
        Some(most_urgent)
    }

    /// Forget announced warnings when a new session starts
    pub fn reset_warnings(&mut self) {
        self.warned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::platform::memory::MemoryUsageStats;

    fn timer_counter(clock: Arc<ManualClock>) -> ScreenTimeCounter {
        ScreenTimeCounter::new(&ScreenTimeConfig::default(), None, clock)
    }

    #[test]
    fn limit_boundary_is_inclusive() {
        let clock = ManualClock::new(1_000_000);
        let counter = timer_counter(clock.clone());

        let mut state = ScreenTimeState::idle();
        state.start(7200, clock.now_ms());

        clock.advance_secs(7199);
        assert_eq!(
            counter.check_limit(&state),
            LimitStatus::Within {
                elapsed: 7199,
                remaining: 1
            }
        );

        clock.advance_secs(1);
        assert_eq!(
            counter.check_limit(&state),
            LimitStatus::Exceeded { elapsed: 7200 }
        );
    }

    #[test]
    fn idle_state_is_inactive() {
        let counter = timer_counter(ManualClock::new(0));
        assert_eq!(
            counter.check_limit(&ScreenTimeState::idle()),
            LimitStatus::Inactive
        );
    }

    #[test]
    fn clock_going_backwards_counts_zero() {
        let clock = ManualClock::new(50_000);
        let counter = timer_counter(clock.clone());

        let mut state = ScreenTimeState::idle();
        state.start(60, 50_000);
        clock.set_ms(10_000);
        assert_eq!(counter.elapsed_seconds(&state), 0);
    }

    #[test]
    fn usage_stats_requires_permission() {
        let config = ScreenTimeConfig {
            strategy: Strategy::UsageStats,
            ..Default::default()
        };
        let (source, handle) = MemoryUsageStats::new(false);
        let counter = ScreenTimeCounter::new(&config, Some(Box::new(source)), ManualClock::new(0));

        let err = counter.ensure_ready().unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        handle.set_permission(true);
        assert!(counter.ensure_ready().is_ok());

        let no_source = ScreenTimeCounter::new(&config, None, ManualClock::new(0));
        assert!(no_source.ensure_ready().is_err());
    }

    #[test]
    fn usage_stats_measures_foreground_time() {
        let config = ScreenTimeConfig {
            strategy: Strategy::UsageStats,
            ..Default::default()
        };
        let (source, handle) = MemoryUsageStats::new(true);
        let counter = ScreenTimeCounter::new(&config, Some(Box::new(source)), ManualClock::new(0));

        let mut state = ScreenTimeState::idle();
        state.start(600, 1);

        handle.set_foreground_seconds(599);
        assert!(!counter.check_limit(&state).is_exceeded());
        handle.set_foreground_seconds(600);
        assert!(counter.check_limit(&state).is_exceeded());

        // revoked permission reads as zero rather than failing
        handle.set_permission(false);
        assert_eq!(counter.elapsed_seconds(&state), 0);
    }

    #[test]
    fn warnings_fire_once_each() {
        let mut counter = timer_counter(ManualClock::new(0));

        let within = |remaining| LimitStatus::Within {
            elapsed: 0,
            remaining,
        };

        assert_eq!(counter.due_warning(&within(20 * 60)), None);
        assert_eq!(counter.due_warning(&within(15 * 60)), Some(15));
        assert_eq!(counter.due_warning(&within(14 * 60)), None);
        // 5 and 1 crossed together: only the more urgent is announced
        assert_eq!(counter.due_warning(&within(50)), Some(1));
        assert_eq!(counter.due_warning(&within(40)), None);

        counter.reset_warnings();
        assert_eq!(counter.due_warning(&within(4 * 60)), Some(5));
    }
}
