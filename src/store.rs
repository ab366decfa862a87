//! Persisted key groups.
//!
//! Each group is a small JSON document replaced atomically as a whole, so an
//! enforcing flag and its value are always committed together and a crash
//! can never leave one without the other.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::platform::common::{atomic_write, read_optional};
use crate::target::{EnforcementTarget, ScreenTimeState, TargetKind, UNSET};

const ENFORCEMENT_GROUP: &str = "enforcement_prefs";
const SCREEN_TIME_GROUP: &str = "screen_time_prefs";
const PIN_GROUP: &str = "kids_guard_pin";

fn unset() -> i64 {
    UNSET
}

/// `enforcement_prefs` key group
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnforcementPrefs {
    #[serde(default)]
    pub brightness_enforcing: bool,
    #[serde(default = "unset")]
    pub brightness_value: i64,
    #[serde(default)]
    pub volume_enforcing: bool,
    #[serde(default = "unset")]
    pub volume_value: i64,
}

impl Default for EnforcementPrefs {
    fn default() -> Self {
        Self {
            brightness_enforcing: false,
            brightness_value: UNSET,
            volume_enforcing: false,
            volume_value: UNSET,
        }
    }
}

impl EnforcementPrefs {
    /// Rebuild the in-memory target for a setting kind
    pub fn target(&self, kind: TargetKind) -> EnforcementTarget {
        let (enforcing, value) = match kind {
            TargetKind::Brightness => (self.brightness_enforcing, self.brightness_value),
            TargetKind::Volume => (self.volume_enforcing, self.volume_value),
            TargetKind::ScreenTime => return EnforcementTarget::idle(kind),
        };

        let mut target = EnforcementTarget::idle(kind);
        if enforcing && value != UNSET {
            target.arm(value);
        } else if value != UNSET {
            target.target_value = kind.clamp(value);
        }
        target
    }

    /// Snapshot both setting targets as one group
    pub fn from_targets(brightness: &EnforcementTarget, volume: &EnforcementTarget) -> Self {
        Self {
            brightness_enforcing: brightness.is_enforcing,
            brightness_value: brightness.target_value,
            volume_enforcing: volume.is_enforcing,
            volume_value: volume.target_value,
        }
    }
}

/// `screen_time_prefs` key group
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScreenTimePrefs {
    #[serde(default = "unset")]
    pub limit_seconds: i64,
    #[serde(default)]
    pub enforcing: bool,
    #[serde(default)]
    pub timer_start_ms: i64,
}

impl Default for ScreenTimePrefs {
    fn default() -> Self {
        ScreenTimeState::idle().into()
    }
}

impl From<ScreenTimeState> for ScreenTimePrefs {
    fn from(state: ScreenTimeState) -> Self {
        Self {
            limit_seconds: state.limit_seconds,
            enforcing: state.enforcing,
            timer_start_ms: state.timer_start_epoch_ms,
        }
    }
}

impl From<ScreenTimePrefs> for ScreenTimeState {
    fn from(prefs: ScreenTimePrefs) -> Self {
        Self {
            limit_seconds: prefs.limit_seconds,
            enforcing: prefs.enforcing,
            timer_start_epoch_ms: prefs.timer_start_ms,
        }
    }
}

/// PIN key group
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PinPrefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pin: Option<String>,
}

/// Directory-backed store for all key groups
#[derive(Debug, Clone)]
pub struct PrefsStore {
    dir: PathBuf,
}

impl PrefsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn group_path(&self, group: &str) -> PathBuf {
        self.dir.join(format!("{}.json", group))
    }

    /// Load a group; a missing file yields defaults, a corrupt file is
    /// reported and replaced by defaults
    fn load_group<T: DeserializeOwned + Default>(&self, group: &str) -> Result<T> {
        let path = self.group_path(group);
        let Some(content) = read_optional(&path)? else {
            return Ok(T::default());
        };

        match serde_json::from_str(&content) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("Discarding unreadable key group {}: {}", path.display(), e);
                Ok(T::default())
            }
        }
    }

    fn save_group<T: Serialize>(&self, group: &str, value: &T, mode: Option<u32>) -> Result<()> {
        let path = self.group_path(group);
        let content = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize key group {}", group))?;

        atomic_write(&path, content.as_bytes(), mode)
            .with_context(|| format!("Failed to write key group: {}", path.display()))
    }

    pub fn load_enforcement(&self) -> Result<EnforcementPrefs> {
        self.load_group(ENFORCEMENT_GROUP)
    }

    pub fn save_enforcement(&self, prefs: &EnforcementPrefs) -> Result<()> {
        self.save_group(ENFORCEMENT_GROUP, prefs, None)
    }

    pub fn load_screen_time(&self) -> Result<ScreenTimeState> {
        self.load_group::<ScreenTimePrefs>(SCREEN_TIME_GROUP)
            .map(Into::into)
    }

    pub fn save_screen_time(&self, state: &ScreenTimeState) -> Result<()> {
        self.save_group(SCREEN_TIME_GROUP, &ScreenTimePrefs::from(*state), None)
    }

    pub fn load_pin(&self) -> Result<PinPrefs> {
        self.load_group(PIN_GROUP)
    }

    pub fn save_pin(&self, prefs: &PinPrefs) -> Result<()> {
        self.save_group(PIN_GROUP, prefs, Some(0o600))
    }
}
