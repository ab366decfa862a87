use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::curve::{BrightnessCurve, BrightnessRange, PlatformCapabilities};
use crate::screen_time::Strategy;

const APP_NAME: &str = "kids-guard";

/// Engine configuration, loaded from `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub brightness: BrightnessConfig,
    pub volume: VolumeConfig,
    pub screen_time: ScreenTimeConfig,
    pub lock: LockConfig,
    pub logging: LoggingConfig,
}

/// Brightness watchdog settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BrightnessConfig {
    /// Allowed drift in percentage points before correcting
    pub tolerance: u8,

    pub poll_interval_secs: u64,

    pub curve: CurveSelection,

    /// Backlight device name; first one found when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Native range overrides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<i64>,
}

impl Default for BrightnessConfig {
    fn default() -> Self {
        Self {
            tolerance: 3,
            poll_interval_secs: 5,
            curve: CurveSelection::Auto,
            device: None,
            minimum: None,
            maximum: None,
        }
    }
}

impl BrightnessConfig {
    /// Resolve the device range, letting configured bounds override the
    /// ones reported by the device
    pub fn range(&self, device: BrightnessRange) -> BrightnessRange {
        BrightnessRange::resolve(
            Some(self.minimum.unwrap_or(device.minimum() as i64)),
            Some(self.maximum.unwrap_or(device.maximum() as i64)),
        )
    }
}

/// Curve choice; `auto` follows platform capabilities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveSelection {
    #[default]
    Auto,
    Linear,
    Quadratic,
    Perceptual,
    Remapped,
}

impl CurveSelection {
    pub fn resolve(self, caps: PlatformCapabilities) -> BrightnessCurve {
        match self {
            CurveSelection::Auto => BrightnessCurve::resolve(caps),
            CurveSelection::Linear => BrightnessCurve::Linear,
            CurveSelection::Quadratic => BrightnessCurve::Quadratic,
            CurveSelection::Perceptual => BrightnessCurve::Perceptual,
            CurveSelection::Remapped => BrightnessCurve::RemappedPerceptual,
        }
    }
}

/// Volume watchdog settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub tolerance: u8,

    /// Poll interval; without one the watchdog relies on notifications and
    /// falls back to a 5 second poll when the backend has none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,

    /// Mixer control name
    pub control: String,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            tolerance: 2,
            poll_interval_secs: None,
            control: "Master".to_string(),
        }
    }
}

/// Screen-time counter settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScreenTimeConfig {
    pub strategy: Strategy,

    pub check_interval_secs: u64,

    /// Warning thresholds in minutes before the limit
    pub warnings_minutes: Vec<u32>,

    /// Limit reported when none has been set
    pub default_limit_seconds: i64,
}

impl Default for ScreenTimeConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Timer,
            check_interval_secs: 60,
            warnings_minutes: vec![15, 5, 1],
            default_limit_seconds: 7200,
        }
    }
}

/// Lock session timings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    pub relaunch_delay_ms: u64,
    pub foreground_check_ms: u64,
    pub emergency_first_check_ms: u64,
    pub emergency_recheck_ms: u64,

    /// Foreground package fragments treated as the emergency dialer
    pub emergency_packages: Vec<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            relaunch_delay_ms: 100,
            foreground_check_ms: 200,
            emergency_first_check_ms: 1000,
            emergency_recheck_ms: 500,
            emergency_packages: vec![
                "dialer".to_string(),
                "phone".to_string(),
                "contacts".to_string(),
            ],
        }
    }
}

impl LockConfig {
    pub fn relaunch_delay(&self) -> Duration {
        Duration::from_millis(self.relaunch_delay_ms)
    }

    pub fn foreground_check(&self) -> Duration {
        Duration::from_millis(self.foreground_check_ms)
    }

    pub fn emergency_first_check(&self) -> Duration {
        Duration::from_millis(self.emergency_first_check_ms)
    }

    pub fn emergency_recheck(&self) -> Duration {
        Duration::from_millis(self.emergency_recheck_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        let config = match crate::platform::common::read_optional(path)? {
            Some(content) => toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.brightness.tolerance > 50 || self.volume.tolerance > 50 {
            anyhow::bail!("Tolerance must be between 0 and 50 percentage points");
        }

        if self.brightness.poll_interval_secs == 0 {
            anyhow::bail!("brightness.poll_interval_secs must be greater than zero");
        }

        if self.volume.poll_interval_secs == Some(0) {
            anyhow::bail!("volume.poll_interval_secs must be greater than zero");
        }

        if self.screen_time.check_interval_secs == 0 {
            anyhow::bail!("screen_time.check_interval_secs must be greater than zero");
        }

        if self.screen_time.default_limit_seconds < 0 {
            anyhow::bail!("screen_time.default_limit_seconds cannot be negative");
        }

        let lock = &self.lock;
        if lock.foreground_check_ms == 0
            || lock.emergency_first_check_ms == 0
            || lock.emergency_recheck_ms == 0
        {
            anyhow::bail!("Lock check intervals must be greater than zero");
        }

        if lock.emergency_packages.iter().all(|p| p.trim().is_empty()) {
            anyhow::bail!("lock.emergency_packages must name at least one package");
        }

        Ok(())
    }
}

/// Default config file location
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = project_dirs()?;
    Ok(dirs.config_dir().join("config.toml"))
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
        .context("Could not determine a home directory for kids-guard")
}

/// Where persisted state and runtime files live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths {
    pub state_dir: PathBuf,
    pub runtime_dir: PathBuf,
}

impl EnginePaths {
    /// Resolve from `ProjectDirs`, or place everything under `state_dir`
    pub fn resolve(state_dir: Option<&Path>) -> Result<Self> {
        if let Some(dir) = state_dir {
            return Ok(Self::under(dir));
        }

        let dirs = project_dirs()?;
        let state_dir = dirs.data_local_dir().join("state");
        let runtime_dir = dirs
            .runtime_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dirs.data_local_dir().join("run"));

        Ok(Self {
            state_dir,
            runtime_dir,
        })
    }

    pub fn under(dir: &Path) -> Self {
        Self {
            state_dir: dir.to_path_buf(),
            runtime_dir: dir.join("run"),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join("kids-guard.sock")
    }

    pub fn status_path(&self) -> PathBuf {
        self.runtime_dir.join("status.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::PlatformGeneration;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.brightness.tolerance, 3);
        assert_eq!(config.volume.tolerance, 2);
        assert_eq!(config.screen_time.default_limit_seconds, 7200);
        assert_eq!(config.lock.emergency_packages.len(), 3);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            concat!(
                "[brightness]\ncurve = \"quadratic\"\ntolerance = 5\n\n",
                "[screen_time]\nstrategy = \"usage-stats\"\n",
            ),
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.brightness.curve, CurveSelection::Quadratic);
        assert_eq!(config.brightness.tolerance, 5);
        assert_eq!(config.brightness.poll_interval_secs, 5);
        assert_eq!(config.screen_time.strategy, Strategy::UsageStats);
        assert_eq!(config.lock.relaunch_delay_ms, 100);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.brightness.tolerance = 60;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.screen_time.check_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.lock.emergency_packages.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn curve_selection_overrides_auto() {
        let caps = PlatformCapabilities {
            generation: PlatformGeneration::Gamma,
            native_gamma: true,
        };
        assert_eq!(CurveSelection::Auto.resolve(caps), BrightnessCurve::Perceptual);
        assert_eq!(CurveSelection::Linear.resolve(caps), BrightnessCurve::Linear);
    }

    #[test]
    fn configured_range_overrides_device() {
        let config = BrightnessConfig {
            minimum: Some(20),
            ..Default::default()
        };
        let range = config.range(BrightnessRange::new(0, 1000).unwrap());
        assert_eq!(range.minimum(), 20);
        assert_eq!(range.maximum(), 1000);
    }

    #[test]
    fn state_dir_override_holds_runtime_files() {
        let paths = EnginePaths::under(Path::new("/tmp/kg"));
        assert_eq!(paths.socket_path(), PathBuf::from("/tmp/kg/run/kids-guard.sock"));
        assert_eq!(paths.status_path(), PathBuf::from("/tmp/kg/run/status.json"));
    }
}
