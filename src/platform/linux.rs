use anyhow::Result;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::common::{atomic_write, command_output, try_command};
use super::{
    ChangeSubscription, LivenessIndicator, LockSurface, OverlayHandle, Platform, SettingBackend,
};
use crate::config::{EnginePaths, EngineConfig};
use crate::curve::{BrightnessRange, PlatformCapabilities, PlatformGeneration};
use crate::error::{Permission, PlatformError};
use crate::process::ProcessStatus;

const BACKLIGHT_ROOT: &str = "/sys/class/backlight";

/// Build the Linux platform from sysfs, ALSA and logind
pub fn detect(config: &EngineConfig, paths: &EnginePaths) -> Result<Platform> {
    let device = config.brightness.device.as_deref();
    let brightness: Box<dyn SettingBackend> =
        match SysfsBacklight::discover(Path::new(BACKLIGHT_ROOT), device) {
            Some(backlight) => {
                info!("Using backlight device {}", backlight.dir.display());
                Box::new(backlight)
            }
            None => {
                warn!("No backlight device found; brightness enforcement unavailable");
                Box::new(MissingSetting("backlight"))
            }
        };

    Ok(Platform {
        // No platform gamma implementation to defer to
        capabilities: PlatformCapabilities {
            generation: PlatformGeneration::Gamma,
            native_gamma: false,
        },
        brightness,
        volume: Box::new(AlsaMixer::new(&config.volume.control)),
        usage_stats: None,
        lock_surface: Box::new(SessionLock::from_env()),
        liveness: Box::new(StatusFile::new(paths.status_path())),
    })
}

/// Stand-in for a setting the host does not have
struct MissingSetting(&'static str);

impl SettingBackend for MissingSetting {
    fn native_range(&mut self) -> Result<BrightnessRange, PlatformError> {
        Err(PlatformError::Unavailable(format!("no {} device", self.0)))
    }

    fn read_native(&mut self) -> Result<i64, PlatformError> {
        Err(PlatformError::Unavailable(format!("no {} device", self.0)))
    }

    fn write_native(&mut self, _value: u32) -> Result<(), PlatformError> {
        Err(PlatformError::Unavailable(format!("no {} device", self.0)))
    }
}

/// Backlight exposed under `/sys/class/backlight/<device>`
pub struct SysfsBacklight {
    dir: PathBuf,
}

impl SysfsBacklight {
    /// Use the named device, or the first one present
    pub fn discover(root: &Path, device: Option<&str>) -> Option<Self> {
        if let Some(name) = device {
            let dir = root.join(name);
            return dir.join("brightness").exists().then_some(Self { dir });
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(root)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.join("brightness").exists())
            .collect();
        entries.sort();
        entries.into_iter().next().map(|dir| Self { dir })
    }

    fn brightness_path(&self) -> PathBuf {
        self.dir.join("brightness")
    }

    fn read_number(&self, file: &str) -> Result<i64, PlatformError> {
        let path = self.dir.join(file);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| PlatformError::from_io(e, Permission::WriteSettings))?;
        content.trim().parse().map_err(|_| {
            PlatformError::Unavailable(format!("unexpected content in {}", path.display()))
        })
    }
}

impl SettingBackend for SysfsBacklight {
    fn native_range(&mut self) -> Result<BrightnessRange, PlatformError> {
        let max = self.read_number("max_brightness")?;
        Ok(BrightnessRange::resolve(Some(0), Some(max)))
    }

    fn read_native(&mut self) -> Result<i64, PlatformError> {
        self.read_number("brightness")
    }

    fn write_native(&mut self, value: u32) -> Result<(), PlatformError> {
        std::fs::write(self.brightness_path(), value.to_string())
            .map_err(|e| PlatformError::from_io(e, Permission::WriteSettings))
    }

    fn subscribe(&mut self) -> Option<ChangeSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res
                    && matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                {
                    let _ = tx.send(());
                }
            },
            NotifyConfig::default(),
        );

        let mut watcher = match watcher {
            Ok(watcher) => watcher,
            Err(e) => {
                debug!("Backlight watch unavailable: {}", e);
                return None;
            }
        };

        if let Err(e) = watcher.watch(&self.brightness_path(), RecursiveMode::NonRecursive) {
            debug!("Failed to watch {}: {}", self.brightness_path().display(), e);
            return None;
        }

        Some(ChangeSubscription::new(rx, watcher))
    }
}

/// ALSA simple mixer control driven through `amixer`
pub struct AlsaMixer {
    control: String,
}

impl AlsaMixer {
    pub fn new(control: &str) -> Self {
        Self {
            control: control.to_string(),
        }
    }

    fn query(&self) -> Result<String, PlatformError> {
        command_output("amixer", &["sget", &self.control]).ok_or_else(|| {
            PlatformError::Unavailable(format!("amixer control '{}' not readable", self.control))
        })
    }
}

impl SettingBackend for AlsaMixer {
    fn native_range(&mut self) -> Result<BrightnessRange, PlatformError> {
        let output = self.query()?;
        let (min, max) = parse_mixer_limits(&output)
            .ok_or_else(|| PlatformError::Unavailable("mixer reports no playback limits".into()))?;
        BrightnessRange::new(min, max)
            .ok_or_else(|| PlatformError::Unavailable("mixer reports an empty range".into()))
    }

    fn read_native(&mut self) -> Result<i64, PlatformError> {
        let output = self.query()?;
        parse_mixer_value(&output)
            .ok_or_else(|| PlatformError::Unavailable("mixer reports no playback value".into()))
    }

    fn write_native(&mut self, value: u32) -> Result<(), PlatformError> {
        let value = value.to_string();
        if try_command("amixer", &["-q", "sset", &self.control, &value]) {
            Ok(())
        } else {
            Err(PlatformError::Unavailable(format!(
                "amixer failed to set '{}'",
                self.control
            )))
        }
    }
}

/// Parse `Limits: Playback 0 - 65536`
fn parse_mixer_limits(output: &str) -> Option<(u32, u32)> {
    let line = output.lines().find(|l| l.trim_start().starts_with("Limits:"))?;
    let numbers: Vec<u32> = line
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    match numbers.as_slice() {
        [min, max, ..] => Some((*min, *max)),
        _ => None,
    }
}

/// Parse the first `Playback <n> [..%]` channel value
fn parse_mixer_value(output: &str) -> Option<i64> {
    output
        .lines()
        .filter(|l| !l.trim_start().starts_with("Limits:"))
        .filter_map(|l| l.split_once("Playback "))
        .filter(|(_, rest)| rest.contains('['))
        .find_map(|(_, rest)| rest.split_whitespace().next()?.parse().ok())
}

/// Lock surface backed by the login session's screen locker
pub struct SessionLock {
    session_id: Option<String>,
}

impl SessionLock {
    pub fn from_env() -> Self {
        Self {
            session_id: std::env::var("XDG_SESSION_ID").ok(),
        }
    }

    fn session_args<'a>(&'a self, verb: &'a str) -> Vec<&'a str> {
        let mut args = vec![verb];
        if let Some(id) = &self.session_id {
            args.push(id);
        }
        args
    }
}

impl LockSurface for SessionLock {
    fn can_draw_overlays(&self) -> bool {
        false
    }

    fn show_overlay(&mut self) -> Result<OverlayHandle, PlatformError> {
        Err(PlatformError::PermissionDenied(Permission::Overlay))
    }

    fn remove_overlay(&mut self, _handle: OverlayHandle) -> Result<(), PlatformError> {
        Ok(())
    }

    fn launch_lock_screen(&mut self) -> Result<(), PlatformError> {
        if try_command("loginctl", &self.session_args("lock-session")) {
            return Ok(());
        }

        const LOCKERS: &[(&str, &[&str])] = &[
            ("xdg-screensaver", &["lock"]),
            ("gnome-screensaver-command", &["--lock"]),
            ("cinnamon-screensaver-command", &["--lock"]),
            ("mate-screensaver-command", &["--lock"]),
            ("xscreensaver-command", &["-lock"]),
            ("light-locker-command", &["--lock"]),
        ];

        for (cmd, args) in LOCKERS {
            if try_command(cmd, args) {
                debug!("Session locked with {}", cmd);
                return Ok(());
            }
        }

        Err(PlatformError::Unavailable(
            "no supported screen locker found".to_string(),
        ))
    }

    fn finish_lock_screen(&mut self) -> Result<(), PlatformError> {
        if try_command("loginctl", &self.session_args("unlock-session")) {
            Ok(())
        } else {
            Err(PlatformError::Unavailable("loginctl unlock-session failed".into()))
        }
    }

    fn is_lock_screen_foreground(&self) -> bool {
        let mut args = vec!["show-session"];
        if let Some(id) = &self.session_id {
            args.push(id);
        }
        args.extend(["-p", "LockedHint", "--value"]);

        match command_output("loginctl", &args) {
            Some(hint) => hint.trim() == "yes",
            // Cannot tell; assume the locker is still up rather than spin relaunching
            None => true,
        }
    }

    fn foreground_package(&self) -> Option<String> {
        None
    }

    fn launch_dialer(&mut self) -> Result<(), PlatformError> {
        Err(PlatformError::Unavailable(
            "no emergency dialer on this platform".to_string(),
        ))
    }

    fn show_feedback(&mut self, message: &str) {
        if !try_command("notify-send", &["Kids Guard", message]) {
            debug!("Could not show feedback: {}", message);
        }
    }
}

/// Liveness published as a JSON status file in the runtime directory
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl LivenessIndicator for StatusFile {
    fn publish(&mut self, status: &ProcessStatus) -> Result<(), PlatformError> {
        let content = serde_json::to_vec_pretty(status)
            .map_err(|e| PlatformError::Unavailable(format!("status encoding failed: {}", e)))?;
        atomic_write(&self.path, &content, Some(0o644))
            .map_err(|e| PlatformError::Unavailable(format!("{:#}", e)))
    }

    fn withdraw(&mut self) -> Result<(), PlatformError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PlatformError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const AMIXER_OUTPUT: &str = "Simple mixer control 'Master',0
  Capabilities: pvolume pswitch pswitch-joined
  Playback channels: Front Left - Front Right
  Limits: Playback 0 - 65536
  Mono:
  Front Left: Playback 39321 [60%] [on]
  Front Right: Playback 39321 [60%] [on]
";

    #[test]
    fn test_parse_mixer_output() {
        assert_eq!(parse_mixer_limits(AMIXER_OUTPUT), Some((0, 65536)));
        assert_eq!(parse_mixer_value(AMIXER_OUTPUT), Some(39321));
        assert_eq!(parse_mixer_value("no playback here"), None);
    }

    #[test]
    fn test_sysfs_backlight_read_write() {
        let root = tempdir().unwrap();
        let dev = root.path().join("intel_backlight");
        std::fs::create_dir(&dev).unwrap();
        std::fs::write(dev.join("brightness"), "1200\n").unwrap();
        std::fs::write(dev.join("max_brightness"), "19393\n").unwrap();

        let mut backlight = SysfsBacklight::discover(root.path(), None).unwrap();
        assert_eq!(backlight.native_range().unwrap(), BrightnessRange::new(0, 19393).unwrap());
        assert_eq!(backlight.read_native().unwrap(), 1200);

        backlight.write_native(5000).unwrap();
        assert_eq!(backlight.read_native().unwrap(), 5000);
    }

    #[test]
    fn test_discover_named_device() {
        let root = tempdir().unwrap();
        assert!(SysfsBacklight::discover(root.path(), Some("acpi_video0")).is_none());

        let dev = root.path().join("acpi_video0");
        std::fs::create_dir(&dev).unwrap();
        std::fs::write(dev.join("brightness"), "3").unwrap();
        assert!(SysfsBacklight::discover(root.path(), Some("acpi_video0")).is_some());
    }

    #[test]
    fn test_status_file_publish_and_withdraw() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run").join("status.json");
        let mut liveness = StatusFile::new(path.clone());

        liveness.publish(&ProcessStatus::starting()).unwrap();
        assert!(path.exists());

        liveness.withdraw().unwrap();
        assert!(!path.exists());
        liveness.withdraw().unwrap();
    }
}
