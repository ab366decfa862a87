//! The long-lived enforcement process.
//!
//! One [`EnforcementProcess`] owns every target, both watchdogs, the
//! screen-time counter and the lock state machine. Control commands and all
//! timers are served from a single `select!` loop in [`EnforcementProcess::run`],
//! so no two corrections or transitions ever run concurrently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::PinStore;
use crate::clock::{Clock, sleep_until_deadline};
use crate::config::EngineConfig;
use crate::curve::{BrightnessCurve, BrightnessRange, NativeScale};
use crate::error::ControlError;
use crate::events::{EnforcementEvent, EventBus, Presentation, UnlockReason};
use crate::lock::{LifecycleEvent, LockStateMachine, PinOutcome};
use crate::platform::{LivenessIndicator, Platform};
use crate::screen_time::{LimitStatus, ScreenTimeCounter};
use crate::store::{EnforcementPrefs, PrefsStore};
use crate::target::{EnforcementTarget, ScreenTimeState, TargetKind};
use crate::watchdog::{Correction, SettingWatchdog};

/// Control protocol understood by the process
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProcessCommand {
    /// Re-arm persisted intent; a no-op when already running
    Start,

    UpdateBrightness {
        value: i64,
        #[serde(default = "default_true")]
        enforcing: bool,
    },
    StopBrightness,
    SetBrightness {
        percent: i32,
    },
    GetBrightness,

    UpdateVolume {
        value: i64,
        #[serde(default = "default_true")]
        enforcing: bool,
    },
    StopVolume,
    SetVolume {
        percent: i32,
    },
    GetVolume,

    UpdateScreenTime {
        limit_seconds: i64,
        #[serde(default = "default_true")]
        enforcing: bool,
    },
    StopScreenTime,
    GetScreenTime,

    SavePin {
        pin: String,
    },
    ChangePin {
        old: String,
        new: String,
    },
    VerifyPin {
        pin: String,
    },
    EmergencyCall,
    Lifecycle {
        event: LifecycleEvent,
    },

    Status,
    Shutdown,
}

fn default_true() -> bool {
    true
}

/// Acknowledgment for a [`ProcessCommand`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Ack,
    Percent {
        percent: u8,
    },
    ScreenTime(ScreenTimeReport),
    /// `Unlocked` also reports a correct PIN when no lock session was active
    Pin {
        outcome: PinOutcome,
    },
    Status(ProcessStatus),
    Error {
        code: String,
        message: String,
    },
}

impl From<ControlError> for ControlResponse {
    fn from(err: ControlError) -> Self {
        ControlResponse::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScreenTimeReport {
    pub enforcing: bool,
    pub limit_seconds: i64,
    pub elapsed_seconds: i64,
    pub limit: LimitStatus,
}

/// Liveness document describing the running process
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProcessStatus {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness_target: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_target: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_time_limit: Option<i64>,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation: Option<Presentation>,
    #[serde(default)]
    pub pin_set: bool,
}

impl ProcessStatus {
    /// Status of a process that is not enforcing anything yet
    pub fn starting() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            brightness_target: None,
            volume_target: None,
            screen_time_limit: None,
            locked: false,
            presentation: None,
            pin_set: false,
        }
    }
}

/// A command with its reply channel
pub struct Envelope {
    pub command: ProcessCommand,
    pub reply: oneshot::Sender<ControlResponse>,
}

/// Cloneable client side of a running process
#[derive(Clone)]
pub struct ProcessHandle {
    sender: mpsc::Sender<Envelope>,
    events: EventBus,
}

impl ProcessHandle {
    pub async fn send(&self, command: ProcessCommand) -> Result<ControlResponse, ControlError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Envelope { command, reply })
            .await
            .map_err(|_| ControlError::ProcessUnavailable)?;
        response.await.map_err(|_| ControlError::ProcessUnavailable)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnforcementEvent> {
        self.events.subscribe()
    }
}

pub struct EnforcementProcess {
    config: EngineConfig,
    store: PrefsStore,
    pins: PinStore,
    brightness: SettingWatchdog,
    brightness_target: EnforcementTarget,
    volume: SettingWatchdog,
    volume_target: EnforcementTarget,
    screen_time: ScreenTimeState,
    counter: ScreenTimeCounter,
    next_screen_check: Option<Instant>,
    lock: LockStateMachine,
    liveness: Box<dyn LivenessIndicator>,
    events: EventBus,
    started_at: DateTime<Utc>,
    shutdown_requested: bool,
}

impl EnforcementProcess {
    /// Build the process and restore any persisted enforcement intent
    pub fn new(
        config: EngineConfig,
        platform: Platform,
        store: PrefsStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let Platform {
            capabilities,
            mut brightness,
            mut volume,
            usage_stats,
            lock_surface,
            liveness,
        } = platform;

        let brightness_range = match brightness.native_range() {
            Ok(range) => config.brightness.range(range),
            Err(e) => {
                warn!("Brightness range unavailable ({}); using defaults", e);
                config.brightness.range(BrightnessRange::default())
            }
        };
        let curve = config.brightness.curve.resolve(capabilities);
        info!("Brightness curve {} over native range {}", curve, brightness_range);

        let volume_range = volume.native_range().unwrap_or_else(|e| {
            warn!("Volume range unavailable ({}); assuming 0..=100", e);
            BrightnessRange::new(0, 100).unwrap_or_default()
        });

        let brightness = SettingWatchdog::new(
            TargetKind::Brightness,
            brightness,
            NativeScale::new(curve, brightness_range),
            config.brightness.tolerance,
            Some(Duration::from_secs(config.brightness.poll_interval_secs)),
        );

        let volume = SettingWatchdog::new(
            TargetKind::Volume,
            volume,
            NativeScale::new(BrightnessCurve::Linear, volume_range),
            config.volume.tolerance,
            config.volume.poll_interval_secs.map(Duration::from_secs),
        );

        let counter = ScreenTimeCounter::new(&config.screen_time, usage_stats, clock);
        let lock = LockStateMachine::new(lock_surface, config.lock.clone());

        let mut process = Self {
            pins: PinStore::new(store.clone()),
            store,
            brightness,
            brightness_target: EnforcementTarget::idle(TargetKind::Brightness),
            volume,
            volume_target: EnforcementTarget::idle(TargetKind::Volume),
            screen_time: ScreenTimeState::idle(),
            counter,
            next_screen_check: None,
            lock,
            liveness,
            events: EventBus::default(),
            started_at: Utc::now(),
            shutdown_requested: false,
            config,
        };

        process.restore();
        process.publish_status();
        process
    }

    /// Re-arm whatever the store says was being enforced
    fn restore(&mut self) {
        let prefs = self.store.load_enforcement().unwrap_or_else(|e| {
            warn!("Failed to load enforcement state: {:#}", e);
            EnforcementPrefs::default()
        });

        self.brightness_target = prefs.target(TargetKind::Brightness);
        if self.brightness_target.is_enforcing {
            info!("Restoring brightness enforcement at {}%", self.brightness_target.target_value);
            self.brightness.start_enforcing(&mut self.brightness_target);
        }

        self.volume_target = prefs.target(TargetKind::Volume);
        if self.volume_target.is_enforcing {
            info!("Restoring volume enforcement at {}%", self.volume_target.target_value);
            self.volume.start_enforcing(&mut self.volume_target);
        }

        self.screen_time = self.store.load_screen_time().unwrap_or_else(|e| {
            warn!("Failed to load screen time state: {:#}", e);
            ScreenTimeState::idle()
        });

        if self.screen_time.repair(self.counter.now_ms()) {
            warn!("Repaired inconsistent screen time state");
            self.persist_screen_time();
        }

        if self.screen_time.enforcing {
            info!("Restoring screen time limit of {}s", self.screen_time.limit_seconds);
            self.counter.reset_warnings();
            self.next_screen_check = Some(Instant::now());
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Create the command channel for [`run`](Self::run)
    pub fn control_channel(&self, capacity: usize) -> (ProcessHandle, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            ProcessHandle {
                sender,
                events: self.events.clone(),
            },
            receiver,
        )
    }

    /// Serve commands and timers until shutdown or until every handle is gone
    pub async fn run(mut self, mut commands: mpsc::Receiver<Envelope>) {
        info!("Enforcement process running");

        loop {
            let screen_due = self.next_screen_check;
            let lock_due = self.lock.next_deadline();

            tokio::select! {
                envelope = commands.recv() => {
                    let Some(Envelope { command, reply }) = envelope else {
                        info!("All control handles closed");
                        break;
                    };
                    let response = self.execute(command);
                    if reply.send(response).is_err() {
                        debug!("Control client went away before the reply");
                    }
                    if self.shutdown_requested {
                        break;
                    }
                }
                trigger = self.brightness.next_trigger() => {
                    let correction = self
                        .brightness
                        .handle_trigger(trigger, &mut self.brightness_target);
                    self.announce(TargetKind::Brightness, correction);
                }
                trigger = self.volume.next_trigger() => {
                    let correction = self.volume.handle_trigger(trigger, &mut self.volume_target);
                    self.announce(TargetKind::Volume, correction);
                }
                _ = sleep_until_deadline(screen_due) => {
                    self.next_screen_check = Some(Instant::now() + self.counter.check_interval());
                    self.check_screen_time();
                }
                _ = sleep_until_deadline(lock_due) => {
                    self.lock.on_tick();
                }
            }
        }

        self.shutdown();
    }

    /// Dispatch one control command
    pub fn execute(&mut self, command: ProcessCommand) -> ControlResponse {
        debug!("Control command: {:?}", command);

        let result = match command {
            ProcessCommand::Start => {
                self.restore_if_idle();
                Ok(ControlResponse::Ack)
            }
            ProcessCommand::UpdateBrightness { value, enforcing } => {
                self.update(TargetKind::Brightness, value, enforcing)
            }
            ProcessCommand::StopBrightness => self.stop_enforcing(TargetKind::Brightness),
            ProcessCommand::SetBrightness { percent } => {
                self.set_value(TargetKind::Brightness, percent)
            }
            ProcessCommand::GetBrightness => self.get_value(TargetKind::Brightness),
            ProcessCommand::UpdateVolume { value, enforcing } => {
                self.update(TargetKind::Volume, value, enforcing)
            }
            ProcessCommand::StopVolume => self.stop_enforcing(TargetKind::Volume),
            ProcessCommand::SetVolume { percent } => self.set_value(TargetKind::Volume, percent),
            ProcessCommand::GetVolume => self.get_value(TargetKind::Volume),
            ProcessCommand::UpdateScreenTime {
                limit_seconds,
                enforcing,
            } => self.update(TargetKind::ScreenTime, limit_seconds, enforcing),
            ProcessCommand::StopScreenTime => self.stop_enforcing(TargetKind::ScreenTime),
            ProcessCommand::GetScreenTime => {
                Ok(ControlResponse::ScreenTime(self.screen_time_report()))
            }
            ProcessCommand::SavePin { pin } => {
                self.pins.save_pin(&pin).map(|_| ControlResponse::Ack)
            }
            ProcessCommand::ChangePin { old, new } => {
                self.pins.change_pin(&old, &new).map(|_| ControlResponse::Ack)
            }
            ProcessCommand::VerifyPin { pin } => Ok(ControlResponse::Pin {
                outcome: self.verify_pin(&pin),
            }),
            ProcessCommand::EmergencyCall => {
                self.lock.emergency_call().map(|_| ControlResponse::Ack)
            }
            ProcessCommand::Lifecycle { event } => {
                self.lifecycle(event);
                Ok(ControlResponse::Ack)
            }
            ProcessCommand::Status => Ok(ControlResponse::Status(self.status())),
            ProcessCommand::Shutdown => {
                info!("Shutdown requested");
                self.shutdown_requested = true;
                Ok(ControlResponse::Ack)
            }
        };

        self.publish_status();

        result.unwrap_or_else(|e| {
            warn!("Control command failed: {}", e);
            e.into()
        })
    }

    fn update(
        &mut self,
        kind: TargetKind,
        value: i64,
        enforcing: bool,
    ) -> Result<ControlResponse, ControlError> {
        if enforcing {
            self.start_enforcing(kind, value)?;
        } else {
            self.store_target(kind, value);
        }
        Ok(ControlResponse::Ack)
    }

    /// Persist a target and begin (or re-point) enforcement for it
    pub fn start_enforcing(&mut self, kind: TargetKind, value: i64) -> Result<(), ControlError> {
        match kind {
            TargetKind::Brightness => {
                self.brightness_target.arm(value);
                self.persist_target(kind);
                self.brightness.start_enforcing(&mut self.brightness_target);
            }
            TargetKind::Volume => {
                self.volume_target.arm(value);
                self.persist_target(kind);
                self.volume.start_enforcing(&mut self.volume_target);
            }
            TargetKind::ScreenTime => {
                if value < 0 {
                    return Err(ControlError::InvalidArgument(
                        "limit_seconds cannot be negative".to_string(),
                    ));
                }
                self.counter.ensure_ready()?;

                self.screen_time.start(value, self.counter.now_ms());
                self.persist_screen_time();
                self.counter.reset_warnings();
                self.next_screen_check = Some(Instant::now());
                info!("Screen time limit set to {}s", self.screen_time.limit_seconds);
            }
        }
        Ok(())
    }

    /// Store a value without enforcing it
    fn store_target(&mut self, kind: TargetKind, value: i64) {
        match kind {
            TargetKind::Brightness => {
                self.brightness.stop_enforcing();
                self.brightness_target.arm(value);
                self.brightness_target.is_enforcing = false;
                self.persist_target(kind);
            }
            TargetKind::Volume => {
                self.volume.stop_enforcing();
                self.volume_target.arm(value);
                self.volume_target.is_enforcing = false;
                self.persist_target(kind);
            }
            TargetKind::ScreenTime => {
                self.screen_time.disarm();
                self.screen_time.limit_seconds = kind.clamp(value);
                self.next_screen_check = None;
                self.persist_screen_time();
                self.release_lock(UnlockReason::NoLongerRequired);
            }
        }
    }

    /// Stop enforcement and clear the stored target
    pub fn stop_enforcing(&mut self, kind: TargetKind) -> Result<ControlResponse, ControlError> {
        match kind {
            TargetKind::Brightness => {
                self.brightness.stop_enforcing();
                self.brightness_target.clear();
            }
            TargetKind::Volume => {
                self.volume.stop_enforcing();
                self.volume_target.clear();
            }
            TargetKind::ScreenTime => {
                self.screen_time.clear();
                self.next_screen_check = None;
                self.persist_screen_time();
                self.release_lock(UnlockReason::NoLongerRequired);
                info!("Screen time enforcement stopped");
                return Ok(ControlResponse::Ack);
            }
        }

        self.persist_target(kind);
        Ok(ControlResponse::Ack)
    }

    pub fn is_enforcing(&self, kind: TargetKind) -> bool {
        match kind {
            TargetKind::Brightness => self.brightness_target.is_enforcing,
            TargetKind::Volume => self.volume_target.is_enforcing,
            TargetKind::ScreenTime => self.screen_time.enforcing,
        }
    }

    /// The stored target: percent for settings, limit seconds for screen time
    pub fn target_value(&self, kind: TargetKind) -> i64 {
        match kind {
            TargetKind::Brightness => self.brightness_target.target_value,
            TargetKind::Volume => self.volume_target.target_value,
            TargetKind::ScreenTime => self.screen_time.limit_seconds,
        }
    }

    pub fn set_value(
        &mut self,
        kind: TargetKind,
        percent: i32,
    ) -> Result<ControlResponse, ControlError> {
        let percent = match kind {
            TargetKind::Brightness => self.brightness.set_value(percent)?,
            TargetKind::Volume => self.volume.set_value(percent)?,
            TargetKind::ScreenTime => {
                return Err(ControlError::InvalidArgument(
                    "screen time has no current value to set".to_string(),
                ));
            }
        };
        Ok(ControlResponse::Percent { percent })
    }

    pub fn get_value(&mut self, kind: TargetKind) -> Result<ControlResponse, ControlError> {
        let percent = match kind {
            TargetKind::Brightness => self.brightness.current_percent()?,
            TargetKind::Volume => self.volume.current_percent()?,
            TargetKind::ScreenTime => {
                return Err(ControlError::InvalidArgument(
                    "use get_screen_time for screen time".to_string(),
                ));
            }
        };
        Ok(ControlResponse::Percent { percent })
    }

    pub fn screen_time_report(&self) -> ScreenTimeReport {
        let limit_seconds = if self.screen_time.limit_seconds < 0 {
            self.config.screen_time.default_limit_seconds
        } else {
            self.screen_time.limit_seconds
        };

        ScreenTimeReport {
            enforcing: self.screen_time.enforcing,
            limit_seconds,
            elapsed_seconds: self.counter.elapsed_seconds(&self.screen_time),
            limit: self.counter.check_limit(&self.screen_time),
        }
    }

    /// Check a PIN; while locked a correct PIN ends the session and
    /// disarms the screen-time timer, keeping the limit
    pub fn verify_pin(&mut self, pin: &str) -> PinOutcome {
        if !self.lock.is_locked() {
            return match (pin.is_empty(), self.pins.verify_pin(pin)) {
                (true, _) => PinOutcome::EmptyPin,
                (false, true) => PinOutcome::Unlocked,
                (false, false) => PinOutcome::Rejected,
            };
        }

        let outcome = self.lock.submit_pin(pin, &self.pins);
        if outcome == PinOutcome::Unlocked {
            info!("Unlocked with parent PIN");
            self.screen_time.disarm();
            self.next_screen_check = None;
            self.persist_screen_time();
            self.events.emit(EnforcementEvent::Unlocked {
                reason: UnlockReason::Pin,
            });
        }
        outcome
    }

    fn lifecycle(&mut self, event: LifecycleEvent) {
        let still_required = self.screen_time.enforcing
            && self.counter.check_limit(&self.screen_time).is_exceeded();

        if self.lock.on_lifecycle(event, still_required) {
            self.events.emit(EnforcementEvent::Unlocked {
                reason: UnlockReason::NoLongerRequired,
            });
        }
    }

    /// Evaluate the limit, warning or locking as needed
    pub fn check_screen_time(&mut self) -> LimitStatus {
        let status = self.counter.check_limit(&self.screen_time);

        match status {
            LimitStatus::Exceeded { elapsed } => {
                if let Some(presentation) = self.lock.engage() {
                    info!(
                        "Screen time limit reached: {}s used of {}s",
                        elapsed, self.screen_time.limit_seconds
                    );
                    self.events
                        .emit(EnforcementEvent::LockEngaged { presentation });
                    self.publish_status();
                }
            }
            LimitStatus::Within { remaining, .. } => {
                if let Some(minutes_remaining) = self.counter.due_warning(&status) {
                    info!("Screen time warning: {}s remaining", remaining);
                    self.lock.announce(&format!(
                        "{} minute{} of screen time left",
                        minutes_remaining,
                        if minutes_remaining == 1 { "" } else { "s" }
                    ));
                    self.events
                        .emit(EnforcementEvent::ScreenTimeWarning { minutes_remaining });
                }
                self.release_lock(UnlockReason::NoLongerRequired);
            }
            LimitStatus::Inactive => self.release_lock(UnlockReason::NoLongerRequired),
        }

        status
    }

    fn release_lock(&mut self, reason: UnlockReason) {
        if self.lock.release() {
            self.events.emit(EnforcementEvent::Unlocked { reason });
            self.publish_status();
        }
    }

    fn restore_if_idle(&mut self) {
        let anything_enforcing = self.brightness.is_enforcing()
            || self.volume.is_enforcing()
            || self.screen_time.enforcing;
        if !anything_enforcing {
            self.restore();
        }
    }

    fn announce(&mut self, kind: TargetKind, correction: Option<Correction>) {
        let Some(Correction { from, to }) = correction else {
            return;
        };
        let event = match kind {
            TargetKind::Brightness => EnforcementEvent::BrightnessEnforced { from, to },
            TargetKind::Volume => EnforcementEvent::VolumeEnforced { from, to },
            TargetKind::ScreenTime => return,
        };
        self.events.emit(event);
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            pid: std::process::id(),
            started_at: self.started_at,
            brightness_target: self
                .brightness_target
                .is_enforcing
                .then(|| self.brightness_target.percent())
                .flatten(),
            volume_target: self
                .volume_target
                .is_enforcing
                .then(|| self.volume_target.percent())
                .flatten(),
            screen_time_limit: self
                .screen_time
                .enforcing
                .then_some(self.screen_time.limit_seconds),
            locked: self.lock.is_locked(),
            presentation: self.lock.presentation(),
            pin_set: self.pins.has_pin(),
        }
    }

    fn publish_status(&mut self) {
        let status = self.status();
        if let Err(e) = self.liveness.publish(&status) {
            warn!("Failed to publish liveness status: {}", e);
        }
    }

    /// Commit the in-memory targets. Both setting kinds share one group, so
    /// it is always written whole from memory.
    fn persist_target(&self, kind: TargetKind) {
        if kind == TargetKind::ScreenTime {
            return self.persist_screen_time();
        }
        let prefs = EnforcementPrefs::from_targets(&self.brightness_target, &self.volume_target);
        if let Err(e) = self.store.save_enforcement(&prefs) {
            warn!("Failed to persist {} target, continuing in memory: {:#}", kind, e);
        }
    }

    fn persist_screen_time(&self) {
        if let Err(e) = self.store.save_screen_time(&self.screen_time) {
            warn!("Failed to persist screen time state, continuing in memory: {:#}", e);
        }
    }

    /// Stop watching and withdraw the liveness indicator. Persisted intent
    /// is left untouched so a restart resumes enforcement.
    pub fn shutdown(&mut self) {
        self.brightness.stop_enforcing();
        self.volume.stop_enforcing();
        if let Err(e) = self.liveness.withdraw() {
            warn!("Failed to withdraw liveness status: {}", e);
        }
        info!("Enforcement process stopped");
    }
}
