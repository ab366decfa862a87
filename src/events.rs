use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// How a lock session is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presentation {
    Overlay,
    LockScreen,
}

/// Why a lock session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockReason {
    /// Correct parent PIN
    Pin,
    /// Enforcement was disabled or the limit no longer applies
    NoLongerRequired,
}

/// Events pushed to subscribers of the enforcement process
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "event")]
pub enum EnforcementEvent {
    #[serde(rename = "onBrightnessEnforced")]
    BrightnessEnforced { from: u8, to: u8 },

    #[serde(rename = "onVolumeEnforced")]
    VolumeEnforced { from: u8, to: u8 },

    #[serde(rename = "screenTimeWarning")]
    ScreenTimeWarning { minutes_remaining: u32 },

    #[serde(rename = "lockEngaged")]
    LockEngaged { presentation: Presentation },

    #[serde(rename = "unlocked")]
    Unlocked { reason: UnlockReason },
}

/// Fan-out channel for [`EnforcementEvent`]s; slow subscribers lose old events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EnforcementEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnforcementEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: EnforcementEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correction_event_wire_format() {
        let event = EnforcementEvent::BrightnessEnforced { from: 54, to: 50 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "onBrightnessEnforced");
        assert_eq!(json["from"], 54);
        assert_eq!(json["to"], 50);
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(EnforcementEvent::LockEngaged {
            presentation: Presentation::LockScreen,
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            EnforcementEvent::LockEngaged {
                presentation: Presentation::LockScreen
            }
        );
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        EventBus::new(4).emit(EnforcementEvent::Unlocked {
            reason: UnlockReason::Pin,
        });
    }
}
