use anyhow::Result;
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::store::{PinPrefs, PrefsStore};

const MIN_PIN_LEN: usize = 4;
const MAX_PIN_LEN: usize = 8;

/// Parent PIN storage and verification
///
/// The PIN is kept in its own key group, readable by the owning user only.
#[derive(Debug, Clone)]
pub struct PinStore {
    store: PrefsStore,
}

impl PinStore {
    pub fn new(store: PrefsStore) -> Self {
        Self { store }
    }

    /// Check that a PIN is 4-8 ASCII digits
    pub fn validate(pin: &str) -> Result<(), ControlError> {
        if !(MIN_PIN_LEN..=MAX_PIN_LEN).contains(&pin.len()) {
            return Err(ControlError::InvalidArgument(format!(
                "PIN must be {}-{} digits",
                MIN_PIN_LEN, MAX_PIN_LEN
            )));
        }
        if !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ControlError::InvalidArgument(
                "PIN must contain digits only".to_string(),
            ));
        }
        Ok(())
    }

    pub fn has_pin(&self) -> bool {
        self.stored().is_some()
    }

    pub fn save_pin(&self, pin: &str) -> Result<(), ControlError> {
        Self::validate(pin)?;

        self.store
            .save_pin(&PinPrefs {
                parent_pin: Some(pin.to_string()),
            })
            .map_err(ControlError::Persistence)?;

        info!("Parent PIN saved");
        Ok(())
    }

    /// Replace the PIN, requiring the current one
    pub fn change_pin(&self, old: &str, new: &str) -> Result<(), ControlError> {
        if !self.verify_pin(old) {
            warn!("PIN change rejected: current PIN did not match");
            return Err(ControlError::InvalidArgument(
                "current PIN is incorrect".to_string(),
            ));
        }
        self.save_pin(new)
    }

    /// Compare against the stored PIN; false when no PIN has been set
    pub fn verify_pin(&self, pin: &str) -> bool {
        match self.stored() {
            Some(stored) => stored == pin,
            None => {
                debug!("PIN verification attempted with no stored PIN");
                false
            }
        }
    }

    fn stored(&self) -> Option<String> {
        match self.store.load_pin() {
            Ok(prefs) => prefs.parent_pin.filter(|pin| !pin.is_empty()),
            Err(e) => {
                warn!("Failed to read stored PIN: {:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pin_store() -> (tempfile::TempDir, PinStore) {
        let dir = tempdir().unwrap();
        let store = PinStore::new(PrefsStore::new(dir.path()));
        (dir, store)
    }

    #[test]
    fn test_save_and_verify_pin() {
        let (_dir, pins) = pin_store();
        pins.save_pin("1234").unwrap();

        assert!(pins.has_pin());
        assert!(pins.verify_pin("1234"));
        assert!(!pins.verify_pin("4321"));
    }

    #[test]
    fn test_verify_without_stored_pin() {
        let (_dir, pins) = pin_store();
        assert!(!pins.has_pin());
        assert!(!pins.verify_pin(""));
        assert!(!pins.verify_pin("1234"));
    }

    #[test]
    fn test_pin_validation() {
        assert!(PinStore::validate("1234").is_ok());
        assert!(PinStore::validate("12345678").is_ok());
        assert_eq!(PinStore::validate("123").unwrap_err().code(), "INVALID_ARGUMENT");
        assert!(PinStore::validate("123456789").is_err());
        assert!(PinStore::validate("12a4").is_err());
    }

    #[test]
    fn test_change_pin_requires_old() {
        let (_dir, pins) = pin_store();
        pins.save_pin("1234").unwrap();

        assert!(pins.change_pin("0000", "5678").is_err());
        assert!(pins.verify_pin("1234"));

        pins.change_pin("1234", "5678").unwrap();
        assert!(pins.verify_pin("5678"));
        assert!(!pins.verify_pin("1234"));
    }

    #[cfg(unix)]
    #[test]
    fn test_pin_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let pins = PinStore::new(PrefsStore::new(dir.path()));
        pins.save_pin("2468").unwrap();

        let meta = std::fs::metadata(dir.path().join("kids_guard_pin.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
