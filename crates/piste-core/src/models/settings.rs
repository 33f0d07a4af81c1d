//! Application settings model

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application settings
///
/// Persisted settings are rebuilt field-by-field during migration, so every
/// field must tolerate absence in older blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Bump the pending bib number after each recorded entry
    pub auto_increment_bib: bool,
    /// Vibrate on record
    pub haptic_feedback: bool,
    /// Play a beep on record
    pub sound_effects: bool,
    /// Exchange entries with other devices sharing the race id
    pub sync_enabled: bool,
    /// Upload photo markers alongside entries
    pub photo_sync_enabled: bool,
    /// Attach a GPS fix to recorded entries
    pub gps_enabled: bool,
    /// Capture a finish-line photo on record
    pub photo_capture_enabled: bool,
    /// UI transition animations
    pub animations_enabled: bool,
    /// Translucent panel effect in the UI
    pub glass_effects_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_increment_bib: true,
            haptic_feedback: true,
            sound_effects: true,
            sync_enabled: false,
            photo_sync_enabled: false,
            gps_enabled: false,
            photo_capture_enabled: false,
            animations_enabled: true,
            glass_effects_enabled: true,
        }
    }
}

impl Settings {
    /// Rebuild settings from untrusted JSON, accepting only correctly-typed
    /// fields and falling back to defaults for the rest.
    #[must_use]
    pub fn from_untrusted(value: &Value) -> Self {
        let mut settings = Self::default();
        let Some(obj) = value.as_object() else {
            return settings;
        };

        let read = |key: &str, slot: &mut bool| {
            if let Some(Value::Bool(flag)) = obj.get(key) {
                *slot = *flag;
            }
        };

        read("autoIncrementBib", &mut settings.auto_increment_bib);
        read("hapticFeedback", &mut settings.haptic_feedback);
        read("soundEffects", &mut settings.sound_effects);
        read("syncEnabled", &mut settings.sync_enabled);
        read("photoSyncEnabled", &mut settings.photo_sync_enabled);
        read("gpsEnabled", &mut settings.gps_enabled);
        read("photoCaptureEnabled", &mut settings.photo_capture_enabled);
        read("animationsEnabled", &mut settings.animations_enabled);
        read("glassEffectsEnabled", &mut settings.glass_effects_enabled);

        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();
        assert!(settings.auto_increment_bib);
        assert!(!settings.sync_enabled);
    }

    #[test]
    fn test_from_untrusted_accepts_only_typed_fields() {
        let value = json!({
            "syncEnabled": true,
            "hapticFeedback": "yes",
            "gpsEnabled": 1,
            "unknownField": true
        });
        let settings = Settings::from_untrusted(&value);
        assert!(settings.sync_enabled);
        // wrong-typed fields keep their defaults
        assert!(settings.haptic_feedback);
        assert!(!settings.gps_enabled);
    }

    #[test]
    fn test_from_untrusted_non_object_yields_defaults() {
        assert_eq!(Settings::from_untrusted(&json!(null)), Settings::default());
        assert_eq!(Settings::from_untrusted(&json!([1, 2])), Settings::default());
    }
}
