//! Shared types for the emergency response engine

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// Newtype wrapper for zone IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub String);

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ZoneId {
    fn from(s: &str) -> Self {
        ZoneId(s.to_string())
    }
}

/// Geographic coordinate pair in decimal degrees
///
/// Serialized as a `[lat, lon]` pair to match zone configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct LatLng {
    pub lat: f64,
    pub lon: f64,
}

impl LatLng {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Whether both components are finite and within WGS84 bounds
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

impl From<[f64; 2]> for LatLng {
    fn from(pair: [f64; 2]) -> Self {
        Self { lat: pair[0], lon: pair[1] }
    }
}

impl From<LatLng> for [f64; 2] {
    fn from(p: LatLng) -> Self {
        [p.lat, p.lon]
    }
}

/// A single normalized position sample
///
/// Immutable once built: every new reading produces a new `Position`.
/// Optional fields are `None` both when the source omitted them and when
/// the source reported them as unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Epoch milliseconds at which the fix was taken
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: u64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp_ms,
            accuracy_m: None,
            speed: None,
            heading: None,
            altitude: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }

    #[inline]
    pub fn lat_lng(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }

    /// Age of the fix relative to `now_ms`, zero if the fix is in the future
    #[inline]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }

    /// A position is stale once strictly older than the threshold
    #[inline]
    pub fn is_stale(&self, now_ms: u64, threshold_ms: u64) -> bool {
        self.age_ms(now_ms) > threshold_ms
    }
}

/// Safety classification of a geofence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Safe,
    Danger,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::Safe => "safe",
            ZoneKind::Danger => "danger",
        }
    }
}

/// Named circular geofence, supplied as configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub center: LatLng,
    pub radius_m: f64,
    pub kind: ZoneKind,
}

impl Zone {
    pub fn new(id: &str, name: &str, center: LatLng, radius_m: f64, kind: ZoneKind) -> Self {
        Self { id: ZoneId::from(id), name: name.to_string(), center, radius_m, kind }
    }

    /// Reject zones that cannot be evaluated meaningfully
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.0.trim().is_empty() {
            return Err(EngineError::invalid_config("zone id cannot be empty"));
        }
        if !self.radius_m.is_finite() || self.radius_m <= 0.0 {
            return Err(EngineError::invalid_config(format!(
                "zone {} radius must be a positive number of meters, got {}",
                self.id, self.radius_m
            )));
        }
        if !self.center.is_valid() {
            return Err(EngineError::invalid_config(format!(
                "zone {} center ({}, {}) is out of range",
                self.id, self.center.lat, self.center.lon
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn is_danger(&self) -> bool {
        self.kind == ZoneKind::Danger
    }
}

/// Input channel that produced a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Manual,
    Voice,
    Geofence,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 3] = [TriggerKind::Manual, TriggerKind::Voice, TriggerKind::Geofence];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Voice => "voice",
            TriggerKind::Geofence => "geofence",
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        match self {
            TriggerKind::Manual => 0,
            TriggerKind::Voice => 1,
            TriggerKind::Geofence => 2,
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized emergency-intent signal from one input adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// Matched phrase for voice triggers, zone name for geofence triggers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Epoch ms
    pub occurred_at: u64,
}

impl Trigger {
    pub fn new(kind: TriggerKind, detail: Option<String>, occurred_at: u64) -> Self {
        Self { kind, detail, occurred_at }
    }
}

/// Emergency contact attached to outgoing alerts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub relation: String,
}

/// Recognition languages, as (tag, display name)
pub const SUPPORTED_LANGUAGES: [(&str, &str); 4] = [
    ("en-US", "English (US)"),
    ("en-GB", "English (UK)"),
    ("en-IN", "English (India)"),
    ("hi-IN", "Hindi"),
];

/// Phrase-spotting settings for the voice adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub trigger_phrases: Vec<String>,
    /// Stored for the recognizer, in [0.0, 1.0]
    pub sensitivity: f32,
    pub language: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            trigger_phrases: ["help", "emergency", "save me", "danger", "sos"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sensitivity: 0.8,
            language: "en-US".to_string(),
        }
    }
}

impl VoiceSettings {
    pub fn validate(&self) -> EngineResult<()> {
        if !(0.0..=1.0).contains(&self.sensitivity) {
            return Err(EngineError::invalid_config(format!(
                "voice sensitivity must be within [0, 1], got {}",
                self.sensitivity
            )));
        }
        if self.trigger_phrases.iter().all(|p| p.trim().is_empty()) {
            return Err(EngineError::invalid_config("at least one trigger phrase is required"));
        }
        if !SUPPORTED_LANGUAGES.iter().any(|(tag, _)| *tag == self.language) {
            return Err(EngineError::invalid_config(format!(
                "unsupported voice language {:?}",
                self.language
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_settings_validation() {
        assert!(VoiceSettings::default().validate().is_ok());

        let loud = VoiceSettings { sensitivity: 1.5, ..VoiceSettings::default() };
        assert!(loud.validate().is_err());

        let silent = VoiceSettings { trigger_phrases: vec![" ".into()], ..VoiceSettings::default() };
        assert!(silent.validate().is_err());

        let hindi = VoiceSettings { language: "hi-IN".into(), ..VoiceSettings::default() };
        assert!(hindi.validate().is_ok());
        let klingon = VoiceSettings { language: "tlh".into(), ..VoiceSettings::default() };
        assert!(klingon.validate().is_err());
    }

    #[test]
    fn test_staleness_boundary() {
        let now = 1_767_617_600_000;
        let stale = Position::new(10.0, 10.0, now - 30_001);
        let fresh = Position::new(10.0, 10.0, now - 29_999);
        let exact = Position::new(10.0, 10.0, now - 30_000);

        assert!(stale.is_stale(now, 30_000));
        assert!(!fresh.is_stale(now, 30_000));
        assert!(!exact.is_stale(now, 30_000));
    }

    #[test]
    fn test_future_fix_is_not_stale() {
        let now = 1_000;
        let p = Position::new(0.0, 0.0, 5_000);
        assert_eq!(p.age_ms(now), 0);
        assert!(!p.is_stale(now, 0));
    }

    #[test]
    fn test_zone_validation() {
        let ok = Zone::new("z1", "Underpass", LatLng::new(10.0, 10.0), 500.0, ZoneKind::Danger);
        assert!(ok.validate().is_ok());

        let zero = Zone { radius_m: 0.0, ..ok.clone() };
        assert!(matches!(zero.validate(), Err(EngineError::InvalidConfiguration { .. })));

        let nan = Zone { radius_m: f64::NAN, ..ok.clone() };
        assert!(nan.validate().is_err());

        let bad_center = Zone { center: LatLng::new(91.0, 0.0), ..ok };
        assert!(bad_center.validate().is_err());
    }

    #[test]
    fn test_zone_deserialize_center_pair() {
        let zone: Zone = serde_json::from_str(
            r#"{"id":"z1","name":"Park","center":[10.0,10.5],"radius_m":250.0,"kind":"safe"}"#,
        )
        .unwrap();
        assert_eq!(zone.center, LatLng::new(10.0, 10.5));
        assert_eq!(zone.kind, ZoneKind::Safe);
    }

    #[test]
    fn test_position_omits_missing_fields() {
        let json = serde_json::to_string(&Position::new(1.0, 2.0, 3)).unwrap();
        assert!(!json.contains("speed"));
        assert!(!json.contains("accuracy_m"));
    }
}
