//! Boundary contracts consumed by the engine
//!
//! Position, transcript and permission sources are platform services. The
//! engine only sees these traits; `io::replay` provides file and console
//! backed implementations for the binary and the tests.

use crate::domain::types::Position;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Options passed to the position source for each request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleOptions {
    pub high_accuracy: bool,
    /// Upper bound on how long one fix may take
    pub timeout: Duration,
    /// Oldest cached fix the source may return instead of a fresh one
    pub max_sample_age: Duration,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(10),
            max_sample_age: Duration::ZERO,
        }
    }
}

/// Fix as reported by a platform source, before normalization
///
/// Sources may report an unavailable optional field as NaN or leave it
/// out entirely; both become `None` on the normalized `Position`.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Deserialize)]
pub struct RawFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

impl RawFix {
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: u64) -> Self {
        Self { latitude, longitude, timestamp_ms, ..Self::default() }
    }

    /// Normalize into a `Position`, rejecting coordinates outside WGS84
    pub fn normalize(self) -> EngineResult<Position> {
        if !self.latitude.is_finite()
            || !self.longitude.is_finite()
            || !(-90.0..=90.0).contains(&self.latitude)
            || !(-180.0..=180.0).contains(&self.longitude)
        {
            return Err(EngineError::unavailable(format!(
                "invalid coordinates ({}, {})",
                self.latitude, self.longitude
            )));
        }
        Ok(Position {
            latitude: self.latitude,
            longitude: self.longitude,
            timestamp_ms: self.timestamp_ms,
            accuracy_m: finite(self.accuracy),
            speed: finite(self.speed),
            heading: finite(self.heading),
            altitude: finite(self.altitude),
        })
    }
}

/// Platform position service
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// One-shot fix. Implementations may ignore `opts.timeout`; the sampler
    /// enforces it.
    async fn current(&self, opts: SampleOptions) -> EngineResult<RawFix>;

    /// Continuous updates. Dropping the receiver cancels the watch.
    fn watch(&self, opts: SampleOptions) -> EngineResult<mpsc::Receiver<EngineResult<RawFix>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Geolocation,
    Microphone,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Geolocation => "geolocation",
            Capability::Microphone => "microphone",
        }
    }
}

/// Platform permission service
#[async_trait]
pub trait PermissionOracle: Send + Sync {
    async fn query(&self, capability: Capability) -> EngineResult<PermissionState>;

    /// Change notifications for one capability, if the platform offers them
    fn changes(&self, _capability: Capability) -> Option<watch::Receiver<PermissionState>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptSegment {
    pub text: String,
    pub is_final: bool,
}

impl TranscriptSegment {
    pub fn interim(text: &str) -> Self {
        Self { text: text.to_string(), is_final: false }
    }

    pub fn final_(text: &str) -> Self {
        Self { text: text.to_string(), is_final: true }
    }
}

/// Events produced by one recognition session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Update for the current utterance; a final segment closes it
    Result(TranscriptSegment),
    /// Session ended without error (silence, platform timeout, stop)
    End,
    Error(String),
}

/// Platform speech recognition service
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    /// Start one recognition session. The channel closes after `End` or `Error`.
    async fn start(&self, language: &str) -> EngineResult<mpsc::Receiver<RecognitionEvent>>;

    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_drops_nan_fields() {
        let raw = RawFix {
            accuracy: Some(12.0),
            speed: Some(f64::NAN),
            heading: None,
            altitude: Some(f64::INFINITY),
            ..RawFix::new(10.0, 20.0, 1000)
        };
        let pos = raw.normalize().unwrap();
        assert_eq!(pos.accuracy_m, Some(12.0));
        assert_eq!(pos.speed, None);
        assert_eq!(pos.heading, None);
        assert_eq!(pos.altitude, None);
    }

    #[test]
    fn test_normalize_rejects_bad_coordinates() {
        let err = RawFix::new(120.0, 0.0, 0).normalize().unwrap_err();
        assert_eq!(err.kind(), "position_unavailable");
        assert!(RawFix::new(f64::NAN, 0.0, 0).normalize().is_err());
    }

    #[test]
    fn test_raw_fix_deserialize_without_optionals() {
        let raw: RawFix =
            serde_json::from_str(r#"{"latitude":1.5,"longitude":2.5,"timestamp_ms":7}"#).unwrap();
        assert_eq!(raw, RawFix::new(1.5, 2.5, 7));
    }
}
