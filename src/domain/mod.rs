//! Domain models - core data types and geodesy
//!
//! This module contains the canonical data types used throughout the engine:
//! - `Position` - a normalized location sample
//! - `Zone` - a circular geofence with a safety classification
//! - `Trigger` - emergency intent from one input adapter
//! - `Alert` - the lifecycle object created per trigger
//! - `geo` - haversine distance and display helpers

pub mod alert;
pub mod geo;
pub mod types;

pub use alert::{epoch_ms, Alert, AlertId, AlertStatus};
pub use types::{
    Contact, LatLng, Position, Trigger, TriggerKind, VoiceSettings, Zone, ZoneId, ZoneKind,
};
