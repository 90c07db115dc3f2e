//! Services - engine state and behavior
//!
//! - `sampler` - position sampling and continuous tracking
//! - `geofence` - zone membership and entry/exit edges
//! - `triggers` - manual, voice and geofence input adapters
//! - `lifecycle` - alert creation and status progression
//! - `hub` - alert fan-out to observers
//! - `engine` - facade wiring the above together

pub mod engine;
pub mod geofence;
pub mod hub;
pub mod lifecycle;
pub mod sampler;
pub mod triggers;

pub use engine::{EmergencyEngine, Platform};
pub use geofence::{GeofenceEvaluator, ZoneEvent, ZoneMembership};
pub use hub::{AlertObserver, NotificationHub, Subscription};
pub use lifecycle::{AlertEngine, LifecycleTimings, PositionProvider};
pub use sampler::{GeoSampler, TrackingStatus};
