//! IO modules - external system interfaces
//!
//! - `sources` - position, transcript and permission contracts
//! - `replay` - file and caller driven implementations of those contracts
//! - `dispatch` - contact dispatch and delivery reports
//! - `console` - operator command parsing
//! - `egress` - alert journal (JSONL)
//! - `egress_channel` - typed channel for MQTT egress messages
//! - `mqtt_egress` - MQTT publisher for egress events
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod console;
pub mod dispatch;
pub mod egress;
pub mod egress_channel;
pub mod mqtt_egress;
pub mod prometheus;
pub mod replay;
pub mod sources;

pub use console::ConsoleCommand;
pub use dispatch::{ContactDispatcher, DeliveryReport, DeliveryReporter, LogDispatcher};
pub use egress::AlertJournal;
pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender};
pub use mqtt_egress::MqttPublisher;
pub use replay::{ReplaySource, ScriptedSource, ScriptedTranscripts, StaticPermissions};
pub use sources::{
    Capability, PermissionOracle, PermissionState, PositionSource, RawFix, RecognitionEvent,
    SampleOptions, TranscriptSegment, TranscriptSource,
};
