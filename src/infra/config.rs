//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::{Contact, VoiceSettings, Zone};
use crate::error::{EngineError, EngineResult};
use anyhow::Context;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { id: default_device_id() }
    }
}

fn default_device_id() -> String {
    "sentinel".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplerToml {
    #[serde(default = "default_true")]
    pub high_accuracy: bool,
    /// Per-fix timeout
    #[serde(default = "default_sample_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum age of a cached fix that `sample()` may return (0 = always fresh)
    #[serde(default)]
    pub max_sample_age_ms: u64,
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    #[serde(default = "default_permission_check_interval_ms")]
    pub permission_check_interval_ms: u64,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

impl Default for SamplerToml {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout_ms: default_sample_timeout_ms(),
            max_sample_age_ms: 0,
            stale_threshold_ms: default_stale_threshold_ms(),
            permission_check_interval_ms: default_permission_check_interval_ms(),
            history_len: default_history_len(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sample_timeout_ms() -> u64 {
    10_000
}

fn default_stale_threshold_ms() -> u64 {
    30_000
}

fn default_permission_check_interval_ms() -> u64 {
    30_000
}

fn default_history_len() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManualToml {
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
}

impl Default for ManualToml {
    fn default() -> Self {
        Self { hold_ms: default_hold_ms() }
    }
}

fn default_hold_ms() -> u64 {
    1500
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleToml {
    #[serde(default = "default_position_timeout_ms")]
    pub position_timeout_ms: u64,
    #[serde(default = "default_delivery_delay_ms")]
    pub delivery_delay_ms: u64,
    #[serde(default = "default_ack_delay_ms")]
    pub ack_delay_ms: u64,
    /// When false, only the dispatch collaborator moves alerts to `delivered`
    #[serde(default = "default_true")]
    pub simulate_delivery: bool,
    /// Suppress identical triggers within this window (0 = disabled)
    #[serde(default)]
    pub dedup_window_ms: u64,
}

impl Default for LifecycleToml {
    fn default() -> Self {
        Self {
            position_timeout_ms: default_position_timeout_ms(),
            delivery_delay_ms: default_delivery_delay_ms(),
            ack_delay_ms: default_ack_delay_ms(),
            simulate_delivery: true,
            dedup_window_ms: 0,
        }
    }
}

fn default_position_timeout_ms() -> u64 {
    5000
}

fn default_delivery_delay_ms() -> u64 {
    1000
}

fn default_ack_delay_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreToml {
    /// JSON file for persisted state; in-memory when absent
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct JournalToml {
    /// JSONL file receiving every alert snapshot; disabled when absent
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsToml {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsToml {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressToml {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Topic for alert snapshots (QoS 1)
    #[serde(default = "default_alerts_topic")]
    pub alerts_topic: String,
    /// Topic for zone transitions (QoS 0)
    #[serde(default = "default_zones_topic")]
    pub zones_topic: String,
    /// Topic for periodic metrics snapshots (QoS 0)
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
}

impl Default for MqttEgressToml {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            alerts_topic: default_alerts_topic(),
            zones_topic: default_zones_topic(),
            metrics_topic: default_metrics_topic(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_alerts_topic() -> String {
    "sentinel/alerts".to_string()
}

fn default_zones_topic() -> String {
    "sentinel/zones".to_string()
}

fn default_metrics_topic() -> String {
    "sentinel/metrics".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayToml {
    /// JSONL file of position fixes fed to the replay position source
    #[serde(default)]
    pub positions_file: Option<String>,
    #[serde(default = "default_replay_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ReplayToml {
    fn default() -> Self {
        Self { positions_file: None, interval_ms: default_replay_interval_ms() }
    }
}

fn default_replay_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub sampler: SamplerToml,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub voice: Option<VoiceSettings>,
    #[serde(default)]
    pub manual: ManualToml,
    #[serde(default)]
    pub lifecycle: LifecycleToml,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub store: StoreToml,
    #[serde(default)]
    pub journal: JournalToml,
    #[serde(default)]
    pub metrics: MetricsToml,
    #[serde(default)]
    pub mqtt_egress: MqttEgressToml,
    #[serde(default)]
    pub replay: ReplayToml,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    device_id: String,
    high_accuracy: bool,
    sample_timeout_ms: u64,
    max_sample_age_ms: u64,
    stale_threshold_ms: u64,
    permission_check_interval_ms: u64,
    history_len: usize,
    zones: Vec<Zone>,
    voice: VoiceSettings,
    hold_ms: u64,
    position_timeout_ms: u64,
    delivery_delay_ms: u64,
    ack_delay_ms: u64,
    simulate_delivery: bool,
    dedup_window_ms: u64,
    contacts: Vec<Contact>,
    store_path: Option<String>,
    journal_file: Option<String>,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
    // MQTT egress
    mqtt_egress_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_alerts_topic: String,
    mqtt_zones_topic: String,
    mqtt_metrics_topic: String,
    // Replay source
    replay_positions_file: Option<String>,
    replay_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            device_id: toml_config.device.id,
            high_accuracy: toml_config.sampler.high_accuracy,
            sample_timeout_ms: toml_config.sampler.timeout_ms,
            max_sample_age_ms: toml_config.sampler.max_sample_age_ms,
            stale_threshold_ms: toml_config.sampler.stale_threshold_ms,
            permission_check_interval_ms: toml_config.sampler.permission_check_interval_ms,
            history_len: toml_config.sampler.history_len,
            zones: toml_config.zones,
            voice: toml_config.voice.unwrap_or_default(),
            hold_ms: toml_config.manual.hold_ms,
            position_timeout_ms: toml_config.lifecycle.position_timeout_ms,
            delivery_delay_ms: toml_config.lifecycle.delivery_delay_ms,
            ack_delay_ms: toml_config.lifecycle.ack_delay_ms,
            simulate_delivery: toml_config.lifecycle.simulate_delivery,
            dedup_window_ms: toml_config.lifecycle.dedup_window_ms,
            contacts: toml_config.contacts,
            store_path: toml_config.store.path,
            journal_file: toml_config.journal.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_host: toml_config.mqtt_egress.host,
            mqtt_port: toml_config.mqtt_egress.port,
            mqtt_username: toml_config.mqtt_egress.username,
            mqtt_password: toml_config.mqtt_egress.password,
            mqtt_alerts_topic: toml_config.mqtt_egress.alerts_topic,
            mqtt_zones_topic: toml_config.mqtt_egress.zones_topic,
            mqtt_metrics_topic: toml_config.mqtt_egress.metrics_topic,
            replay_positions_file: toml_config.replay.positions_file,
            replay_interval_ms: toml_config.replay.interval_ms,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        // Check CONFIG_FILE environment variable
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        let mut seen = FxHashSet::default();
        for zone in &self.zones {
            zone.validate()?;
            if !seen.insert(zone.id.clone()) {
                return Err(EngineError::invalid_config(format!("duplicate zone id {}", zone.id)));
            }
        }
        self.voice.validate()?;
        if self.hold_ms == 0 {
            return Err(EngineError::invalid_config("manual hold_ms must be positive"));
        }
        if self.sample_timeout_ms == 0 || self.position_timeout_ms == 0 {
            return Err(EngineError::invalid_config("sampler and position timeouts must be positive"));
        }
        if self.permission_check_interval_ms == 0 {
            return Err(EngineError::invalid_config("permission_check_interval_ms must be positive"));
        }
        Ok(())
    }

    // Getters for all config fields
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn high_accuracy(&self) -> bool {
        self.high_accuracy
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn max_sample_age(&self) -> Duration {
        Duration::from_millis(self.max_sample_age_ms)
    }

    pub fn stale_threshold_ms(&self) -> u64 {
        self.stale_threshold_ms
    }

    pub fn permission_check_interval(&self) -> Duration {
        Duration::from_millis(self.permission_check_interval_ms)
    }

    pub fn history_len(&self) -> usize {
        self.history_len
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn voice_settings(&self) -> &VoiceSettings {
        &self.voice
    }

    pub fn hold_duration(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    pub fn position_timeout(&self) -> Duration {
        Duration::from_millis(self.position_timeout_ms)
    }

    pub fn delivery_delay(&self) -> Duration {
        Duration::from_millis(self.delivery_delay_ms)
    }

    pub fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms)
    }

    pub fn simulate_delivery(&self) -> bool {
        self.simulate_delivery
    }

    pub fn dedup_window(&self) -> Option<Duration> {
        (self.dedup_window_ms > 0).then(|| Duration::from_millis(self.dedup_window_ms))
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn store_path(&self) -> Option<&str> {
        self.store_path.as_deref()
    }

    pub fn journal_file(&self) -> Option<&str> {
        self.journal_file.as_deref()
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_alerts_topic(&self) -> &str {
        &self.mqtt_alerts_topic
    }

    pub fn mqtt_zones_topic(&self) -> &str {
        &self.mqtt_zones_topic
    }

    pub fn mqtt_metrics_topic(&self) -> &str {
        &self.mqtt_metrics_topic
    }

    pub fn replay_positions_file(&self) -> Option<&str> {
        self.replay_positions_file.as_deref()
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }

    /// Builder for tests and embedders
    pub fn with_zones(mut self, zones: Vec<Zone>) -> Self {
        self.zones = zones;
        self
    }

    pub fn with_voice_settings(mut self, voice: VoiceSettings) -> Self {
        self.voice = voice;
        self
    }

    pub fn with_contacts(mut self, contacts: Vec<Contact>) -> Self {
        self.contacts = contacts;
        self
    }

    pub fn with_lifecycle_delays(mut self, delivery_ms: u64, ack_ms: u64) -> Self {
        self.delivery_delay_ms = delivery_ms;
        self.ack_delay_ms = ack_ms;
        self
    }

    pub fn with_simulate_delivery(mut self, simulate: bool) -> Self {
        self.simulate_delivery = simulate;
        self
    }

    pub fn with_dedup_window_ms(mut self, ms: u64) -> Self {
        self.dedup_window_ms = ms;
        self
    }
}
