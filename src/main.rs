//! Sentinel engine - personal emergency response runtime
//!
//! Runs the engine against file-replayed positions and a stdin operator
//! console standing in for the UI and the speech recognizer.
//!
//! Module structure:
//! - `domain/` - Core types (Position, Zone, Trigger, Alert)
//! - `io/` - Platform contracts, replay sources, egress, HTTP endpoint
//! - `services/` - Sampler, geofence, trigger adapters, alert lifecycle, hub
//! - `infra/` - Config, metrics, persisted state

use clap::Parser;
use sentinel_engine::domain::alert::{Alert, AlertId};
use sentinel_engine::infra::{Config, FileStore, KvStore, MemoryStore, Metrics};
use sentinel_engine::io::console::HELP;
use sentinel_engine::io::{
    create_egress_channel, AlertJournal, ConsoleCommand, DeliveryReport, MqttPublisher,
    PositionSource, ReplaySource, ScriptedSource, ScriptedTranscripts, StaticPermissions,
    TranscriptSegment,
};
use sentinel_engine::services::{EmergencyEngine, Platform};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Sentinel - personal safety engine with manual, voice and geofence triggers
#[derive(Parser, Debug)]
#[command(name = "sentinel-engine", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// JSONL position fixes to replay, overriding [replay].positions_file
    #[arg(long)]
    replay: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "sentinel_starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        device = %config.device_id(),
        zones = %config.zones().len(),
        contacts = %config.contacts().len(),
        hold_ms = %config.hold_duration().as_millis(),
        delivery_delay_ms = %config.delivery_delay().as_millis(),
        ack_delay_ms = %config.ack_delay().as_millis(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let store: Arc<dyn KvStore> = match config.store_path() {
        Some(path) => Arc::new(FileStore::open(path)),
        None => Arc::new(MemoryStore::new()),
    };

    let replay_path = args.replay.as_deref().or(config.replay_positions_file());
    let positions: Arc<dyn PositionSource> = match replay_path {
        Some(path) => match ReplaySource::from_file(path, config.replay_interval()) {
            Ok(source) => Arc::new(source),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "replay_unavailable");
                Arc::new(ScriptedSource::new())
            }
        },
        None => {
            warn!("no_position_source_configured");
            Arc::new(ScriptedSource::new())
        }
    };
    let transcripts = Arc::new(ScriptedTranscripts::new());
    let permissions = Arc::new(StaticPermissions::granted());

    let platform = Platform::new(positions, transcripts.clone(), permissions, store);
    let engine = EmergencyEngine::start(&config, platform, metrics.clone())?;

    let _status_log = engine.subscribe(|alert: &Alert| {
        info!(
            alert_id = %alert.id,
            status = %alert.status,
            trigger = %alert.trigger.kind,
            detail = ?alert.trigger.detail,
            located = %alert.position.is_some(),
            "alert_status"
        );
    });

    let _journal = config
        .journal_file()
        .map(|path| engine.subscribe(AlertJournal::new(path, config.device_id())));

    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_engine = engine.clone();
        let prom_shutdown = shutdown_rx.clone();
        let device = config.device_id().to_string();
        tokio::spawn(async move {
            if let Err(e) = sentinel_engine::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                device,
                prom_engine,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    let egress_sender = if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) =
            create_egress_channel(1000, config.device_id().to_string(), metrics.clone());

        let publisher = MqttPublisher::new(&config, egress_rx);
        tokio::spawn(publisher.run(shutdown_rx.clone()));

        let alert_egress = egress_sender.clone();
        let _ = engine.subscribe(move |alert: &Alert| {
            alert_egress.send_alert(alert);
        });

        let zone_egress = egress_sender.clone();
        let mut zone_events = engine.subscribe_zone_events();
        tokio::spawn(async move {
            loop {
                match zone_events.recv().await {
                    Ok(event) => {
                        zone_egress.send_zone_event(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = %n, "zone_egress_lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Some(egress_sender)
    } else {
        None
    };

    // Periodic metrics: log, and publish when egress is on
    let report_engine = engine.clone();
    let report_metrics = metrics.clone();
    let metrics_interval = Duration::from_secs(config.metrics_interval_secs().max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(metrics_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            let summary =
                report_metrics.report(report_engine.membership().len(), report_engine.is_tracking());
            summary.log();
            if let Some(ref egress) = egress_sender {
                egress.send_metrics(&summary);
            }
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("console_closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "console_read_failed");
                        break;
                    }
                };
                match ConsoleCommand::parse(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => apply(&engine, &transcripts, command).await,
                    Ok(None) => {}
                    Err(msg) => println!("{}", msg),
                }
            }
        }
    }

    engine.shutdown().await;
    let _ = shutdown_tx.send(true);
    info!("sentinel shutdown complete");
    Ok(())
}

async fn apply(engine: &Arc<EmergencyEngine>, transcripts: &ScriptedTranscripts, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Press => {
            engine.press();
        }
        ConsoleCommand::Release => {
            if !engine.release() {
                println!("released, no alert");
            }
        }
        ConsoleCommand::Hold(duration) => {
            if engine.press() {
                let engine = engine.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    engine.release();
                });
            }
        }
        ConsoleCommand::Say(text) => {
            if !transcripts.say(TranscriptSegment::interim(&text)) {
                println!("not listening");
            }
        }
        ConsoleCommand::Final(text) => {
            if !transcripts.say(TranscriptSegment::final_(&text)) {
                println!("not listening");
            }
        }
        ConsoleCommand::Ack(id) => {
            if !engine.acknowledge(&AlertId(id)) {
                println!("no active alert with that id");
            }
        }
        ConsoleCommand::Delivered(id) => {
            if !engine.report_delivery(&AlertId(id), DeliveryReport::Delivered) {
                println!("no active alert with that id");
            }
        }
        ConsoleCommand::Tracking(true) => {
            if let Err(e) = engine.start_tracking().await {
                println!("{}", e.user_message());
            }
        }
        ConsoleCommand::Tracking(false) => {
            engine.stop_tracking();
        }
        ConsoleCommand::Listening(true) => {
            if let Err(e) = engine.start_listening().await {
                println!("{}", e.user_message());
            }
        }
        ConsoleCommand::Listening(false) => engine.stop_listening().await,
        ConsoleCommand::Locate => match engine.locate().await {
            Ok(p) => println!("{:.6}, {:.6} (accuracy {:?} m)", p.latitude, p.longitude, p.accuracy_m),
            Err(e) => println!("{}", e.user_message()),
        },
        ConsoleCommand::Alerts => {
            for alert in engine.alerts() {
                println!(
                    "{} {} {} {}",
                    alert.id,
                    alert.status,
                    alert.trigger.kind,
                    alert.trigger.detail.as_deref().unwrap_or("-")
                );
            }
        }
        ConsoleCommand::Zones => {
            let membership = engine.membership();
            for zone in engine.zones() {
                let inside = if membership.contains(&zone.id) { "inside" } else { "outside" };
                println!("{} {} {} {:.0} m {}", zone.id, zone.name, zone.kind.as_str(), zone.radius_m, inside);
            }
        }
        ConsoleCommand::Status => {
            let voice = engine.voice_status();
            println!(
                "tracking={} listening={} holding={} active_alerts={} last_phrase={}",
                engine.is_tracking(),
                voice.listening,
                engine.is_holding(),
                engine.active_alerts(),
                voice.last_detected_phrase.as_deref().unwrap_or("-")
            );
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
}
