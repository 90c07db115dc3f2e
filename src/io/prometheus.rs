//! Prometheus metrics HTTP endpoint
//!
//! Exposes engine metrics in Prometheus text format at /metrics, plus
//! /health, the alert list at /alerts and an acknowledgment endpoint.
//! Uses hyper for the HTTP server.

use crate::domain::alert::AlertStatus;
use crate::domain::types::TriggerKind;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Live engine state the HTTP endpoint reports on
pub trait EngineStatus: Send + Sync {
    fn zones_occupied(&self) -> usize;
    fn tracking_active(&self) -> bool;
    /// JSON array of alert snapshots
    fn alerts_json(&self) -> String;
    /// Contact acknowledgment arriving over HTTP
    fn acknowledge(&self, alert_id: &str) -> bool;
}

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    device: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{device=\"{device}\"}} {val}");
}

/// One metric family with a single extra label
fn write_labeled<'a>(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    device: &str,
    label: &str,
    values: impl Iterator<Item = (&'a str, u64)>,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{device=\"{device}\",{label}=\"{value}\"}} {count}");
    }
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    device: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{device=\"{device}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{device=\"{device}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{device=\"{device}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{device=\"{device}\"}} {count}");
}

fn format_prometheus_metrics(
    metrics: &Metrics,
    zones_occupied: usize,
    tracking_active: bool,
    device: &str,
) -> String {
    let summary = metrics.report(zones_occupied, tracking_active);
    let mut output = String::with_capacity(4096);

    write_position_metrics(&mut output, device, &summary);
    write_zone_metrics(&mut output, device, &summary);
    write_alert_metrics(&mut output, device, &summary);
    write_metric(
        &mut output,
        "sentinel_egress_dropped_total",
        "Egress messages dropped on a full channel",
        MetricType::Counter,
        device,
        summary.egress_dropped,
    );

    output
}

fn write_position_metrics(output: &mut String, device: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "sentinel_samples_total",
        "Position samples accepted",
        MetricType::Counter,
        device,
        summary.samples_total,
    );
    write_metric(
        output,
        "sentinel_stale_samples_total",
        "Samples older than the staleness threshold on arrival",
        MetricType::Counter,
        device,
        summary.stale_samples_total,
    );
    write_metric(
        output,
        "sentinel_position_errors_total",
        "Position source errors",
        MetricType::Counter,
        device,
        summary.position_errors_total,
    );
    write_metric(
        output,
        "sentinel_positions_dropped_total",
        "Positions not forwarded to the geofence evaluator",
        MetricType::Counter,
        device,
        summary.positions_dropped,
    );
    write_metric(
        output,
        "sentinel_tracking_active",
        "Continuous tracking state (0=off, 1=on)",
        MetricType::Gauge,
        device,
        summary.tracking_active as u64,
    );
    let _ = writeln!(output, "# HELP sentinel_samples_per_min Samples accepted per minute");
    let _ = writeln!(output, "# TYPE sentinel_samples_per_min gauge");
    let _ = writeln!(
        output,
        "sentinel_samples_per_min{{device=\"{device}\"}} {:.2}",
        summary.samples_per_min
    );
}

fn write_zone_metrics(output: &mut String, device: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "sentinel_zone_entries_total",
        "Zone entries",
        MetricType::Counter,
        device,
        summary.zone_entries_total,
    );
    write_metric(
        output,
        "sentinel_zone_exits_total",
        "Zone exits",
        MetricType::Counter,
        device,
        summary.zone_exits_total,
    );
    write_metric(
        output,
        "sentinel_danger_entries_total",
        "Danger zone entries",
        MetricType::Counter,
        device,
        summary.danger_entries_total,
    );
    write_metric(
        output,
        "sentinel_zones_occupied",
        "Zones containing the last evaluated position",
        MetricType::Gauge,
        device,
        summary.zones_occupied as u64,
    );
}

fn write_alert_metrics(output: &mut String, device: &str, summary: &MetricsSummary) {
    write_labeled(
        output,
        "sentinel_triggers_total",
        "Triggers fired by input channel",
        MetricType::Counter,
        device,
        "kind",
        TriggerKind::ALL.iter().map(|k| (k.as_str(), summary.triggers_total[k.index()])),
    );
    write_metric(
        output,
        "sentinel_triggers_suppressed_total",
        "Triggers suppressed as duplicates",
        MetricType::Counter,
        device,
        summary.triggers_suppressed,
    );
    write_labeled(
        output,
        "sentinel_alerts_total",
        "Alerts reaching each status",
        MetricType::Counter,
        device,
        "status",
        AlertStatus::ALL.iter().map(|s| (s.as_str(), summary.alerts_by_status[s.index()])),
    );
    write_metric(
        output,
        "sentinel_alerts_in_flight",
        "Alerts not yet acknowledged",
        MetricType::Gauge,
        device,
        summary.alerts_in_flight,
    );
    write_metric(
        output,
        "sentinel_alerts_without_position_total",
        "Alerts sent with no position",
        MetricType::Counter,
        device,
        summary.alerts_without_position,
    );
    write_histogram(
        output,
        "sentinel_position_resolve_ms",
        "Alert position resolution latency in milliseconds",
        device,
        &summary.resolve_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.resolve_avg_ms,
    );
    write_metric(
        output,
        "sentinel_position_resolve_p99_ms",
        "99th percentile position resolution latency",
        MetricType::Gauge,
        device,
        summary.resolve_p99_ms,
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// `/alerts/{id}/ack` -> `{id}`
fn ack_target(path: &str) -> Option<&str> {
    path.strip_prefix("/alerts/")?.strip_suffix("/ack").filter(|id| !id.is_empty() && !id.contains('/'))
}

async fn handle_request<S: EngineStatus>(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    device_id: Arc<String>,
    status: Arc<S>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let response = match (req.method(), path) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(
                &metrics,
                status.zones_occupied(),
                status.tracking_active(),
                &device_id,
            );
            text_response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body)
        }
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".into()),
        (&Method::GET, "/alerts") => {
            text_response(StatusCode::OK, "application/json", status.alerts_json())
        }
        (&Method::POST, p) if ack_target(p).is_some() => {
            let id = ack_target(p).unwrap_or_default();
            if status.acknowledge(id) {
                info!(alert_id = %id, "http_acknowledged");
                text_response(StatusCode::OK, "application/json", r#"{"ok":true}"#.into())
            } else {
                text_response(
                    StatusCode::NOT_FOUND,
                    "application/json",
                    r#"{"ok":false,"error":"alert_not_active"}"#.into(),
                )
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".into()),
    };
    Ok(response)
}

/// Start the metrics HTTP server
pub async fn start_metrics_server<S: EngineStatus + 'static>(
    port: u16,
    metrics: Arc<Metrics>,
    device_id: String,
    status: Arc<S>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let device_id = Arc::new(device_id);

    info!(port = %port, device = %device_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let device_id = device_id.clone();
                        let status = status.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let device_id = device_id.clone();
                                let status = status.clone();
                                async move { handle_request(req, metrics, device_id, status).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
