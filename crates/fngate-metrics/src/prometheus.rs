//! Prometheus text exposition.

use std::fmt::Write;

use crate::collector::{LATENCY_BUCKETS, MetricsSnapshot};

/// Point-in-time gauges owned by other components, read at scrape time.
#[derive(Debug, Clone, Default)]
pub struct GatewayGauges {
    pub inflight: usize,
    /// `(name.namespace, in-flight)`.
    pub inflight_per_function: Vec<(String, usize)>,
    pub admission_rejected_total: u64,
    pub queue_depth: u64,
}

/// Render a snapshot and gauges in the Prometheus text format.
pub fn render_prometheus(snapshot: &MetricsSnapshot, gauges: &GatewayGauges) -> String {
    let mut out = String::new();

    out.push_str("# HELP gateway_function_invocation_total Function invocations by status code\n");
    out.push_str("# TYPE gateway_function_invocation_total counter\n");
    for s in &snapshot.invocations {
        let _ = writeln!(
            out,
            "gateway_function_invocation_total{{function_name=\"{}\",code=\"{}\"}} {}",
            escape(&s.function),
            s.code,
            s.count
        );
    }

    out.push_str("# HELP gateway_function_invocation_started Function invocations started\n");
    out.push_str("# TYPE gateway_function_invocation_started counter\n");
    for (function, started) in &snapshot.started {
        let _ = writeln!(
            out,
            "gateway_function_invocation_started{{function_name=\"{}\"}} {}",
            escape(function),
            started
        );
    }

    out.push_str("# HELP gateway_functions_seconds Function invocation time taken\n");
    out.push_str("# TYPE gateway_functions_seconds histogram\n");
    for s in &snapshot.invocations {
        let labels = format!("function_name=\"{}\",code=\"{}\"", escape(&s.function), s.code);
        for (bound, count) in LATENCY_BUCKETS.iter().zip(&s.cumulative) {
            let _ = writeln!(out, "gateway_functions_seconds_bucket{{{labels},le=\"{bound}\"}} {count}");
        }
        let _ = writeln!(out, "gateway_functions_seconds_bucket{{{labels},le=\"+Inf\"}} {}", s.count);
        let _ = writeln!(out, "gateway_functions_seconds_sum{{{labels}}} {}", s.sum_seconds);
        let _ = writeln!(out, "gateway_functions_seconds_count{{{labels}}} {}", s.count);
    }

    out.push_str("# HELP gateway_inflight_requests Requests admitted and not yet finished\n");
    out.push_str("# TYPE gateway_inflight_requests gauge\n");
    let _ = writeln!(out, "gateway_inflight_requests {}", gauges.inflight);
    for (function, inflight) in &gauges.inflight_per_function {
        let _ = writeln!(
            out,
            "gateway_inflight_requests{{function_name=\"{}\"}} {}",
            escape(function),
            inflight
        );
    }

    out.push_str("# HELP gateway_admission_rejected_total Requests rejected by admission control\n");
    out.push_str("# TYPE gateway_admission_rejected_total counter\n");
    let _ = writeln!(out, "gateway_admission_rejected_total {}", gauges.admission_rejected_total);

    out.push_str("# HELP gateway_queue_depth Messages waiting in the async queue\n");
    out.push_str("# TYPE gateway_queue_depth gauge\n");
    let _ = writeln!(out, "gateway_queue_depth {}", gauges.queue_depth);

    out
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
