// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {
    Count,
    Seconds,
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $(let _ = &$label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $(let _ = &$label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $(let _ = &$label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {{
        let _ = $unit;
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {{
        let _ = $unit;
    }};
}

use std::time::Duration;

/// Registers metric descriptions. Call once at startup.
pub fn describe_metrics() {
    describe_gauge!("oracle_up", "Oracle process liveness (1=up).");
    describe_counter!("oracle_ticks_total", Unit::Count, "Control loop ticks started.");
    describe_histogram!("oracle_tick_seconds", Unit::Seconds, "Wall time of a full tick.");
    describe_counter!(
        "oracle_step_failures_total",
        Unit::Count,
        "Tick steps that failed and were skipped, labeled by step and error kind."
    );
    describe_counter!(
        "oracle_parameter_updates_total",
        Unit::Count,
        "Confirmed on-chain parameter updates, labeled by parameter."
    );
    describe_counter!(
        "oracle_parameter_skips_total",
        Unit::Count,
        "Parameter decisions that resulted in no write, labeled by parameter and reason."
    );
    describe_gauge!("oracle_parameter_value", "Last observed on-chain value per parameter.");
    describe_gauge!("oracle_parameter_target", "Last computed target per parameter.");
    describe_gauge!("oracle_counter_cumulative", "Cumulative counter value in whole tokens.");
    describe_gauge!("oracle_price_usd", "Last known-good USD price per pair.");
    describe_counter!("oracle_snapshot_commits_total", Unit::Count, "Snapshot commits, labeled by side and result.");
    describe_counter!("oracle_rpc_calls_total", Unit::Count, "RPC calls, labeled by call and result.");
    describe_histogram!("oracle_rpc_call_seconds", Unit::Seconds, "RPC call latency, labeled by call.");
}

pub fn set_up() {
    gauge!("oracle_up", 1.0);
}

pub fn increment_tick() {
    counter!("oracle_ticks_total", 1);
}

pub fn record_tick_duration(duration: Duration) {
    histogram!("oracle_tick_seconds", duration.as_secs_f64());
}

pub fn increment_step_failure(step: &'static str, kind: &'static str) {
    counter!("oracle_step_failures_total", 1, "step" => step, "kind" => kind);
}

pub fn increment_parameter_update(parameter: &'static str) {
    counter!("oracle_parameter_updates_total", 1, "parameter" => parameter);
}

pub fn increment_parameter_skip(parameter: &'static str, reason: &'static str) {
    counter!("oracle_parameter_skips_total", 1, "parameter" => parameter, "reason" => reason);
}

pub fn set_parameter_value(parameter: &'static str, value: f64) {
    gauge!("oracle_parameter_value", value, "parameter" => parameter);
}

pub fn set_parameter_target(parameter: &'static str, value: f64) {
    gauge!("oracle_parameter_target", value, "parameter" => parameter);
}

pub fn set_counter_cumulative(counter_name: &'static str, value: f64) {
    gauge!("oracle_counter_cumulative", value, "counter" => counter_name);
}

pub fn set_price(pair: &'static str, value: f64) {
    gauge!("oracle_price_usd", value, "pair" => pair);
}

pub fn increment_snapshot_commit(side: &'static str, result: &'static str) {
    counter!("oracle_snapshot_commits_total", 1, "side" => side, "result" => result);
}

pub fn record_rpc_call(call: &'static str, success: bool, duration: Duration) {
    let result = if success { "ok" } else { "error" };
    counter!("oracle_rpc_calls_total", 1, "call" => call, "result" => result);
    histogram!("oracle_rpc_call_seconds", duration.as_secs_f64(), "call" => call);
}
