//! Prometheus metrics for the package runtime
//!
//! Counters are incremented by the runtime as packages move through their
//! lifecycle; transports that expose a `/metrics` endpoint pick them up
//! from the default registry.

use lazy_static::lazy_static;
use prometheus::{register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Gauge};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────
    // Package Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Successful package loads, by package id.
    pub static ref PACKAGE_LOADS: CounterVec = register_counter_vec!(
        "kai_package_loads_total",
        "Packages loaded into the runtime",
        &["package"]
    ).expect("failed to register PACKAGE_LOADS metric");

    /// Failed load attempts (kernel, policy, or resource errors).
    pub static ref LOAD_FAILURES: Counter = register_counter!(
        "kai_package_load_failures_total",
        "Package loads that failed and rolled back"
    ).expect("failed to register LOAD_FAILURES metric");

    /// Successful attaches, by package id.
    pub static ref PACKAGE_ATTACHES: CounterVec = register_counter_vec!(
        "kai_package_attaches_total",
        "Packages attached to kernel hooks",
        &["package"]
    ).expect("failed to register PACKAGE_ATTACHES metric");

    /// Completed unloads, by package id.
    pub static ref PACKAGE_UNLOADS: CounterVec = register_counter_vec!(
        "kai_package_unloads_total",
        "Packages unloaded from the runtime",
        &["package"]
    ).expect("failed to register PACKAGE_UNLOADS metric");

    /// Packages currently resident in the registry.
    pub static ref LOADED_PACKAGES: Gauge = register_gauge!(
        "kai_loaded_packages",
        "Number of packages currently loaded"
    ).expect("failed to register LOADED_PACKAGES metric");

    // ─────────────────────────────────────────────────────────────────────────
    // Event Streaming
    // ─────────────────────────────────────────────────────────────────────────

    /// Ring-buffer records handed to callers of stream_events.
    pub static ref EVENTS_STREAMED: Counter = register_counter!(
        "kai_events_streamed_total",
        "Ring buffer events delivered to transports"
    ).expect("failed to register EVENTS_STREAMED metric");
}
