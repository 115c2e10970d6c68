//! Prometheus metrics for the relay bus

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

use crate::Result;

lazy_static! {
    /// Events consumed from the entity runtime
    pub static ref EVENTS_ROUTED: IntCounterVec = register_int_counter_vec!(
        "relay_bus_events_routed_total",
        "Published events routed by the dispatcher",
        &["event"]
    )
    .unwrap();

    /// Command deliveries by target kind and result
    pub static ref DELIVERIES: IntCounterVec = register_int_counter_vec!(
        "relay_bus_deliveries_total",
        "Relayed command deliveries",
        &["target", "status"]
    )
    .unwrap();

    /// Delivery retries by target kind
    pub static ref DELIVERY_RETRIES: IntCounterVec = register_int_counter_vec!(
        "relay_bus_delivery_retries_total",
        "Relayed command delivery retries",
        &["target"]
    )
    .unwrap();

    /// Delivery latency including retries
    pub static ref DELIVERY_DURATION: HistogramVec = register_histogram_vec!(
        "relay_bus_delivery_duration_seconds",
        "Relayed command delivery duration in seconds",
        &["target"]
    )
    .unwrap();

    /// Dead letters by failure reason
    pub static ref DEAD_LETTERS: IntCounterVec = register_int_counter_vec!(
        "relay_bus_dead_letters_total",
        "Commands moved to the dead letter queue",
        &["reason"]
    )
    .unwrap();

    /// Delivery lanes started
    pub static ref LANES_OPENED: IntCounter = register_int_counter!(
        "relay_bus_lanes_opened_total",
        "Per-entity delivery lanes started"
    )
    .unwrap();

    /// Journaled events replayed on start because their cascade never settled
    pub static ref EVENTS_REPLAYED: IntCounter = register_int_counter!(
        "relay_bus_events_replayed_total",
        "Unrelayed events republished on start"
    )
    .unwrap();

    /// Events and deliveries not yet settled
    pub static ref BACKLOG: IntGauge = register_int_gauge!(
        "relay_bus_backlog",
        "Events and deliveries in flight"
    )
    .unwrap();
}

/// Every metric in the default registry, in the Prometheus text format
pub fn export() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
