//! telebridge: change-only telemetry bridge from MQTT or HTTP JSON sources
//! into a primary InfluxDB store and an optional secondary replica.

pub mod agent;
pub mod bridge;
pub mod config;
pub mod export;
pub mod source;
pub mod store;
