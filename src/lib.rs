//! Edge runtime for a remote rover
//!
//! Exposes an in-process message bus over a private overlay network, bridges
//! flight-controller telemetry onto it and serves a live camera stream.

pub mod bus;
pub mod camera;
pub mod config;
pub mod mavlink;
pub mod relay;
pub mod transport;
pub mod web;

pub use config::Config;
