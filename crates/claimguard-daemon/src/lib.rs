//! claimguard-daemon library crate.
//!
//! The daemon wires the core pipeline into a served process: the HTTP API,
//! the review dispatcher, the fleet health prober, Prometheus metrics, and
//! the remote model-gateway client. The binary in `main.rs` is a thin shell
//! over [`state::AppState`] and [`api::router`].

#![warn(clippy::all)]

pub mod api;
pub mod gateway_http;
pub mod metrics;
pub mod state;
