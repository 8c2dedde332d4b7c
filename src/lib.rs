//! # avlgate - Teltonika AVL gateway
//!
//! avlgate sits between a fleet of Teltonika FMB-family GPS trackers and an
//! event bus. Devices open long-lived TCP sessions, identify once with their
//! IMEI, and stream Codec 8 / 8 Extended telemetry batches; operators push
//! Codec 12 text commands the other way and get the device's reply back.
//!
//! ## Features
//!
//! - **Binary codecs**: Codec 8, Codec 8 Extended, and Codec 12 framing with
//!   CRC-16/IBM checking (mismatches are logged, not fatal - field units get
//!   this wrong).
//! - **Admission control**: per-source rate windows with soft-bans, device
//!   caps per source, and optional IMEI / source allow-lists, all mutable at
//!   runtime.
//! - **Command multiplexing**: `send(imei, text, timeout)` with strict FIFO
//!   response pairing and a bounded in-flight window (the protocol carries
//!   no correlation ids).
//! - **Event sink seam**: one observer trait carries every parsed record,
//!   command response, and session lifecycle change; bus publishers and
//!   webhooks live entirely outside the core.
//! - **Async design**: built on Tokio; thousands of device sockets multiplex
//!   onto a small worker pool.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use avlgate::config::Config;
//! use avlgate::gateway::{GatewayServer, LogSink};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("avlgate.toml").await?;
//!     let mut server = GatewayServer::new(config, Arc::new(LogSink));
//!     server.bind().await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module organization
//!
//! - [`codec`] - pure wire-format encoders and decoders
//! - [`gateway`] - listener, sessions, registry, admission, dispatch, events
//! - [`imei`] - IMEI syntax, Luhn, and allow-list validation
//! - [`config`] - TOML configuration with runtime-safe defaults
//! - [`metrics`] - process-wide counters
//! - [`logutil`] - log sanitation for device-supplied bytes

pub mod codec;
pub mod config;
pub mod gateway;
pub mod imei;
pub mod logutil;
pub mod metrics;
