//! Core data-plane engine for a device plugin runtime.
//!
//! A plugin process hosts user-supplied per-device handler code and exposes
//! a uniform request/response interface for reading, writing, and listening
//! to devices. This crate is the data-plane engine underneath that surface:
//! the scheduler, the state/reading manager, the write transaction tracker,
//! and the in-memory reading cache that together coordinate concurrent I/O
//! with backpressure, rate limiting, and at-most-once write semantics.
//!
//! Configuration loading, YAML parsing, device/handler registration
//! validation, RPC server glue, and the per-device callbacks themselves are
//! out of scope — this crate consumes an already-populated
//! [`device::DeviceRegistry`] and [`config::PluginSettings`], and hands back
//! a [`dataplane::DataPlane`] façade.
//!
//! Every stateful component is generic over [`runtime::Runtime`] so the
//! engine can run against a real executor in production or a deterministic
//! virtual clock under test.

pub mod config;
pub mod dataplane;
pub mod device;
pub mod error;
pub mod health;
pub mod metrics;
pub mod read_stream;
pub mod reading;
pub mod readings_cache;
pub mod runtime;
pub mod scheduler;
pub mod state_manager;
pub mod time;
pub mod transaction;
pub mod transactions_cache;

pub use dataplane::DataPlane;
pub use error::{DataPlaneError, Result};
