//! Metrics (ambient — expansion, §4.9). Each subsystem gets its own thin
//! submodule registering named counters/histograms through the public
//! `metrics` facade crate and exposing `log_*` wrapper functions called from
//! the hot paths, rather than scattering raw `counter!`/`histogram!` macro
//! calls through business logic.

pub mod scheduler;
pub mod state;
pub mod stream;
