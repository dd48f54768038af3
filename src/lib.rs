//! # burst-daq
//!
//! Burst-mode digitizer acquisition. The workspace crates carry the
//! framework; this crate wires them into an application:
//!
//! - [`config`]: layered configuration (defaults, TOML file, `BURST_DAQ_*`
//!   environment variables) via Figment
//! - [`logging`]: `tracing-subscriber` setup
//! - [`runner`]: one acquisition run against the simulated digitizer
//!
//! The framework itself lives in:
//! - `daq-core`: parameters, configuration snapshots, arm states, worker queue
//! - `daq-pool`: buffer pool and per-channel array delivery
//! - `daq-digitizer`: the acquisition controller and driver trait
//! - `daq-driver-mock`: a simulated digitizer with fault injection

pub mod config;
pub mod logging;
pub mod runner;

pub use config::AppConfig;
pub use runner::{run, RunReport};
