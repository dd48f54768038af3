//! `daq-core`
//!
//! Shared types for the burst digitizer framework.
//!
//! This crate holds the pieces every other crate in the workspace builds on:
//! the parameter table that stands in for a device's control-system port, the
//! configuration parameters that are snapshotted at arm time, the arm/burst
//! records exchanged between the acquisition controller and drivers, and a
//! small worker queue for offloading blocking work from hook contexts.
//!
//! ## Key Types
//!
//! - [`ParamTable`]: named, typed parameters with write protection and batched
//!   change notification
//! - [`ConfigParam`]: desired/effective parameter pair with a private snapshot
//! - [`ArmState`], [`ArmMode`], [`ArmInfo`], [`BurstMetaInfo`]: acquisition
//!   state and per-cycle records
//! - [`TimeAxis`]: display time values derived from the accepted settings
//! - [`WorkerQueue`]: FIFO task queue with identity-based deduplication
//! - [`DaqError`], [`DriverError`], [`ParamError`]: error types

pub mod arm;
pub mod config_param;
pub mod error;
pub mod parameter;
pub mod time_axis;
pub mod worker;

pub use arm::{next_burst_id, ArmInfo, ArmMode, ArmRequest, ArmState, BurstMetaInfo, CustomTimeAxis};
pub use config_param::{ConfigParam, ConfigValue, SnapshotPhase};
pub use error::{AppResult, DaqError, DriverError, DriverErrorKind, DriverResult, ParamError};
pub use parameter::{ParamId, ParamKind, ParamTable, ParamUpdate, ParamValue};
pub use time_axis::TimeAxis;
pub use worker::{WorkerQueue, WorkerTask};
