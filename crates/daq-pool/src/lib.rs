//! Sample-buffer pool and per-channel output stage for burst digitizers.
//!
//! This crate provides the data path between a digitizer's acquisition thread
//! and the consumers of its burst data:
//!
//! - [`BufferPool`]: bounded pool of sample buffers with `bytes::Bytes`
//!   integration (buffers return to the pool when the last reference drops)
//! - [`ChannelArray`]: one channel's samples for one burst plus metadata and
//!   attributes
//! - [`ChannelPool`]: per-channel last-delivered slots, delivery switches and
//!   consumer dispatch (observers and bounded sinks)
//!
//! # Ownership Model
//!
//! ```text
//! producer ── PooledBuffer (exclusive) ── freeze() ──▶ Bytes
//!                                                      ├── last-delivered slot (shared)
//!                                                      ├── observers (borrowed for the call)
//!                                                      └── sinks (shared clones)
//! ```
//!
//! A buffer is back in the pool exactly when no producer handle, slot or
//! consumer references it any more; [`BufferPool::outstanding`] makes this
//! observable in tests.
//!
//! # Example
//!
//! ```
//! use daq_pool::{BufferPool, ChannelArray, ChannelPool, SampleFormat};
//! use std::collections::BTreeMap;
//!
//! let channels = ChannelPool::new(2, BufferPool::new(16, 1 << 20), true);
//!
//! let mut buffer = channels.allocate(0, SampleFormat::I16, 1024).unwrap();
//! buffer.fill_with(|i| (i % 100) as i16);
//!
//! let array = ChannelArray {
//!     channel: 0,
//!     sequence_id: 1,
//!     timestamp: 0.0,
//!     wall_time: chrono::Utc::now(),
//!     format: SampleFormat::I16,
//!     data: buffer.freeze(),
//!     attributes: BTreeMap::new(),
//! };
//! channels.submit_array(array, 100e6, None);
//!
//! assert_eq!(channels.last_array(0).unwrap().len(), 1024);
//! ```

pub mod array;
pub mod buffer_pool;
pub mod channels;

pub use array::{AttributeValue, ChannelArray, Sample, SampleFormat, READ_SAMPLE_RATE};
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use channels::{
    ArrayCompletion, ArrayObserver, ChannelPool, ChannelPoolStats, ObserverHandle, SinkReceiver,
    SubmitOutcome,
};
