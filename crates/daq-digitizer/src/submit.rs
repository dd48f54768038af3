//! Submitting one channel's burst data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use daq_pool::{ArrayCompletion, ChannelArray, PooledBuffer, SampleFormat, SubmitOutcome};
use tracing::{error, trace};

use crate::port::PortHandle;

/// What happened to a submitted buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Nothing was allocated (e.g. the allocation failed).
    NoBuffer,
    /// Data was not allowed (disarming or disarmed); the buffer was released.
    Discarded,
    Accepted,
    /// The completion hook vetoed delivery.
    Vetoed,
}

/// Allocate, fill and submit channel data from the acquisition thread or a
/// driver thread.
///
/// Holds at most one buffer. Dropping the handle releases it.
///
/// ```text
/// Empty ── allocate ──▶ Allocated ── submit / release ──▶ Empty
/// ```
#[derive(Debug)]
pub struct DataSubmission {
    port: PortHandle,
    buffer: Option<PooledBuffer>,
}

impl DataSubmission {
    /// An empty handle for `port`.
    pub fn new(port: &PortHandle) -> Self {
        Self {
            port: port.clone(),
            buffer: None,
        }
    }

    /// Allocate a buffer of `num_samples` samples for `channel`.
    ///
    /// Returns false, leaving the handle empty, if the buffer pool is
    /// exhausted.
    ///
    /// # Panics
    ///
    /// Panics if a buffer is already allocated or `channel` is out of range.
    pub fn allocate(&mut self, channel: usize, format: SampleFormat, num_samples: usize) -> bool {
        assert!(self.buffer.is_none(), "buffer already allocated");

        self.buffer = self.port.channels().allocate(channel, format, num_samples);
        if self.buffer.is_none() {
            error!(channel, num_samples, "Failed to allocate channel buffer");
        }
        self.buffer.is_some()
    }

    /// Whether a buffer is held.
    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    /// The allocated buffer, for filling in samples.
    pub fn buffer_mut(&mut self) -> Option<&mut PooledBuffer> {
        self.buffer.as_mut()
    }

    /// Return the buffer to the pool without submitting it.
    pub fn release(&mut self) {
        self.buffer = None;
    }

    /// Submit the allocated buffer as `channel`'s data.
    ///
    /// The buffer is released without reaching consumers unless data is
    /// currently allowed. `completion` runs with the channel slots locked and
    /// may veto delivery. Must be called with the port unlocked.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is out of range, whether or not data is allowed.
    pub fn submit(
        &mut self,
        channel: usize,
        sequence_id: i32,
        timestamp: f64,
        wall_time: DateTime<Utc>,
        completion: Option<&mut dyn ArrayCompletion>,
    ) -> SubmitStatus {
        assert!(
            channel < self.port.num_channels(),
            "channel {} out of range ({} channels)",
            channel,
            self.port.num_channels()
        );

        let Some(buffer) = self.buffer.take() else {
            return SubmitStatus::NoBuffer;
        };

        let (allowing_data, sample_rate) = {
            let port = self.port.lock();
            (port.state.allowing_data, port.state.rate_for_display)
        };
        if !allowing_data {
            trace!(channel, sequence_id, "Discarding data, not allowed");
            return SubmitStatus::Discarded;
        }

        let format = buffer.format();
        let array = ChannelArray {
            channel,
            sequence_id,
            timestamp,
            wall_time,
            format,
            data: buffer.freeze(),
            attributes: BTreeMap::new(),
        };

        match self.port.channels().submit_array(array, sample_rate, completion) {
            SubmitOutcome::Accepted => SubmitStatus::Accepted,
            SubmitOutcome::Vetoed => SubmitStatus::Vetoed,
        }
    }
}
