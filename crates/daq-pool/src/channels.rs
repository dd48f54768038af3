//! Per-channel output stage: last-delivered slots and consumers.
//!
//! [`ChannelPool`] is where finished burst data ends up. For every channel it
//! keeps the most recently delivered [`ChannelArray`] (the "last delivered"
//! slot) and two switches:
//!
//! - **callbacks enabled**: deliver submitted arrays to consumers
//! - **update arrays**: keep submitted arrays in the last-delivered slot
//!
//! # Consumers
//!
//! - [`ArrayObserver`]s are called synchronously on the submitting thread. They
//!   MUST NOT block.
//! - Sinks are bounded `tokio::sync::mpsc` channels. When a sink is full the
//!   array is dropped for that sink and counted, the producer never waits.
//!
//! # Locking
//!
//! The slot table has its own mutex. Consumers are dispatched only after it is
//! released, so an observer may call back into the pool (e.g. to read a
//! last-delivered slot) without deadlocking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::array::{AttributeValue, ChannelArray, SampleFormat, READ_SAMPLE_RATE};
use crate::buffer_pool::{BufferPool, PooledBuffer};

/// Synchronous consumer of submitted arrays.
///
/// # Performance Warning
///
/// Implementations MUST return immediately. If persistence or heavy
/// processing is needed, clone the array (cheap) into a channel and process
/// it elsewhere.
pub trait ArrayObserver: Send + Sync {
    fn on_array(&self, array: &ChannelArray);

    /// Optional: a descriptive name for logging.
    fn name(&self) -> &str {
        "unnamed_observer"
    }
}

/// Hook run on a submitted array while the slot table is locked.
///
/// Returning `false` vetoes delivery: the array is neither stored nor
/// dispatched.
pub trait ArrayCompletion {
    fn complete_array(&mut self, array: &mut ChannelArray) -> bool;
}

impl<F> ArrayCompletion for F
where
    F: FnMut(&mut ChannelArray) -> bool,
{
    fn complete_array(&mut self, array: &mut ChannelArray) -> bool {
        self(array)
    }
}

/// Handle identifying a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(pub u64);

/// Receiving side of a sink.
pub type SinkReceiver = mpsc::Receiver<ChannelArray>;

/// What happened to a submitted array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The array was accepted (stored and/or dispatched per channel settings).
    Accepted,
    /// The completion hook vetoed delivery.
    Vetoed,
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelPoolStats {
    pub arrays_accepted: u64,
    pub arrays_vetoed: u64,
    /// Arrays handed to consumers (once per array, not per consumer).
    pub arrays_dispatched: u64,
    /// Per-sink drop counts
    pub sink_drops: HashMap<String, u64>,
}

#[derive(Debug)]
struct ChannelSlot {
    last: Option<ChannelArray>,
    callbacks_enabled: bool,
    update_arrays: bool,
}

struct ArraySink {
    name: String,
    channel: Option<usize>,
    sender: mpsc::Sender<ChannelArray>,
    drops: AtomicU64,
}

/// Output stage for a digitizer's channels.
pub struct ChannelPool {
    buffers: BufferPool,
    slots: Mutex<Vec<ChannelSlot>>,
    observers: RwLock<Vec<(ObserverHandle, Arc<dyn ArrayObserver>)>>,
    sinks: RwLock<Vec<ArraySink>>,
    next_observer: AtomicU64,
    arrays_accepted: AtomicU64,
    arrays_vetoed: AtomicU64,
    arrays_dispatched: AtomicU64,
}

impl ChannelPool {
    /// Create the output stage for `num_channels` channels. Callbacks start
    /// enabled; the update-arrays switch starts at `update_arrays`.
    pub fn new(num_channels: usize, buffers: BufferPool, update_arrays: bool) -> Self {
        let slots = (0..num_channels)
            .map(|_| ChannelSlot {
                last: None,
                callbacks_enabled: true,
                update_arrays,
            })
            .collect();
        Self {
            buffers,
            slots: Mutex::new(slots),
            observers: RwLock::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            arrays_accepted: AtomicU64::new(0),
            arrays_vetoed: AtomicU64::new(0),
            arrays_dispatched: AtomicU64::new(0),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Allocate a sample buffer for `channel`.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is out of range.
    pub fn allocate(&self, channel: usize, format: SampleFormat, num_samples: usize) -> Option<PooledBuffer> {
        self.assert_channel(channel);
        self.buffers.try_allocate(format, num_samples)
    }

    /// Release every last-delivered array.
    pub fn reset_arrays(&self) {
        let released: Vec<ChannelArray> = {
            let mut slots = self.slots.lock();
            slots.iter_mut().filter_map(|slot| slot.last.take()).collect()
        };
        debug!(released = released.len(), "Channel arrays reset");
    }

    /// The most recently delivered array of `channel`.
    pub fn last_array(&self, channel: usize) -> Option<ChannelArray> {
        self.assert_channel(channel);
        self.slots.lock()[channel].last.clone()
    }

    pub fn set_callbacks_enabled(&self, channel: usize, enabled: bool) {
        self.assert_channel(channel);
        self.slots.lock()[channel].callbacks_enabled = enabled;
    }

    pub fn callbacks_enabled(&self, channel: usize) -> bool {
        self.assert_channel(channel);
        self.slots.lock()[channel].callbacks_enabled
    }

    pub fn set_update_arrays(&self, channel: usize, enabled: bool) {
        self.assert_channel(channel);
        self.slots.lock()[channel].update_arrays = enabled;
    }

    pub fn update_arrays(&self, channel: usize) -> bool {
        self.assert_channel(channel);
        self.slots.lock()[channel].update_arrays
    }

    pub fn register_observer(&self, observer: Arc<dyn ArrayObserver>) -> ObserverHandle {
        let handle = ObserverHandle(self.next_observer.fetch_add(1, Ordering::Relaxed));
        debug!(observer = observer.name(), handle = handle.0, "Registered array observer");
        self.observers.write().push((handle, observer));
        handle
    }

    /// Returns `false` if the handle was not registered.
    pub fn unregister_observer(&self, handle: ObserverHandle) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(h, _)| *h != handle);
        observers.len() != before
    }

    /// Add a bounded sink receiving arrays of `channel` (or all channels).
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0 or `channel` is out of range.
    pub fn add_sink(&self, name: &str, channel: Option<usize>, capacity: usize) -> SinkReceiver {
        if let Some(channel) = channel {
            self.assert_channel(channel);
        }
        let (sender, receiver) = mpsc::channel(capacity);
        debug!(sink = name, ?channel, capacity, "Added array sink");
        self.sinks.write().push(ArraySink {
            name: name.to_string(),
            channel,
            sender,
            drops: AtomicU64::new(0),
        });
        receiver
    }

    /// Deliver a finished array.
    ///
    /// Stamps the `READ_SAMPLE_RATE` attribute and runs `completion` with the
    /// slot table locked. If accepted, the array replaces the channel's
    /// last-delivered array (when update-arrays is on) and is then dispatched
    /// to consumers outside the lock (when callbacks are on).
    ///
    /// # Panics
    ///
    /// Panics if the array's channel is out of range.
    pub fn submit_array(
        &self,
        mut array: ChannelArray,
        sample_rate: f64,
        completion: Option<&mut dyn ArrayCompletion>,
    ) -> SubmitOutcome {
        let channel = array.channel;
        self.assert_channel(channel);

        let (accepted, callbacks_enabled, replaced) = {
            let mut slots = self.slots.lock();
            let slot = &mut slots[channel];
            let callbacks_enabled = slot.callbacks_enabled;

            array.set_attribute(READ_SAMPLE_RATE, AttributeValue::Float(sample_rate));

            let accepted = match completion {
                Some(hook) => hook.complete_array(&mut array),
                None => true,
            };

            let replaced = if accepted && slot.update_arrays {
                slot.last.replace(array.clone())
            } else {
                None
            };
            (accepted, callbacks_enabled, replaced)
        };
        // The previous occupant is released outside the lock.
        drop(replaced);

        if !accepted {
            self.arrays_vetoed.fetch_add(1, Ordering::Relaxed);
            trace!(channel, sequence_id = array.sequence_id, "Array vetoed by completion hook");
            return SubmitOutcome::Vetoed;
        }
        self.arrays_accepted.fetch_add(1, Ordering::Relaxed);

        if callbacks_enabled {
            self.dispatch(&array);
        }
        SubmitOutcome::Accepted
    }

    fn dispatch(&self, array: &ChannelArray) {
        self.arrays_dispatched.fetch_add(1, Ordering::Relaxed);

        for (_, observer) in self.observers.read().iter() {
            observer.on_array(array);
        }

        let mut any_closed = false;
        for sink in self.sinks.read().iter() {
            if sink.channel.is_some_and(|c| c != array.channel) {
                continue;
            }
            match sink.sender.try_send(array.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sink.drops.fetch_add(1, Ordering::Relaxed);
                    trace!(sink = %sink.name, channel = array.channel, "Dropped array (sink full)");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    any_closed = true;
                }
            }
        }

        if any_closed {
            self.sinks.write().retain(|sink| {
                let open = !sink.sender.is_closed();
                if !open {
                    debug!(sink = %sink.name, "Sink closed");
                }
                open
            });
        }
    }

    pub fn stats(&self) -> ChannelPoolStats {
        ChannelPoolStats {
            arrays_accepted: self.arrays_accepted.load(Ordering::Relaxed),
            arrays_vetoed: self.arrays_vetoed.load(Ordering::Relaxed),
            arrays_dispatched: self.arrays_dispatched.load(Ordering::Relaxed),
            sink_drops: self
                .sinks
                .read()
                .iter()
                .map(|s| (s.name.clone(), s.drops.load(Ordering::Relaxed)))
                .collect(),
        }
    }

    fn assert_channel(&self, channel: usize) {
        let num_channels = self.slots.lock().len();
        assert!(
            channel < num_channels,
            "channel {} out of range (have {})",
            channel,
            num_channels
        );
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("num_channels", &self.num_channels())
            .field("buffers", &self.buffers)
            .finish_non_exhaustive()
    }
}
