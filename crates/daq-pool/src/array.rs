//! Channel sample arrays and their element formats.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Name of the attribute carrying the display sample rate of the arm cycle
/// that produced an array.
pub const READ_SAMPLE_RATE: &str = "READ_SAMPLE_RATE";

/// Element type of a sample array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl SampleFormat {
    /// Size of one element in bytes.
    pub const fn element_size(self) -> usize {
        match self {
            SampleFormat::I8 | SampleFormat::U8 => 1,
            SampleFormat::I16 | SampleFormat::U16 => 2,
            SampleFormat::I32 | SampleFormat::U32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

/// A primitive sample type that can be stored in a sample buffer.
///
/// Samples are stored in native byte order.
pub trait Sample: Copy + Send + 'static {
    const FORMAT: SampleFormat;

    fn write_ne(self, out: &mut [u8]);

    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_sample {
    ($ty:ty, $format:ident) => {
        impl Sample for $ty {
            const FORMAT: SampleFormat = SampleFormat::$format;

            fn write_ne(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_ne_bytes());
            }

            fn read_ne(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(raw)
            }
        }
    };
}

impl_sample!(i8, I8);
impl_sample!(u8, U8);
impl_sample!(i16, I16);
impl_sample!(u16, U16);
impl_sample!(i32, I32);
impl_sample!(u32, U32);
impl_sample!(f32, F32);
impl_sample!(f64, F64);

/// Value of an array attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    Text(String),
}

/// One channel's samples for one burst, as delivered to consumers.
///
/// Cloning is cheap: the sample data is a reference-counted view of a pooled
/// buffer, which returns to its pool when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct ChannelArray {
    pub channel: usize,
    /// Producer-assigned id, usually the burst id.
    pub sequence_id: i32,
    /// Producer timestamp in seconds.
    pub timestamp: f64,
    pub wall_time: DateTime<Utc>,
    pub format: SampleFormat,
    pub data: Bytes,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl ChannelArray {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.data.len() / self.format.element_size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode the samples, `None` if `T` does not match the array format.
    pub fn samples<T: Sample>(&self) -> Option<Vec<T>> {
        if T::FORMAT != self.format {
            return None;
        }
        Some(
            self.data
                .chunks_exact(self.format.element_size())
                .map(T::read_ne)
                .collect(),
        )
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(name.into(), value);
    }

    /// The `READ_SAMPLE_RATE` attribute, if present.
    pub fn read_sample_rate(&self) -> Option<f64> {
        match self.attribute(READ_SAMPLE_RATE) {
            Some(AttributeValue::Float(rate)) => Some(*rate),
            _ => None,
        }
    }
}
