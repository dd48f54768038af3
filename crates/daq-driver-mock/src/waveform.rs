//! Synthetic burst waveforms.
//!
//! Each burst is `num_pre` baseline samples followed by the waveform, which
//! starts at the trigger. Channels are offset from each other so that data
//! from different channels can be told apart in tests and plots.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::rng::SimRng;

/// Shape of the signal following the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Waveform {
    /// `cycles` periods over the post-trigger samples; channel `n` is
    /// phase-shifted by `n * 45°`
    Sine { amplitude: f64, cycles: f64 },
    /// Rectangular pulse `width` samples long; channel `n` has height
    /// `amplitude / (n + 1)`
    Pulse { amplitude: f64, width: u32 },
    /// Linear ramp from 0 to `amplitude` over the post-trigger samples
    Ramp { amplitude: f64 },
}

impl Default for Waveform {
    fn default() -> Self {
        Waveform::Sine {
            amplitude: 10_000.0,
            cycles: 4.0,
        }
    }
}

impl Waveform {
    /// Ideal value of post-trigger sample `index` (0 = the trigger) out of
    /// `num_post`.
    fn value(&self, channel: usize, index: u32, num_post: u32) -> f64 {
        let n = f64::from(num_post.max(1));
        let i = f64::from(index);
        match *self {
            Waveform::Sine { amplitude, cycles } => {
                let phase = channel as f64 * PI / 4.0;
                amplitude * (2.0 * PI * cycles * i / n + phase).sin()
            }
            Waveform::Pulse { amplitude, width } => {
                if index < width {
                    amplitude / (channel as f64 + 1.0)
                } else {
                    0.0
                }
            }
            Waveform::Ramp { amplitude } => amplitude * i / n,
        }
    }

    /// One burst for `channel`: `num_pre` baseline samples, then `num_post`
    /// waveform samples, each with uniform noise of `noise` counts.
    pub fn burst(
        &self,
        channel: usize,
        num_pre: u32,
        num_post: u32,
        noise: f64,
        rng: &SimRng,
    ) -> Vec<i16> {
        let total = (num_pre + num_post) as usize;
        let mut noise_values = vec![0.0; total];
        rng.fill_noise(noise, &mut noise_values);

        noise_values
            .iter()
            .enumerate()
            .map(|(i, noise)| {
                let ideal = match (i as u32).checked_sub(num_pre) {
                    Some(post_index) => self.value(channel, post_index, num_post),
                    None => 0.0,
                };
                to_sample(ideal + noise)
            })
            .collect()
    }
}

fn to_sample(value: f64) -> i16 {
    value
        .round()
        .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}
