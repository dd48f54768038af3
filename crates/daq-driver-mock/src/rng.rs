//! Seeded RNG shared by the simulated hardware.
//!
//! Fault decisions and waveform noise draw from the same generator so a
//! seeded run is reproducible end to end.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Thread-safe, optionally seeded random number generator.
pub struct SimRng {
    inner: Mutex<ChaCha8Rng>,
}

impl SimRng {
    /// Seed from `seed`, or from the OS if `None`.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// True with probability `rate` (clamped to 0.0..=1.0).
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate.is_nan() || rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    pub fn next_u64(&self) -> u64 {
        self.inner.lock().gen()
    }

    /// Uniform noise in `[-amplitude, amplitude)`; zero for a non-positive
    /// or non-finite amplitude.
    pub fn noise(&self, amplitude: f64) -> f64 {
        if !amplitude.is_finite() || amplitude <= 0.0 {
            return 0.0;
        }
        self.inner.lock().gen_range(-amplitude..amplitude)
    }

    /// Fill `out` with noise in one lock acquisition.
    pub fn fill_noise(&self, amplitude: f64, out: &mut [f64]) {
        if !amplitude.is_finite() || amplitude <= 0.0 {
            out.fill(0.0);
            return;
        }
        let mut rng = self.inner.lock();
        for value in out.iter_mut() {
            *value = rng.gen_range(-amplitude..amplitude);
        }
    }
}

impl Default for SimRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for SimRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRng").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_rng_deterministic() {
        let a = SimRng::new(Some(42));
        let b = SimRng::new(Some(42));
        assert_eq!(a.next_u64(), b.next_u64(), "Same seed should produce same values");
    }

    #[test]
    fn test_should_fail_bounds() {
        let rng = SimRng::new(Some(7));
        for _ in 0..100 {
            assert!(!rng.should_fail(0.0));
            assert!(!rng.should_fail(f64::NAN));
            assert!(rng.should_fail(1.0));
        }
    }

    #[test]
    fn test_should_fail_probability() {
        let rng = SimRng::new(Some(42));
        let samples = 10_000;
        let failures = (0..samples).filter(|_| rng.should_fail(0.3)).count();
        let observed = failures as f64 / samples as f64;
        assert!(
            (observed - 0.3).abs() < 0.05,
            "Observed failure rate {observed} too far from 0.3"
        );
    }

    #[test]
    fn test_noise_within_amplitude() {
        let rng = SimRng::new(Some(1));
        let mut out = [0.0; 256];
        rng.fill_noise(10.0, &mut out);
        assert!(out.iter().all(|v| (-10.0..10.0).contains(v)));
        assert!(out.iter().any(|v| *v != 0.0));
        assert_eq!(rng.noise(0.0), 0.0);
    }
}
