use std::f64::consts::PI;
use std::time::Duration;

use rand::{rng, Rng};
use serde::Serialize;
use tokio::time::sleep;

/// Inclusive range a human-scale pause is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const fn secs(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_secs(min),
            max: Duration::from_secs(max),
        }
    }

    pub const ZERO: DelayRange = DelayRange {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    /// Normal sample centred on the midpoint with sigma = width / 6, clipped
    /// to the range. Pauses cluster mid-range instead of spreading evenly.
    pub fn sample(&self) -> Duration {
        self.sample_with(&mut rng())
    }

    pub fn sample_with<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let lo = self.min.as_secs_f64();
        let hi = self.max.as_secs_f64();
        let mean = (lo + hi) / 2.0;
        let sigma = (hi - lo) / 6.0;
        let secs = (mean + box_muller(rng) * sigma).clamp(lo, hi);
        Duration::from_secs_f64(secs)
    }

    pub async fn pause(&self) {
        let d = self.sample();
        if !d.is_zero() {
            sleep(d).await;
        }
    }
}

fn box_muller<R: Rng>(rng: &mut R) -> f64 {
    // u1 must be in (0, 1] so ln(u1) is finite
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn samples_stay_in_range_and_cluster_mid() {
        let range = DelayRange::secs(20, 30);
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<f64> = (0..2000)
            .map(|_| range.sample_with(&mut rng).as_secs_f64())
            .collect();
        assert!(samples.iter().all(|s| (20.0..=30.0).contains(s)));

        let middle = samples.iter().filter(|s| (22.5..=27.5).contains(*s)).count();
        // A uniform draw would put about half here.
        assert!(middle > 1500, "only {middle} samples near the midpoint");
    }

    #[test]
    fn degenerate_range_returns_min() {
        assert_eq!(DelayRange::ZERO.sample(), Duration::ZERO);
        let inverted = DelayRange {
            min: Duration::from_secs(5),
            max: Duration::from_secs(1),
        };
        assert_eq!(inverted.sample(), Duration::from_secs(5));
    }
}
