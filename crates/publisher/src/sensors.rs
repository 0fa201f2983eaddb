//! Simulated sensor readings.

use std::time::Duration;

use common::{Reading, Topic};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Supplies readings on demand and decides how long to wait between them.
pub trait ReadingSource: Send {
    fn next_reading(&mut self) -> Reading;

    /// Pause before the next reading is requested.
    fn pause(&mut self) -> Duration;
}

/// Uniformly random readings within each topic's range, rounded to two decimals.
pub struct SimulatedSensors<R = StdRng> {
    rng: R,
    interval_min: Duration,
    interval_max: Duration,
}

impl SimulatedSensors<StdRng> {
    /// Seeded from the OS. `interval_min` must not exceed `interval_max`.
    pub fn new(interval_min: Duration, interval_max: Duration) -> Self {
        Self::with_rng(StdRng::from_entropy(), interval_min, interval_max)
    }
}

impl<R: Rng + Send> SimulatedSensors<R> {
    pub fn with_rng(rng: R, interval_min: Duration, interval_max: Duration) -> Self {
        Self {
            rng,
            interval_min,
            interval_max,
        }
    }
}

impl<R: Rng + Send> ReadingSource for SimulatedSensors<R> {
    fn next_reading(&mut self) -> Reading {
        let topic = Topic::ALL[self.rng.gen_range(0..Topic::ALL.len())];
        let value = self.rng.gen_range(topic.range());
        Reading::new(topic, round2(value).clamp(*topic.range().start(), *topic.range().end()))
    }

    fn pause(&mut self) -> Duration {
        if self.interval_min >= self.interval_max {
            return self.interval_min;
        }
        self.rng.gen_range(self.interval_min..=self.interval_max)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> SimulatedSensors<StdRng> {
        SimulatedSensors::with_rng(
            StdRng::seed_from_u64(seed),
            Duration::from_millis(1000),
            Duration::from_millis(5000),
        )
    }

    #[test]
    fn readings_stay_in_range_with_two_decimals() {
        let mut sensors = seeded(7);
        for _ in 0..1_000 {
            let reading = sensors.next_reading();
            assert!(reading.is_in_range(), "{reading:?}");
            let text = reading.value_text();
            let decimals = text.split('.').nth(1).map_or(0, str::len);
            assert!(decimals <= 2, "{text}");
        }
    }

    #[test]
    fn every_topic_is_produced() {
        let mut sensors = seeded(11);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(sensors.next_reading().topic);
        }
        assert_eq!(seen.len(), Topic::ALL.len());
    }

    #[test]
    fn pause_within_interval() {
        let mut sensors = seeded(3);
        for _ in 0..500 {
            let pause = sensors.pause();
            assert!(pause >= Duration::from_millis(1000) && pause <= Duration::from_millis(5000));
        }
    }

    #[test]
    fn fixed_interval() {
        let mut sensors = SimulatedSensors::with_rng(
            StdRng::seed_from_u64(1),
            Duration::from_millis(250),
            Duration::from_millis(250),
        );
        assert_eq!(sensors.pause(), Duration::from_millis(250));
    }

    #[test]
    fn same_seed_same_readings() {
        let (mut a, mut b) = (seeded(42), seeded(42));
        for _ in 0..20 {
            assert_eq!(a.next_reading(), b.next_reading());
        }
    }
}
