//! The shared musical timeline: `beat = beat_offset + (time - time_offset) * bps`.

/// Affine beat/time map plus the epoch counter that invalidates stale
/// tempo requests. Mutated only through the clock scheduler's validated
/// operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeMap {
    pub epoch: i32,
    pub time_offset: f64,
    pub beat_offset: f64,
    /// Beats per second; 0 means the ensemble is stopped.
    pub bps: f64,
}

impl TimeMap {
    pub fn new() -> Self {
        Self {
            epoch: 0,
            time_offset: 0.0,
            beat_offset: 0.0,
            bps: 0.0,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.bps == 0.0
    }

    /// When stopped the beat will never occur; the infinity sentinel keeps
    /// comparisons sane without NaNs.
    pub fn beat_to_time(&self, beat: f64) -> f64 {
        if self.bps == 0.0 {
            return f64::INFINITY;
        }
        self.time_offset + (beat - self.beat_offset) / self.bps
    }

    pub fn time_to_beat(&self, time: f64) -> f64 {
        self.beat_offset + (time - self.time_offset) * self.bps
    }
}

impl Default for TimeMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_time_inverse_while_running() {
        let map = TimeMap {
            epoch: 3,
            time_offset: 10.0,
            beat_offset: 4.0,
            bps: 2.5,
        };
        for beat in [0.0, 4.0, 17.25, -3.0] {
            let there_and_back = map.time_to_beat(map.beat_to_time(beat));
            assert!((there_and_back - beat).abs() < 1e-9);
        }
    }

    #[test]
    fn stopped_map_returns_infinity() {
        let map = TimeMap::new();
        assert!(map.beat_to_time(1.0).is_infinite());
        assert!(map.is_stopped());
    }
}
