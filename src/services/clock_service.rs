//! Validated mutations of the shared beat/time map.
//!
//! Every request carries the epoch it was issued against; a request from an
//! outdated timeline is dropped, logged, and never surfaced to the sender.

use log::{debug, info};

use crate::models::timemap::TimeMap;

#[derive(Debug)]
pub struct ClockScheduler {
    map: TimeMap,
    /// Maximum delay to any client, in seconds. Changes must land at least
    /// this far in the future so every client hears about them in time.
    max_net_delay: f64,
}

impl ClockScheduler {
    pub fn new(max_net_delay: f64) -> Self {
        Self {
            map: TimeMap::new(),
            max_net_delay,
        }
    }

    pub fn map(&self) -> TimeMap {
        self.map
    }

    pub fn max_net_delay(&self) -> f64 {
        self.max_net_delay
    }

    pub fn reset(&mut self) {
        self.map = TimeMap::new();
    }

    /// Earliest (time, beat) at which a start or tempo change may land.
    ///
    /// If a tempo change is already scheduled after `now + max_net_delay`,
    /// nothing before it can use the current tempo for beat math, so the
    /// floor moves to the pending time offset. Two beats of margin allow
    /// clients to schedule one beat ahead.
    fn earliest_feasible(&self, now: f64) -> (f64, f64) {
        let mut earliest_time = now + self.max_net_delay;
        if self.map.time_offset > earliest_time {
            earliest_time = self.map.time_offset;
        }
        let earliest_beat = self.map.time_to_beat(earliest_time) + 2.0;
        if self.map.bps > 0.0 {
            earliest_time = self.map.beat_to_time(earliest_beat);
        }
        debug!(
            "earliest feasible start: time {:.4} beat {:.4}",
            earliest_time, earliest_beat
        );
        (earliest_time, earliest_beat)
    }

    /// Tempo change while playing. Keeps the epoch: the timeline continues,
    /// only its slope changes.
    pub fn request_tempo_change(&mut self, now: f64, epoch: i32, beat_offset: f64, bps: f64) -> bool {
        if epoch == self.map.epoch
            && beat_offset > self.map.beat_offset
            && self.map.bps > 0.0
            && bps > 0.0
        {
            // Tempo cannot be set while stopped; clients must request a
            // start instead.
            let time_offset = self.map.beat_to_time(beat_offset);
            if time_offset >= now + self.max_net_delay {
                self.map.time_offset = time_offset;
                self.map.beat_offset = beat_offset;
                self.map.bps = bps;
                info!(
                    "tempo change accepted: beat {:.4} bps {:.4} at time {:.4}",
                    beat_offset, bps, time_offset
                );
                return true;
            }
        }
        debug!(
            "dropping tempo change: epoch {} (current {}) beat {:.4} (current {:.4}) bps {:.4} (current {:.4})",
            epoch, self.map.epoch, beat_offset, self.map.beat_offset, bps, self.map.bps
        );
        false
    }

    /// Start from a stopped timeline. A requested time offset of 0 means
    /// "as soon as possible". Stores one beat of preroll and opens a new
    /// epoch on success.
    pub fn request_start(
        &mut self,
        now: f64,
        epoch: i32,
        time_offset: f64,
        beat_offset: f64,
        bps: f64,
    ) -> bool {
        let mut time_offset = time_offset;
        let mut beat_offset = beat_offset;
        if time_offset < now + self.max_net_delay {
            time_offset = now + self.max_net_delay;
        }
        if epoch != self.map.epoch
            || beat_offset <= self.map.beat_offset
            || time_offset <= self.map.time_offset
            || bps <= 0.0
            || self.map.bps != 0.0
        {
            debug!(
                "dropping start: epoch {} (current {}) beat {:.4} (current {:.4}) time {:.4} (current {:.4}) bps {:.4} (current {:.4})",
                epoch,
                self.map.epoch,
                beat_offset,
                self.map.beat_offset,
                time_offset,
                self.map.time_offset,
                bps,
                self.map.bps
            );
            return false;
        }
        let (floor_time, floor_beat) = self.earliest_feasible(now);
        if time_offset < floor_time || beat_offset < floor_beat {
            time_offset = floor_time;
            beat_offset = floor_beat;
        }
        self.map.epoch += 1;
        self.map.time_offset = time_offset;
        self.map.beat_offset = beat_offset - 1.0; // preroll
        self.map.bps = bps;
        info!(
            "start accepted: epoch {} time {:.4} beat {:.4} bps {:.4}",
            self.map.epoch, self.map.time_offset, self.map.beat_offset, self.map.bps
        );
        true
    }

    /// Stop at the given beat. Opens a new epoch on success.
    pub fn request_stop(&mut self, now: f64, epoch: i32, beat: f64) -> bool {
        if epoch != self.map.epoch || self.map.bps == 0.0 || beat < self.map.beat_offset {
            debug!(
                "dropping stop: beat {:.4} epoch {} (current {}) bps {:.4}",
                beat, epoch, self.map.epoch, self.map.bps
            );
            return false;
        }
        self.map.epoch += 1;
        self.map.time_offset = now + self.max_net_delay;
        self.map.beat_offset = beat;
        self.map.bps = 0.0;
        info!("stop accepted: epoch {} beat {:.4}", self.map.epoch, beat);
        true
    }

    /// Unconditional stop when a participant drops mid-session. The
    /// timeline halts at the beat the stop time maps to.
    pub fn force_stop(&mut self, now: f64) {
        let stop_time = now + self.max_net_delay;
        self.map.epoch += 1;
        self.map.beat_offset = self.map.time_to_beat(stop_time);
        self.map.time_offset = stop_time;
        self.map.bps = 0.0;
        info!(
            "forced stop: epoch {} beat {:.4}",
            self.map.epoch, self.map.beat_offset
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MND: f64 = 2.4;

    #[test]
    fn cold_start_is_raised_to_the_feasible_floor() {
        let mut clock = ClockScheduler::new(MND);
        // Client sends 0 for "as soon as possible".
        assert!(clock.request_start(10.0, 0, 0.0, 1.0, 2.0));
        let map = clock.map();
        assert_eq!(map.epoch, 1);
        assert_eq!(map.bps, 2.0);
        // From a stopped map the floor beat is current beat + 2; one beat
        // of preroll is subtracted from it.
        assert!((map.beat_offset - 1.0).abs() < 1e-9);
        assert!((map.time_offset - 12.4).abs() < 1e-9);
    }

    #[test]
    fn start_with_stale_epoch_is_rejected() {
        let mut clock = ClockScheduler::new(MND);
        assert!(clock.request_start(0.0, 0, 0.0, 1.0, 2.0));
        let before = clock.map();
        assert!(!clock.request_start(20.0, 0, 0.0, 5.0, 2.0));
        assert_eq!(clock.map(), before);
    }

    #[test]
    fn start_while_running_is_rejected() {
        let mut clock = ClockScheduler::new(MND);
        assert!(clock.request_start(0.0, 0, 0.0, 1.0, 2.0));
        assert!(!clock.request_start(30.0, 1, 0.0, 50.0, 2.0));
    }

    #[test]
    fn tempo_change_requires_running_timeline_and_positive_bps() {
        let mut clock = ClockScheduler::new(MND);
        // Stopped: no tempo changes at all.
        assert!(!clock.request_tempo_change(0.0, 0, 4.0, 2.0));
        assert!(clock.request_start(0.0, 0, 0.0, 1.0, 2.0));
        let map = clock.map();
        assert!(!clock.request_tempo_change(3.0, map.epoch, map.beat_offset + 20.0, 0.0));
        assert!(!clock.request_tempo_change(3.0, map.epoch, map.beat_offset + 20.0, -1.5));
        assert!(clock.request_tempo_change(3.0, map.epoch, map.beat_offset + 20.0, 3.0));
        // Epoch is kept across tempo changes.
        assert_eq!(clock.map().epoch, map.epoch);
    }

    #[test]
    fn stale_tempo_change_leaves_map_unchanged() {
        let mut clock = ClockScheduler::new(MND);
        assert!(clock.request_start(0.0, 0, 0.0, 1.0, 2.0));
        let before = clock.map();
        assert!(!clock.request_tempo_change(3.0, 0, before.beat_offset + 20.0, 3.0));
        assert_eq!(clock.map(), before);
    }

    #[test]
    fn tempo_change_too_soon_is_rejected() {
        let mut clock = ClockScheduler::new(MND);
        assert!(clock.request_start(0.0, 0, 0.0, 1.0, 2.0));
        let map = clock.map();
        // A beat just past the current offset maps to a time closer than
        // the network delay allows.
        let now = map.time_offset;
        assert!(!clock.request_tempo_change(now, map.epoch, map.beat_offset + 0.5, 3.0));
    }

    #[test]
    fn stop_validates_epoch_and_beat() {
        let mut clock = ClockScheduler::new(MND);
        assert!(clock.request_start(0.0, 0, 0.0, 1.0, 2.0));
        let map = clock.map();
        assert!(!clock.request_stop(5.0, map.epoch + 3, map.beat_offset + 8.0));
        assert!(!clock.request_stop(5.0, map.epoch, map.beat_offset - 1.0));
        assert!(clock.request_stop(5.0, map.epoch, map.beat_offset + 8.0));
        let stopped = clock.map();
        assert_eq!(stopped.epoch, map.epoch + 1);
        assert_eq!(stopped.bps, 0.0);
        assert!((stopped.time_offset - 7.4).abs() < 1e-9);
        // Stopping twice is rejected.
        assert!(!clock.request_stop(6.0, stopped.epoch, stopped.beat_offset + 1.0));
    }

    #[test]
    fn restart_after_stop_respects_pending_offsets() {
        let mut clock = ClockScheduler::new(MND);
        assert!(clock.request_start(0.0, 0, 0.0, 1.0, 2.0));
        let map = clock.map();
        assert!(clock.request_stop(5.0, map.epoch, map.beat_offset + 8.0));
        let stopped = clock.map();
        assert!(clock.request_start(
            20.0,
            stopped.epoch,
            0.0,
            stopped.beat_offset + 1.0,
            1.5
        ));
        let restarted = clock.map();
        assert_eq!(restarted.epoch, stopped.epoch + 1);
        assert_eq!(restarted.bps, 1.5);
        assert!(restarted.beat_offset > stopped.beat_offset);
    }
}
