//! Composition event log.
//!
//! Every event is one comma-separated line tagged with a single-letter
//! kind. Lines accumulate in a bounded buffer and are flushed to a new
//! sequentially numbered CSV when the buffer fills or the session ends.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};

use crate::models::connection::ConnId;

#[derive(Debug)]
pub struct Recorder {
    log_dir: PathBuf,
    capacity: usize,
    lines: Vec<String>,
    file_index: u32,
}

impl Recorder {
    pub fn new(log_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            log_dir: log_dir.into(),
            capacity,
            lines: Vec::new(),
            file_index: 0,
        }
    }

    fn push(&mut self, line: String) {
        self.lines.push(line);
        if self.lines.len() >= self.capacity {
            self.flush();
        }
    }

    pub fn log_finish(&mut self, beat: f64) {
        self.push(format!("F,{}", beat));
    }

    pub fn log_user_types(&mut self, composer_ids: &str, listener_ids: &str, performer_ids: &str) {
        self.push(format!("U,{},{},{}", composer_ids, listener_ids, performer_ids));
    }

    pub fn log_listener_move(&mut self, listener_id: ConnId, start_beat: f64, end_beat: f64) {
        self.push(format!("L,{},{},{}", listener_id, start_beat, end_beat));
    }

    pub fn log_tempo_change(&mut self, beat: f64, bps: f64) {
        self.push(format!("T,{},{}", beat, bps));
    }

    /// Listener distances as seen from one performer, so each listener's
    /// perspective of the composition can be reconstructed offline.
    pub fn log_distance_map(&mut self, performer_id: ConnId, distances: &BTreeMap<ConnId, i32>) {
        let mut ids = String::new();
        let mut dists = String::new();
        for (listener_id, distance) in distances {
            let _ = write!(ids, "{}.", listener_id);
            let _ = write!(dists, "{}.", distance);
        }
        self.push(format!("P,{},{},{}", performer_id, ids, dists));
    }

    pub fn log_drum_hit(&mut self, beat: f64, sender_id: ConnId, drum_index: i32) {
        self.push(format!("H,{},{},{}", beat, sender_id, drum_index));
    }

    /// Writes buffered lines to the next numbered file. IO failures are
    /// logged; the recording must never take the session down.
    pub fn flush(&mut self) {
        if self.lines.is_empty() {
            return;
        }
        let path = self.current_path();
        let mut contents = self.lines.join("\n");
        contents.push('\n');
        match fs::write(&path, contents) {
            Ok(()) => info!("wrote {} recorded events to {:?}", self.lines.len(), path),
            Err(e) => error!("failed to write {:?}: {}", path, e),
        }
        self.lines.clear();
        self.file_index += 1;
    }

    pub fn current_path(&self) -> PathBuf {
        self.log_dir.join(format!("log{}.csv", self.file_index))
    }

    /// Drops buffered events and restarts numbering for a fresh session.
    pub fn reset(&mut self) {
        self.lines.clear();
        self.file_index = 0;
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}
