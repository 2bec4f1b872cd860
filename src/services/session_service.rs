//! Session coordination: the setup/active/complete state machine, voting,
//! credential validation, and distance-tagged hit routing.
//!
//! All shared session state lives here behind the app's coarse lock; every
//! operation is one short synchronous critical section, and outbound
//! delivery is a non-blocking mailbox enqueue per recipient.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use actix::prelude::*;
use log::{debug, error, info, warn};

use crate::config::Settings;
use crate::models::connection::{ConnId, Role, SessionError, SetupState};
use crate::models::grid::{GridCoordinate, OccupancyMap};
use crate::models::registry::ConnectionRegistry;
use crate::protocol::{compose, Param, ProtocolError};
use crate::services::clock_service::ClockScheduler;
use crate::services::layout_service::{generate_grid_coords, LayoutParams};
use crate::services::recorder_service::Recorder;

/// Sender name for server announcements in chat.
pub const SERVER_CHAT_NAME: &str = "Server";

/// One text frame bound for a client.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Outbound(pub String);

/// Orders the receiving session actor to close its connection.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect;

/// Mailbox endpoints of one connection's session actor.
#[derive(Clone)]
pub struct PeerHandle {
    pub out: Recipient<Outbound>,
    pub control: Recipient<Disconnect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Setup,
    Active,
    GeneratingOutput,
    Complete,
}

/// What the caller must do after a connection closed.
#[derive(Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    Continue,
    /// The session ended; spawn output generation.
    SessionEnded,
}

pub struct SessionService {
    registry: ConnectionRegistry,
    peers: HashMap<ConnId, PeerHandle>,
    clock: ClockScheduler,
    occupancy: OccupancyMap,
    layout: LayoutParams,
    recorder: Recorder,
    state: SessionState,
    ensemble_name: String,
    admin_password: String,
    /// Directories whose generated csv/mid artifacts are cleared between
    /// sessions.
    artifact_dirs: Vec<PathBuf>,
}

impl SessionService {
    pub fn new(settings: &Settings, admin_password: String) -> Self {
        let layout = LayoutParams {
            grid_dim: settings.grid.dimension,
            bijection_value: settings.grid.bijection_value,
            spiral_max_radius: settings.grid.spiral_max_radius,
            relaxation_iterations: settings.grid.relaxation_iterations,
        };
        let artifact_dirs = vec![
            PathBuf::from(&settings.recorder.log_dir),
            PathBuf::from(&settings.midi.output_dir),
        ];
        let service = Self {
            registry: ConnectionRegistry::new(),
            peers: HashMap::new(),
            clock: ClockScheduler::new(settings.session.max_net_delay),
            occupancy: OccupancyMap::new(settings.grid.bijection_value),
            layout,
            recorder: Recorder::new(
                settings.recorder.log_dir.clone(),
                settings.recorder.buffer_lines,
            ),
            state: SessionState::Setup,
            ensemble_name: settings.session.ensemble_name.clone(),
            admin_password,
            artifact_dirs,
        };
        service.clear_artifacts();
        service
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn timemap(&self) -> crate::models::timemap::TimeMap {
        self.clock.map()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Inbound messages from a connection that is gone, or timestamped
    /// messages from one that has not synced its clock, are dropped before
    /// dispatch.
    pub fn should_drop(&self, id: ConnId, timestamp: f64) -> bool {
        match self.registry.get(id) {
            None => true,
            Some(conn) => !conn.clock_synced && timestamp > 0.0,
        }
    }

    // ---- connection lifecycle ------------------------------------------

    pub fn on_open(&mut self, peer: PeerHandle) -> ConnId {
        let id = self.registry.register();
        self.peers.insert(id, peer);
        info!("connection {} opened ({} total)", id, self.registry.len());
        let (nc, nl, np) = self.population();
        self.send_to(
            id,
            "/elbs/clientupdateclasses",
            "iii",
            &[Param::Int(nc), Param::Int(nl), Param::Int(np)],
        );
        self.chat_to(
            id,
            SERVER_CHAT_NAME,
            "Once one of each user type has entered a valid username and \
             password, the confirmed users can vote to start.",
        );
        id
    }

    pub fn on_close(&mut self, id: ConnId, now: f64) -> CloseOutcome {
        self.peers.remove(&id);
        if self.registry.get(id).is_none() {
            // Already removed (e.g. kicked at session start); nothing to do.
            return CloseOutcome::Continue;
        }
        let drained = self.registry.unregister(id);
        info!("connection {} closed ({} remaining)", id, self.registry.len());
        if drained {
            self.reset_all();
            return CloseOutcome::Continue;
        }
        match self.state {
            SessionState::Setup => {
                self.reset_votes();
                self.fanout(None, "/elbs/clientvoteconfirmed", "i", &[Param::Int(0)]);
                self.broadcast_population();
                CloseOutcome::Continue
            }
            SessionState::Active => {
                // One dropped participant ends the session for everyone.
                self.clock.force_stop(now);
                self.broadcast_timemap();
                self.fanout(None, "/elbs/sessioninterrupt", "", &[]);
                self.recorder.log_finish(self.clock.map().beat_offset);
                self.recorder.flush();
                self.begin_output_generation(1);
                CloseOutcome::SessionEnded
            }
            _ => CloseOutcome::Continue,
        }
    }

    // ---- join handshake and clock sync ---------------------------------

    /// First message of the join handshake. A wrong ensemble name gets the
    /// connection closed.
    pub fn greet(&mut self, id: ConnId, ensemble: &str) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if ensemble == self.ensemble_name && !conn.greeted {
            conn.greeted = true;
            self.send_to(id, "!_o2/id", "i", &[Param::Int(id)]);
        } else {
            warn!("connection {} greeted with ensemble {:?}; closing", id, ensemble);
            if let Some(peer) = self.peers.get(&id) {
                peer.control.do_send(Disconnect);
            }
        }
    }

    /// Clock-sync probe: echo the sequence number with the server time to
    /// the address the client asked for.
    pub fn clock_get(&self, id: ConnId, seq: i32, reply_addr: &str, reliable: bool, now: f64) {
        self.send_frame(
            id,
            compose(
                reply_addr,
                0.0,
                "it",
                reliable,
                &[Param::Int(seq), Param::Time(now)],
            ),
        );
    }

    pub fn clock_synced(&mut self, id: ConnId) -> Result<(), SessionError> {
        let Some(conn) = self.registry.get_mut(id) else {
            return Ok(());
        };
        // Once synced, a clock never becomes unsynced again.
        conn.clock_synced = true;
        self.send_timemap_to(id);
        self.check_and_validate(id)
    }

    pub fn rtt_probe(&self, id: ConnId, index: i32) {
        self.send_to(id, "/elbs/rtttest", "i", &[Param::Int(index)]);
    }

    pub fn register_rtt(&mut self, id: ConnId, rtt: f64) -> Result<(), SessionError> {
        let Some(conn) = self.registry.get_mut(id) else {
            return Ok(());
        };
        conn.register_rtt(rtt);
        info!("connection {} registered round-trip time {:.4}", id, rtt);
        self.check_and_validate(id)
    }

    // ---- setup: credentials and voting ---------------------------------

    pub fn credentials_entered(
        &mut self,
        id: ConnId,
        password: &str,
        username: &str,
        role_code: i32,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Setup {
            self.chat_to(
                id,
                SERVER_CHAT_NAME,
                "This session is already in progress - no more active participants can enter.",
            );
            return Ok(());
        }
        let Some(conn) = self.registry.get_mut(id) else {
            return Ok(());
        };
        let role = Role::from_wire(role_code);
        let password_valid = password == self.admin_password;
        // The username doubles as a field in dot-separated roster strings,
        // so "." is reserved.
        let username_valid = !username.trim().is_empty() && !username.contains('.');
        if password_valid && username_valid && role.is_some() {
            conn.username = username.to_string();
            conn.role = role.unwrap_or(Role::Unset);
            conn.credentials_valid = true;
        }
        self.send_to(
            id,
            "/gdc/infoentered",
            "ii",
            &[
                Param::Int(password_valid as i32),
                Param::Int(username_valid as i32),
            ],
        );
        self.check_and_validate(id)
    }

    /// Moves the connection to Validated once clock sync, credentials, and
    /// a positive round-trip measurement are all in. Called after every
    /// event that could complete the set.
    fn check_and_validate(&mut self, id: ConnId) -> Result<(), SessionError> {
        let Some(conn) = self.registry.get_mut(id) else {
            return Ok(());
        };
        let rtt = conn.rtt().unwrap_or(-1.0);
        if !(conn.clock_synced && conn.credentials_valid && rtt > 0.0) {
            debug!(
                "connection {} not yet validated: synced={} credentials={} rtt={:.4}",
                id, conn.clock_synced, conn.credentials_valid, rtt
            );
            return Ok(());
        }
        conn.set_setup_state(SetupState::Validated)?;
        let role = conn.role;
        let name = conn.display_name().to_string();
        self.send_to(id, "/elbs/validated", "", &[]);

        // Someone new is in: every vote so far must be re-confirmed.
        self.reset_votes();
        self.broadcast_population();

        let (role_word, guidance) = match role {
            Role::Listener => (
                "listener",
                "As a listener, you hear what performers play. Click and drag \
                 your node (the black dot) to change your perspective of the composition.",
            ),
            Role::Performer => (
                "performer",
                "As a performer, you (the black dot) mimic (or choose to ignore) what composers play. \
                 Tap your keyboard to play drums, which are broadcast to listeners.",
            ),
            Role::Composer => (
                "composer",
                "As a composer, you can start and stop the composition, change tempo, \
                 and send performers drums to mimic by tapping your keyboard. Click and drag from yourself \
                 (the black dot) to performers (blue dots) to draw connections.",
            ),
            Role::Unset => ("participant", ""),
        };
        if !guidance.is_empty() {
            self.chat_to(id, SERVER_CHAT_NAME, guidance);
        }
        self.chat_broadcast(
            &name,
            &format!(" has joined the ensemble as a {}.", role_word),
            Some(id),
        );
        Ok(())
    }

    pub fn vote_to_start(&mut self, id: ConnId) -> Result<(), SessionError> {
        if self.state != SessionState::Setup {
            self.chat_to(
                id,
                SERVER_CHAT_NAME,
                "This session is already in progress - no more active participants can enter.",
            );
            return Ok(());
        }
        let Some(conn) = self.registry.get_mut(id) else {
            return Ok(());
        };
        if conn.setup_state() == SetupState::Validated {
            conn.set_setup_state(SetupState::Voted)?;
        }
        let name = self
            .registry
            .get(id)
            .map(|c| c.display_name().to_string())
            .unwrap_or_default();
        self.send_to(id, "/elbs/clientvoteconfirmed", "i", &[Param::Int(1)]);
        self.chat_broadcast(&name, " has voted to start.", None);
        self.try_begin_session();
        Ok(())
    }

    /// Setup -> Active once every non-Init connection has voted and each
    /// role has at least one voter.
    fn try_begin_session(&mut self) {
        let mut composers = 0;
        let mut listeners = 0;
        let mut performers = 0;
        for conn in self.registry.iter() {
            match conn.setup_state() {
                SetupState::Validated => return, // someone still has to vote
                SetupState::Voted => match conn.role {
                    Role::Composer => composers += 1,
                    Role::Listener => listeners += 1,
                    Role::Performer => performers += 1,
                    Role::Unset => {}
                },
                SetupState::Init => {}
            }
        }
        if composers < 1 || performers < 1 || listeners < 1 {
            debug!(
                "not starting yet: {} composers, {} listeners, {} performers voted",
                composers, listeners, performers
            );
            return;
        }

        self.state = SessionState::Active;
        info!("all votes in; session is now active");

        // Connections that never entered valid credentials are removed at
        // the transition.
        let stragglers: Vec<ConnId> = self
            .registry
            .iter()
            .filter(|c| c.setup_state() == SetupState::Init)
            .map(|c| c.id)
            .collect();
        for straggler in stragglers {
            self.chat_to(
                straggler,
                SERVER_CHAT_NAME,
                "You have been removed from the group for not entering a valid username and password.",
            );
            if let Some(peer) = self.peers.remove(&straggler) {
                peer.control.do_send(Disconnect);
            }
            self.registry.unregister(straggler);
        }

        let mut composer_ids = String::new();
        let mut listener_ids = String::new();
        let mut performer_ids = String::new();
        for conn in self.registry.iter() {
            let out = match conn.role {
                Role::Composer => &mut composer_ids,
                Role::Listener => &mut listener_ids,
                Role::Performer => &mut performer_ids,
                Role::Unset => continue,
            };
            let _ = write!(out, "{}.", conn.id);
        }
        self.recorder
            .log_user_types(&composer_ids, &listener_ids, &performer_ids);

        self.place_participants();
    }

    /// Runs the layout once, caches all propagation distances, and tells
    /// every client where everyone sits.
    fn place_participants(&mut self) {
        let rtts: Vec<(ConnId, f64)> = self
            .registry
            .iter()
            .map(|c| (c.id, c.rtt().unwrap_or(0.0)))
            .collect();
        let coords = generate_grid_coords(&rtts, &self.layout);
        for conn in self.registry.iter_mut() {
            if let Some(&coord) = coords.get(&conn.id) {
                conn.grid_pos = coord;
            }
        }

        let mut ids = String::new();
        let mut xs = String::new();
        let mut ys = String::new();
        let mut usernames = String::new();
        let mut role_codes = String::new();
        for conn in self.registry.iter() {
            let _ = write!(ids, "{}.", conn.id);
            let _ = write!(xs, "{}.", conn.grid_pos.x);
            let _ = write!(ys, "{}.", conn.grid_pos.y);
            let _ = write!(usernames, "{}.", conn.display_name());
            let _ = write!(role_codes, "{}.", conn.role.wire_code());
            self.occupancy.place(conn.id as i64, conn.grid_pos);
        }

        // Cache performer distances: downstream to every listener, and the
        // nearest upstream composer.
        let roster: Vec<(ConnId, Role, GridCoordinate)> = self
            .registry
            .iter()
            .map(|c| (c.id, c.role, c.grid_pos))
            .collect();
        let mut max_rtt: f64 = -1.0;
        for conn in self.registry.iter() {
            max_rtt = max_rtt.max(conn.rtt().unwrap_or(-1.0));
        }
        debug!("max round-trip time in session: {:.4}", max_rtt);

        let mut performer_logs: Vec<ConnId> = Vec::new();
        for &(pid, role, pos) in &roster {
            if role != Role::Performer {
                continue;
            }
            for &(oid, other_role, other_pos) in &roster {
                let distance = pos.manhattan_distance(&other_pos);
                match other_role {
                    Role::Listener => {
                        if let Some(perf) = self.registry.get_mut(pid) {
                            perf.downstream_distances.insert(oid, distance);
                        }
                    }
                    Role::Composer => {
                        if let Some(perf) = self.registry.get_mut(pid) {
                            if distance < perf.min_upstream_distance {
                                perf.min_upstream_distance = distance;
                            }
                        }
                    }
                    _ => {}
                }
            }
            if let Some(perf) = self.registry.get(pid) {
                self.send_to(
                    pid,
                    "/elbs/mcdist",
                    "i",
                    &[Param::Int(perf.min_upstream_distance)],
                );
            }
            performer_logs.push(pid);
        }
        for pid in performer_logs {
            if let Some(perf) = self.registry.get(pid) {
                let distances = perf.downstream_distances.clone();
                self.recorder.log_distance_map(pid, &distances);
            }
        }

        self.chat_broadcast(
            SERVER_CHAT_NAME,
            "Everyone has voted to confirm. A composer can now click start to begin the composition.",
            None,
        );
        self.fanout(
            None,
            "/elbs/everyonevoted",
            "sssss",
            &[
                Param::Str(ids),
                Param::Str(xs),
                Param::Str(ys),
                Param::Str(usernames),
                Param::Str(role_codes),
            ],
        );
    }

    // ---- chat ----------------------------------------------------------

    pub fn chat(&self, id: ConnId, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let Some(conn) = self.registry.get(id) else {
            return;
        };
        self.chat_broadcast(conn.display_name(), text, None);
    }

    // ---- timeline requests ---------------------------------------------

    pub fn tempo_change_requested(&mut self, now: f64, epoch: i32, beat_offset: f64, bps: f64) {
        if self.clock.request_tempo_change(now, epoch, beat_offset, bps) {
            self.recorder.log_tempo_change(beat_offset, bps);
            self.broadcast_timemap();
        }
    }

    pub fn start_requested(
        &mut self,
        now: f64,
        epoch: i32,
        time_offset: f64,
        beat_offset: f64,
        bps: f64,
    ) {
        if self.clock.request_start(now, epoch, time_offset, beat_offset, bps) {
            let map = self.clock.map();
            self.recorder.log_tempo_change(map.beat_offset, map.bps);
            self.broadcast_timemap();
        }
    }

    /// Returns true when the session ended and output generation must be
    /// spawned by the caller.
    pub fn stop_requested(&mut self, now: f64, epoch: i32, beat: f64) -> bool {
        if !self.clock.request_stop(now, epoch, beat) {
            return false;
        }
        self.broadcast_timemap();
        self.recorder.log_finish(beat);
        self.recorder.flush();
        self.begin_output_generation(0);
        true
    }

    // ---- distance-tagged hit routing -----------------------------------

    /// Composer hit: distance-tagged to each performer the composer has a
    /// drawn connection to, a display-only frame to everyone else.
    pub fn composer_hit(&self, id: ConnId, sender_id: ConnId, drum_index: i32, beat: f64) {
        if self.state != SessionState::Active || self.clock.map().is_stopped() {
            return;
        }
        let Some(composer) = self.registry.get(id) else {
            return;
        };
        let downstream = composer.downstream_distances.clone();
        for conn in self.registry.iter() {
            if conn.role == Role::Performer {
                if let Some(&distance) = downstream.get(&conn.id) {
                    self.send_to(
                        conn.id,
                        "/elbs/ctocp",
                        "iiit",
                        &[
                            Param::Int(sender_id),
                            Param::Int(drum_index),
                            Param::Int(distance),
                            Param::Time(beat),
                        ],
                    );
                    continue;
                }
            }
            if conn.id != sender_id {
                self.send_to(
                    conn.id,
                    "/elbs/thdm",
                    "it",
                    &[Param::Int(sender_id), Param::Time(beat)],
                );
            }
        }
    }

    /// Performer hit: distance-tagged to every listener, display-only to
    /// the rest, and recorded for offline reconstruction.
    pub fn performer_hit(&mut self, id: ConnId, sender_id: ConnId, drum_index: i32, beat: f64) {
        if self.state != SessionState::Active || self.clock.map().is_stopped() {
            return;
        }
        let Some(performer) = self.registry.get(id) else {
            return;
        };
        let downstream = performer.downstream_distances.clone();
        self.recorder.log_drum_hit(beat, sender_id, drum_index);
        for conn in self.registry.iter() {
            if conn.role == Role::Listener {
                let Some(&distance) = downstream.get(&conn.id) else {
                    warn!("no cached distance from {} to listener {}", id, conn.id);
                    continue;
                };
                self.send_to(
                    conn.id,
                    "/elbs/lphit",
                    "iiit",
                    &[
                        Param::Int(sender_id),
                        Param::Int(drum_index),
                        Param::Int(distance),
                        Param::Time(beat),
                    ],
                );
            } else if conn.id != id {
                self.send_to(
                    conn.id,
                    "/elbs/phdm",
                    "it",
                    &[Param::Int(sender_id), Param::Time(beat)],
                );
            }
        }
    }

    /// Listener repositioning. Refused while stopped and when the target
    /// cell is taken; otherwise re-derives every performer's distance to
    /// the listener and announces the beat at which the move completes.
    pub fn move_listener(
        &mut self,
        requester: ConnId,
        listener_id: ConnId,
        x: i32,
        y: i32,
        sent_beat: f64,
    ) {
        if self.clock.map().bps <= 0.0 {
            self.send_to(
                requester,
                "/elbs/blmm",
                "s",
                &[Param::Str(
                    "Cannot move listener while ensemble is stopped.".into(),
                )],
            );
            return;
        }
        let target = GridCoordinate::new(x, y);
        if self.occupancy.is_occupied(target) {
            self.send_to(
                requester,
                "/elbs/blmm",
                "s",
                &[Param::Str("There is already an element in this position.".into())],
            );
            return;
        }
        let Some(old_pos) = self
            .registry
            .iter()
            .find(|c| c.role == Role::Listener && c.id == listener_id)
            .map(|c| c.grid_pos)
        else {
            return;
        };
        self.occupancy.place(listener_id as i64, target);

        // The move is visually complete once every performer's rendering
        // has covered both endpoints, and never sooner than 4 beats out.
        let mut completion_beat = sent_beat + 4.0;
        let performer_updates: Vec<(ConnId, i32)> = self
            .registry
            .iter()
            .filter(|c| c.role == Role::Performer)
            .map(|c| {
                let new_d = c.grid_pos.manhattan_distance(&target);
                let old_d = c.grid_pos.manhattan_distance(&old_pos);
                completion_beat = completion_beat.max(sent_beat + new_d.max(old_d) as f64);
                (c.id, new_d)
            })
            .collect();
        for &(pid, distance) in &performer_updates {
            if let Some(perf) = self.registry.get_mut(pid) {
                perf.downstream_distances.insert(listener_id, distance);
            }
        }
        if let Some(listener) = self.registry.get_mut(listener_id) {
            listener.grid_pos = target;
        }

        self.fanout(
            None,
            "/elbs/listenerposchanged",
            "iiit",
            &[
                Param::Int(listener_id),
                Param::Int(x),
                Param::Int(y),
                Param::Time(completion_beat),
            ],
        );
        self.recorder
            .log_listener_move(listener_id, sent_beat, completion_beat);
        for (pid, _) in performer_updates {
            if let Some(perf) = self.registry.get(pid) {
                let distances = perf.downstream_distances.clone();
                self.recorder.log_distance_map(pid, &distances);
            }
        }
    }

    // ---- drawn connections ---------------------------------------------

    /// A composer draws a path to a performer; the waypoint count becomes
    /// the propagation distance for that link.
    pub fn new_drawn_connection(
        &mut self,
        id: ConnId,
        xs_field: &str,
        ys_field: &str,
        dest: ConnId,
    ) -> Result<(), ProtocolError> {
        let dest_is_performer = self
            .registry
            .get(dest)
            .map(|c| c.role == Role::Performer)
            .unwrap_or(false);
        if !dest_is_performer {
            self.send_to(
                id,
                "/elbs/bdcm",
                "s",
                &[Param::Str("You can only draw lines to performers (blue).".into())],
            );
            return Ok(());
        }
        let xs = parse_coord_list(xs_field)?;
        let ys = parse_coord_list(ys_field)?;
        if xs.len() != ys.len() {
            return Err(ProtocolError::MalformedMessage(
                "coordinate lists differ in length".into(),
            ));
        }

        // Endpoints are the two users themselves; only interior waypoints
        // occupy cells.
        let mut waypoint_keys = HashSet::new();
        for i in 1..xs.len().saturating_sub(1) {
            let cell = GridCoordinate::new(xs[i], ys[i]);
            if self.occupancy.is_occupied(cell) {
                self.send_to(
                    id,
                    "/elbs/bdcm",
                    "s",
                    &[Param::Str("There is already an element in this position.".into())],
                );
                return Ok(());
            }
            waypoint_keys.insert(self.occupancy.cell_key(cell));
        }
        let link = self.occupancy.link_key(id as i64, dest as i64);
        self.occupancy.place_set(link, waypoint_keys);

        let distance = (xs.len() as i32 - 2).max(0);
        if let Some(conn) = self.registry.get_mut(id) {
            conn.downstream_distances.insert(dest, distance);
        }
        self.fanout(
            None,
            "!elbs/newdc",
            "ssii",
            &[
                Param::Str(xs_field.to_string()),
                Param::Str(ys_field.to_string()),
                Param::Int(id),
                Param::Int(dest),
            ],
        );
        Ok(())
    }

    pub fn remove_drawn_connection(&mut self, id: ConnId, dest: ConnId) {
        if let Some(conn) = self.registry.get_mut(id) {
            conn.downstream_distances.remove(&dest);
        }
        let link = self.occupancy.link_key(id as i64, dest as i64);
        self.occupancy.release(link);
        self.fanout(
            None,
            "/elbs/removedc",
            "ii",
            &[Param::Int(id), Param::Int(dest)],
        );
    }

    // ---- output generation ---------------------------------------------

    fn begin_output_generation(&mut self, error_code: i32) {
        self.state = SessionState::GeneratingOutput;
        self.fanout(
            None,
            "/elbs/midisgenerating",
            "i",
            &[Param::Int(error_code)],
        );
    }

    /// Called from the generation task once the external generator is done.
    pub fn finish_output_generation(&mut self, names: &[String]) {
        let mut joined = String::new();
        for name in names {
            let _ = write!(joined, "{},", name);
        }
        self.fanout(None, "/elbs/midisready", "s", &[Param::Str(joined)]);
        self.state = SessionState::Complete;
        info!("output generation finished: {} files", names.len());
    }

    // ---- shared plumbing -----------------------------------------------

    fn population(&self) -> (i32, i32, i32) {
        let mut nc = 0;
        let mut nl = 0;
        let mut np = 0;
        for conn in self.registry.iter() {
            match conn.role {
                Role::Composer => nc += 1,
                Role::Listener => nl += 1,
                Role::Performer => np += 1,
                Role::Unset => {}
            }
        }
        (nc, nl, np)
    }

    fn broadcast_population(&self) {
        let (nc, nl, np) = self.population();
        self.fanout(
            None,
            "/elbs/clientupdateclasses",
            "iii",
            &[Param::Int(nc), Param::Int(nl), Param::Int(np)],
        );
    }

    fn reset_votes(&mut self) {
        for conn in self.registry.iter_mut() {
            if conn.setup_state() == SetupState::Voted {
                // Voted -> Validated is always legal.
                let _ = conn.set_setup_state(SetupState::Validated);
            }
        }
    }

    fn timemap_params(&self) -> [Param; 4] {
        let map = self.clock.map();
        [
            Param::Int(map.epoch),
            Param::Time(map.time_offset),
            Param::Time(map.beat_offset),
            Param::Double(map.bps),
        ]
    }

    fn broadcast_timemap(&self) {
        let map = self.clock.map();
        info!(
            "broadcasting timemap: epoch {} timeOffset {:.4} beatOffset {:.4} bps {:.4}",
            map.epoch, map.time_offset, map.beat_offset, map.bps
        );
        self.fanout(None, "/gdc/timemap", "ittd", &self.timemap_params());
    }

    fn send_timemap_to(&self, id: ConnId) {
        self.send_to(id, "/gdc/timemap", "ittd", &self.timemap_params());
    }

    fn chat_to(&self, id: ConnId, sender: &str, text: &str) {
        self.send_to(
            id,
            "/gdc/chat",
            "ss",
            &[Param::Str(sender.to_string()), Param::Str(text.to_string())],
        );
    }

    fn chat_broadcast(&self, sender: &str, text: &str, exclude: Option<ConnId>) {
        self.fanout(
            exclude,
            "/gdc/chat",
            "ss",
            &[Param::Str(sender.to_string()), Param::Str(text.to_string())],
        );
    }

    fn send_to(&self, id: ConnId, address: &str, types: &str, params: &[Param]) {
        self.send_frame(id, compose(address, 0.0, types, true, params));
    }

    fn send_frame(&self, id: ConnId, frame: Result<String, ProtocolError>) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        match frame {
            Ok(frame) => peer.out.do_send(Outbound(frame)),
            Err(e) => error!("dropping outbound frame for {}: {}", id, e),
        }
    }

    fn fanout(&self, exclude: Option<ConnId>, address: &str, types: &str, params: &[Param]) {
        match compose(address, 0.0, types, true, params) {
            Ok(frame) => {
                for (&id, peer) in &self.peers {
                    if Some(id) == exclude {
                        continue;
                    }
                    peer.out.do_send(Outbound(frame.clone()));
                }
            }
            Err(e) => error!("dropping broadcast frame {}: {}", address, e),
        }
    }

    /// Full reset once the last connection leaves. Generated artifacts are
    /// cleared so a fresh session never serves stale output.
    fn reset_all(&mut self) {
        info!("registry drained; resetting session state");
        self.registry.reset();
        self.peers.clear();
        self.clock.reset();
        self.occupancy.clear();
        self.recorder.reset();
        self.state = SessionState::Setup;
        self.clear_artifacts();
    }

    fn clear_artifacts(&self) {
        for dir in &self.artifact_dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let generated = matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("csv") | Some("mid")
                );
                if generated {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!("could not remove stale artifact {:?}: {}", path, e);
                    }
                }
            }
        }
    }
}

/// Dot-separated integers ("3.5.7."), trailing separator tolerated.
fn parse_coord_list(field: &str) -> Result<Vec<i32>, ProtocolError> {
    field
        .split('.')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| ProtocolError::MalformedMessage(format!("bad coordinate {:?}", s)))
        })
        .collect()
}
