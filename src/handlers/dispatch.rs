//! Address-routed dispatch of inbound frames.
//!
//! An immutable table maps each literal address to its handler and the
//! type string the handler expects; one generic validation step checks the
//! incoming frame's declared types against the table before any handler
//! runs.

use std::collections::HashMap;

use log::debug;
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::app_state::AppState;
use crate::models::connection::{ConnId, SessionError};
use crate::protocol::{self, Decoded, ProtocolError, WireMessage};
use crate::services::midi_service;
use crate::services::session_service::SessionService;

/// Per-message failure boundary: anything below here is logged and the
/// offending message dropped; the connection stays open.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// What the dispatcher must do once the handler returns and the session
/// lock is released.
enum Flow {
    Done,
    /// The session just ended; output generation runs as its own task.
    GenerateOutput,
}

type HandlerFn = fn(&mut SessionService, ConnId, f64, &mut WireMessage) -> Result<Flow, ServerError>;

struct Entry {
    types: &'static str,
    handler: HandlerFn,
}

static HANDLERS: Lazy<HashMap<&'static str, Entry>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Entry> = HashMap::new();
    let mut register = |address, types, handler| {
        table.insert(address, Entry { types, handler });
    };
    register("_o2/ws/dy", "s", handle_greet as HandlerFn);
    register("_o2/ws/cs/get", "is", handle_clock_get);
    register("_o2/ws/cs/cs", "", handle_clock_synced);
    register("gdc/timemap", "ittd", handle_tempo_change);
    register("gdc/start", "ittd", handle_start);
    register("gdc/stop", "it", handle_stop);
    register("gdc/chat", "s", handle_chat);
    register("gdc/infoentered", "ssi", handle_credentials);
    register("elbs/registertt", "d", handle_register_rtt);
    register("elbs/votetostart", "", handle_vote);
    register("elbs/rtttest", "i", handle_rtt_probe);
    register("elbs/newdc", "ssi", handle_new_drawn_connection);
    register("elbs/removedc", "i", handle_remove_drawn_connection);
    register("elbs/chit", "iit", handle_composer_hit);
    register("elbs/phit", "iit", handle_performer_hit);
    register("elbs/changelistenerpos", "iiit", handle_move_listener);
    table
});

/// Handles one raw frame from `conn_id`'s connection.
pub fn dispatch(app: &AppState, conn_id: ConnId, raw: &str) -> Result<(), ServerError> {
    let mut msg = match protocol::parse(raw)? {
        Decoded::Nop => {
            debug!("NOP frame from connection {}", conn_id);
            return Ok(());
        }
        Decoded::Frame(msg) => msg,
    };

    // Addresses arrive with a '/' or '!' routing prefix.
    let key = msg
        .address
        .strip_prefix('/')
        .or_else(|| msg.address.strip_prefix('!'))
        .unwrap_or(&msg.address);
    let entry = HANDLERS
        .get(key)
        .ok_or_else(|| ProtocolError::UnknownAddress(msg.address.clone()))?;
    if msg.types != entry.types {
        return Err(ProtocolError::TypestringMismatch {
            address: msg.address.clone(),
            expected: entry.types.to_string(),
            got: msg.types.clone(),
        }
        .into());
    }

    let now = app.elapsed_secs();
    let flow = {
        let mut session = app.session();
        // A timestamped message is meaningless until the sender's clock is
        // synced; a message from a departed connection is a no-op.
        if session.should_drop(conn_id, msg.timestamp) {
            debug!(
                "dropping {} from connection {} (unsynced or gone)",
                msg.address, conn_id
            );
            return Ok(());
        }
        (entry.handler)(&mut session, conn_id, now, &mut msg)?
    };
    if let Flow::GenerateOutput = flow {
        tokio::spawn(midi_service::run_and_report(app.clone()));
    }
    Ok(())
}

fn handle_greet(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let ensemble = msg.get_string()?;
    session.greet(id, &ensemble);
    Ok(Flow::Done)
}

fn handle_clock_get(
    session: &mut SessionService,
    id: ConnId,
    now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let sequence = msg.get_int32()?;
    let reply_addr = msg.get_string()?;
    session.clock_get(id, sequence, &reply_addr, msg.reliable, now);
    Ok(Flow::Done)
}

fn handle_clock_synced(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    _msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    session.clock_synced(id)?;
    Ok(Flow::Done)
}

fn handle_tempo_change(
    session: &mut SessionService,
    _id: ConnId,
    now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let epoch = msg.get_int32()?;
    let _time_offset = msg.get_time()?; // derived server-side from the beat
    let beat_offset = msg.get_time()?;
    let bps = msg.get_double()?;
    session.tempo_change_requested(now, epoch, beat_offset, bps);
    Ok(Flow::Done)
}

fn handle_start(
    session: &mut SessionService,
    _id: ConnId,
    now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let epoch = msg.get_int32()?;
    let time_offset = msg.get_time()?;
    let beat_offset = msg.get_time()?;
    let bps = msg.get_double()?;
    session.start_requested(now, epoch, time_offset, beat_offset, bps);
    Ok(Flow::Done)
}

fn handle_stop(
    session: &mut SessionService,
    _id: ConnId,
    now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let epoch = msg.get_int32()?;
    let beat = msg.get_time()?;
    if session.stop_requested(now, epoch, beat) {
        return Ok(Flow::GenerateOutput);
    }
    Ok(Flow::Done)
}

fn handle_chat(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let text = msg.get_string()?;
    session.chat(id, &text);
    Ok(Flow::Done)
}

fn handle_credentials(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let password = msg.get_string()?;
    let username = msg.get_string()?;
    let role_code = msg.get_int32()?;
    session.credentials_entered(id, &password, &username, role_code)?;
    Ok(Flow::Done)
}

fn handle_register_rtt(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let rtt = msg.get_double()?;
    session.register_rtt(id, rtt)?;
    Ok(Flow::Done)
}

fn handle_vote(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    _msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    session.vote_to_start(id)?;
    Ok(Flow::Done)
}

fn handle_rtt_probe(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let index = msg.get_int32()?;
    session.rtt_probe(id, index);
    Ok(Flow::Done)
}

fn handle_new_drawn_connection(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let xs = msg.get_string()?;
    let ys = msg.get_string()?;
    let dest = msg.get_int32()?;
    session.new_drawn_connection(id, &xs, &ys, dest)?;
    Ok(Flow::Done)
}

fn handle_remove_drawn_connection(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let dest = msg.get_int32()?;
    session.remove_drawn_connection(id, dest);
    Ok(Flow::Done)
}

fn handle_composer_hit(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let sender_id = msg.get_int32()?;
    let drum_index = msg.get_int32()?;
    let beat = msg.get_time()?;
    session.composer_hit(id, sender_id, drum_index, beat);
    Ok(Flow::Done)
}

fn handle_performer_hit(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let sender_id = msg.get_int32()?;
    let drum_index = msg.get_int32()?;
    let beat = msg.get_time()?;
    session.performer_hit(id, sender_id, drum_index, beat);
    Ok(Flow::Done)
}

fn handle_move_listener(
    session: &mut SessionService,
    id: ConnId,
    _now: f64,
    msg: &mut WireMessage,
) -> Result<Flow, ServerError> {
    let listener_id = msg.get_int32()?;
    let x = msg.get_int32()?;
    let y = msg.get_int32()?;
    let beat = msg.get_time()?;
    session.move_listener(id, listener_id, x, y, beat);
    Ok(Flow::Done)
}
