//! End-to-end session flow: client frames through the dispatcher into the
//! coordinator, with actor mailboxes standing in for WebSocket peers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix::{Actor, Context, Handler};

use drumgrid::handlers::dispatch::{self, ServerError};
use drumgrid::{
    compose, AppState, ConnId, Disconnect, Outbound, Param, PeerHandle, ProtocolError, Settings,
    SessionState,
};

const PASSWORD: &str = "secret";

/// Stand-in client: records every frame the server sends it.
struct Collector {
    frames: Arc<Mutex<Vec<String>>>,
}

impl Actor for Collector {
    type Context = Context<Self>;
}

impl Handler<Outbound> for Collector {
    type Result = ();

    fn handle(&mut self, msg: Outbound, _: &mut Self::Context) {
        self.frames.lock().unwrap().push(msg.0);
    }
}

impl Handler<Disconnect> for Collector {
    type Result = ();

    fn handle(&mut self, _: Disconnect, _: &mut Self::Context) {}
}

fn test_settings(tag: &str) -> Settings {
    let base = std::env::temp_dir().join(format!("drumgrid-flow-{}-{}", tag, std::process::id()));
    let mut settings = Settings::default();
    settings.recorder.log_dir = base.join("logs").to_string_lossy().into_owned();
    settings.midi.output_dir = base.join("midi").to_string_lossy().into_owned();
    settings
}

fn connect(app: &AppState) -> (ConnId, Arc<Mutex<Vec<String>>>) {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let addr = Collector {
        frames: frames.clone(),
    }
    .start();
    let peer = PeerHandle {
        out: addr.clone().recipient(),
        control: addr.recipient(),
    };
    let id = app.session().on_open(peer);
    (id, frames)
}

fn send(app: &AppState, id: ConnId, address: &str, types: &str, params: &[Param]) {
    let frame = compose(address, 0.0, types, true, params).unwrap();
    dispatch::dispatch(app, id, &frame).unwrap();
}

/// Runs the full join handshake and credential entry for one client.
fn join(app: &AppState, id: ConnId, username: &str, role_code: i32, rtt: f64) {
    send(app, id, "!_o2/ws/dy", "s", &[Param::Str("gdc".into())]);
    send(app, id, "/_o2/ws/cs/cs", "", &[]);
    send(app, id, "/elbs/registertt", "d", &[Param::Double(rtt)]);
    send(
        app,
        id,
        "/gdc/infoentered",
        "ssi",
        &[
            Param::Str(PASSWORD.into()),
            Param::Str(username.into()),
            Param::Int(role_code),
        ],
    );
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[actix_web::test]
async fn three_roles_vote_and_start() {
    let app = AppState::new(test_settings("start"), PASSWORD.to_string());
    let (composer, composer_frames) = connect(&app);
    let (listener, _) = connect(&app);
    let (performer, performer_frames) = connect(&app);

    join(&app, composer, "carol", 1, 0.03);
    join(&app, listener, "liam", 2, 0.05);
    join(&app, performer, "pat", 3, 0.04);

    for id in [composer, listener, performer] {
        send(&app, id, "/elbs/votetostart", "", &[]);
    }
    assert_eq!(app.session().state(), SessionState::Active);

    send(
        &app,
        composer,
        "/gdc/start",
        "ittd",
        &[
            Param::Int(0),
            Param::Time(0.0),
            Param::Time(1.0),
            Param::Double(2.0),
        ],
    );
    let map = app.session().timemap();
    assert_eq!(map.epoch, 1);
    assert_eq!(map.bps, 2.0);

    settle().await;
    let composer_seen = composer_frames.lock().unwrap().clone();
    assert!(composer_seen
        .iter()
        .any(|f| f.starts_with("/elbs/everyonevoted\u{3}")));
    assert!(composer_seen
        .iter()
        .any(|f| f.starts_with("/gdc/timemap\u{3}")));
    // The performer learned its nearest upstream composer distance.
    let performer_seen = performer_frames.lock().unwrap().clone();
    assert!(performer_seen
        .iter()
        .any(|f| f.starts_with("/elbs/mcdist\u{3}")));
}

#[actix_web::test]
async fn performer_hits_reach_listeners_distance_tagged() {
    let app = AppState::new(test_settings("hits"), PASSWORD.to_string());
    let (composer, _) = connect(&app);
    let (listener, listener_frames) = connect(&app);
    let (performer, _) = connect(&app);

    join(&app, composer, "carol", 1, 0.03);
    join(&app, listener, "liam", 2, 0.05);
    join(&app, performer, "pat", 3, 0.04);
    for id in [composer, listener, performer] {
        send(&app, id, "/elbs/votetostart", "", &[]);
    }
    send(
        &app,
        composer,
        "/gdc/start",
        "ittd",
        &[
            Param::Int(0),
            Param::Time(0.0),
            Param::Time(1.0),
            Param::Double(2.0),
        ],
    );

    send(
        &app,
        performer,
        "/elbs/phit",
        "iit",
        &[Param::Int(performer), Param::Int(3), Param::Time(4.0)],
    );
    settle().await;
    let seen = listener_frames.lock().unwrap().clone();
    assert!(seen.iter().any(|f| f.starts_with("/elbs/lphit\u{3}")));
}

#[actix_web::test]
async fn stopping_generates_output_asynchronously() {
    let app = AppState::new(test_settings("stop"), PASSWORD.to_string());
    let (composer, _) = connect(&app);
    let (listener, listener_frames) = connect(&app);
    let (performer, _) = connect(&app);

    join(&app, composer, "carol", 1, 0.03);
    join(&app, listener, "liam", 2, 0.05);
    join(&app, performer, "pat", 3, 0.04);
    for id in [composer, listener, performer] {
        send(&app, id, "/elbs/votetostart", "", &[]);
    }
    send(
        &app,
        composer,
        "/gdc/start",
        "ittd",
        &[
            Param::Int(0),
            Param::Time(0.0),
            Param::Time(1.0),
            Param::Double(2.0),
        ],
    );

    let map = app.session().timemap();
    send(
        &app,
        composer,
        "/gdc/stop",
        "it",
        &[Param::Int(map.epoch), Param::Time(map.beat_offset + 4.0)],
    );
    assert!(app.session().timemap().is_stopped());

    // The generator runs (and here fails fast) off the session lock; the
    // result is reported back as a broadcast.
    for _ in 0..40 {
        if app.session().state() == SessionState::Complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(app.session().state(), SessionState::Complete);
    let seen = listener_frames.lock().unwrap().clone();
    assert!(seen
        .iter()
        .any(|f| f.starts_with("/elbs/midisgenerating\u{3}")));
    assert!(seen.iter().any(|f| f.starts_with("/elbs/midisready\u{3}")));
}

#[actix_web::test]
async fn dispatch_validates_before_any_handler_runs() {
    let app = AppState::new(test_settings("validate"), PASSWORD.to_string());
    let (id, _) = connect(&app);

    // Declared types must match the handler's expectation exactly.
    let frame = compose("/elbs/rtttest", 0.0, "d", true, &[Param::Double(1.0)]).unwrap();
    let err = dispatch::dispatch(&app, id, &frame).unwrap_err();
    assert!(matches!(
        err,
        ServerError::Protocol(ProtocolError::TypestringMismatch { .. })
    ));

    let frame = compose("/no/such/address", 0.0, "", true, &[]).unwrap();
    let err = dispatch::dispatch(&app, id, &frame).unwrap_err();
    assert!(matches!(
        err,
        ServerError::Protocol(ProtocolError::UnknownAddress(_))
    ));

    // Heartbeat NOP frames pass through silently.
    dispatch::dispatch(&app, id, "\u{3}").unwrap();

    // A timestamped message before clock sync is dropped, not an error.
    let frame = compose("/gdc/chat", 5.0, "s", true, &[Param::Str("hi".into())]).unwrap();
    dispatch::dispatch(&app, id, &frame).unwrap();

    // Messages from a connection that is gone are a no-op.
    let frame = compose("/gdc/chat", 0.0, "s", true, &[Param::Str("hi".into())]).unwrap();
    dispatch::dispatch(&app, 999, &frame).unwrap();
}

#[actix_web::test]
async fn wrong_ensemble_name_gets_disconnected() {
    let app = AppState::new(test_settings("ensemble"), PASSWORD.to_string());
    let (id, _) = connect(&app);
    send(&app, id, "!_o2/ws/dy", "s", &[Param::Str("someone-else".into())]);
    settle().await;
    // The kick is delivered through the control mailbox; the registry entry
    // goes away when the actor actually stops, which the collector stub
    // does not do. The session must still be serving.
    assert_eq!(app.session().state(), SessionState::Setup);
}
