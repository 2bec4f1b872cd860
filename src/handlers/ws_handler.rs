//! One WebSocket session actor per client connection.
//!
//! The actor mailbox processes a connection's messages in arrival order,
//! which the protocol requires (e.g. a vote must not overtake the join
//! handshake it follows). Nothing here holds the session lock across I/O.

use std::time::{Duration, Instant};

use actix::{Actor, ActorContext, AsyncContext, Handler, StreamHandler};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::handlers::dispatch;
use crate::models::connection::ConnId;
use crate::services::midi_service;
use crate::services::session_service::{CloseOutcome, Disconnect, Outbound, PeerHandle};

pub struct WsSession {
    app: AppState,
    conn_id: Option<ConnId>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl WsSession {
    pub fn new(app: AppState) -> Self {
        let websocket = &app.settings.websocket;
        let heartbeat_interval = Duration::from_secs(websocket.heartbeat_interval_secs);
        let client_timeout = Duration::from_secs(websocket.client_timeout_secs);
        Self {
            app,
            conn_id: None,
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(
                    "[WS] connection {:?} heartbeat timeout; closing",
                    act.conn_id
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let peer = PeerHandle {
            out: ctx.address().recipient(),
            control: ctx.address().recipient(),
        };
        let id = self.app.session().on_open(peer);
        info!("[WS] connection {} established", id);
        self.conn_id = Some(id);
        self.heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let Some(id) = self.conn_id else {
            return;
        };
        info!("[WS] connection {} closed", id);
        let outcome = {
            let now = self.app.elapsed_secs();
            self.app.session().on_close(id, now)
        };
        if outcome == CloseOutcome::SessionEnded {
            tokio::spawn(midi_service::run_and_report(self.app.clone()));
        }
    }
}

impl Handler<Outbound> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<Disconnect> for WsSession {
    type Result = ();

    fn handle(&mut self, _msg: Disconnect, ctx: &mut Self::Context) {
        ctx.close(None);
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                let Some(id) = self.conn_id else {
                    return;
                };
                if let Err(e) = dispatch::dispatch(&self.app, id, &text) {
                    // The per-message failure boundary: drop it, keep the
                    // connection.
                    warn!("[WS] connection {} message dropped: {}", id, e);
                }
            }
            Ok(ws::Message::Binary(data)) => {
                debug!(
                    "[WS] ignoring unexpected binary message of {} bytes",
                    data.len()
                );
            }
            Ok(ws::Message::Close(reason)) => {
                debug!("[WS] close frame: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                error!("[WS] protocol error: {}", e);
                ctx.stop();
            }
            _ => (),
        }
    }
}

pub async fn ws_route(
    req: HttpRequest,
    stream: web::Payload,
    app: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    info!("[WS] new connection request from {:?}", req.peer_addr());

    let max_connections = app.settings.websocket.max_connections;
    let current = app.session().registry().len();
    if current >= max_connections {
        error!("[WS] connection limit reached: {}/{}", current, max_connections);
        return Ok(HttpResponse::ServiceUnavailable().finish());
    }

    ws::start(WsSession::new(app.get_ref().clone()), &req, stream)
}
