use actix_web::{web, HttpResponse, Result};
use chrono::Utc;

use crate::app_state::AppState;

pub async fn health_check(app_state: web::Data<AppState>) -> Result<HttpResponse> {
    let (state, connections, map) = {
        let session = app_state.session();
        (
            format!("{:?}", session.state()),
            session.registry().len(),
            session.timemap(),
        )
    };

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "session_state": state,
        "connections": connections,
        "tempo_epoch": map.epoch,
        "bps": map.bps,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("").route(web::get().to(health_check)));
}
