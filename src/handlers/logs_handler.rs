//! Recorded-composition log listing and download.

use std::path::PathBuf;

use actix_files::NamedFile;
use actix_web::{web, HttpRequest, HttpResponse, Result};
use log::warn;

use crate::app_state::AppState;

/// Lists the recorded CSV files currently on disk.
pub async fn list_logs(app_state: web::Data<AppState>) -> Result<HttpResponse> {
    let log_dir = PathBuf::from(&app_state.settings.recorder.log_dir);
    let mut names: Vec<String> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&log_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".csv") {
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(HttpResponse::Ok().json(names))
}

/// Serves one recorded CSV by name.
pub async fn download_log(
    req: HttpRequest,
    app_state: web::Data<AppState>,
    name: web::Path<String>,
) -> Result<HttpResponse> {
    let name = name.into_inner();
    // File names are flat; anything path-like is refused.
    if name.contains('/') || name.contains("..") || !name.ends_with(".csv") {
        warn!("refusing log download of {:?}", name);
        return Ok(HttpResponse::BadRequest().finish());
    }
    let path = PathBuf::from(&app_state.settings.recorder.log_dir).join(name);
    match NamedFile::open(path) {
        Ok(file) => Ok(file.into_response(&req)),
        Err(_) => Ok(HttpResponse::NotFound().finish()),
    }
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("").route(web::get().to(list_logs)));
    cfg.service(web::resource("/{name}").route(web::get().to(download_log)));
}
