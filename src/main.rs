use drumgrid::{
    handlers::{health_handler, logs_handler, ws_handler::ws_route},
    utils::logging::{init_logging_with_config, LogConfig},
    AppState, Settings,
};

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use dotenvy::dotenv;
use log::{error, info};
use std::fs;
use std::io;
use tokio::signal::unix::{signal, SignalKind};

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Env vars may also come from the environment directly.
    dotenv().ok();

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to load settings: {:?}", e);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to load settings: {:?}", e),
            ));
        }
    };

    init_logging_with_config(LogConfig::from(&settings.log))?;
    info!("Starting drumgrid server...");

    // The ensemble can't run without its shared secret.
    let admin_password = match fs::read_to_string(&settings.session.admin_password_path) {
        Ok(contents) => match contents.lines().next() {
            Some(line) if !line.trim().is_empty() => line.trim().to_string(),
            _ => {
                error!(
                    "admin password file {} is empty",
                    settings.session.admin_password_path
                );
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "empty admin password file",
                ));
            }
        },
        Err(e) => {
            error!(
                "could not read admin password file {}: {}",
                settings.session.admin_password_path, e
            );
            return Err(e);
        }
    };

    for dir in [&settings.recorder.log_dir, &settings.midi.output_dir] {
        fs::create_dir_all(dir)?;
    }

    let bind_address = format!("{}:{}", settings.network.bind_address, settings.network.port);
    let web_root = settings.midi.web_root.clone();
    let app_state = web::Data::new(AppState::new(settings, admin_password));

    info!("Starting HTTP server on {}", bind_address);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(app_state.clone())
            .route("/o2ws", web::get().to(ws_route))
            .service(web::scope("/health").configure(health_handler::config))
            .service(web::scope("/logs").configure(logs_handler::config))
            .service(actix_files::Files::new("/", web_root.clone()).index_file("index.html"))
    })
    .bind(&bind_address)?
    .run();

    let server_handle = server.handle();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT signal");
            }
        }
        info!("Initiating graceful shutdown");
        server_handle.stop(true).await;
    });

    server.await?;

    info!("HTTP server stopped");
    Ok(())
}
