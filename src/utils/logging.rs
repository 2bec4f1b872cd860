use log::{info, LevelFilter};
use simplelog::{CombinedLogger, Config, TermLogger, TerminalMode, WriteLogger};
use std::fs::File;
use std::io;

use crate::config::LogSettings;

#[derive(Debug)]
pub struct LogConfig {
    file_level: LevelFilter,
    console_level: LevelFilter,
    log_path: String,
}

fn parse_level(level: &str) -> LevelFilter {
    match level {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

impl LogConfig {
    pub fn new(file_level: &str, console_level: &str, log_path: &str) -> Self {
        Self {
            file_level: parse_level(file_level),
            console_level: parse_level(console_level),
            log_path: log_path.to_string(),
        }
    }
}

impl From<&LogSettings> for LogConfig {
    fn from(settings: &LogSettings) -> Self {
        Self::new(
            &settings.file_level,
            &settings.console_level,
            &settings.file_path,
        )
    }
}

pub fn init_logging_with_config(config: LogConfig) -> io::Result<()> {
    let log_file = File::create(&config.log_path)?;

    CombinedLogger::init(vec![
        TermLogger::new(
            config.console_level,
            Config::default(),
            TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        ),
        WriteLogger::new(config.file_level, Config::default(), log_file),
    ])
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    info!(
        "Logging initialized with level file:{:?} console:{:?}",
        config.file_level, config.console_level
    );
    Ok(())
}
