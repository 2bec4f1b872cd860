//! Out-of-process MIDI generation.
//!
//! The generator script reads the recorded CSVs and writes one MIDI file
//! per listener. It has no defined timeout and runs as its own task so it
//! never blocks message handling for connected clients.

use std::io;

use log::{error, info};
use tokio::process::Command;

use crate::app_state::AppState;

/// Runs the generator and returns its exit code plus the listener output
/// files it produced, in sorted order.
pub async fn generate(script_path: &str, output_dir: &str) -> io::Result<(i32, Vec<String>)> {
    info!("running MIDI generator: python3 {}", script_path);
    let output = Command::new("python3").arg(script_path).output().await?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        info!("[midigen] {}", line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        error!("[midigen] {}", line);
    }
    let exit_code = output.status.code().unwrap_or(-1);
    info!("MIDI generator finished with exit code {}", exit_code);

    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(output_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("listener") {
            names.push(name);
        }
    }
    names.sort();
    Ok((exit_code, names))
}

/// Generates output for the finished session and reports the result to
/// every connected client. Spawned by the coordinator when a session ends.
pub async fn run_and_report(app: AppState) {
    let (script, output_dir) = {
        let settings = &app.settings;
        (settings.midi.script_path.clone(), settings.midi.output_dir.clone())
    };
    let names = match generate(&script, &output_dir).await {
        Ok((code, names)) => {
            if code != 0 {
                error!("MIDI generator exited with {}", code);
            }
            names
        }
        Err(e) => {
            error!("MIDI generation failed: {}", e);
            Vec::new()
        }
    };
    app.session().finish_output_generation(&names);
}
