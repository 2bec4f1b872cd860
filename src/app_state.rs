use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::config::Settings;
use crate::services::session_service::SessionService;

/// Shared state handed to every actix worker and session actor.
///
/// The session service sits behind one coarse mutex: every state-mutating
/// operation is a short synchronous critical section, and nothing holds
/// the lock across network I/O.
#[derive(Clone)]
pub struct AppState {
    session: Arc<Mutex<SessionService>>,
    pub settings: Arc<Settings>,
    started: Instant,
}

impl AppState {
    pub fn new(settings: Settings, admin_password: String) -> Self {
        let session = SessionService::new(&settings, admin_password);
        Self {
            session: Arc::new(Mutex::new(session)),
            settings: Arc::new(settings),
            started: Instant::now(),
        }
    }

    pub fn session(&self) -> MutexGuard<'_, SessionService> {
        // A poisoned lock means a handler panicked mid-update; the state
        // itself is still structurally sound, so keep serving.
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seconds since the server started; the session-time "now" used for
    /// all timeline math.
    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}
