//! Per-connection state owned by the registry.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::models::grid::GridCoordinate;

pub type ConnId = i32;

/// Upstream distance before any composer has been measured.
pub const UNMEASURED_UPSTREAM: i32 = 9999;

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    /// A setup-state transition the state machine must never take. Reported
    /// to the caller and logged; the server stays available.
    #[error("illegal setup transition {from:?} -> {to:?} for connection {id}")]
    IllegalSetupTransition {
        id: ConnId,
        from: SetupState,
        to: SetupState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unset,
    Composer,
    Listener,
    Performer,
}

impl Role {
    pub fn from_wire(code: i32) -> Option<Role> {
        match code {
            1 => Some(Role::Composer),
            2 => Some(Role::Listener),
            3 => Some(Role::Performer),
            _ => None,
        }
    }

    pub fn wire_code(self) -> i32 {
        match self {
            Role::Unset => 0,
            Role::Composer => 1,
            Role::Listener => 2,
            Role::Performer => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    Init,
    Validated,
    Voted,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub role: Role,
    pub username: String,
    pub credentials_valid: bool,
    pub clock_synced: bool,
    /// Whether the join handshake has been answered already.
    pub greeted: bool,
    round_trip_time: Option<f64>,
    setup_state: SetupState,
    pub grid_pos: GridCoordinate,
    /// Propagation distance to each downstream user, in beats. Ordered so
    /// iteration (and the recorded distance maps) are deterministic.
    pub downstream_distances: BTreeMap<ConnId, i32>,
    pub min_upstream_distance: i32,
}

impl Connection {
    pub fn new(id: ConnId) -> Self {
        Self {
            id,
            role: Role::Unset,
            username: String::new(),
            credentials_valid: false,
            clock_synced: false,
            greeted: false,
            round_trip_time: None,
            setup_state: SetupState::Init,
            grid_pos: GridCoordinate::new(-1, -1),
            downstream_distances: BTreeMap::new(),
            min_upstream_distance: UNMEASURED_UPSTREAM,
        }
    }

    pub fn setup_state(&self) -> SetupState {
        self.setup_state
    }

    /// Permitted: Init -> Validated, Validated <-> Voted, and staying put.
    /// Anything entering Init, or Init -> Voted, is a consistency violation.
    pub fn set_setup_state(&mut self, to: SetupState) -> Result<(), SessionError> {
        use SetupState::*;
        let from = self.setup_state;
        let legal = matches!(
            (from, to),
            (Init, Init)
                | (Init, Validated)
                | (Validated, Validated)
                | (Validated, Voted)
                | (Voted, Voted)
                | (Voted, Validated)
        );
        if !legal {
            return Err(SessionError::IllegalSetupTransition {
                id: self.id,
                from,
                to,
            });
        }
        self.setup_state = to;
        Ok(())
    }

    pub fn register_rtt(&mut self, rtt: f64) {
        self.round_trip_time = Some(rtt);
    }

    pub fn rtt(&self) -> Option<f64> {
        self.round_trip_time
    }

    /// Username as shown to peers; placeholder until credentials pass.
    pub fn display_name(&self) -> &str {
        if self.credentials_valid {
            &self.username
        } else {
            "NULL"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_setup_path_is_legal() {
        let mut conn = Connection::new(0);
        conn.set_setup_state(SetupState::Validated).unwrap();
        conn.set_setup_state(SetupState::Voted).unwrap();
        conn.set_setup_state(SetupState::Validated).unwrap();
        conn.set_setup_state(SetupState::Voted).unwrap();
    }

    #[test]
    fn init_to_voted_is_rejected() {
        let mut conn = Connection::new(4);
        let err = conn.set_setup_state(SetupState::Voted).unwrap_err();
        assert_eq!(
            err,
            SessionError::IllegalSetupTransition {
                id: 4,
                from: SetupState::Init,
                to: SetupState::Voted,
            }
        );
        // The failed transition leaves the state untouched.
        assert_eq!(conn.setup_state(), SetupState::Init);
    }

    #[test]
    fn nothing_returns_to_init() {
        let mut conn = Connection::new(1);
        conn.set_setup_state(SetupState::Validated).unwrap();
        assert!(conn.set_setup_state(SetupState::Init).is_err());
        conn.set_setup_state(SetupState::Voted).unwrap();
        assert!(conn.set_setup_state(SetupState::Init).is_err());
    }

    #[test]
    fn display_name_hidden_until_validated() {
        let mut conn = Connection::new(2);
        conn.username = "ari".to_string();
        assert_eq!(conn.display_name(), "NULL");
        conn.credentials_valid = true;
        assert_eq!(conn.display_name(), "ari");
    }

    #[test]
    fn role_wire_codes_round_trip() {
        for role in [Role::Composer, Role::Listener, Role::Performer] {
            assert_eq!(Role::from_wire(role.wire_code()), Some(role));
        }
        assert_eq!(Role::from_wire(0), None);
        assert_eq!(Role::from_wire(7), None);
    }
}
