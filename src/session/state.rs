//! Connection state machine.
//!
//! ```text
//!                connect                 select
//! NotConnected ──────────► Connected ─┬─────────────────► Selected
//!      ▲                     │ (auto) │                    │
//!      │                     ▼        │       select       │ deselect
//!      │                 NotSelected ─┴──────────────► ◄───┘
//!      │                     │
//!      └── disconnect (any) ─┴── timeoutT7 (Connected | NotSelected)
//! ```
//!
//! `Connected` is transient: firing `connect` lands in `NotSelected`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SecsError};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    Connected,
    NotSelected,
    Selected,
}

impl ConnectionState {
    /// Whether a transport link exists.
    pub fn is_connected(self) -> bool {
        self != ConnectionState::NotConnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::NotConnected => "NOT_CONNECTED",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::NotSelected => "NOT_SELECTED",
            ConnectionState::Selected => "SELECTED",
        };
        f.write_str(name)
    }
}

/// Named transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Connect,
    Select,
    Deselect,
    Disconnect,
    TimeoutT7,
}

impl Transition {
    pub const ALL: [Transition; 5] = [
        Transition::Connect,
        Transition::Select,
        Transition::Deselect,
        Transition::Disconnect,
        Transition::TimeoutT7,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Transition::Connect => "connect",
            Transition::Select => "select",
            Transition::Deselect => "deselect",
            Transition::Disconnect => "disconnect",
            Transition::TimeoutT7 => "timeoutT7",
        }
    }

    /// States this transition may be fired from.
    pub fn sources(self) -> &'static [ConnectionState] {
        use ConnectionState::*;
        match self {
            Transition::Connect => &[NotConnected],
            Transition::Select => &[Connected, NotSelected],
            Transition::Deselect => &[Selected],
            Transition::Disconnect => &[NotConnected, Connected, NotSelected, Selected],
            Transition::TimeoutT7 => &[Connected, NotSelected],
        }
    }

    pub fn target(self) -> ConnectionState {
        match self {
            Transition::Connect => ConnectionState::Connected,
            Transition::Select => ConnectionState::Selected,
            Transition::Deselect => ConnectionState::NotSelected,
            Transition::Disconnect | Transition::TimeoutT7 => ConnectionState::NotConnected,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transition {
    type Err = SecsError;

    fn from_str(s: &str) -> Result<Self> {
        Transition::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| SecsError::UnknownTransition(s.to_string()))
    }
}

/// Tracks the current state and enforces the transition table.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn can_fire(&self, transition: Transition) -> bool {
        transition.sources().contains(&self.state)
    }

    /// Fire `transition`, returning the resulting state.
    pub fn fire(&mut self, transition: Transition) -> Result<ConnectionState> {
        if !self.can_fire(transition) {
            return Err(SecsError::InvalidTransition {
                transition,
                state: self.state,
            });
        }

        self.state = match transition.target() {
            ConnectionState::Connected => ConnectionState::NotSelected,
            target => target,
        };
        Ok(self.state)
    }
}
