use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Session state of one supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Dead,
    AwaitingLogin,
    Active,
    ActivePaused,
}

impl SessionState {
    /// Numeric status code used by the legacy management API.
    pub fn code(self) -> i32 {
        match self {
            SessionState::Dead => -1,
            SessionState::AwaitingLogin => 0,
            SessionState::Active => 1,
            SessionState::ActivePaused => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(SessionState::Dead),
            0 => Some(SessionState::AwaitingLogin),
            1 => Some(SessionState::Active),
            2 => Some(SessionState::ActivePaused),
            _ => None,
        }
    }

    /// Whether `update` may target this state.
    pub fn is_toggle_target(self) -> bool {
        matches!(self, SessionState::Active | SessionState::ActivePaused)
    }
}
