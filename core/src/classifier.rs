//! Derives a worker's session state from its free-text output.
//!
//! The worker has no structured event stream; it only prints log lines. The
//! exact literals and patterns below are what the unmodified worker emits, so
//! they must match line-for-line. Parsing lives behind [`LineClassifier`] so a
//! structured protocol can replace it without touching [`SessionMachine`].

use std::fmt;

use herd_protocol::SessionState;
use regex_lite::Regex;

use crate::error::HerdErr;

/// Printed right before the worker lists its login URLs.
pub const LOGIN_CODE_MARKER: &str = "You can also scan QRCode in any website below:";
const LOGIN_URL_PREFIX: &str = "https://";
const SYNC_CHECK_MARKER: &str = "Unexpected sync check result: window.synccheck";

const LOGIN_SUCCESS_PATTERN: &str = concat!(
    r"\[INFO\]\[",
    r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\]\[",
    r"wechat_channel\.py:\d+\] - ",
    r"Wechat login success, user_id: @",
    r"[a-f0-9]+, nickname: (.+)",
);
const SYNC_CHECK_PATTERN: &str =
    r#"Unexpected sync check result: window\.synccheck=\{retcode:"(\d+)",selector:"(\d+)"\}"#;

/// Something a worker line tells us about its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSignal {
    LoginCodePresented,
    LoginUrl(String),
    LoginSucceeded { display_name: String },
    SessionInvalidated { retcode: String, selector: String },
}

/// Maps one output line to at most one [`WorkerSignal`].
pub trait LineClassifier: Send {
    fn classify(&mut self, line: &str) -> Option<WorkerSignal>;
}

/// Pattern matcher for the worker's plain-text log format.
pub struct TextLogClassifier {
    login_success: Regex,
    sync_check: Regex,
    /// True while consecutive lines after the marker are login URLs.
    capturing_urls: bool,
}

impl TextLogClassifier {
    pub fn new() -> Self {
        Self {
            login_success: compile(LOGIN_SUCCESS_PATTERN),
            sync_check: compile(SYNC_CHECK_PATTERN),
            capturing_urls: false,
        }
    }
}

impl Default for TextLogClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::expect_used)]
fn compile(pattern: &str) -> Regex {
    // Patterns are compile-time constants covered by tests.
    Regex::new(pattern).expect("static worker log pattern")
}

impl LineClassifier for TextLogClassifier {
    fn classify(&mut self, line: &str) -> Option<WorkerSignal> {
        if line == LOGIN_CODE_MARKER {
            self.capturing_urls = true;
            return Some(WorkerSignal::LoginCodePresented);
        }
        if self.capturing_urls && line.starts_with(LOGIN_URL_PREFIX) {
            return Some(WorkerSignal::LoginUrl(line.to_string()));
        }
        self.capturing_urls = false;

        if let Some(captures) = self.login_success.captures(line) {
            let display_name = captures.get(1).map_or("", |m| m.as_str()).to_string();
            return Some(WorkerSignal::LoginSucceeded { display_name });
        }
        if line.contains(SYNC_CHECK_MARKER)
            && let Some(captures) = self.sync_check.captures(line)
        {
            let group = |idx| captures.get(idx).map_or("", |m| m.as_str()).to_string();
            return Some(WorkerSignal::SessionInvalidated {
                retcode: group(1),
                selector: group(2),
            });
        }
        None
    }
}

/// Why an instance is going down. Only used for diagnostics; every cause
/// lands in the same [`SessionState::Dead`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathCause {
    LoginTimedOut,
    SessionInvalidated { retcode: String, selector: String },
    ProcessExited,
    Deleted,
    RegistryStopped,
    NeverReady,
}

impl fmt::Display for DeathCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeathCause::LoginTimedOut => write!(f, "waited too long for login"),
            DeathCause::SessionInvalidated { retcode, selector } => {
                write!(f, "session invalidated (retcode={retcode}, selector={selector})")
            }
            DeathCause::ProcessExited => write!(f, "worker process exited"),
            DeathCause::Deleted => write!(f, "deleted"),
            DeathCause::RegistryStopped => write!(f, "registry stopped"),
            DeathCause::NeverReady => write!(f, "worker never became ready"),
        }
    }
}

/// What the supervisor must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// The worker is awaiting login and has listed at least one login URL.
    Ready,
    /// Start the "waited too long for login" timer.
    ArmLoginTimer,
    Shutdown(DeathCause),
}

/// Session state of one worker plus the data captured alongside it.
pub struct SessionMachine {
    classifier: Box<dyn LineClassifier>,
    state: SessionState,
    login_artifacts: Vec<String>,
    display_name: String,
    ready: bool,
}

impl SessionMachine {
    pub fn new(classifier: Box<dyn LineClassifier>) -> Self {
        Self {
            classifier,
            state: SessionState::Dead,
            login_artifacts: Vec::new(),
            display_name: String::new(),
            ready: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn login_artifacts(&self) -> &[String] {
        &self.login_artifacts
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn observe_line(&mut self, line: &str) -> Vec<SessionEffect> {
        match self.classifier.classify(line) {
            Some(signal) => self.apply(signal),
            None => Vec::new(),
        }
    }

    pub fn apply(&mut self, signal: WorkerSignal) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        match signal {
            WorkerSignal::LoginCodePresented => {
                if self.state != SessionState::AwaitingLogin {
                    self.transition(SessionState::AwaitingLogin);
                    effects.push(SessionEffect::ArmLoginTimer);
                }
                self.login_artifacts.clear();
            }
            WorkerSignal::LoginUrl(url) => {
                if self.state == SessionState::AwaitingLogin {
                    self.login_artifacts.push(url);
                    if !self.ready {
                        self.ready = true;
                        effects.push(SessionEffect::Ready);
                    }
                }
            }
            WorkerSignal::LoginSucceeded { display_name } => {
                if self.state == SessionState::AwaitingLogin {
                    self.display_name = display_name;
                    self.transition(SessionState::Active);
                }
            }
            WorkerSignal::SessionInvalidated { retcode, selector } => {
                if self.state == SessionState::Active {
                    self.transition(SessionState::Dead);
                    effects.push(SessionEffect::Shutdown(DeathCause::SessionInvalidated {
                        retcode,
                        selector,
                    }));
                }
            }
        }
        effects
    }

    /// Called when the login timer fires. No-op unless still awaiting login.
    pub fn login_deadline_elapsed(&mut self) -> Option<SessionEffect> {
        if self.state != SessionState::AwaitingLogin {
            return None;
        }
        self.transition(SessionState::Dead);
        Some(SessionEffect::Shutdown(DeathCause::LoginTimedOut))
    }

    pub fn mark_dead(&mut self) {
        self.transition(SessionState::Dead);
    }

    /// Validates a pause/resume target. Returns whether the request applies
    /// to the current state; sessions that are not logged in ignore it.
    pub fn check_toggle(&self, target: SessionState) -> Result<bool, HerdErr> {
        if !target.is_toggle_target() {
            return Err(HerdErr::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        Ok(matches!(
            self.state,
            SessionState::Active | SessionState::ActivePaused
        ))
    }

    /// Records the worker's effective message-handling flag.
    pub fn set_handling_messages(&mut self, active: bool) {
        let target = if active {
            SessionState::Active
        } else {
            SessionState::ActivePaused
        };
        self.transition(target);
    }

    fn transition(&mut self, to: SessionState) {
        if self.state == SessionState::AwaitingLogin && to != SessionState::AwaitingLogin {
            self.login_artifacts.clear();
        }
        if self.state != to {
            tracing::debug!(from = %self.state, to = %to, "session state transition");
        }
        self.state = to;
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new(Box::new(TextLogClassifier::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    const LOGIN_ALICE: &str = "[INFO][2024-05-01 12:30:45][wechat_channel.py:123] - Wechat login success, user_id: @0fa3c9, nickname: Alice";
    const SYNC_CHECK_FAILED: &str = r#"[ERROR][2024-05-01 13:00:00][login.py:309] - Unexpected sync check result: window.synccheck={retcode:"1101",selector:"0"}"#;

    fn feed(machine: &mut SessionMachine, lines: &[&str]) -> Vec<SessionEffect> {
        lines
            .iter()
            .flat_map(|line| machine.observe_line(line))
            .collect()
    }

    fn logged_in() -> SessionMachine {
        let mut machine = SessionMachine::default();
        feed(&mut machine, &[LOGIN_CODE_MARKER, "https://login.example/qr?1", LOGIN_ALICE]);
        assert_eq!(machine.state(), SessionState::Active);
        machine
    }

    #[test]
    fn marker_then_urls_captures_only_the_contiguous_run() {
        let mut machine = SessionMachine::default();
        let effects = feed(
            &mut machine,
            &[
                "booting worker",
                LOGIN_CODE_MARKER,
                "https://login.example/qr?1",
                "https://login.example/qr?2",
                "Waiting for scan...",
                "https://login.example/qr?3",
            ],
        );

        assert_eq!(
            effects,
            vec![SessionEffect::ArmLoginTimer, SessionEffect::Ready]
        );
        assert_eq!(machine.state(), SessionState::AwaitingLogin);
        assert_eq!(
            machine.login_artifacts(),
            ["https://login.example/qr?1", "https://login.example/qr?2"]
        );
    }

    #[test]
    fn ready_waits_for_the_first_url_and_fires_once() {
        let mut machine = SessionMachine::default();
        assert_eq!(
            feed(&mut machine, &[LOGIN_CODE_MARKER]),
            vec![SessionEffect::ArmLoginTimer]
        );
        assert_eq!(
            feed(&mut machine, &["https://login.example/qr?1"]),
            vec![SessionEffect::Ready]
        );
        let again = feed(&mut machine, &[LOGIN_CODE_MARKER, "https://login.example/qr?2"]);
        assert!(again.is_empty());
    }

    #[test]
    fn next_marker_clears_urls_without_rearming() {
        let mut machine = SessionMachine::default();
        feed(&mut machine, &[LOGIN_CODE_MARKER, "https://login.example/qr?1"]);
        let effects = feed(&mut machine, &[LOGIN_CODE_MARKER]);
        assert!(effects.is_empty());
        assert!(machine.login_artifacts().is_empty());

        feed(&mut machine, &["https://login.example/qr?9"]);
        assert_eq!(machine.login_artifacts(), ["https://login.example/qr?9"]);
    }

    #[test]
    fn login_success_sets_display_name_and_clears_urls() {
        let machine = logged_in();
        assert_eq!(machine.display_name(), "Alice");
        assert!(machine.login_artifacts().is_empty());
    }

    #[test]
    fn login_line_is_ignored_before_a_login_code() {
        let mut machine = SessionMachine::default();
        feed(&mut machine, &[LOGIN_ALICE]);
        assert_eq!(machine.state(), SessionState::Dead);
        assert_eq!(machine.display_name(), "");
    }

    #[test]
    fn sync_check_failure_kills_an_active_session() {
        let mut machine = logged_in();
        let effects = feed(&mut machine, &[SYNC_CHECK_FAILED]);
        assert_eq!(machine.state(), SessionState::Dead);
        assert_matches!(
            effects.as_slice(),
            [SessionEffect::Shutdown(DeathCause::SessionInvalidated { retcode, selector })]
                if retcode == "1101" && selector == "0"
        );
    }

    #[test]
    fn sync_check_failure_is_ignored_while_awaiting_login() {
        let mut machine = SessionMachine::default();
        let effects = feed(&mut machine, &[LOGIN_CODE_MARKER, SYNC_CHECK_FAILED]);
        assert_eq!(effects, vec![SessionEffect::ArmLoginTimer]);
        assert_eq!(machine.state(), SessionState::AwaitingLogin);
    }

    #[test]
    fn sync_check_marker_without_codes_is_not_a_failure() {
        let mut machine = logged_in();
        let effects = feed(
            &mut machine,
            &["Unexpected sync check result: window.synccheck={retcode:\"x\"}"],
        );
        assert!(effects.is_empty());
        assert_eq!(machine.state(), SessionState::Active);
    }

    #[test]
    fn login_timer_only_fires_while_waiting() {
        let mut machine = SessionMachine::default();
        feed(&mut machine, &[LOGIN_CODE_MARKER, "https://login.example/qr?1"]);
        assert_eq!(
            machine.login_deadline_elapsed(),
            Some(SessionEffect::Shutdown(DeathCause::LoginTimedOut))
        );
        assert_eq!(machine.state(), SessionState::Dead);
        assert!(machine.login_artifacts().is_empty());

        let mut active = logged_in();
        assert_eq!(active.login_deadline_elapsed(), None);
        assert_eq!(active.state(), SessionState::Active);
    }

    #[test]
    fn pause_and_resume_round_trip() {
        let mut machine = logged_in();
        assert_matches!(machine.check_toggle(SessionState::ActivePaused), Ok(true));
        machine.set_handling_messages(false);
        assert_eq!(machine.state(), SessionState::ActivePaused);

        assert_matches!(machine.check_toggle(SessionState::Active), Ok(true));
        machine.set_handling_messages(true);
        assert_eq!(machine.state(), SessionState::Active);
        assert_eq!(machine.display_name(), "Alice");
        assert!(machine.login_artifacts().is_empty());
    }

    #[test]
    fn toggle_rejects_other_targets_and_ignores_other_states() {
        let machine = logged_in();
        assert_matches!(
            machine.check_toggle(SessionState::Dead),
            Err(HerdErr::InvalidTransition {
                from: SessionState::Active,
                to: SessionState::Dead,
            })
        );

        let mut waiting = SessionMachine::default();
        feed(&mut waiting, &[LOGIN_CODE_MARKER]);
        assert_matches!(waiting.check_toggle(SessionState::Active), Ok(false));
        assert_matches!(
            waiting.check_toggle(SessionState::AwaitingLogin),
            Err(HerdErr::InvalidTransition { .. })
        );
    }

    #[test]
    fn paused_session_ignores_sync_check_failures() {
        let mut machine = logged_in();
        machine.set_handling_messages(false);

        assert_eq!(feed(&mut machine, &[SYNC_CHECK_FAILED]), Vec::new());
        assert_eq!(machine.state(), SessionState::ActivePaused);
        assert_eq!(machine.display_name(), "Alice");

        machine.set_handling_messages(true);
        assert_matches!(
            feed(&mut machine, &[SYNC_CHECK_FAILED]).as_slice(),
            [SessionEffect::Shutdown(DeathCause::SessionInvalidated { .. })]
        );
        assert_eq!(machine.state(), SessionState::Dead);
    }
}
