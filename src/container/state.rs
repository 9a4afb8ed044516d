//! Container runtime state and its transition function

use crate::error::{HullError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Container status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Container is created but has never run
    #[default]
    Created,
    /// Container process is running
    Running,
    /// Container process is frozen
    Paused,
    /// Container is being restarted by its restart policy
    Restarting,
    /// Container was stopped through the API
    Stopped,
    /// Container process exited on its own
    Exited,
    /// Container is being removed; terminal
    Dead,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Restarting => "restarting",
            Status::Stopped => "stopped",
            Status::Exited => "exited",
            Status::Dead => "dead",
        }
    }

    /// Whether `to` is reachable from `self`.
    ///
    /// A repeated terminal transition (Exited -> Exited, Stopped -> Exited) is
    /// allowed so that an exit event racing a Stop is not an error.
    pub fn can_transition(&self, to: Status) -> bool {
        use Status::*;
        match (*self, to) {
            (Dead, _) => false,
            (_, Dead) => true,
            (Created, Running) => true,
            (Running, Paused | Stopped | Exited | Restarting) => true,
            (Paused, Running | Stopped | Exited) => true,
            (Restarting, Running | Stopped | Exited) => true,
            (Stopped | Exited, Running | Restarting | Stopped | Exited) => true,
            _ => false,
        }
    }

    /// Statuses a container can be started from
    pub fn is_startable(&self) -> bool {
        matches!(self, Status::Created | Status::Stopped | Status::Exited)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = HullError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Status::Created),
            "running" => Ok(Status::Running),
            "paused" => Ok(Status::Paused),
            "restarting" => Ok(Status::Restarting),
            "stopped" => Ok(Status::Stopped),
            "exited" => Ok(Status::Exited),
            "dead" => Ok(Status::Dead),
            other => Err(HullError::InvalidParam(format!("unknown status {}", other))),
        }
    }
}

/// Boolean view of the status, as reported by inspect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusFlags {
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    pub exited: bool,
    pub dead: bool,
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
}

/// Mutable runtime state of a container.
///
/// Fields are private: every status change goes through [`State::transition`]
/// so the reported flags can never disagree with `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    status: Status,
    pid: u32,
    exit_code: i64,
    error: String,
    oom_killed: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn oom_killed(&self) -> bool {
        self.oom_killed
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_running(&self) -> bool {
        self.status == Status::Running
    }

    pub fn is_paused(&self) -> bool {
        self.status == Status::Paused
    }

    pub fn is_dead(&self) -> bool {
        self.status == Status::Dead
    }

    /// Running or paused: a live process exists
    pub fn is_alive(&self) -> bool {
        matches!(self.status, Status::Running | Status::Paused)
    }

    pub fn flags(&self) -> StatusFlags {
        StatusFlags {
            running: self.status == Status::Running,
            paused: self.status == Status::Paused,
            restarting: self.status == Status::Restarting,
            exited: matches!(self.status, Status::Exited | Status::Stopped),
            dead: self.status == Status::Dead,
            oom_killed: self.oom_killed,
        }
    }

    /// The single state-transition function.
    fn transition(&mut self, to: Status) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(HullError::InvalidState(format!(
                "cannot transition from {} to {}",
                self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    pub fn set_running(&mut self, pid: u32) -> Result<()> {
        self.transition(Status::Running)?;
        self.pid = pid;
        self.exit_code = 0;
        self.error.clear();
        self.oom_killed = false;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn set_paused(&mut self) -> Result<()> {
        self.transition(Status::Paused)
    }

    pub fn set_unpaused(&mut self) -> Result<()> {
        if self.status != Status::Paused {
            return Err(HullError::InvalidState(format!(
                "container is {}, not paused",
                self.status
            )));
        }
        self.transition(Status::Running)
    }

    pub fn set_restarting(&mut self) -> Result<()> {
        self.transition(Status::Restarting)
    }

    /// Stopped through the API
    pub fn set_stopped(&mut self, exit_code: i64, finished_at: DateTime<Utc>) -> Result<()> {
        self.transition(Status::Stopped)?;
        self.pid = 0;
        self.exit_code = exit_code;
        self.finished_at = Some(finished_at);
        Ok(())
    }

    /// Exited on its own, as reported by the runtime
    pub fn set_exited(&mut self, exit_code: i64, finished_at: DateTime<Utc>) -> Result<()> {
        self.transition(Status::Exited)?;
        self.pid = 0;
        self.exit_code = exit_code;
        self.finished_at = Some(finished_at);
        Ok(())
    }

    pub fn set_dead(&mut self) -> Result<()> {
        if self.status == Status::Dead {
            return Ok(());
        }
        self.transition(Status::Dead)?;
        self.pid = 0;
        Ok(())
    }

    /// Record an error without changing status
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = error.into();
    }

    pub fn set_oom_killed(&mut self) {
        self.oom_killed = true;
    }

    /// Human readable status, e.g. `Up 3 minutes` or `Exited (0) 2 hours ago`
    pub fn format_status(&self, now: DateTime<Utc>) -> String {
        match self.status {
            Status::Created => "Created".to_string(),
            Status::Running => format!("Up {}", humanize(self.started_at, now)),
            Status::Paused => format!("Up {} (Paused)", humanize(self.started_at, now)),
            Status::Restarting => format!(
                "Restarting ({}) {} ago",
                self.exit_code,
                humanize(self.finished_at, now)
            ),
            Status::Stopped => format!(
                "Stopped ({}) {} ago",
                self.exit_code,
                humanize(self.finished_at, now)
            ),
            Status::Exited => format!(
                "Exited ({}) {} ago",
                self.exit_code,
                humanize(self.finished_at, now)
            ),
            Status::Dead => "Dead".to_string(),
        }
    }
}

fn humanize(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(since) = since else {
        return "Less than a second".to_string();
    };
    let secs = (now - since).num_seconds().max(0);
    match secs {
        0 => "Less than a second".to_string(),
        1 => "1 second".to_string(),
        s if s < 60 => format!("{} seconds", s),
        s if s < 120 => "About a minute".to_string(),
        s if s < 3600 => format!("{} minutes", s / 60),
        s if s < 7200 => "About an hour".to_string(),
        s if s < 48 * 3600 => format!("{} hours", s / 3600),
        s => format!("{} days", s / 86400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn active_flags(state: &State) -> usize {
        let f = state.flags();
        [f.running, f.paused, f.restarting, f.exited, f.dead]
            .iter()
            .filter(|b| **b)
            .count()
    }

    #[test]
    fn test_lifecycle_flags_follow_status() {
        let mut state = State::new();
        assert_eq!(state.status(), Status::Created);
        assert_eq!(active_flags(&state), 0);

        state.set_running(42).unwrap();
        assert!(state.flags().running);
        assert_eq!(state.pid(), 42);
        assert_eq!(active_flags(&state), 1);

        state.set_paused().unwrap();
        assert!(state.flags().paused);
        assert_eq!(active_flags(&state), 1);

        state.set_unpaused().unwrap();
        state.set_stopped(143, Utc::now()).unwrap();
        assert!(state.flags().exited);
        assert_eq!(state.pid(), 0);
        assert_eq!(state.exit_code(), 143);
        assert_eq!(active_flags(&state), 1);

        state.set_dead().unwrap();
        assert!(state.flags().dead);
        assert_eq!(active_flags(&state), 1);
    }

    #[test]
    fn test_dead_is_terminal() {
        let mut state = State::new();
        state.set_dead().unwrap();
        assert!(state.set_running(1).is_err());
        assert!(state.set_exited(0, Utc::now()).is_err());
        assert!(state.set_dead().is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = State::new();
        assert!(matches!(state.set_paused(), Err(HullError::InvalidState(_))));
        assert!(state.set_unpaused().is_err());
        state.set_running(7).unwrap();
        assert!(state.set_running(8).is_err());
    }

    #[test]
    fn test_exit_after_stop_is_accepted() {
        let mut state = State::new();
        state.set_running(7).unwrap();
        state.set_stopped(0, Utc::now()).unwrap();
        assert!(state.set_exited(0, Utc::now()).is_ok());
    }

    #[test]
    fn test_error_does_not_change_status() {
        let mut state = State::new();
        state.set_error("failed to mount rootfs");
        assert_eq!(state.status(), Status::Created);
        assert_eq!(state.error(), "failed to mount rootfs");
        state.set_running(3).unwrap();
        assert!(state.error().is_empty());
    }

    #[test]
    fn test_format_status() {
        let mut state = State::new();
        let now = Utc::now();
        assert_eq!(state.format_status(now), "Created");

        state.set_running(1).unwrap();
        let later = state.started_at().unwrap() + Duration::minutes(3);
        assert_eq!(state.format_status(later), "Up 3 minutes");

        let finished = Utc::now();
        state.set_exited(2, finished).unwrap();
        assert_eq!(
            state.format_status(finished + Duration::hours(2)),
            "Exited (2) 2 hours ago"
        );
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("running".parse::<Status>().unwrap(), Status::Running);
        assert!("sleeping".parse::<Status>().is_err());
    }
}
