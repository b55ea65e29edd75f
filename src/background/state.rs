use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    #[default]
    Idle,
    /// Request handed to the scheduler, no grant yet.
    Submitted,
    Running,
    /// User stop in progress; an expiration arriving now still wins.
    Stopping,
    Completed,
    Expired,
}

impl TaskStatus {
    /// A request or grant is outstanding.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Submitted | TaskStatus::Running | TaskStatus::Stopping
        )
    }

    /// A grant arriving now may start collecting. Any other state means the request was
    /// already withdrawn or settled.
    pub fn accepts_grant(&self) -> bool {
        matches!(self, TaskStatus::Idle | TaskStatus::Submitted)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub status: TaskStatus,
    pub outcome: Option<TaskOutcome>,
    pub session_id: Option<String>,
    pub granted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&mut self) {
        *self = Self {
            status: TaskStatus::Submitted,
            ..Self::default()
        };
    }

    pub fn begin(&mut self, granted_at: DateTime<Utc>) {
        *self = Self {
            status: TaskStatus::Running,
            granted_at: Some(granted_at),
            ..Self::default()
        };
    }

    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Expired;
        self.outcome = Some(TaskOutcome::Failed);
        self.finished_at = Some(now);
    }

    pub fn begin_stop(&mut self) {
        self.status = TaskStatus::Stopping;
    }

    /// Settles a user stop. `false` when an expiration overtook it.
    pub fn finish_stop(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Stopping {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.outcome = Some(TaskOutcome::Succeeded);
        self.finished_at = Some(now);
        true
    }

    /// The user stopped before any grant arrived.
    pub fn withdraw(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.outcome = Some(TaskOutcome::Succeeded);
        self.finished_at = Some(now);
    }

    /// The grant could not start collecting.
    pub fn fail(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.outcome = Some(TaskOutcome::Failed);
        self.finished_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_overtaken_by_expiration_is_not_a_success() {
        let now = Utc::now();
        let mut state = TaskState::new();
        state.begin(now);
        state.begin_stop();
        state.expire(now);

        assert!(!state.finish_stop(now));
        assert_eq!(state.status, TaskStatus::Expired);
        assert_eq!(state.outcome, Some(TaskOutcome::Failed));
    }

    #[test]
    fn test_withdrawn_request_refuses_grants() {
        let mut state = TaskState::new();
        assert!(state.status.accepts_grant());
        state.submitted();
        assert!(state.status.accepts_grant());

        state.withdraw(Utc::now());
        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.outcome, Some(TaskOutcome::Succeeded));
        assert!(!state.status.accepts_grant());
        assert!(!state.status.is_active());
    }

    #[test]
    fn test_clean_stop_succeeds() {
        let now = Utc::now();
        let mut state = TaskState::new();
        state.submitted();
        assert!(state.status.is_active());
        state.begin(now);
        state.session_id = Some("s".into());
        state.begin_stop();

        assert!(state.finish_stop(now));
        assert_eq!(state.outcome, Some(TaskOutcome::Succeeded));
        assert!(!state.status.is_active());
        assert_eq!(state.session_id.as_deref(), Some("s"));
    }
}
