//! Broadcastable job snapshot.

use serde::{Deserialize, Serialize};

use cms_core::ValueObject;

use crate::progress::Progress;
use crate::status::Status;

/// Immutable snapshot of a job's status, progress and error.
///
/// This is the only type that crosses the pub/sub boundary. Progress is kept
/// only for `InProgress`; processed/total mean nothing once a job has settled
/// or before it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ValueObject for State {}

impl State {
    pub fn new(status: Status, progress: Option<Progress>, error: Option<String>) -> Self {
        let progress = match status {
            Status::InProgress => progress,
            _ => None,
        };
        Self {
            status,
            progress,
            error,
        }
    }

    pub fn in_progress(processed: u64, total: u64) -> Self {
        Self::new(Status::InProgress, Some(Progress::new(processed, total)), None)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn progress(&self) -> Option<&Progress> {
        self.progress.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

impl From<Status> for State {
    fn from(status: Status) -> Self {
        Self::new(status, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_survives_only_in_progress() {
        let p = Some(Progress::new(3, 9));
        for status in Status::ALL {
            let state = State::new(status, p, None);
            assert_eq!(state.progress().is_some(), status == Status::InProgress, "{status}");
        }
    }

    #[test]
    fn serializes_without_absent_fields() {
        let json = serde_json::to_value(State::from(Status::Completed)).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "completed" }));

        let json = serde_json::to_value(State::in_progress(10, 100)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "in_progress",
                "progress": { "processed": 10, "total": 100 }
            })
        );
    }

    #[test]
    fn finished_follows_status() {
        assert!(!State::in_progress(1, 2).is_finished());
        assert!(State::new(Status::Failed, None, Some("boom".into())).is_finished());
    }
}
