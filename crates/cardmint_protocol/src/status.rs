//! Scan-job status machine.
//!
//! Statuses advance forward through the pipeline with narrow back-edges;
//! anything else is rejected with `INVALID_TRANSITION` before any mutation
//! reaches the store.

use serde::{Deserialize, Serialize};

/// Lifecycle states of a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, awaiting a worker.
    Queued,
    /// Capture in flight (two-stage front/back flow).
    Capturing,
    /// Raw image present.
    Captured,
    /// Awaiting back-side capture. Operator-initiated only.
    BackImage,
    /// Image normalization, resize, orientation.
    Preprocessing,
    /// Extraction in flight.
    Inferencing,
    /// Resolver has produced candidates.
    CandidatesReady,
    /// Awaiting operator decision.
    OperatorPending,
    /// Resolver returned nothing above the acceptance floor.
    UnmatchedNoReasonableCandidate,
    /// Terminal: operator locked the truth core.
    Accepted,
    /// Terminal: operator flagged for later.
    Flagged,
    /// Terminal: system-initiated review request.
    NeedsReview,
    /// Terminal: fatal error after retries.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 13] = [
        JobStatus::Queued,
        JobStatus::Capturing,
        JobStatus::Captured,
        JobStatus::BackImage,
        JobStatus::Preprocessing,
        JobStatus::Inferencing,
        JobStatus::CandidatesReady,
        JobStatus::OperatorPending,
        JobStatus::UnmatchedNoReasonableCandidate,
        JobStatus::Accepted,
        JobStatus::Flagged,
        JobStatus::NeedsReview,
        JobStatus::Failed,
    ];

    /// Canonical string stored in the database and shown on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Capturing => "CAPTURING",
            JobStatus::Captured => "CAPTURED",
            JobStatus::BackImage => "BACK_IMAGE",
            JobStatus::Preprocessing => "PREPROCESSING",
            JobStatus::Inferencing => "INFERENCING",
            JobStatus::CandidatesReady => "CANDIDATES_READY",
            JobStatus::OperatorPending => "OPERATOR_PENDING",
            JobStatus::UnmatchedNoReasonableCandidate => "UNMATCHED_NO_REASONABLE_CANDIDATE",
            JobStatus::Accepted => "ACCEPTED",
            JobStatus::Flagged => "FLAGGED",
            JobStatus::NeedsReview => "NEEDS_REVIEW",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<JobStatus> {
        JobStatus::ALL.iter().copied().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Accepted | JobStatus::Flagged | JobStatus::NeedsReview | JobStatus::Failed
        )
    }

    /// Valid successor states.
    ///
    /// FAILED is reachable from every non-terminal state on a non-retriable
    /// error, so it is listed on each of them. OPERATOR_PENDING can re-enter
    /// INFERENCING on an explicit re-scan command.
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Queued => &[JobStatus::Capturing, JobStatus::Captured, JobStatus::Failed],
            JobStatus::Capturing => &[JobStatus::Captured, JobStatus::Failed],
            JobStatus::Captured => &[
                JobStatus::BackImage,
                JobStatus::Preprocessing,
                JobStatus::Failed,
            ],
            JobStatus::BackImage => &[JobStatus::Preprocessing, JobStatus::Failed],
            JobStatus::Preprocessing => &[JobStatus::Inferencing, JobStatus::Failed],
            JobStatus::Inferencing => &[
                JobStatus::CandidatesReady,
                JobStatus::UnmatchedNoReasonableCandidate,
                JobStatus::Failed,
            ],
            JobStatus::CandidatesReady => &[JobStatus::OperatorPending, JobStatus::Failed],
            JobStatus::OperatorPending => &[
                JobStatus::Accepted,
                JobStatus::Flagged,
                JobStatus::NeedsReview,
                JobStatus::Inferencing,
                JobStatus::Failed,
            ],
            JobStatus::UnmatchedNoReasonableCandidate => &[
                JobStatus::OperatorPending,
                JobStatus::NeedsReview,
                JobStatus::Failed,
            ],
            JobStatus::Accepted
            | JobStatus::Flagged
            | JobStatus::NeedsReview
            | JobStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_round_trips() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for status in JobStatus::ALL {
            if status.is_terminal() {
                assert!(status.valid_transitions().is_empty(), "{status}");
            } else {
                assert!(
                    status.can_transition_to(JobStatus::Failed),
                    "{status} must be able to fail"
                );
            }
        }
    }

    #[test]
    fn happy_path_edges() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Capturing));
        assert!(JobStatus::Capturing.can_transition_to(JobStatus::Captured));
        assert!(JobStatus::Captured.can_transition_to(JobStatus::Preprocessing));
        assert!(JobStatus::Preprocessing.can_transition_to(JobStatus::Inferencing));
        assert!(JobStatus::Inferencing.can_transition_to(JobStatus::CandidatesReady));
        assert!(JobStatus::CandidatesReady.can_transition_to(JobStatus::OperatorPending));
        assert!(JobStatus::OperatorPending.can_transition_to(JobStatus::Accepted));
    }

    #[test]
    fn rescan_is_the_only_back_edge_from_operator_pending() {
        assert!(JobStatus::OperatorPending.can_transition_to(JobStatus::Inferencing));
        assert!(!JobStatus::OperatorPending.can_transition_to(JobStatus::Preprocessing));
        assert!(!JobStatus::OperatorPending.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn back_image_is_optional() {
        assert!(JobStatus::Captured.can_transition_to(JobStatus::BackImage));
        assert!(JobStatus::Captured.can_transition_to(JobStatus::Preprocessing));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::BackImage));
    }

    #[test]
    fn illegal_edges_rejected() {
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Accepted));
        assert!(!JobStatus::Accepted.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Inferencing.can_transition_to(JobStatus::OperatorPending));
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&JobStatus::CandidatesReady).unwrap();
        assert_eq!(json, "\"CANDIDATES_READY\"");
        let back: JobStatus =
            serde_json::from_str("\"UNMATCHED_NO_REASONABLE_CANDIDATE\"").unwrap();
        assert_eq!(back, JobStatus::UnmatchedNoReasonableCandidate);
    }
}
