use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a submission, from upload to a terminal evaluation outcome.
///
/// Stored and exposed through the stable short codes returned by [`SubmissionStatus::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Submitted,
    SubmittedForRebuild,
    Rebuilding,
    Validated,
    ValidatedRebuilt,
    Failed,
    AbortedByTimeout,
    TooMuchOutput,
    IllegalAccess,
    Deleted,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("unknown submission status code '{0}'")]
    UnknownCode(String),
    #[error("illegal status transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: SubmissionStatus,
        to: SubmissionStatus,
    },
}

impl SubmissionStatus {
    pub const ALL: [SubmissionStatus; 10] = [
        Self::Submitted,
        Self::SubmittedForRebuild,
        Self::Rebuilding,
        Self::Validated,
        Self::ValidatedRebuilt,
        Self::Failed,
        Self::AbortedByTimeout,
        Self::TooMuchOutput,
        Self::IllegalAccess,
        Self::Deleted,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::Submitted => "S",
            Self::SubmittedForRebuild => "SR",
            Self::Rebuilding => "R",
            Self::Validated => "V",
            Self::ValidatedRebuilt => "VR",
            Self::Failed => "F",
            Self::AbortedByTimeout => "AT",
            Self::TooMuchOutput => "TO",
            Self::IllegalAccess => "IA",
            Self::Deleted => "D",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, StatusError> {
        Self::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .ok_or_else(|| StatusError::UnknownCode(code.to_string()))
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Submitted => "Submitted",
            Self::SubmittedForRebuild => "Submitted for rebuild",
            Self::Rebuilding => "Rebuilding",
            Self::Validated => "Validated",
            Self::ValidatedRebuilt => "Validated (Rebuilt)",
            Self::Failed => "Failed",
            Self::AbortedByTimeout => "Aborted by Timeout",
            Self::TooMuchOutput => "Too much output",
            Self::IllegalAccess => "Illegal Access",
            Self::Deleted => "Deleted",
        }
    }

    /// The submission still waits for (or is in the middle of) a build.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::SubmittedForRebuild | Self::Rebuilding
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }

    /// Outcome of a completed build, as opposed to a deletion.
    pub fn is_build_outcome(self) -> bool {
        matches!(
            self,
            Self::Validated
                | Self::ValidatedRebuilt
                | Self::Failed
                | Self::AbortedByTimeout
                | Self::TooMuchOutput
                | Self::IllegalAccess
        )
    }

    pub fn can_transition_to(self, next: SubmissionStatus) -> bool {
        use SubmissionStatus::*;

        if self == next {
            return true;
        }

        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (SubmittedForRebuild, Rebuilding) => true,
            (Submitted, Validated) => true,
            (SubmittedForRebuild | Rebuilding, ValidatedRebuilt) => true,
            (
                Submitted | SubmittedForRebuild | Rebuilding,
                Failed | AbortedByTimeout | TooMuchOutput | IllegalAccess,
            ) => true,
            (from, SubmittedForRebuild) => from.is_build_outcome(),
            _ => false,
        }
    }

    /// Returns `next` when the move is allowed, otherwise an error naming both ends.
    pub fn transition(self, next: SubmissionStatus) -> Result<SubmissionStatus, StatusError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StatusError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}
