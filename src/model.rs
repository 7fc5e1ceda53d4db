use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::create_timestamp;
use crate::status::{StatusError, SubmissionStatus};

/// Class-name prefix of the tests shipped by the teacher.
pub const TEACHER_TEST_NAME_PREFIX: &str = "TestTeacher";
/// Class-name prefix of the teacher tests that students never see.
pub const TEACHER_HIDDEN_TEST_NAME_PREFIX: &str = "TestTeacherHidden";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Language {
    #[default]
    Java,
    Kotlin,
}

impl Language {
    /// Source folder name under `src/main` and `src/test`.
    pub fn source_folder(self) -> &'static str {
        match self {
            Self::Java => "java",
            Self::Kotlin => "kotlin",
        }
    }
}

/// How much students may learn about the hidden teacher tests.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestVisibility {
    HideEverything,
    ShowOkNok,
    ShowProgress,
}

/// Grading settings of an assignment. Read-only for the pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Assignment {
    pub id: String,
    pub name: String,
    pub package_name: Option<String>,
    #[serde(default)]
    pub language: Language,
    pub max_memory_mb: Option<u32>,
    #[serde(default)]
    pub accepts_student_tests: bool,
    pub min_student_tests: Option<u32>,
    #[serde(default)]
    pub calculate_student_tests_coverage: bool,
    pub mandatory_tests_suffix: Option<String>,
    pub hidden_tests_visibility: Option<TestVisibility>,
    /// Folder holding the reference solution, used by the assignment self-check.
    pub folder: Option<PathBuf>,
}

impl Assignment {
    pub fn package(&self) -> &str {
        self.package_name.as_deref().unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Submission {
    pub id: i64,
    pub assignment_id: String,
    pub group_id: i64,
    pub submitter_user_id: String,
    pub submission_folder: String,
    pub submission_date: String,
    pub status: SubmissionStatus,
    pub status_date: String,
    pub build_report_id: Option<i64>,
    pub coverage: Option<i64>,
    pub marked_as_final: bool,
    pub git_submission_id: Option<i64>,
}

impl Submission {
    /// Moves the submission to `status`, refreshing the status date unless
    /// `keep_status_date` is set.
    pub fn set_status(
        &mut self,
        status: SubmissionStatus,
        keep_status_date: bool,
    ) -> Result<(), StatusError> {
        self.status = self.status.transition(status)?;
        if !keep_status_date {
            self.status_date = create_timestamp();
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Indicator {
    ProjectStructure,
    Compilation,
    Checkstyle,
    StudentUnitTests,
    TeacherUnitTests,
    HiddenUnitTests,
}

impl Indicator {
    pub const ALL: [Indicator; 6] = [
        Self::ProjectStructure,
        Self::Compilation,
        Self::Checkstyle,
        Self::StudentUnitTests,
        Self::TeacherUnitTests,
        Self::HiddenUnitTests,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::ProjectStructure => "PS",
            Self::Compilation => "C",
            Self::Checkstyle => "CS",
            Self::StudentUnitTests => "ST",
            Self::TeacherUnitTests => "TT",
            Self::HiddenUnitTests => "HT",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.code() == code)
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::ProjectStructure => "Fields, methods and class structure",
            Self::Compilation => "Compilation",
            Self::Checkstyle => "Code Quality",
            Self::StudentUnitTests => "Student Unit Tests",
            Self::TeacherUnitTests => "Teacher Unit Tests",
            Self::HiddenUnitTests => "Hidden Unit Tests",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorValue {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NOK")]
    NotOk,
    #[serde(rename = "Not Enough Tests")]
    NotEnoughTests,
}

impl IndicatorValue {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NotOk => "NOK",
            Self::NotEnoughTests => "Not Enough Tests",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OK" => Some(Self::Ok),
            "NOK" => Some(Self::NotOk),
            "Not Enough Tests" => Some(Self::NotEnoughTests),
            _ => None,
        }
    }

    pub fn from_ok(ok: bool) -> Self {
        if ok { Self::Ok } else { Self::NotOk }
    }
}

/// One persisted indicator of a submission, with an optional progress bar.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorRecord {
    pub indicator: Indicator,
    pub value: IndicatorValue,
    pub progress: Option<u32>,
    pub goal: Option<u32>,
}

impl IndicatorRecord {
    pub fn new(indicator: Indicator, value: IndicatorValue) -> Self {
        Self {
            indicator,
            value,
            progress: None,
            goal: None,
        }
    }

    pub fn with_progress(mut self, progress: u32, goal: u32) -> Self {
        self.progress = Some(progress);
        self.goal = Some(goal);
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GitSubmission {
    pub id: i64,
    pub group_id: i64,
    pub assignment_id: String,
    pub git_repository_url: String,
    pub last_submission_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(status: SubmissionStatus) -> Submission {
        Submission {
            id: 1,
            assignment_id: "sample".to_string(),
            group_id: 1,
            submitter_user_id: "student1".to_string(),
            submission_folder: "/tmp/sub".to_string(),
            submission_date: "2024-01-01T00:00:00.000Z".to_string(),
            status,
            status_date: "2024-01-01T00:00:00.000Z".to_string(),
            build_report_id: None,
            coverage: None,
            marked_as_final: false,
            git_submission_id: None,
        }
    }

    #[test]
    fn test_set_status_updates_date() {
        let mut s = submission(SubmissionStatus::Submitted);
        s.set_status(SubmissionStatus::Validated, false).unwrap();
        assert_eq!(s.status, SubmissionStatus::Validated);
        assert_ne!(s.status_date, "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_set_status_keeps_date() {
        let mut s = submission(SubmissionStatus::Rebuilding);
        s.set_status(SubmissionStatus::ValidatedRebuilt, true).unwrap();
        assert_eq!(s.status_date, "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_set_status_rejects_illegal_move() {
        let mut s = submission(SubmissionStatus::Deleted);
        assert!(s.set_status(SubmissionStatus::Validated, false).is_err());
        assert_eq!(s.status, SubmissionStatus::Deleted);
    }

    #[test]
    fn test_indicator_codes() {
        for indicator in Indicator::ALL {
            assert_eq!(Indicator::from_code(indicator.code()), Some(indicator));
        }
        assert_eq!(
            IndicatorValue::parse("Not Enough Tests"),
            Some(IndicatorValue::NotEnoughTests)
        );
        assert_eq!(
            serde_json::to_string(&IndicatorValue::NotOk).unwrap(),
            "\"NOK\""
        );
    }
}
