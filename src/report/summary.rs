use std::path::Path;

use serde::Serialize;
use sqlx::SqlitePool;

use super::{BuildReport, ReportBuilder, TestSummary};
use crate::database as db;
use crate::model::{
    Assignment, Indicator, IndicatorRecord, IndicatorValue, Submission, TestVisibility,
};
use crate::parsers::TestType;
use crate::status::SubmissionStatus;

/// One indicator as it should be presented to the reader of a report.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    pub indicator: Indicator,
    pub code: &'static str,
    pub description: &'static str,
    pub value: IndicatorValue,
    pub show_icon: bool,
    pub progress_summary: Option<String>,
}

/// Parsed details of the build, present once a build report exists.
#[derive(Serialize, Debug, Clone)]
pub struct BuildDetails {
    pub compilation_errors: Vec<String>,
    pub checkstyle_errors: Vec<String>,
    pub teacher_tests: Option<TestSummary>,
    pub teacher_errors: Option<String>,
    pub student_tests: Option<TestSummary>,
    pub student_errors: Option<String>,
    pub not_enough_student_tests: Option<String>,
    pub hidden_tests: Option<TestSummary>,
    pub hidden_errors: Option<String>,
    pub coverage: Option<u32>,
    pub elapsed_time_junit: Option<f64>,
    pub build_output: Option<String>,
}

/// Everything a reader needs to render the evaluation of one submission.
#[derive(Serialize, Debug, Clone)]
pub struct FullBuildReport {
    pub submission: Submission,
    pub status_code: &'static str,
    pub error: Option<String>,
    pub summary: Vec<SummaryEntry>,
    pub build: Option<BuildDetails>,
}

fn status_message(status: SubmissionStatus) -> Option<&'static str> {
    use SubmissionStatus::*;

    match status {
        Submitted | SubmittedForRebuild | Rebuilding => {
            Some("The submission is waiting to be built. Please refresh in a few seconds.")
        }
        Failed => Some("The build of this submission failed. Check the build output for details."),
        AbortedByTimeout => Some(
            "The build was aborted because it took too long. \
             Check your code for infinite loops or very slow algorithms.",
        ),
        TooMuchOutput => Some(
            "The build was aborted because it produced too much output. \
             Check your code for loops printing messages.",
        ),
        IllegalAccess => Some("The submission tried to perform an operation that is not allowed."),
        Deleted => Some("This submission was deleted."),
        Validated | ValidatedRebuilt => None,
    }
}

fn show_item(record: &IndicatorRecord, visibility: Option<TestVisibility>, is_teacher: bool) -> bool {
    is_teacher
        || record.indicator != Indicator::HiddenUnitTests
        || !matches!(visibility, None | Some(TestVisibility::HideEverything))
}

fn show_icon(record: &IndicatorRecord, visibility: Option<TestVisibility>, is_teacher: bool) -> bool {
    if record.progress.is_none() && record.goal.is_none() {
        return true;
    }
    !is_teacher
        && record.indicator == Indicator::HiddenUnitTests
        && visibility == Some(TestVisibility::ShowOkNok)
}

fn progress_summary(
    record: &IndicatorRecord,
    visibility: Option<TestVisibility>,
    is_teacher: bool,
) -> Option<String> {
    if !is_teacher
        && record.indicator == Indicator::HiddenUnitTests
        && visibility != Some(TestVisibility::ShowProgress)
    {
        return None;
    }

    match (record.progress, record.goal) {
        (Some(progress), Some(goal)) => Some(format!("{progress} / {goal}")),
        (Some(progress), None) => Some(progress.to_string()),
        _ => None,
    }
}

/// Applies the hidden-test visibility policy of the assignment to stored indicators.
pub fn visible_indicators(
    records: &[IndicatorRecord],
    assignment: &Assignment,
    is_teacher: bool,
) -> Vec<SummaryEntry> {
    let visibility = assignment.hidden_tests_visibility;
    records
        .iter()
        .filter(|r| show_item(r, visibility, is_teacher))
        .map(|r| SummaryEntry {
            indicator: r.indicator,
            code: r.indicator.code(),
            description: r.indicator.description(),
            value: r.value,
            show_icon: show_icon(r, visibility, is_teacher),
            progress_summary: progress_summary(r, visibility, is_teacher),
        })
        .collect()
}

impl BuildDetails {
    /// Details of `report` filtered for the reader. The raw build output is only shown to
    /// teachers or when the build failed.
    pub fn from_report(report: &BuildReport, status: SubmissionStatus, is_teacher: bool) -> Self {
        let visibility = report.assignment.hidden_tests_visibility;
        let hidden_visible = is_teacher || visibility == Some(TestVisibility::ShowProgress);

        BuildDetails {
            compilation_errors: report.compilation_errors(),
            checkstyle_errors: report.checkstyle_errors(),
            teacher_tests: report.junit_summary(TestType::Teacher),
            teacher_errors: report.junit_errors(TestType::Teacher),
            student_tests: report.junit_summary(TestType::Student),
            student_errors: report.junit_errors(TestType::Student),
            not_enough_student_tests: report.not_enough_student_tests_message(),
            hidden_tests: report
                .junit_summary(TestType::Hidden)
                .filter(|_| hidden_visible),
            hidden_errors: report.junit_errors(TestType::Hidden).filter(|_| is_teacher),
            coverage: report.coverage_percent(),
            elapsed_time_junit: report.elapsed_time_junit(),
            build_output: (is_teacher || status == SubmissionStatus::Failed)
                .then(|| report.build_output()),
        }
    }
}

/// Rebuilds the report of a submission from stored data only; never runs a build.
pub async fn full_report(
    pool: &SqlitePool,
    builder: &ReportBuilder,
    submission: Submission,
    assignment: &Assignment,
    is_teacher: bool,
) -> sqlx::Result<FullBuildReport> {
    let status = submission.status;

    let summary = if status.is_pending() || status == SubmissionStatus::Deleted {
        Vec::new()
    } else {
        let records = db::fetch_indicators(pool, submission.id).await?;
        visible_indicators(&records, assignment, is_teacher)
    };

    let mut build = None;
    if matches!(
        status,
        SubmissionStatus::Validated | SubmissionStatus::ValidatedRebuilt | SubmissionStatus::Failed
    ) && let Some(report_id) = submission.build_report_id
        && let Some(output) = db::fetch_build_report(pool, report_id).await?
    {
        let lines = output.lines().map(str::to_string).collect();
        let report = builder
            .build(
                lines,
                Path::new(&submission.submission_folder),
                assignment,
                Some(submission.id),
            )
            .await;
        build = Some(BuildDetails::from_report(&report, status, is_teacher));
    }

    Ok(FullBuildReport {
        status_code: status.code(),
        error: status_message(status).map(str::to_string),
        submission,
        summary,
        build,
    })
}
