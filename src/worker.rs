mod isolation;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::BuildConfig;
use crate::database::{self as db, ArtifactKind};
use crate::invoker::{BuildTool, InvocationRequest, ProcessTracker};
use crate::model::{Assignment, Indicator, IndicatorRecord, IndicatorValue, Submission};
use crate::parsers::TestType;
use crate::registry::TtlRegistry;
use crate::report::{
    BuildDetails, BuildReport, JACOCO_REPORTS_DIR, ReportBuilder, SUREFIRE_REPORTS_DIR,
    read_artifacts,
};
use crate::scheduler::{JobContext, JobOutcome, Scheduler};
use crate::status::SubmissionStatus;

pub use isolation::HiddenTestsGuard;

const COVERAGE_PLUGIN: &str = "jacoco-maven-plugin";
const TEST_SOURCES_DIR: &str = "src/test";

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub submission_id: i64,
    /// Identity of whoever uploaded the project. Ignored for teacher rebuilds.
    pub principal: Option<String>,
    pub rebuild_by_teacher: bool,
    pub keep_status_date: bool,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Queued,
    Running,
    Finished,
}

/// Where the build of a submission currently is.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BuildTask {
    pub job_id: Option<u64>,
    pub phase: TaskPhase,
    pub outcome: Option<JobOutcome>,
}

pub type BuildTasks = TtlRegistry<i64, BuildTask>;

/// State of an assignment self-check, keyed by its scheduler job id.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AssignmentCheck {
    Pending,
    Done {
        indicators: Vec<IndicatorRecord>,
        details: BuildDetails,
    },
    TimedOut,
    Failed {
        reason: String,
    },
}

pub type CheckTasks = TtlRegistry<u64, AssignmentCheck>;

/// Runs the build of one submission and turns the result into indicators and a status.
pub struct BuildWorker {
    pool: SqlitePool,
    builder: ReportBuilder,
    build_tool: Arc<dyn BuildTool>,
    assignments: Vec<Assignment>,
    too_much_output_threshold: usize,
    descriptor: String,
}

impl BuildWorker {
    pub fn new(
        pool: SqlitePool,
        build_tool: Arc<dyn BuildTool>,
        config: &BuildConfig,
        assignments: Vec<Assignment>,
    ) -> Self {
        Self {
            builder: ReportBuilder::new(pool.clone()),
            pool,
            build_tool,
            assignments,
            too_much_output_threshold: config.too_much_output_threshold,
            descriptor: config.descriptor.clone(),
        }
    }

    pub fn assignment(&self, id: &str) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.id == id)
    }

    pub fn report_builder(&self) -> &ReportBuilder {
        &self.builder
    }

    /// Builds the submission and records its indicators and final status.
    pub async fn check_project(
        &self,
        ctx: &JobContext,
        request: &BuildRequest,
    ) -> anyhow::Result<SubmissionStatus> {
        let id = request.submission_id;
        let mut submission = db::fetch_submission(&self.pool, id)
            .await?
            .ok_or_else(|| anyhow!("Submission {id} not found"))?;
        let assignment = self
            .assignment(&submission.assignment_id)
            .ok_or_else(|| anyhow!("Unknown assignment {}", submission.assignment_id))?;

        if !submission.status.is_pending() {
            log::info!(
                "[{id}] Submission is {} and no longer waits for a build, skipping",
                submission.status
            );
            return Ok(submission.status);
        }

        if submission.status == SubmissionStatus::SubmittedForRebuild {
            submission.set_status(SubmissionStatus::Rebuilding, true)?;
            if !db::save_submission_if_status(
                &self.pool,
                &submission,
                SubmissionStatus::SubmittedForRebuild,
            )
            .await?
            {
                return self.superseded(id).await;
            }
        }

        let principal = if request.rebuild_by_teacher {
            Some(submission.submitter_user_id.clone())
        } else {
            request
                .principal
                .clone()
                .or_else(|| Some(submission.submitter_user_id.clone()))
        };
        let project_folder = PathBuf::from(&submission.submission_folder);
        let invocation = InvocationRequest {
            project_folder: project_folder.clone(),
            principal,
            max_memory_mb: assignment.max_memory_mb,
        };

        log::info!(
            "[{id}] Started build invocation (max memory: {})",
            assignment
                .max_memory_mb
                .map_or("unlimited".to_string(), |mb| format!("{mb} Mb"))
        );
        let (output_lines, mut execution_failed) =
            match self.build_tool.run(&invocation, &ctx.tracker).await {
                Ok(result) if result.expired_by_timeout => {
                    log::warn!("[{id}] Build aborted by timeout");
                    return self
                        .finish(submission, SubmissionStatus::AbortedByTimeout, request)
                        .await;
                }
                Ok(result) if result.too_much_output(self.too_much_output_threshold) => {
                    log::warn!("[{id}] Build produced too much output");
                    return self
                        .finish(submission, SubmissionStatus::TooMuchOutput, request)
                        .await;
                }
                Ok(result) => {
                    log::info!(
                        "[{id}] Finished build invocation (exit code {})",
                        result.exit_code
                    );
                    (result.output_lines, false)
                }
                Err(e) => {
                    log::error!("[{id}] Build invocation failed: {e:#}");
                    (vec![format!("[ERROR] {e:#}")], true)
                }
            };

        if !db::fetch_submission(&self.pool, id)
            .await?
            .is_some_and(|s| s.status.is_pending())
        {
            return self.superseded(id).await;
        }

        // a fresh build ran, so anything stored for this submission is stale
        for kind in [ArtifactKind::JUnit, ArtifactKind::Jacoco] {
            db::delete_artifacts(&self.pool, kind, id).await?;
        }
        let report = self
            .builder
            .build(output_lines, &project_folder, assignment, Some(id))
            .await;
        db::delete_indicators_except(&self.pool, id, Indicator::ProjectStructure).await?;

        execution_failed |= report.execution_failed();
        let indicators = if execution_failed {
            log::info!("[{id}] Build execution failed");
            vec![IndicatorRecord::new(
                Indicator::Compilation,
                IndicatorValue::NotOk,
            )]
        } else {
            derive_indicators(&report, assignment)
        };
        for record in &indicators {
            if let Err(e) = db::save_indicator(&self.pool, id, record).await {
                log::error!("[{id}] Failed to save indicator {:?}: {e}", record.indicator);
            }
        }

        let report_id = db::insert_build_report(&self.pool, &report.build_output()).await?;
        submission.build_report_id = Some(report_id);
        if !execution_failed {
            self.store_test_reports(id, &project_folder).await;
        }

        if !execution_failed
            && assignment.calculate_student_tests_coverage
            && self.has_coverage_plugin(&project_folder)
        {
            match self
                .measure_coverage(ctx, id, &invocation, assignment)
                .await
            {
                Ok(Some(coverage)) => {
                    log::info!("[{id}] Student tests cover {coverage}% of the lines");
                    submission.coverage = Some(i64::from(coverage));
                }
                Ok(None) => {}
                Err(e) => log::error!("[{id}] Coverage measurement failed: {e:#}"),
            }
        }

        let status = final_status(execution_failed, request.rebuild_by_teacher, &indicators);
        if status == SubmissionStatus::Failed && !execution_failed {
            log::warn!("[{id}] Compiled without teacher test results, marking the build as failed");
        }

        if let Some(git_id) = submission.git_submission_id
            && let Err(e) = db::update_git_last_submission(&self.pool, git_id, id).await
        {
            log::error!("[{id}] Failed to update git submission {git_id}: {e}");
        }

        self.finish(submission, status, request).await
    }

    /// Builds an assignment's reference solution without any submission.
    /// Returns `None` when the build timed out.
    pub async fn check_assignment(
        &self,
        tracker: &ProcessTracker,
        folder: &Path,
        assignment: &Assignment,
        principal: Option<String>,
    ) -> anyhow::Result<Option<BuildReport>> {
        let request = InvocationRequest {
            project_folder: folder.to_path_buf(),
            principal,
            max_memory_mb: assignment.max_memory_mb,
        };

        log::info!("Checking assignment {} in {}", assignment.id, folder.display());
        let result = self.build_tool.run(&request, tracker).await?;
        if result.expired_by_timeout {
            log::warn!("Check of assignment {} aborted by timeout", assignment.id);
            return Ok(None);
        }

        let report = self
            .builder
            .build(result.output_lines, folder, assignment, None)
            .await;
        Ok(Some(report))
    }

    /// Records the timeout of a build whose job had to be abandoned.
    pub async fn mark_aborted(&self, submission_id: i64) -> anyhow::Result<()> {
        self.settle_pending(submission_id, SubmissionStatus::AbortedByTimeout)
            .await
    }

    /// Records a build whose job ended with an error before it could store a status.
    pub async fn mark_failed(&self, submission_id: i64) -> anyhow::Result<()> {
        self.settle_pending(submission_id, SubmissionStatus::Failed)
            .await
    }

    async fn settle_pending(
        &self,
        submission_id: i64,
        status: SubmissionStatus,
    ) -> anyhow::Result<()> {
        let Some(mut submission) = db::fetch_submission(&self.pool, submission_id).await? else {
            return Ok(());
        };
        let previous = submission.status;
        if !previous.is_pending() {
            return Ok(());
        }
        submission.set_status(status, false)?;
        if db::save_submission_if_status(&self.pool, &submission, previous).await? {
            log::warn!("[{submission_id}] Marked as {status}");
        }
        Ok(())
    }

    /// Queues the build of a submission and keeps its entry in `tasks` current.
    /// Returns the scheduler job id.
    pub async fn enqueue(
        self: &Arc<Self>,
        scheduler: &Scheduler,
        tasks: &Arc<BuildTasks>,
        request: BuildRequest,
    ) -> u64 {
        let id = request.submission_id;
        tasks.insert(
            id,
            BuildTask {
                job_id: None,
                phase: TaskPhase::Queued,
                outcome: None,
            },
        );

        let worker = self.clone();
        let job_tasks = tasks.clone();
        let ticket = scheduler
            .submit(move |ctx| async move {
                job_tasks.update(&id, |t| {
                    t.job_id = Some(ctx.id);
                    t.phase = TaskPhase::Running;
                });
                let status = worker.check_project(&ctx, &request).await?;
                log::info!("[{id}] Build finished with status {status}");
                Ok(())
            })
            .await;

        let job_id = ticket.id;
        tasks.update(&id, |t| t.job_id = Some(job_id));

        let worker = self.clone();
        let tasks = tasks.clone();
        tokio::spawn(async move {
            let outcome = ticket.wait().await;
            let settled = match &outcome {
                JobOutcome::TimedOut { abandoned: true } => worker.mark_aborted(id).await,
                JobOutcome::Failed { .. } => worker.mark_failed(id).await,
                _ => Ok(()),
            };
            if let Err(e) = settled {
                log::error!("[{id}] Failed to record the end of the build: {e:#}");
            }
            tasks.update(&id, |t| {
                t.phase = TaskPhase::Finished;
                t.outcome = Some(outcome);
            });
        });

        job_id
    }

    async fn finish(
        &self,
        mut submission: Submission,
        status: SubmissionStatus,
        request: &BuildRequest,
    ) -> anyhow::Result<SubmissionStatus> {
        let previous = submission.status;
        submission.set_status(status, request.keep_status_date)?;
        let saved = db::save_submission_if_status(&self.pool, &submission, previous)
            .await
            .with_context(|| format!("Failed to save submission {}", submission.id))?;
        if !saved {
            return self.superseded(submission.id).await;
        }
        Ok(status)
    }

    /// Status stored by whoever changed the submission while it was being built.
    async fn superseded(&self, id: i64) -> anyhow::Result<SubmissionStatus> {
        let current = db::fetch_submission(&self.pool, id)
            .await?
            .ok_or_else(|| anyhow!("Submission {id} not found"))?;
        log::warn!(
            "[{id}] Submission became {} during the build, result discarded",
            current.status
        );
        Ok(current.status)
    }

    async fn store_test_reports(&self, id: i64, project_folder: &Path) {
        let reports = match read_artifacts(&project_folder.join(SUREFIRE_REPORTS_DIR), "xml") {
            Ok(reports) => reports,
            Err(e) => {
                log::error!("[{id}] Failed to read test reports: {e}");
                return;
            }
        };
        for (name, content) in reports {
            if let Err(e) =
                db::save_artifact(&self.pool, ArtifactKind::JUnit, id, &name, &content).await
            {
                log::error!("[{id}] Failed to store test report {name}: {e}");
            }
        }
    }

    fn has_coverage_plugin(&self, project_folder: &Path) -> bool {
        std::fs::read_to_string(project_folder.join(&self.descriptor))
            .is_ok_and(|d| d.contains(COVERAGE_PLUGIN))
    }

    /// Runs the student tests alone and stores the resulting coverage reports.
    async fn measure_coverage(
        &self,
        ctx: &JobContext,
        id: i64,
        request: &InvocationRequest,
        assignment: &Assignment,
    ) -> anyhow::Result<Option<u32>> {
        let folder = &request.project_folder;
        let guard = HiddenTestsGuard::engage(&folder.join(TEST_SOURCES_DIR))?;
        log::info!(
            "[{id}] Started build invocation again for coverage ({} teacher test files hidden)",
            guard.hidden()
        );
        let result = self.build_tool.run(request, &ctx.tracker).await;
        guard.restore()?;
        let result = result?;

        if result.expired_by_timeout {
            log::warn!("[{id}] Coverage build aborted by timeout");
            return Ok(None);
        }

        let report = self
            .builder
            .build(result.output_lines, folder, assignment, None)
            .await;
        if report.has_junit_errors(TestType::Student) == Some(true) {
            log::warn!("[{id}] Student tests fail when run alone, coverage skipped");
            return Ok(None);
        }

        let reports = read_artifacts(&folder.join(JACOCO_REPORTS_DIR), "csv")?;
        if reports.is_empty() {
            log::warn!("[{id}] Coverage build produced no coverage report");
            return Ok(None);
        }
        for (name, content) in &reports {
            db::save_artifact(&self.pool, ArtifactKind::Jacoco, id, name, content).await?;
        }

        Ok(report.coverage_percent())
    }
}

/// Indicators of a build that ran to completion.
pub fn derive_indicators(report: &BuildReport, assignment: &Assignment) -> Vec<IndicatorRecord> {
    let compiled = report.compilation_errors().is_empty();
    let mut records = vec![IndicatorRecord::new(
        Indicator::Compilation,
        IndicatorValue::from_ok(compiled),
    )];
    if !compiled {
        return records;
    }

    if report.checkstyle_validation_active() {
        records.push(IndicatorRecord::new(
            Indicator::Checkstyle,
            IndicatorValue::from_ok(report.checkstyle_errors().is_empty()),
        ));
    }

    if assignment.accepts_student_tests {
        let summary = report.junit_summary(TestType::Student);
        let min = assignment.min_student_tests.unwrap_or(0);
        let value = if report.has_junit_errors(TestType::Student) == Some(true) {
            IndicatorValue::NotOk
        } else if summary.is_none_or(|s| s.num_tests < min) {
            IndicatorValue::NotEnoughTests
        } else {
            IndicatorValue::Ok
        };
        let mut record = IndicatorRecord::new(Indicator::StudentUnitTests, value);
        if let Some(summary) = summary {
            record = record.with_progress(summary.progress(), summary.num_tests);
        }
        records.push(record);
    }

    for (test_type, indicator) in [
        (TestType::Teacher, Indicator::TeacherUnitTests),
        (TestType::Hidden, Indicator::HiddenUnitTests),
    ] {
        if let Some(summary) = report.junit_summary(test_type) {
            let ok = summary.num_errors == 0 && summary.num_failures == 0;
            records.push(
                IndicatorRecord::new(indicator, IndicatorValue::from_ok(ok))
                    .with_progress(summary.progress(), summary.num_tests),
            );
        }
    }

    records
}

fn final_status(
    execution_failed: bool,
    rebuild_by_teacher: bool,
    indicators: &[IndicatorRecord],
) -> SubmissionStatus {
    if execution_failed {
        return SubmissionStatus::Failed;
    }
    if rebuild_by_teacher {
        return SubmissionStatus::ValidatedRebuilt;
    }

    let compiled = indicators
        .iter()
        .any(|r| r.indicator == Indicator::Compilation && r.value == IndicatorValue::Ok);
    let teacher_tested = indicators
        .iter()
        .any(|r| r.indicator == Indicator::TeacherUnitTests);
    if compiled && !teacher_tested {
        SubmissionStatus::Failed
    } else {
        SubmissionStatus::Validated
    }
}
