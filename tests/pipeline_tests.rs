mod common;

use std::fs;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use autograder::config::SchedulerConfig;
use autograder::database::{self as db, ArtifactKind, NewSubmission};
use autograder::model::{Indicator, IndicatorRecord, IndicatorValue};
use autograder::report::full_report;
use autograder::scheduler::JobOutcome;
use autograder::status::SubmissionStatus;
use autograder::worker::BuildRequest;

use common::{
    Behaviour, Harness, Invocation, assignment, jacoco, pooled, project, success_log, suite,
    synchronous,
};

const PLAIN_POM: &str = "<project><artifactId>sample</artifactId></project>";
const COVERAGE_POM: &str = "<project><build><plugins><plugin>\
    <artifactId>jacoco-maven-plugin</artifactId>\
    </plugin></plugins></build></project>";

fn request(submission_id: i64) -> BuildRequest {
    BuildRequest {
        submission_id,
        principal: Some("uploader".to_string()),
        rebuild_by_teacher: false,
        keep_status_date: false,
    }
}

fn invocation(surefire: Vec<(String, String)>) -> Invocation {
    Invocation {
        output: success_log(),
        surefire,
        ..Default::default()
    }
}

async fn build(harness: &Harness, submission_id: i64) {
    harness
        .worker
        .enqueue(&harness.scheduler, &harness.tasks, request(submission_id))
        .await;
    harness.wait_finished(submission_id).await;
}

fn value_of(records: &[IndicatorRecord], indicator: Indicator) -> Option<IndicatorValue> {
    records
        .iter()
        .find(|r| r.indicator == indicator)
        .map(|r| r.value)
}

#[tokio::test]
async fn test_validated_submission() {
    let harness = Harness::new(
        vec![invocation(vec![suite("TestTeacherProject", 3, 0)])],
        vec![assignment("a1")],
        synchronous(),
    )
    .await;
    let folder = project(PLAIN_POM, &["TestTeacherProject.java"]);
    let submission = harness.submit("a1", folder.path()).await;

    build(&harness, submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::Validated);
    assert!(submission.build_report_id.is_some());
    assert_eq!(submission.coverage, None);

    let records = db::fetch_indicators(&harness.pool, submission.id).await.unwrap();
    assert_eq!(
        records,
        vec![
            IndicatorRecord::new(Indicator::Compilation, IndicatorValue::Ok),
            IndicatorRecord::new(Indicator::TeacherUnitTests, IndicatorValue::Ok)
                .with_progress(3, 3),
        ]
    );

    let stored = db::fetch_artifacts(&harness.pool, ArtifactKind::JUnit, submission.id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        *harness.tool.principals.lock(),
        vec![Some("uploader".to_string())]
    );

    let task = harness.tasks.get(&submission.id).unwrap();
    assert_eq!(task.outcome, Some(JobOutcome::Completed));
}

#[tokio::test]
async fn test_not_enough_student_tests() {
    let mut assignment = assignment("a1");
    assignment.accepts_student_tests = true;
    assignment.min_student_tests = Some(3);
    let harness = Harness::new(
        vec![invocation(vec![
            suite("TestTeacherProject", 2, 0),
            suite("TestStudentProject", 2, 0),
        ])],
        vec![assignment.clone()],
        synchronous(),
    )
    .await;
    let folder = project(PLAIN_POM, &[]);
    let submission = harness.submit("a1", folder.path()).await;

    build(&harness, submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::Validated);

    let records = db::fetch_indicators(&harness.pool, submission.id).await.unwrap();
    let student = records
        .iter()
        .find(|r| r.indicator == Indicator::StudentUnitTests)
        .unwrap();
    assert_eq!(student.value, IndicatorValue::NotEnoughTests);
    assert_eq!((student.progress, student.goal), (Some(2), Some(2)));

    let report = full_report(
        &harness.pool,
        harness.worker.report_builder(),
        submission,
        &assignment,
        false,
    )
    .await
    .unwrap();
    let message = report.build.unwrap().not_enough_student_tests.unwrap();
    assert!(message.contains("only includes 2 unit tests"), "{message}");
    assert!(message.contains("minimum of 3 tests"), "{message}");
}

#[tokio::test]
async fn test_compiled_without_teacher_tests_fails() {
    let harness = Harness::new(
        vec![invocation(vec![])],
        vec![assignment("a1")],
        synchronous(),
    )
    .await;
    let folder = project(PLAIN_POM, &[]);
    let submission = harness.submit("a1", folder.path()).await;

    build(&harness, submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::Failed);
    let records = db::fetch_indicators(&harness.pool, submission.id).await.unwrap();
    assert_eq!(
        records,
        vec![IndicatorRecord::new(
            Indicator::Compilation,
            IndicatorValue::Ok
        )]
    );
}

#[tokio::test]
async fn test_compilation_errors_are_an_indicator() {
    let output = [
        "[INFO] Compiling 2 source files",
        "[ERROR] COMPILATION ERROR : ",
        "[INFO] -------------------------------------------------------------",
        "[ERROR] {FOLDER}/src/main/java/org/example/Main.java:[3,1] ';' expected",
        "[INFO] 1 error",
        "[INFO] BUILD FAILURE",
        "[ERROR] Failed to execute goal org.apache.maven.plugins:maven-compiler-plugin:3.1:compile",
    ];
    let folder = project(PLAIN_POM, &[]);
    let output = output
        .iter()
        .map(|l| l.replace("{FOLDER}", &folder.path().display().to_string()))
        .collect();
    let harness = Harness::new(
        vec![Invocation {
            output,
            ..Default::default()
        }],
        vec![assignment("a1")],
        synchronous(),
    )
    .await;
    let submission = harness.submit("a1", folder.path()).await;

    build(&harness, submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::Validated);
    let records = db::fetch_indicators(&harness.pool, submission.id).await.unwrap();
    assert_eq!(
        value_of(&records, Indicator::Compilation),
        Some(IndicatorValue::NotOk)
    );
    assert_eq!(records.len(), 1);

    let report = full_report(
        &harness.pool,
        harness.worker.report_builder(),
        submission,
        &assignment("a1"),
        false,
    )
    .await
    .unwrap();
    assert_eq!(
        report.build.unwrap().compilation_errors,
        vec!["org/example/Main.java:[3,1] ';' expected".to_string()]
    );
}

#[tokio::test]
async fn test_execution_failure() {
    let harness = Harness::new(
        vec![Invocation {
            behaviour: Behaviour::Fail("mvn: command not found".to_string()),
            ..Default::default()
        }],
        vec![assignment("a1")],
        synchronous(),
    )
    .await;
    let folder = project(PLAIN_POM, &[]);
    let submission = harness.submit("a1", folder.path()).await;

    build(&harness, submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::Failed);
    let records = db::fetch_indicators(&harness.pool, submission.id).await.unwrap();
    assert_eq!(
        records,
        vec![IndicatorRecord::new(
            Indicator::Compilation,
            IndicatorValue::NotOk
        )]
    );

    let output = db::fetch_build_report(&harness.pool, submission.build_report_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(output.contains("mvn: command not found"), "{output}");
}

#[tokio::test]
async fn test_too_much_output() {
    let output = (0..150).map(|i| format!("Hello {i}")).collect();
    let harness = Harness::new(
        vec![Invocation {
            output,
            surefire: vec![suite("TestTeacherProject", 1, 0)],
            ..Default::default()
        }],
        vec![assignment("a1")],
        synchronous(),
    )
    .await;
    let folder = project(PLAIN_POM, &[]);
    let submission = harness.submit("a1", folder.path()).await;

    build(&harness, submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::TooMuchOutput);
    assert_eq!(submission.build_report_id, None);
    assert!(
        db::fetch_indicators(&harness.pool, submission.id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_build_aborted_by_timeout() {
    let harness = Harness::new(
        vec![Invocation {
            behaviour: Behaviour::Hang,
            ..Default::default()
        }],
        vec![assignment("a1")],
        pooled(1),
    )
    .await;
    let token = CancellationToken::new();
    let scheduler = harness.scheduler.clone();
    let child = token.clone();
    tokio::spawn(async move { scheduler.run(child).await });

    let folder = project(PLAIN_POM, &[]);
    let submission = harness.submit("a1", folder.path()).await;
    build(&harness, submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::AbortedByTimeout);
    let task = harness.tasks.get(&submission.id).unwrap();
    assert_eq!(
        task.outcome,
        Some(JobOutcome::TimedOut { abandoned: false })
    );
    token.cancel();
}

#[tokio::test]
async fn test_stuck_build_is_abandoned() {
    let harness = Harness::new(
        vec![Invocation {
            behaviour: Behaviour::Stuck,
            ..Default::default()
        }],
        vec![assignment("a1")],
        pooled(1),
    )
    .await;
    let token = CancellationToken::new();
    let scheduler = harness.scheduler.clone();
    let child = token.clone();
    tokio::spawn(async move { scheduler.run(child).await });

    let folder = project(PLAIN_POM, &[]);
    let submission = harness.submit("a1", folder.path()).await;
    build(&harness, submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::AbortedByTimeout);
    let task = harness.tasks.get(&submission.id).unwrap();
    assert_eq!(task.outcome, Some(JobOutcome::TimedOut { abandoned: true }));
    token.cancel();
}

#[tokio::test]
async fn test_teacher_rebuild_keeps_status_date() {
    let harness = Harness::new(
        vec![invocation(vec![suite("TestTeacherProject", 2, 1)])],
        vec![assignment("a1")],
        synchronous(),
    )
    .await;
    let folder = project(PLAIN_POM, &[]);
    let submission = harness.submit("a1", folder.path()).await;
    build(&harness, submission.id).await;

    let mut submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::Validated);
    let status_date = submission.status_date.clone();

    submission
        .set_status(SubmissionStatus::SubmittedForRebuild, true)
        .unwrap();
    db::save_submission(&harness.pool, &submission).await.unwrap();
    harness
        .worker
        .enqueue(
            &harness.scheduler,
            &harness.tasks,
            BuildRequest {
                submission_id: submission.id,
                principal: Some("teacher".to_string()),
                rebuild_by_teacher: true,
                keep_status_date: true,
            },
        )
        .await;
    harness.wait_finished(submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::ValidatedRebuilt);
    assert_eq!(submission.status_date, status_date);
    // a rebuild acts on behalf of the original submitter
    assert_eq!(
        harness.tool.principals.lock().last().cloned().flatten().as_deref(),
        Some("student1")
    );

    let records = db::fetch_indicators(&harness.pool, submission.id).await.unwrap();
    let teacher = records
        .iter()
        .find(|r| r.indicator == Indicator::TeacherUnitTests)
        .unwrap();
    assert_eq!(teacher.value, IndicatorValue::NotOk);
    assert_eq!((teacher.progress, teacher.goal), (Some(1), Some(2)));
}

#[tokio::test]
async fn test_report_rebuilt_from_stored_data() {
    let harness = Harness::new(
        vec![invocation(vec![
            suite("TestTeacherProject", 3, 1),
            suite("TestTeacherHiddenProject", 2, 0),
        ])],
        vec![assignment("a1")],
        synchronous(),
    )
    .await;
    let folder = project(PLAIN_POM, &[]);
    let submission = harness.submit("a1", folder.path()).await;
    build(&harness, submission.id).await;

    // the project folder no longer holds any report
    fs::remove_dir_all(folder.path().join("target")).unwrap();

    let submission = harness.submission(submission.id).await;
    let mut reports = Vec::new();
    for _ in 0..2 {
        let report = full_report(
            &harness.pool,
            harness.worker.report_builder(),
            submission.clone(),
            &assignment("a1"),
            true,
        )
        .await
        .unwrap();
        reports.push(serde_json::to_value(report).unwrap());
    }
    assert_eq!(reports[0], reports[1]);

    let build = &reports[0]["build"];
    assert_eq!(build["teacher_tests"]["num_tests"], 3);
    assert_eq!(build["hidden_tests"]["num_tests"], 2);
    assert!(
        build["teacher_errors"]
            .as_str()
            .unwrap()
            .contains("FAILURE: org.example.TestTeacherProject.test0")
    );
}

#[tokio::test]
async fn test_coverage_of_student_tests() {
    let mut assignment = assignment("a1");
    assignment.accepts_student_tests = true;
    assignment.min_student_tests = Some(1);
    assignment.calculate_student_tests_coverage = true;
    let harness = Harness::new(
        vec![
            invocation(vec![
                suite("TestTeacherProject", 2, 0),
                suite("TestStudentProject", 1, 0),
            ]),
            Invocation {
                output: success_log(),
                surefire: vec![suite("TestStudentProject", 1, 0)],
                jacoco: vec![jacoco(25, 75)],
                ..Default::default()
            },
        ],
        vec![assignment],
        synchronous(),
    )
    .await;
    let sources = [
        "TestStudentProject.java",
        "TestTeacherHiddenProject.java",
        "TestTeacherProject.java",
    ];
    let folder = project(COVERAGE_POM, &sources);
    let submission = harness.submit("a1", folder.path()).await;

    build(&harness, submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::Validated);
    assert_eq!(submission.coverage, Some(75));
    assert_eq!(harness.tool.calls(), 2);

    let seen = harness.tool.seen_tests.lock().clone();
    assert_eq!(seen[0], sources.map(String::from).to_vec());
    assert_eq!(
        seen[1],
        vec![
            "TestStudentProject.java",
            "TestTeacherHiddenProject.java.ignore",
            "TestTeacherProject.java.ignore",
        ]
    );
    // teacher sources are back after the isolated run
    for name in sources {
        assert!(folder.path().join("src/test/java/org/example").join(name).exists());
    }

    let stored = db::fetch_artifacts(&harness.pool, ArtifactKind::Jacoco, submission.id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    // the full run's test reports are kept, not the isolated run's
    let stored = db::fetch_artifacts(&harness.pool, ArtifactKind::JUnit, submission.id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn test_coverage_skipped_when_student_tests_fail_alone() {
    let mut assignment = assignment("a1");
    assignment.accepts_student_tests = true;
    assignment.calculate_student_tests_coverage = true;
    let harness = Harness::new(
        vec![
            invocation(vec![
                suite("TestTeacherProject", 2, 0),
                suite("TestStudentProject", 1, 0),
            ]),
            Invocation {
                output: success_log(),
                surefire: vec![suite("TestStudentProject", 1, 1)],
                jacoco: vec![jacoco(25, 75)],
                ..Default::default()
            },
        ],
        vec![assignment],
        synchronous(),
    )
    .await;
    let folder = project(COVERAGE_POM, &["TestTeacherProject.java"]);
    let submission = harness.submit("a1", folder.path()).await;

    build(&harness, submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::Validated);
    assert_eq!(submission.coverage, None);
    assert!(
        folder
            .path()
            .join("src/test/java/org/example/TestTeacherProject.java")
            .exists()
    );
    assert!(
        db::fetch_artifacts(&harness.pool, ArtifactKind::Jacoco, submission.id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_git_submission_points_to_latest_build() {
    let harness = Harness::new(
        vec![invocation(vec![suite("TestTeacherProject", 1, 0)])],
        vec![assignment("a1")],
        synchronous(),
    )
    .await;
    let folder = project(PLAIN_POM, &[]);
    let git_id = db::create_git_submission(&harness.pool, 1, "a1", "git@example.org:g1/a1.git")
        .await
        .unwrap();
    let submission = db::create_submission(
        &harness.pool,
        &NewSubmission {
            assignment_id: "a1".to_string(),
            group_id: 1,
            submitter_user_id: "student1".to_string(),
            submission_folder: folder.path().display().to_string(),
            git_submission_id: Some(git_id),
        },
    )
    .await
    .unwrap();

    build(&harness, submission.id).await;

    let git = db::fetch_git_submission(&harness.pool, git_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(git.last_submission_id, Some(submission.id));
}

#[tokio::test]
async fn test_deleted_during_build_stays_deleted() {
    let harness = Harness::new(
        vec![Invocation {
            behaviour: Behaviour::Slow(Duration::from_millis(300)),
            output: success_log(),
            surefire: vec![suite("TestTeacherProject", 2, 0)],
            ..Default::default()
        }],
        vec![assignment("a1")],
        pooled(60),
    )
    .await;
    let token = CancellationToken::new();
    let scheduler = harness.scheduler.clone();
    let child = token.clone();
    tokio::spawn(async move { scheduler.run(child).await });

    let folder = project(PLAIN_POM, &[]);
    let submission = harness.submit("a1", folder.path()).await;
    harness
        .worker
        .enqueue(&harness.scheduler, &harness.tasks, request(submission.id))
        .await;
    while harness.tool.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut deleted = harness.submission(submission.id).await;
    deleted.set_status(SubmissionStatus::Deleted, false).unwrap();
    db::save_submission(&harness.pool, &deleted).await.unwrap();

    harness.wait_finished(submission.id).await;
    let stored = harness.submission(submission.id).await;
    assert_eq!(stored.status, SubmissionStatus::Deleted);
    assert_eq!(stored.build_report_id, None);
    assert!(
        db::fetch_indicators(&harness.pool, submission.id)
            .await
            .unwrap()
            .is_empty()
    );
    token.cancel();
}

#[tokio::test]
async fn test_deleted_before_admission_is_not_built() {
    let harness = Harness::new(
        vec![invocation(vec![suite("TestTeacherProject", 2, 0)])],
        vec![assignment("a1")],
        synchronous(),
    )
    .await;
    let folder = project(PLAIN_POM, &[]);
    let mut submission = harness.submit("a1", folder.path()).await;
    submission.set_status(SubmissionStatus::Deleted, false).unwrap();
    db::save_submission(&harness.pool, &submission).await.unwrap();

    build(&harness, submission.id).await;

    assert_eq!(harness.tool.calls(), 0);
    assert_eq!(
        harness.submission(submission.id).await.status,
        SubmissionStatus::Deleted
    );
}

#[tokio::test]
async fn test_build_error_does_not_strand_submission() {
    let harness = Harness::new(
        vec![invocation(vec![suite("TestTeacherProject", 2, 0)])],
        vec![assignment("a1")],
        synchronous(),
    )
    .await;
    let folder = project(PLAIN_POM, &[]);
    // no worker knows this assignment, so the build job errors out
    let submission = harness.submit("retired", folder.path()).await;

    build(&harness, submission.id).await;

    assert_eq!(harness.tool.calls(), 0);
    assert_eq!(
        harness.submission(submission.id).await.status,
        SubmissionStatus::Failed
    );
    let task = harness.tasks.get(&submission.id).unwrap();
    assert!(matches!(task.outcome, Some(JobOutcome::Failed { .. })));
}

async fn coverage_run_that_breaks(second: Behaviour, scheduler: SchedulerConfig) {
    let mut assignment = assignment("a1");
    assignment.accepts_student_tests = true;
    assignment.calculate_student_tests_coverage = true;
    let harness = Harness::new(
        vec![
            invocation(vec![
                suite("TestTeacherProject", 2, 0),
                suite("TestStudentProject", 1, 0),
            ]),
            Invocation {
                behaviour: second,
                output: success_log(),
                surefire: vec![suite("TestStudentProject", 1, 0)],
                jacoco: vec![jacoco(25, 75)],
            },
        ],
        vec![assignment],
        scheduler,
    )
    .await;
    let token = CancellationToken::new();
    let dispatcher = harness.scheduler.clone();
    let child = token.clone();
    tokio::spawn(async move { dispatcher.run(child).await });

    let sources = [
        "TestStudentProject.java",
        "TestTeacherHiddenProject.java",
        "TestTeacherProject.java",
    ];
    let folder = project(COVERAGE_POM, &sources);
    let submission = harness.submit("a1", folder.path()).await;

    build(&harness, submission.id).await;

    let submission = harness.submission(submission.id).await;
    assert_eq!(submission.status, SubmissionStatus::Validated);
    assert_eq!(submission.coverage, None);
    assert_eq!(harness.tool.calls(), 2);
    for name in sources {
        assert!(folder.path().join("src/test/java/org/example").join(name).exists());
    }
    assert!(
        db::fetch_artifacts(&harness.pool, ArtifactKind::Jacoco, submission.id)
            .await
            .unwrap()
            .is_empty()
    );
    token.cancel();
}

#[tokio::test]
async fn test_failed_coverage_run_keeps_outcome() {
    coverage_run_that_breaks(Behaviour::Fail("mvn crashed".to_string()), synchronous()).await;
}

#[tokio::test]
async fn test_timed_out_coverage_run_keeps_outcome() {
    coverage_run_that_breaks(Behaviour::Hang, pooled(1)).await;
}
