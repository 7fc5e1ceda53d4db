#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::SqlitePool;

use autograder::config::{BuildConfig, SchedulerConfig};
use autograder::database::{self as db, NewSubmission};
use autograder::invoker::{BuildInvocationResult, BuildTool, InvocationRequest, ProcessTracker};
use autograder::model::{Assignment, Language, Submission};
use autograder::registry::TtlRegistry;
use autograder::scheduler::Scheduler;
use autograder::worker::{BuildTasks, BuildWorker, TaskPhase};

pub const PACKAGE: &str = "org.example";

/// How the fake build behaves on one invocation.
#[derive(Clone, Default)]
pub enum Behaviour {
    #[default]
    Succeed,
    /// Keeps running until the tracker is terminated.
    Hang,
    /// Keeps running and ignores termination.
    Stuck,
    /// Succeeds after a delay.
    Slow(Duration),
    Fail(String),
}

/// One scripted invocation: the log it prints and the files it leaves under `target`.
#[derive(Clone, Default)]
pub struct Invocation {
    pub behaviour: Behaviour,
    pub output: Vec<String>,
    pub surefire: Vec<(String, String)>,
    pub jacoco: Vec<(String, String)>,
}

/// Stand-in for Maven that replays scripted invocations in order, repeating the last one.
pub struct FakeBuild {
    script: Vec<Invocation>,
    calls: AtomicUsize,
    /// Test source file names visible at each invocation.
    pub seen_tests: Mutex<Vec<Vec<String>>>,
    pub principals: Mutex<Vec<Option<String>>>,
}

impl FakeBuild {
    pub fn new(script: Vec<Invocation>) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            seen_tests: Mutex::new(Vec::new()),
            principals: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildTool for FakeBuild {
    async fn run(
        &self,
        request: &InvocationRequest,
        tracker: &ProcessTracker,
    ) -> Result<BuildInvocationResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let invocation = self.script[call.min(self.script.len() - 1)].clone();
        self.principals.lock().push(request.principal.clone());
        self.seen_tests
            .lock()
            .push(list_files(&request.project_folder.join("src/test")));

        let target = request.project_folder.join("target");
        let _ = fs::remove_dir_all(&target);

        match invocation.behaviour {
            Behaviour::Succeed => {}
            Behaviour::Slow(delay) => tokio::time::sleep(delay).await,
            Behaviour::Fail(reason) => anyhow::bail!(reason),
            Behaviour::Hang => loop {
                if tracker.is_terminated() {
                    return Ok(BuildInvocationResult::expired(invocation.output));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            },
            Behaviour::Stuck => {
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
        }

        write_all(&target.join("surefire-reports"), &invocation.surefire);
        write_all(&target.join("site/jacoco"), &invocation.jacoco);
        Ok(BuildInvocationResult {
            exit_code: 0,
            output_lines: invocation.output,
            expired_by_timeout: false,
        })
    }
}

fn write_all(dir: &Path, files: &[(String, String)]) {
    if files.is_empty() {
        return;
    }
    fs::create_dir_all(dir).unwrap();
    for (name, content) in files {
        fs::write(dir.join(name), content).unwrap();
    }
}

fn list_files(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                names.extend(list_files(&path));
            } else {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    names.sort();
    names
}

pub fn assignment(id: &str) -> Assignment {
    Assignment {
        id: id.to_string(),
        name: format!("Assignment {id}"),
        package_name: Some(PACKAGE.to_string()),
        language: Language::Java,
        max_memory_mb: Some(512),
        accepts_student_tests: false,
        min_student_tests: None,
        calculate_student_tests_coverage: false,
        mandatory_tests_suffix: None,
        hidden_tests_visibility: None,
        folder: None,
    }
}

/// Surefire report of one test class; the first `failures` methods fail.
pub fn suite(class: &str, tests: u32, failures: u32) -> (String, String) {
    let full_name = format!("{PACKAGE}.{class}");
    let mut cases = String::new();
    for i in 0..tests {
        if i < failures {
            cases.push_str(&format!(
                r#"<testcase name="test{i}" classname="{full_name}" time="0.01"><failure message="expected:&lt;1&gt; but was:&lt;2&gt;" type="java.lang.AssertionError">java.lang.AssertionError: expected:&lt;1&gt; but was:&lt;2&gt;
	at {full_name}.test{i}({class}.java:{line})
</failure></testcase>"#,
                line = 10 + i
            ));
        } else {
            cases.push_str(&format!(
                r#"<testcase name="test{i}" classname="{full_name}" time="0.01"/>"#
            ));
        }
    }
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuite name="{full_name}" time="0.1" tests="{tests}" errors="0" skipped="0" failures="{failures}">{cases}</testsuite>"#
    );
    (format!("TEST-{full_name}.xml"), xml)
}

pub fn jacoco(missed: u64, covered: u64) -> (String, String) {
    let csv = format!(
        "GROUP,PACKAGE,CLASS,INSTRUCTION_MISSED,INSTRUCTION_COVERED,BRANCH_MISSED,BRANCH_COVERED,LINE_MISSED,LINE_COVERED,COMPLEXITY_MISSED,COMPLEXITY_COVERED,METHOD_MISSED,METHOD_COVERED\n\
         sample,{PACKAGE},Main,10,20,0,2,{missed},{covered},1,3,0,2\n"
    );
    ("jacoco.csv".to_string(), csv)
}

pub fn success_log() -> Vec<String> {
    [
        "[INFO] Scanning for projects...",
        "[INFO] --- maven-surefire-plugin:2.22.2:test (default-test) @ sample ---",
        "[INFO] BUILD SUCCESS",
    ]
    .map(String::from)
    .to_vec()
}

/// Project folder with a descriptor and one test source per name.
pub fn project(descriptor: &str, tests: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("pom.xml"), descriptor).unwrap();
    let test_dir = dir.path().join("src/test/java/org/example");
    fs::create_dir_all(&test_dir).unwrap();
    for name in tests {
        fs::write(test_dir.join(name), "class T {}").unwrap();
    }
    dir
}

pub async fn pool() -> SqlitePool {
    db::init_pool("sqlite::memory:").await.unwrap()
}

pub struct Harness {
    pub pool: SqlitePool,
    pub worker: Arc<BuildWorker>,
    pub scheduler: Scheduler,
    pub tasks: Arc<BuildTasks>,
    pub tool: Arc<FakeBuild>,
}

impl Harness {
    pub async fn new(
        script: Vec<Invocation>,
        assignments: Vec<Assignment>,
        scheduler: SchedulerConfig,
    ) -> Self {
        let pool = pool().await;
        let tool = FakeBuild::new(script);
        let worker = Arc::new(BuildWorker::new(
            pool.clone(),
            tool.clone(),
            &BuildConfig {
                too_much_output_threshold: 100,
                ..Default::default()
            },
            assignments,
        ));
        Self {
            pool,
            worker,
            scheduler: Scheduler::new(&scheduler),
            tasks: Arc::new(TtlRegistry::new(Duration::from_secs(600))),
            tool,
        }
    }

    pub async fn submit(&self, assignment_id: &str, folder: &Path) -> Submission {
        db::create_submission(
            &self.pool,
            &NewSubmission {
                assignment_id: assignment_id.to_string(),
                group_id: 1,
                submitter_user_id: "student1".to_string(),
                submission_folder: folder.display().to_string(),
                git_submission_id: None,
            },
        )
        .await
        .unwrap()
    }

    pub async fn submission(&self, id: i64) -> Submission {
        db::fetch_submission(&self.pool, id).await.unwrap().unwrap()
    }

    /// Polls the task registry until the build of `id` finished.
    pub async fn wait_finished(&self, id: i64) {
        for _ in 0..1000 {
            if self
                .tasks
                .get(&id)
                .is_some_and(|t| t.phase == TaskPhase::Finished)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("build of submission {id} did not finish");
    }
}

pub fn pooled(timeout_secs: u64) -> SchedulerConfig {
    SchedulerConfig {
        pool_size: 1,
        timeout_secs,
        term_grace_ms: 200,
        kill_grace_ms: 200,
        ..Default::default()
    }
}

pub fn synchronous() -> SchedulerConfig {
    SchedulerConfig {
        synchronous: true,
        ..Default::default()
    }
}
