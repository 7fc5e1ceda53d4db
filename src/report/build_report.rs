use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::model::{Assignment, Language};
use crate::parsers::{JUnitResults, JacocoResults, MethodOutcome, TestType};

static JAVA_COMPILATION_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[ERROR\] COMPILATION ERROR :.*$").expect("valid regex"));
static KOTLIN_COMPILATION_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[INFO\] --- kotlin-maven-plugin:\d+\.\d+\.\d+:compile.*$").expect("valid regex")
});
static KOTLIN_TEST_COMPILATION_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[ERROR\] Failed to execute goal org\.jetbrains\.kotlin:kotlin-maven-plugin.*test-compile.*$")
        .expect("valid regex")
});

const FAILED_GOAL: &str = "[ERROR] Failed to execute goal org.apache.maven.plugins:";
const FAILED_SUREFIRE: &str = "[ERROR] Failed to execute goal org.apache.maven.plugins:maven-surefire-plugin";
const FAILED_COMPILER: &str = "[ERROR] Failed to execute goal org.apache.maven.plugins:maven-compiler-plugin";
const CHECKSTYLE_START: &str = "[INFO] Starting audit...";
const CHECKSTYLE_END: &str = "Audit done.";
const DETEKT_START: &str = "[INFO] --- detekt-maven-plugin";
const DETEKT_END: &str = "detekt finished";

/// Aggregate of every test class of one tier.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct TestSummary {
    pub num_tests: u32,
    pub num_failures: u32,
    pub num_errors: u32,
    pub num_skipped: u32,
    pub elapsed: f64,
    pub num_mandatory_ok: u32,
}

impl TestSummary {
    /// Tests that neither failed nor errored.
    pub fn progress(&self) -> u32 {
        self.num_tests
            .saturating_sub(self.num_errors + self.num_failures)
    }
}

impl fmt::Display for TestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tests run: {}, Failures: {}, Errors: {}, Time elapsed: {} sec",
            self.num_tests, self.num_failures, self.num_errors, self.elapsed
        )
    }
}

/// Normalized view over one build: the raw log plus every parsed artifact.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub output_lines: Vec<String>,
    pub project_folder: String,
    pub assignment: Assignment,
    pub junit_results: Vec<JUnitResults>,
    pub jacoco_results: Vec<JacocoResults>,
}

impl BuildReport {
    pub fn build_output(&self) -> String {
        self.output_lines.join("\n")
    }

    /// A goal other than compilation or tests failed, so the build never ran to completion.
    pub fn execution_failed(&self) -> bool {
        if !self.output_lines.iter().any(|l| l.starts_with(FAILED_GOAL)) {
            return false;
        }

        !self
            .output_lines
            .iter()
            .any(|l| l.starts_with(FAILED_SUREFIRE) || l.starts_with(FAILED_COMPILER))
    }

    pub fn compilation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let start_trigger = match self.assignment.language {
            Language::Java => &*JAVA_COMPILATION_START,
            Language::Kotlin => &*KOTLIN_COMPILATION_START,
        };

        let mut start = None;
        let mut end = None;
        for (idx, line) in self.output_lines.iter().enumerate() {
            if start_trigger.is_match(line) {
                start = Some(idx + 1);
                log::trace!("Found start of compilation output (line {idx})");
            } else if start.is_some()
                && (line.starts_with("[INFO] BUILD FAILURE") || line.starts_with("[INFO] --- "))
            {
                end = Some(idx);
                break;
            }
        }
        if let (Some(start), Some(end)) = (start, end)
            && end > start
        {
            errors.extend(self.clean_compiler_lines(start, end));
        }

        let mut start = None;
        let mut end = None;
        for (idx, line) in self.output_lines.iter().enumerate() {
            if KOTLIN_TEST_COMPILATION_START.is_match(line) {
                start = Some(idx + 1);
            }
            if line.starts_with("[ERROR] -> [Help 1]") {
                end = Some(idx);
            }
        }
        if let Some(start) = start {
            let end = end.filter(|e| *e >= start).unwrap_or(self.output_lines.len());
            errors.extend(self.clean_compiler_lines(start, end));
        }

        errors
    }

    fn clean_compiler_lines(&self, start: usize, end: usize) -> impl Iterator<Item = String> + '_ {
        let folder = self.assignment.language.source_folder();
        let main_prefix = format!("[ERROR] {}/src/main/{folder}/", self.project_folder);
        let test_prefix = format!("[ERROR] {}/src/test/{folder}/", self.project_folder);

        self.output_lines[start..end]
            .iter()
            .filter(|l| l.starts_with("[ERROR] ") || l.starts_with("  "))
            .map(move |l| l.replace(&main_prefix, "").replace(&test_prefix, "[TEST] "))
    }

    pub fn checkstyle_validation_active(&self) -> bool {
        let marker = match self.assignment.language {
            Language::Java => CHECKSTYLE_START,
            Language::Kotlin => DETEKT_START,
        };
        self.output_lines.iter().any(|l| l.starts_with(marker))
    }

    pub fn checkstyle_errors(&self) -> Vec<String> {
        let folder = self.assignment.language.source_folder();
        let (start_marker, end_marker) = match self.assignment.language {
            Language::Java => (CHECKSTYLE_START, CHECKSTYLE_END),
            Language::Kotlin => (DETEKT_START, DETEKT_END),
        };

        let mut start = None;
        let mut end = None;
        for (idx, line) in self.output_lines.iter().enumerate() {
            if line.starts_with(start_marker) {
                start = Some(idx + 1);
            }
            if start.is_some_and(|s| idx >= s) && line.starts_with(end_marker) {
                end = Some(idx);
            }
        }

        let Some(start) = start else {
            return Vec::new();
        };
        let end = end.unwrap_or(self.output_lines.len());
        let block = &self.output_lines[start..end];

        match self.assignment.language {
            Language::Java => {
                let prefix = format!("[WARN] {}/src/main/{folder}/", self.project_folder);
                block
                    .iter()
                    .filter(|l| l.starts_with("[WARN] "))
                    .map(|l| l.replace(&prefix, ""))
                    .collect()
            }
            Language::Kotlin => {
                let prefix = format!("{}/src/main/{folder}/", self.project_folder);
                block
                    .iter()
                    .filter(|l| l.starts_with('\t'))
                    .map(|l| l.replace('\t', "").replace(&prefix, ""))
                    .collect()
            }
        }
    }

    fn results_of(&self, test_type: TestType) -> impl Iterator<Item = &JUnitResults> {
        self.junit_results
            .iter()
            .filter(move |r| r.is_of_type(test_type, &self.assignment))
    }

    /// `None` when no test class of this tier was found.
    pub fn junit_summary(&self, test_type: TestType) -> Option<TestSummary> {
        let suffix = self.assignment.mandatory_tests_suffix.as_deref();
        self.results_of(test_type).fold(None, |acc, r| {
            let mut summary = acc.unwrap_or(TestSummary {
                num_tests: 0,
                num_failures: 0,
                num_errors: 0,
                num_skipped: 0,
                elapsed: 0.0,
                num_mandatory_ok: 0,
            });
            summary.num_tests += r.num_tests;
            summary.num_failures += r.num_failures;
            summary.num_errors += r.num_errors;
            summary.num_skipped += r.num_skipped;
            summary.elapsed += r.time_elapsed;
            summary.num_mandatory_ok += r.num_mandatory_ok(suffix);
            Some(summary)
        })
    }

    pub fn has_junit_errors(&self, test_type: TestType) -> Option<bool> {
        self.junit_summary(test_type)
            .map(|s| s.num_errors > 0 || s.num_failures > 0)
    }

    /// Failed methods of the tier with stack traces reduced to the assignment's package.
    pub fn junit_errors(&self, test_type: TestType) -> Option<String> {
        let package = self.assignment.package();
        let result = self
            .results_of(test_type)
            .flat_map(|r| r.method_results.iter())
            .filter(|m| m.outcome != MethodOutcome::Success)
            .map(|m| m.render(package))
            .collect::<Vec<_>>()
            .join("\n");

        (!result.is_empty()).then_some(result)
    }

    pub fn elapsed_time_junit(&self) -> Option<f64> {
        let teacher = self.junit_summary(TestType::Teacher)?.elapsed;
        let hidden = self
            .junit_summary(TestType::Hidden)
            .map_or(0.0, |s| s.elapsed);
        Some(teacher + hidden)
    }

    /// Explains why the student tests fall short of the required minimum, if they do.
    pub fn not_enough_student_tests_message(&self) -> Option<String> {
        if !self.assignment.accepts_student_tests {
            return None;
        }
        let min = self.assignment.min_student_tests.unwrap_or(0);

        match self.junit_summary(TestType::Student) {
            None => Some(format!(
                "The submission doesn't include unit tests. \
                 The assignment requires a minimum of {min} tests."
            )),
            Some(summary) if summary.num_tests < min => Some(format!(
                "The submission only includes {} unit tests. \
                 The assignment requires a minimum of {min} tests.",
                summary.num_tests
            )),
            Some(_) => None,
        }
    }

    /// Line coverage over every coverage report, `None` when coverage was not measured.
    pub fn coverage_percent(&self) -> Option<u32> {
        if self.jacoco_results.is_empty() {
            return None;
        }
        let missed: u64 = self.jacoco_results.iter().map(|r| r.lines_missed).sum();
        let covered: u64 = self.jacoco_results.iter().map(|r| r.lines_covered).sum();
        let total = missed + covered;
        if total == 0 {
            return Some(0);
        }
        Some((covered as f64 / total as f64 * 100.0).round_ties_even() as u32)
    }
}
