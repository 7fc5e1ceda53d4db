use roxmltree::Node;
use serde::Serialize;

use super::ParseError;
use crate::model::{Assignment, TEACHER_HIDDEN_TEST_NAME_PREFIX, TEACHER_TEST_NAME_PREFIX};

/// Tier a test class belongs to, derived from its name.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestType {
    Student,
    Teacher,
    Hidden,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodOutcome {
    Success,
    Error,
    Failure,
    Ignored,
}

impl MethodOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Failure => "FAILURE",
            Self::Ignored => "IGNORED",
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JUnitMethodResult {
    pub method_name: String,
    pub full_method_name: String,
    pub outcome: MethodOutcome,
    pub failure_type: Option<String>,
    pub failure_error_line: Option<String>,
    /// Non-blank lines of the failure message and stack trace.
    pub failure_detail: Vec<String>,
}

impl JUnitMethodResult {
    /// Failure detail without the stack frames that do not mention `package`.
    pub fn filter_stacktrace(&self, package: &str) -> Vec<&str> {
        self.failure_detail
            .iter()
            .map(String::as_str)
            .filter(|line| !line.starts_with("\tat") || line.contains(package))
            .collect()
    }

    /// Human readable block used when listing failed tests to students.
    pub fn render(&self, package: &str) -> String {
        format!(
            "{}: {}\n{}\n\n",
            self.outcome.label(),
            self.full_method_name,
            self.filter_stacktrace(package).join("\n")
        )
    }

    pub fn class_name(&self) -> &str {
        let class = self
            .full_method_name
            .strip_suffix(&self.method_name)
            .and_then(|c| c.strip_suffix('.'))
            .unwrap_or(&self.full_method_name);
        class.rsplit('.').next().unwrap_or(class)
    }
}

/// Results of one test class, as reported by one surefire XML file.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JUnitResults {
    pub test_class_name: String,
    pub full_test_class_name: String,
    /// Executed tests, skipped ones excluded.
    pub num_tests: u32,
    pub num_errors: u32,
    pub num_failures: u32,
    pub num_skipped: u32,
    pub time_elapsed: f64,
    pub method_results: Vec<JUnitMethodResult>,
}

impl JUnitResults {
    pub fn is_teacher_public(&self, assignment: &Assignment) -> bool {
        if self.is_teacher_hidden() {
            return false;
        }

        if assignment.accepts_student_tests {
            self.test_class_name.starts_with(TEACHER_TEST_NAME_PREFIX)
        } else {
            true
        }
    }

    pub fn is_teacher_hidden(&self) -> bool {
        self.test_class_name
            .starts_with(TEACHER_HIDDEN_TEST_NAME_PREFIX)
    }

    pub fn is_student(&self, assignment: &Assignment) -> bool {
        assignment.accepts_student_tests
            && !self.test_class_name.starts_with(TEACHER_TEST_NAME_PREFIX)
            && !self.is_teacher_hidden()
    }

    pub fn is_of_type(&self, test_type: TestType, assignment: &Assignment) -> bool {
        match test_type {
            TestType::Teacher => self.is_teacher_public(assignment),
            TestType::Hidden => self.is_teacher_hidden(),
            TestType::Student => self.is_student(assignment),
        }
    }

    /// Passed test methods whose name ends with the assignment's mandatory suffix.
    pub fn num_mandatory_ok(&self, suffix: Option<&str>) -> u32 {
        let Some(suffix) = suffix.filter(|s| !s.is_empty()) else {
            return 0;
        };
        self.method_results
            .iter()
            .filter(|m| m.outcome == MethodOutcome::Success && m.method_name.ends_with(suffix))
            .count() as u32
    }
}

/// Parses a surefire-style XML report holding exactly one `testsuite`.
pub fn parse_junit_xml(content: &str) -> Result<JUnitResults, ParseError> {
    let doc = roxmltree::Document::parse(content)?;
    let root = doc.root_element();

    let suite = match root.tag_name().name() {
        "testsuite" => root,
        "testsuites" => {
            let suites: Vec<Node> = root
                .children()
                .filter(|n| n.has_tag_name("testsuite"))
                .collect();
            match suites.as_slice() {
                [suite] => *suite,
                _ => return Err(ParseError::SuiteCount(suites.len())),
            }
        }
        other => return Err(ParseError::UnexpectedRoot(other.to_string())),
    };

    let full_test_class_name = suite.attribute("name").unwrap_or_default().to_string();
    let test_class_name = full_test_class_name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_string();

    let method_results = suite
        .children()
        .filter(|n| n.has_tag_name("testcase"))
        .map(|n| parse_test_case(n, &full_test_class_name))
        .collect::<Vec<_>>();

    let count_of = |outcome| {
        method_results
            .iter()
            .filter(|m| m.outcome == outcome)
            .count() as u32
    };

    let raw_tests = count_attribute(suite, "tests")?.unwrap_or(method_results.len() as u32);
    let num_errors = count_attribute(suite, "errors")?.unwrap_or_else(|| count_of(MethodOutcome::Error));
    let num_failures =
        count_attribute(suite, "failures")?.unwrap_or_else(|| count_of(MethodOutcome::Failure));
    let num_skipped =
        count_attribute(suite, "skipped")?.unwrap_or_else(|| count_of(MethodOutcome::Ignored));

    Ok(JUnitResults {
        test_class_name,
        full_test_class_name,
        num_tests: raw_tests.saturating_sub(num_skipped),
        num_errors,
        num_failures,
        num_skipped,
        time_elapsed: parse_time(suite.attribute("time"))?,
        method_results,
    })
}

fn parse_test_case(node: Node, full_test_class_name: &str) -> JUnitMethodResult {
    let method_name = node.attribute("name").unwrap_or_default().to_string();
    let class_name = node.attribute("classname").unwrap_or(full_test_class_name);
    let full_method_name = format!("{class_name}.{method_name}");

    let child = |tag: &str| node.children().find(|c| c.has_tag_name(tag));
    let (outcome, marker) = if let Some(error) = child("error") {
        (MethodOutcome::Error, Some(error))
    } else if let Some(failure) = child("failure") {
        (MethodOutcome::Failure, Some(failure))
    } else if child("skipped").is_some() {
        (MethodOutcome::Ignored, None)
    } else {
        (MethodOutcome::Success, None)
    };

    let failure_detail: Vec<String> = marker
        .and_then(|m| m.text())
        .map(|text| {
            text.lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let failure_error_line = find_error_line(&failure_detail, class_name);

    JUnitMethodResult {
        method_name,
        full_method_name,
        outcome,
        failure_type: marker.and_then(|m| m.attribute("type")).map(str::to_string),
        failure_error_line,
        failure_detail,
    }
}

/// Line number of the first stack frame inside the test class, e.g.
/// `\tat org.example.TestTeacher.testSum(TestTeacher.java:12)` gives `12`.
fn find_error_line(detail: &[String], class_name: &str) -> Option<String> {
    let prefix = format!("{class_name}.");
    detail
        .iter()
        .map(|l| l.trim_start())
        .filter_map(|l| l.strip_prefix("at "))
        .find(|frame| frame.starts_with(&prefix))
        .and_then(|frame| {
            let location = frame.rsplit_once('(')?.1.strip_suffix(')')?;
            let line = location.rsplit_once(':')?.1;
            (!line.is_empty() && line.chars().all(|c| c.is_ascii_digit()))
                .then(|| line.to_string())
        })
}

fn count_attribute(node: Node, attribute: &str) -> Result<Option<u32>, ParseError> {
    node.attribute(attribute)
        .map(|v| {
            v.trim().parse().map_err(|_| ParseError::InvalidAttribute {
                attribute: attribute.to_string(),
                value: v.to_string(),
            })
        })
        .transpose()
}

fn parse_time(value: Option<&str>) -> Result<f64, ParseError> {
    match value {
        None => Ok(0.0),
        // surefire may print thousands separators, e.g. "1,024.5"
        Some(v) => v
            .replace(',', "")
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidAttribute {
                attribute: "time".to_string(),
                value: v.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TEACHER_REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuite xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" name="org.dropproject.samples.TestTeacherProject" time="0.042" tests="4" errors="1" skipped="1" failures="1">
  <properties>
    <property name="java.version" value="17"/>
  </properties>
  <testcase name="testFuncaoParaTestar" classname="org.dropproject.samples.TestTeacherProject" time="0.002"/>
  <testcase name="testFuncaoLentaParaTestar" classname="org.dropproject.samples.TestTeacherProject" time="0.03">
    <failure message="expected:&lt;3&gt; but was:&lt;2&gt;" type="java.lang.AssertionError"><![CDATA[java.lang.AssertionError: expected:<3> but was:<2>
	at org.junit.Assert.fail(Assert.java:88)
	at org.junit.Assert.assertEquals(Assert.java:645)

	at org.dropproject.samples.TestTeacherProject.testFuncaoLentaParaTestar(TestTeacherProject.java:17)
]]></failure>
  </testcase>
  <testcase name="testDivide" classname="org.dropproject.samples.TestTeacherProject" time="0.001">
    <error message="/ by zero" type="java.lang.ArithmeticException">java.lang.ArithmeticException: / by zero
	at org.dropproject.samples.Main.divide(Main.java:9)
	at org.dropproject.samples.TestTeacherProject.testDivide(TestTeacherProject.java:22)
	at sun.reflect.NativeMethodAccessorImpl.invoke0(Native Method)
</error>
  </testcase>
  <testcase name="testIgnored" classname="org.dropproject.samples.TestTeacherProject" time="0">
    <skipped/>
  </testcase>
</testsuite>
"#;

    fn assignment(accepts_student_tests: bool) -> Assignment {
        Assignment {
            id: "sample".to_string(),
            name: "Sample".to_string(),
            package_name: Some("org.dropproject.samples".to_string()),
            language: Default::default(),
            max_memory_mb: None,
            accepts_student_tests,
            min_student_tests: None,
            calculate_student_tests_coverage: false,
            mandatory_tests_suffix: None,
            hidden_tests_visibility: None,
            folder: None,
        }
    }

    fn suite_named(name: &str) -> JUnitResults {
        parse_junit_xml(&format!(r#"<testsuite name="{name}" tests="1"/>"#)).unwrap()
    }

    #[test]
    fn test_counts_exclude_skipped() {
        let result = parse_junit_xml(TEACHER_REPORT).unwrap();
        assert_eq!(result.test_class_name, "TestTeacherProject");
        assert_eq!(
            result.full_test_class_name,
            "org.dropproject.samples.TestTeacherProject"
        );
        assert_eq!(result.num_tests, 3);
        assert_eq!(result.num_skipped, 1);
        assert_eq!(result.num_errors, 1);
        assert_eq!(result.num_failures, 1);
        assert!((result.time_elapsed - 0.042).abs() < 1e-9);
    }

    #[test]
    fn test_method_outcomes() {
        let result = parse_junit_xml(TEACHER_REPORT).unwrap();
        let outcomes: Vec<_> = result.method_results.iter().map(|m| m.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                MethodOutcome::Success,
                MethodOutcome::Failure,
                MethodOutcome::Error,
                MethodOutcome::Ignored
            ]
        );

        let failure = &result.method_results[1];
        assert_eq!(failure.failure_type.as_deref(), Some("java.lang.AssertionError"));
        assert_eq!(failure.failure_error_line.as_deref(), Some("17"));
        assert_eq!(failure.failure_detail.len(), 4);
        assert_eq!(failure.class_name(), "TestTeacherProject");
    }

    #[test]
    fn test_filter_stacktrace_keeps_package_frames() {
        let result = parse_junit_xml(TEACHER_REPORT).unwrap();
        let error = &result.method_results[2];
        assert_eq!(
            error.filter_stacktrace("org.dropproject.samples"),
            vec![
                "java.lang.ArithmeticException: / by zero",
                "\tat org.dropproject.samples.Main.divide(Main.java:9)",
                "\tat org.dropproject.samples.TestTeacherProject.testDivide(TestTeacherProject.java:22)",
            ]
        );
        assert!(error.render("org.dropproject.samples").starts_with(
            "ERROR: org.dropproject.samples.TestTeacherProject.testDivide\n"
        ));
    }

    #[test]
    fn test_testsuites_wrapper_with_one_suite() {
        let xml = r#"<testsuites><testsuite name="a.TestX" tests="2" skipped="0">
            <testcase name="t1"/><testcase name="t2"/></testsuite></testsuites>"#;
        let result = parse_junit_xml(xml).unwrap();
        assert_eq!(result.num_tests, 2);
        assert_eq!(result.method_results[0].full_method_name, "a.TestX.t1");
    }

    #[test]
    fn test_more_than_one_suite_is_rejected() {
        let xml = r#"<testsuites><testsuite name="a"/><testsuite name="b"/></testsuites>"#;
        assert!(matches!(parse_junit_xml(xml), Err(ParseError::SuiteCount(2))));

        let xml = r#"<testsuites></testsuites>"#;
        assert!(matches!(parse_junit_xml(xml), Err(ParseError::SuiteCount(0))));
    }

    #[test]
    fn test_invalid_documents() {
        assert!(matches!(parse_junit_xml("<testsuite"), Err(ParseError::Xml(_))));
        assert!(matches!(
            parse_junit_xml("<report/>"),
            Err(ParseError::UnexpectedRoot(_))
        ));
        assert!(matches!(
            parse_junit_xml(r#"<testsuite tests="many"/>"#),
            Err(ParseError::InvalidAttribute { .. })
        ));
    }

    #[test]
    fn test_missing_counters_fall_back_to_children() {
        let xml = r#"<testsuite name="a.TestY">
            <testcase name="ok"/>
            <testcase name="bad"><failure>boom</failure></testcase>
            <testcase name="skip"><skipped/></testcase>
        </testsuite>"#;
        let result = parse_junit_xml(xml).unwrap();
        assert_eq!(result.num_tests, 2);
        assert_eq!(result.num_failures, 1);
        assert_eq!(result.num_errors, 0);
    }

    #[test]
    fn test_tier_classification() {
        let with_students = assignment(true);
        let without_students = assignment(false);

        let teacher = suite_named("org.x.TestTeacherCalc");
        let hidden = suite_named("org.x.TestTeacherHiddenCalc");
        let student = suite_named("org.x.TestCalc");

        assert!(teacher.is_teacher_public(&with_students));
        assert!(!teacher.is_student(&with_students));
        assert!(hidden.is_teacher_hidden());
        assert!(!hidden.is_teacher_public(&with_students));
        assert!(!hidden.is_student(&with_students));
        assert!(student.is_student(&with_students));
        assert!(!student.is_teacher_public(&with_students));

        // without student tests every non-hidden class counts as the teacher's
        assert!(student.is_teacher_public(&without_students));
        assert!(!student.is_student(&without_students));
    }

    #[test]
    fn test_mandatory_suffix() {
        let xml = r#"<testsuite name="a.TestTeacherZ" tests="3">
            <testcase name="testA_MANDATORY"/>
            <testcase name="testB_MANDATORY"><failure>no</failure></testcase>
            <testcase name="testC"/>
        </testsuite>"#;
        let result = parse_junit_xml(xml).unwrap();
        assert_eq!(result.num_mandatory_ok(Some("_MANDATORY")), 1);
        assert_eq!(result.num_mandatory_ok(None), 0);
    }
}
