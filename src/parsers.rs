mod jacoco;
mod junit;

pub use jacoco::{JacocoResults, parse_jacoco_csv};
pub use junit::{JUnitMethodResult, JUnitResults, MethodOutcome, TestType, parse_junit_xml};

use thiserror::Error;

/// Failure to turn a build artifact into structured results.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed test report: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("unexpected root element <{0}> in test report")]
    UnexpectedRoot(String),
    #[error("expected exactly one test suite per report, found {0}")]
    SuiteCount(usize),
    #[error("invalid value '{value}' for attribute '{attribute}'")]
    InvalidAttribute { attribute: String, value: String },
    #[error("coverage report line {line}: {reason}")]
    Csv { line: usize, reason: String },
}
