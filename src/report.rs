mod build_report;
mod builder;
mod summary;

pub use build_report::{BuildReport, TestSummary};
pub use builder::{JACOCO_REPORTS_DIR, ReportBuilder, SUREFIRE_REPORTS_DIR, read_artifacts};
pub use summary::{BuildDetails, FullBuildReport, SummaryEntry, full_report, visible_indicators};
