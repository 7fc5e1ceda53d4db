use serde::Serialize;

use super::ParseError;

const LINE_MISSED_COLUMN: usize = 7;
const LINE_COVERED_COLUMN: usize = 8;

/// Line coverage aggregated over every row of a JaCoCo CSV report.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct JacocoResults {
    pub lines_missed: u64,
    pub lines_covered: u64,
    pub line_coverage_percent: u32,
}

/// Parses a JaCoCo CSV report. The first line is the header.
///
/// A report without any measurable line yields 0%.
pub fn parse_jacoco_csv(content: &str) -> Result<JacocoResults, ParseError> {
    let mut lines_missed = 0u64;
    let mut lines_covered = 0u64;

    for (idx, line) in content.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split(',').collect();
        lines_missed += column(&parts, LINE_MISSED_COLUMN, idx + 1)?;
        lines_covered += column(&parts, LINE_COVERED_COLUMN, idx + 1)?;
    }

    let total = lines_missed + lines_covered;
    let line_coverage_percent = if total == 0 {
        0
    } else {
        (lines_covered as f64 / total as f64 * 100.0).round_ties_even() as u32
    };

    Ok(JacocoResults {
        lines_missed,
        lines_covered,
        line_coverage_percent,
    })
}

fn column(parts: &[&str], index: usize, line: usize) -> Result<u64, ParseError> {
    let raw = parts.get(index).ok_or_else(|| ParseError::Csv {
        line,
        reason: format!("expected at least {} columns, found {}", index + 1, parts.len()),
    })?;

    raw.trim().parse().map_err(|_| ParseError::Csv {
        line,
        reason: format!("column {} is not a number: '{raw}'", index + 1),
    })
}
