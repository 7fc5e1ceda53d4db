use std::fs;
use std::io;
use std::path::Path;

use sqlx::SqlitePool;

use super::BuildReport;
use crate::database::{self as db, ArtifactKind};
use crate::model::Assignment;
use crate::parsers::{JUnitResults, JacocoResults, parse_jacoco_csv, parse_junit_xml};

pub const SUREFIRE_REPORTS_DIR: &str = "target/surefire-reports";
pub const JACOCO_REPORTS_DIR: &str = "target/site/jacoco";

/// Assembles [`BuildReport`]s, preferring artifacts already stored for a submission
/// over the files left in the project folder by the last build.
#[derive(Clone)]
pub struct ReportBuilder {
    pool: SqlitePool,
}

impl ReportBuilder {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn build(
        &self,
        output_lines: Vec<String>,
        project_folder: &Path,
        assignment: &Assignment,
        submission_id: Option<i64>,
    ) -> BuildReport {
        let junit_results = self.load_junit_results(project_folder, submission_id).await;
        let jacoco_results = self.load_jacoco_results(project_folder, submission_id).await;

        BuildReport {
            output_lines,
            project_folder: project_folder.display().to_string(),
            assignment: assignment.clone(),
            junit_results,
            jacoco_results,
        }
    }

    pub async fn load_junit_results(
        &self,
        project_folder: &Path,
        submission_id: Option<i64>,
    ) -> Vec<JUnitResults> {
        let artifacts = self
            .load_artifacts(ArtifactKind::JUnit, project_folder, submission_id)
            .await;
        parse_all(artifacts, parse_junit_xml)
    }

    pub async fn load_jacoco_results(
        &self,
        project_folder: &Path,
        submission_id: Option<i64>,
    ) -> Vec<JacocoResults> {
        let artifacts = self
            .load_artifacts(ArtifactKind::Jacoco, project_folder, submission_id)
            .await;
        parse_all(artifacts, parse_jacoco_csv)
    }

    /// Stored rows of the submission first, the project's `target` folder otherwise.
    async fn load_artifacts(
        &self,
        kind: ArtifactKind,
        project_folder: &Path,
        submission_id: Option<i64>,
    ) -> Vec<(String, String)> {
        if let Some(id) = submission_id {
            match db::fetch_artifacts(&self.pool, kind, id).await {
                Ok(stored) if !stored.is_empty() => {
                    log::debug!("Using {} stored {kind:?} reports of submission {id}", stored.len());
                    return stored;
                }
                Ok(_) => {}
                Err(e) => log::error!("Failed to fetch stored {kind:?} reports of submission {id}: {e}"),
            }
        }

        let (dir, extension) = match kind {
            ArtifactKind::JUnit => (SUREFIRE_REPORTS_DIR, "xml"),
            ArtifactKind::Jacoco => (JACOCO_REPORTS_DIR, "csv"),
        };
        read_artifacts(&project_folder.join(dir), extension).unwrap_or_else(|e| {
            log::error!("Failed to read {kind:?} reports under {}: {e}", project_folder.display());
            Vec::new()
        })
    }
}

/// Reads every `*.{extension}` file directly under `dir`, sorted by file name.
/// A missing directory means the build produced no such report.
pub fn read_artifacts(dir: &Path, extension: &str) -> io::Result<Vec<(String, String)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut artifacts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        artifacts.push((name, fs::read_to_string(&path)?));
    }
    artifacts.sort();

    Ok(artifacts)
}

fn parse_all<T, E: std::fmt::Display>(
    artifacts: Vec<(String, String)>,
    parse: impl Fn(&str) -> Result<T, E>,
) -> Vec<T> {
    artifacts
        .into_iter()
        .filter_map(|(name, content)| match parse(&content) {
            Ok(result) => Some(result),
            Err(e) => {
                log::warn!("Skipping unparseable report {name}: {e}");
                None
            }
        })
        .collect()
}
