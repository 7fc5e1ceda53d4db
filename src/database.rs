use std::fs;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::create_timestamp;
use crate::model::{GitSubmission, Indicator, IndicatorRecord, IndicatorValue, Submission};
use crate::status::SubmissionStatus;

const DATABASE_NAME: &str = "autograder.sqlite3";

pub fn get_db_path() -> PathBuf {
    use directories::ProjectDirs;

    let proj_dirs =
        ProjectDirs::from("", "", "autograder").expect("Unable to find user directory");
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).expect("Failed to create local data dir");

    data_dir.join(DATABASE_NAME)
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = init_pool(&db_url).await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

/// Opens `db_url` and creates the schema. `sqlite::memory:` is accepted for tests.
pub async fn init_pool(db_url: &str) -> sqlx::Result<SqlitePool> {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA foreign_keys = ON;",
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS build_reports (
            id            INTEGER  PRIMARY KEY AUTOINCREMENT,
            build_report  TEXT     NOT NULL
        );",
        r"
        CREATE TABLE IF NOT EXISTS git_submissions (
            id                  INTEGER  PRIMARY KEY AUTOINCREMENT,
            group_id            INTEGER  NOT NULL,
            assignment_id       TEXT     NOT NULL,
            git_repository_url  TEXT     NOT NULL,
            last_submission_id  INTEGER
        );",
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id                 INTEGER  PRIMARY KEY AUTOINCREMENT,
            assignment_id      TEXT     NOT NULL,
            group_id           INTEGER  NOT NULL,
            submitter_user_id  TEXT     NOT NULL,
            submission_folder  TEXT     NOT NULL,
            submission_date    TEXT     NOT NULL,
            status             TEXT     NOT NULL,
            status_date        TEXT     NOT NULL,
            build_report_id    INTEGER,
            coverage           INTEGER,
            marked_as_final    INTEGER  NOT NULL DEFAULT 0,
            git_submission_id  INTEGER,
            FOREIGN KEY (build_report_id)    REFERENCES build_reports (id),
            FOREIGN KEY (git_submission_id)  REFERENCES git_submissions (id)
        );",
        r"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_submissions_final
            ON submissions (group_id, assignment_id) WHERE marked_as_final = 1;",
        r"
        CREATE TABLE IF NOT EXISTS submission_reports (
            submission_id    INTEGER  NOT NULL,
            report_key       TEXT     NOT NULL,
            report_value     TEXT     NOT NULL,
            report_progress  INTEGER,
            report_goal      INTEGER,
            PRIMARY KEY (submission_id, report_key),
            FOREIGN KEY (submission_id)  REFERENCES submissions (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS junit_reports (
            submission_id  INTEGER  NOT NULL,
            file_name      TEXT     NOT NULL,
            xml_report     TEXT     NOT NULL,
            PRIMARY KEY (submission_id, file_name),
            FOREIGN KEY (submission_id)  REFERENCES submissions (id)
        );",
        r"
        CREATE TABLE IF NOT EXISTS jacoco_reports (
            submission_id  INTEGER  NOT NULL,
            file_name      TEXT     NOT NULL,
            csv_report     TEXT     NOT NULL,
            PRIMARY KEY (submission_id, file_name),
            FOREIGN KEY (submission_id)  REFERENCES submissions (id)
        );",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = std::fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Fields supplied by the upload or git collaborator when a project is ready to build.
#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct NewSubmission {
    pub assignment_id: String,
    pub group_id: i64,
    pub submitter_user_id: String,
    pub submission_folder: String,
    pub git_submission_id: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: i64,
    assignment_id: String,
    group_id: i64,
    submitter_user_id: String,
    submission_folder: String,
    submission_date: String,
    status: String,
    status_date: String,
    build_report_id: Option<i64>,
    coverage: Option<i64>,
    marked_as_final: bool,
    git_submission_id: Option<i64>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = sqlx::Error;

    fn try_from(row: SubmissionRow) -> sqlx::Result<Self> {
        let status =
            SubmissionStatus::from_code(&row.status).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Submission {
            id: row.id,
            assignment_id: row.assignment_id,
            group_id: row.group_id,
            submitter_user_id: row.submitter_user_id,
            submission_folder: row.submission_folder,
            submission_date: row.submission_date,
            status,
            status_date: row.status_date,
            build_report_id: row.build_report_id,
            coverage: row.coverage,
            marked_as_final: row.marked_as_final,
            git_submission_id: row.git_submission_id,
        })
    }
}

/// Inserts a new submission with status `SUBMITTED` and returns it.
pub async fn create_submission(pool: &SqlitePool, new: &NewSubmission) -> sqlx::Result<Submission> {
    let now = create_timestamp();

    let result = sqlx::query(
        r"
        INSERT INTO submissions
            (assignment_id, group_id, submitter_user_id, submission_folder,
             submission_date, status, status_date, git_submission_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(&new.assignment_id)
    .bind(new.group_id)
    .bind(&new.submitter_user_id)
    .bind(&new.submission_folder)
    .bind(&now)
    .bind(SubmissionStatus::Submitted.code())
    .bind(&now)
    .bind(new.git_submission_id)
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    fetch_submission(pool, id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn fetch_submission(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<Submission>> {
    log::debug!("Trying to fetch submission {id} from database");

    let row = sqlx::query_as::<_, SubmissionRow>(
        r"
        SELECT id, assignment_id, group_id, submitter_user_id, submission_folder,
               submission_date, status, status_date, build_report_id, coverage,
               marked_as_final, git_submission_id
        FROM submissions
        WHERE id = ?
        ",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Submission::try_from).transpose()
}

/// Persists the mutable part of a submission: status, report pointer and coverage.
pub async fn save_submission(pool: &SqlitePool, submission: &Submission) -> sqlx::Result<()> {
    sqlx::query(
        r"
        UPDATE submissions
        SET status = ?, status_date = ?, build_report_id = ?, coverage = ?
        WHERE id = ?
        ",
    )
    .bind(submission.status.code())
    .bind(&submission.status_date)
    .bind(submission.build_report_id)
    .bind(submission.coverage)
    .bind(submission.id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Like [`save_submission`], but only while the stored status is still `expected`.
/// Returns `false` when another writer changed the status in the meantime.
pub async fn save_submission_if_status(
    pool: &SqlitePool,
    submission: &Submission,
    expected: SubmissionStatus,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE submissions
        SET status = ?, status_date = ?, build_report_id = ?, coverage = ?
        WHERE id = ? AND status = ?
        ",
    )
    .bind(submission.status.code())
    .bind(&submission.status_date)
    .bind(submission.build_report_id)
    .bind(submission.coverage)
    .bind(submission.id)
    .bind(expected.code())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Flags one submission as final, clearing the flag on every other submission of
/// the same group and assignment. Returns `false` if the submission does not exist.
pub async fn mark_as_final(pool: &SqlitePool, id: i64) -> sqlx::Result<bool> {
    let mut tx = pool.begin().await?;

    let owner: Option<(i64, String)> =
        sqlx::query_as("SELECT group_id, assignment_id FROM submissions WHERE id = ?")
            .bind(id)
            .fetch_optional(tx.as_mut())
            .await?;

    let Some((group_id, assignment_id)) = owner else {
        return Ok(false);
    };

    sqlx::query(
        "UPDATE submissions SET marked_as_final = 0 WHERE group_id = ? AND assignment_id = ?",
    )
    .bind(group_id)
    .bind(&assignment_id)
    .execute(tx.as_mut())
    .await?;

    sqlx::query("UPDATE submissions SET marked_as_final = 1 WHERE id = ?")
        .bind(id)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;
    Ok(true)
}

pub async fn insert_build_report(pool: &SqlitePool, build_output: &str) -> sqlx::Result<i64> {
    let result = sqlx::query("INSERT INTO build_reports (build_report) VALUES (?)")
        .bind(build_output)
        .execute(pool)
        .await?;
    Ok(result.last_insert_rowid())
}

pub async fn fetch_build_report(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<String>> {
    sqlx::query_scalar("SELECT build_report FROM build_reports WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn save_indicator(
    pool: &SqlitePool,
    submission_id: i64,
    record: &IndicatorRecord,
) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO submission_reports
            (submission_id, report_key, report_value, report_progress, report_goal)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (submission_id, report_key) DO UPDATE SET
            report_value = excluded.report_value,
            report_progress = excluded.report_progress,
            report_goal = excluded.report_goal
        ",
    )
    .bind(submission_id)
    .bind(record.indicator.code())
    .bind(record.value.as_str())
    .bind(record.progress.map(i64::from))
    .bind(record.goal.map(i64::from))
    .execute(pool)
    .await?;

    Ok(())
}

/// Removes every indicator of the submission except `keep`.
pub async fn delete_indicators_except(
    pool: &SqlitePool,
    submission_id: i64,
    keep: Indicator,
) -> sqlx::Result<u64> {
    let result =
        sqlx::query("DELETE FROM submission_reports WHERE submission_id = ? AND report_key <> ?")
            .bind(submission_id)
            .bind(keep.code())
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}

pub async fn fetch_indicators(
    pool: &SqlitePool,
    submission_id: i64,
) -> sqlx::Result<Vec<IndicatorRecord>> {
    let rows: Vec<(String, String, Option<i64>, Option<i64>)> = sqlx::query_as(
        r"
        SELECT report_key, report_value, report_progress, report_goal
        FROM submission_reports
        WHERE submission_id = ?
        ",
    )
    .bind(submission_id)
    .fetch_all(pool)
    .await?;

    let mut records: Vec<IndicatorRecord> = rows
        .into_iter()
        .filter_map(|(key, value, progress, goal)| {
            let (Some(indicator), Some(value)) =
                (Indicator::from_code(&key), IndicatorValue::parse(&value))
            else {
                log::warn!("Ignoring unknown indicator {key}={value} of submission {submission_id}");
                return None;
            };
            Some(IndicatorRecord {
                indicator,
                value,
                progress: progress.and_then(|p| u32::try_from(p).ok()),
                goal: goal.and_then(|g| u32::try_from(g).ok()),
            })
        })
        .collect();

    records.sort_by_key(|r| r.indicator);
    Ok(records)
}

/// Kind of stored build artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    JUnit,
    Jacoco,
}

impl ArtifactKind {
    fn table(self) -> &'static str {
        match self {
            Self::JUnit => "junit_reports",
            Self::Jacoco => "jacoco_reports",
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::JUnit => "xml_report",
            Self::Jacoco => "csv_report",
        }
    }
}

pub async fn save_artifact(
    pool: &SqlitePool,
    kind: ArtifactKind,
    submission_id: i64,
    file_name: &str,
    content: &str,
) -> sqlx::Result<()> {
    let sql = format!(
        "INSERT INTO {table} (submission_id, file_name, {column}) VALUES (?, ?, ?)
         ON CONFLICT (submission_id, file_name) DO UPDATE SET {column} = excluded.{column}",
        table = kind.table(),
        column = kind.column(),
    );
    sqlx::query(&sql)
        .bind(submission_id)
        .bind(file_name)
        .bind(content)
        .execute(pool)
        .await?;
    Ok(())
}

/// Stored artifacts of the submission as `(file name, content)`, ordered by file name.
pub async fn fetch_artifacts(
    pool: &SqlitePool,
    kind: ArtifactKind,
    submission_id: i64,
) -> sqlx::Result<Vec<(String, String)>> {
    let sql = format!(
        "SELECT file_name, {column} FROM {table} WHERE submission_id = ? ORDER BY file_name",
        table = kind.table(),
        column = kind.column(),
    );
    sqlx::query_as(&sql).bind(submission_id).fetch_all(pool).await
}

pub async fn delete_artifacts(
    pool: &SqlitePool,
    kind: ArtifactKind,
    submission_id: i64,
) -> sqlx::Result<u64> {
    let sql = format!("DELETE FROM {} WHERE submission_id = ?", kind.table());
    let result = sqlx::query(&sql).bind(submission_id).execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn create_git_submission(
    pool: &SqlitePool,
    group_id: i64,
    assignment_id: &str,
    git_repository_url: &str,
) -> sqlx::Result<i64> {
    let result = sqlx::query(
        "INSERT INTO git_submissions (group_id, assignment_id, git_repository_url) VALUES (?, ?, ?)",
    )
    .bind(group_id)
    .bind(assignment_id)
    .bind(git_repository_url)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn fetch_git_submission(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<GitSubmission>> {
    let row: Option<(i64, i64, String, String, Option<i64>)> = sqlx::query_as(
        r"
        SELECT id, group_id, assignment_id, git_repository_url, last_submission_id
        FROM git_submissions
        WHERE id = ?
        ",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(
        |(id, group_id, assignment_id, git_repository_url, last_submission_id)| GitSubmission {
            id,
            group_id,
            assignment_id,
            git_repository_url,
            last_submission_id,
        },
    ))
}

pub async fn update_git_last_submission(
    pool: &SqlitePool,
    git_submission_id: i64,
    submission_id: i64,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE git_submissions SET last_submission_id = ? WHERE id = ?")
        .bind(submission_id)
        .bind(git_submission_id)
        .execute(pool)
        .await?;
    Ok(())
}
