use std::path::Path;

use actix_web::{HttpResponse, Responder, delete, get, post, put, web};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use super::{external_error, internal_error, invalid_argument, invalid_state, not_found};
use crate::database::{self as db, NewSubmission};
use crate::model::Submission;
use crate::report::full_report;
use crate::scheduler::Scheduler;
use crate::status::SubmissionStatus;
use crate::worker::{BuildRequest, BuildTask, BuildTasks, BuildWorker, TaskPhase};

/// A prepared project folder handed over by the upload or git collaborator.
#[derive(Serialize, Deserialize, Debug)]
pub struct SubmissionUpload {
    #[serde(flatten)]
    pub submission: NewSubmission,
    /// Who uploaded the project, when different from the submitter.
    pub principal: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct SubmissionState {
    pub submission: Submission,
    pub task: Option<BuildTask>,
}

#[derive(Deserialize)]
pub struct ReportQuery {
    #[serde(default)]
    pub teacher: bool,
}

async fn fetch_or_respond(pool: &SqlitePool, id: i64) -> Result<Submission, HttpResponse> {
    match db::fetch_submission(pool, id).await {
        Ok(Some(submission)) => Ok(submission),
        Ok(None) => {
            log::info!("Got nothing with submission id {id} from database");
            Err(not_found(format!("Submission {id} not found.")))
        }
        Err(e) => {
            log::error!("Failed to retrieve submission {id} from database: {e}");
            Err(external_error())
        }
    }
}

async fn submission_state(pool: &SqlitePool, tasks: &BuildTasks, id: i64) -> HttpResponse {
    match fetch_or_respond(pool, id).await {
        Ok(submission) => HttpResponse::Ok().json(SubmissionState {
            submission,
            task: tasks.get(&id),
        }),
        Err(response) => response,
    }
}

#[post("/submissions")]
pub async fn post_submission_handler(
    pool: web::Data<SqlitePool>,
    worker: web::Data<BuildWorker>,
    scheduler: web::Data<Scheduler>,
    tasks: web::Data<BuildTasks>,
    body: web::Json<SubmissionUpload>,
) -> impl Responder {
    let SubmissionUpload {
        submission: new,
        principal,
    } = body.into_inner();

    if worker.assignment(&new.assignment_id).is_none() {
        return not_found(format!("Assignment {} not found.", new.assignment_id));
    }
    if !Path::new(&new.submission_folder).is_dir() {
        return invalid_argument(format!(
            "Submission folder {} does not exist.",
            new.submission_folder
        ));
    }

    let submission = match db::create_submission(&pool, &new).await {
        Ok(submission) => submission,
        Err(e) => {
            log::error!("Failed to insert submission into database: {e}");
            return external_error();
        }
    };
    log::info!(
        "Created submission {} of group {} for assignment {}",
        submission.id,
        submission.group_id,
        submission.assignment_id
    );

    let request = BuildRequest {
        submission_id: submission.id,
        principal,
        rebuild_by_teacher: false,
        keep_status_date: false,
    };
    worker
        .clone()
        .into_inner()
        .enqueue(&scheduler, &tasks.clone().into_inner(), request)
        .await;

    submission_state(&pool, &tasks, submission.id).await
}

#[get("/submissions/{id}")]
pub async fn get_submission_handler(
    pool: web::Data<SqlitePool>,
    tasks: web::Data<BuildTasks>,
    path: web::Path<(i64,)>,
) -> impl Responder {
    let id = path.into_inner().0;
    submission_state(&pool, &tasks, id).await
}

#[get("/submissions/{id}/report")]
pub async fn get_report_handler(
    pool: web::Data<SqlitePool>,
    worker: web::Data<BuildWorker>,
    path: web::Path<(i64,)>,
    query: web::Query<ReportQuery>,
) -> impl Responder {
    let id = path.into_inner().0;
    let submission = match fetch_or_respond(&pool, id).await {
        Ok(submission) => submission,
        Err(response) => return response,
    };
    let Some(assignment) = worker.assignment(&submission.assignment_id) else {
        log::error!(
            "Submission {id} refers to unknown assignment {}",
            submission.assignment_id
        );
        return internal_error();
    };

    match full_report(&pool, worker.report_builder(), submission, assignment, query.teacher).await
    {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => {
            log::error!("Failed to build the report of submission {id}: {e}");
            external_error()
        }
    }
}

#[post("/submissions/{id}/rebuild")]
pub async fn post_rebuild_handler(
    pool: web::Data<SqlitePool>,
    worker: web::Data<BuildWorker>,
    scheduler: web::Data<Scheduler>,
    tasks: web::Data<BuildTasks>,
    path: web::Path<(i64,)>,
) -> impl Responder {
    let id = path.into_inner().0;
    let mut submission = match fetch_or_respond(&pool, id).await {
        Ok(submission) => submission,
        Err(response) => return response,
    };

    if submission.status.is_pending() {
        return invalid_state(format!("Submission {id} is already waiting for a build."));
    }
    let previous = submission.status;
    if let Err(e) = submission.set_status(SubmissionStatus::SubmittedForRebuild, true) {
        log::info!("Rebuild of submission {id} refused: {e}");
        return invalid_state(format!("Submission {id} cannot be rebuilt: {e}."));
    }
    match db::save_submission_if_status(&pool, &submission, previous).await {
        Ok(true) => {}
        Ok(false) => return changed_concurrently(id),
        Err(e) => {
            log::error!("Failed to mark submission {id} for rebuild: {e}");
            return external_error();
        }
    }

    let request = BuildRequest {
        submission_id: id,
        principal: None,
        rebuild_by_teacher: true,
        keep_status_date: true,
    };
    worker
        .clone()
        .into_inner()
        .enqueue(&scheduler, &tasks.clone().into_inner(), request)
        .await;

    submission_state(&pool, &tasks, id).await
}

#[put("/submissions/{id}/final")]
pub async fn put_final_handler(
    pool: web::Data<SqlitePool>,
    tasks: web::Data<BuildTasks>,
    path: web::Path<(i64,)>,
) -> impl Responder {
    let id = path.into_inner().0;
    match db::mark_as_final(&pool, id).await {
        Ok(true) => {
            log::info!("Submission {id} marked as final");
            submission_state(&pool, &tasks, id).await
        }
        Ok(false) => not_found(format!("Submission {id} not found.")),
        Err(e) => {
            log::error!("Failed to mark submission {id} as final: {e}");
            external_error()
        }
    }
}

#[delete("/submissions/{id}")]
pub async fn delete_submission_handler(
    pool: web::Data<SqlitePool>,
    scheduler: web::Data<Scheduler>,
    tasks: web::Data<BuildTasks>,
    path: web::Path<(i64,)>,
) -> impl Responder {
    let id = path.into_inner().0;
    let mut submission = match fetch_or_respond(&pool, id).await {
        Ok(submission) => submission,
        Err(response) => return response,
    };
    if submission.status == SubmissionStatus::Deleted {
        return invalid_state(format!("Submission {id} is already deleted."));
    }

    if let Some(BuildTask {
        job_id: Some(job_id),
        phase: TaskPhase::Queued,
        ..
    }) = tasks.get(&id)
        && scheduler.cancel(job_id).await
    {
        log::info!("Cancelled the queued build of submission {id}");
    }

    let previous = submission.status;
    if let Err(e) = submission.set_status(SubmissionStatus::Deleted, false) {
        log::error!("Failed to delete submission {id}: {e}");
        return internal_error();
    }
    match db::save_submission_if_status(&pool, &submission, previous).await {
        Ok(true) => HttpResponse::Ok().json(submission),
        Ok(false) => changed_concurrently(id),
        Err(e) => {
            log::error!("Failed to delete submission {id}: {e}");
            external_error()
        }
    }
}

/// A build stored its result between our read and our write.
fn changed_concurrently(id: i64) -> HttpResponse {
    log::info!("Submission {id} changed while being updated");
    invalid_state(format!("Submission {id} changed meanwhile, please retry."))
}
