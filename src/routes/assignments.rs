use actix_web::{HttpResponse, Responder, get, post, web};
use serde::Serialize;

use super::{invalid_argument, not_found};
use crate::report::BuildDetails;
use crate::scheduler::{JobOutcome, Scheduler};
use crate::status::SubmissionStatus;
use crate::worker::{AssignmentCheck, BuildWorker, CheckTasks, derive_indicators};

#[derive(Serialize, Debug)]
struct CheckCreated {
    task_id: u64,
}

/// Builds the reference solution of an assignment in the background.
/// The result is polled with `GET /tasks/{id}`.
#[post("/assignments/{id}/check")]
pub async fn post_assignment_check_handler(
    worker: web::Data<BuildWorker>,
    scheduler: web::Data<Scheduler>,
    checks: web::Data<CheckTasks>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let assignment_id = path.into_inner().0;
    let Some(assignment) = worker.assignment(&assignment_id).cloned() else {
        return not_found(format!("Assignment {assignment_id} not found."));
    };
    let Some(folder) = assignment.folder.clone() else {
        return invalid_argument(format!("Assignment {assignment_id} has no folder to check."));
    };

    let job_worker = worker.clone().into_inner();
    let job_checks = checks.clone().into_inner();
    let ticket = scheduler
        .submit(move |ctx| async move {
            let result = job_worker
                .check_assignment(&ctx.tracker, &folder, &assignment, None)
                .await?;
            let check = match result {
                Some(report) => AssignmentCheck::Done {
                    indicators: derive_indicators(&report, &assignment),
                    details: BuildDetails::from_report(&report, SubmissionStatus::Validated, true),
                },
                None => AssignmentCheck::TimedOut,
            };
            job_checks.insert(ctx.id, check);
            Ok(())
        })
        .await;

    let task_id = ticket.id;
    checks.insert_if_absent(task_id, AssignmentCheck::Pending);
    log::info!("Check of assignment {assignment_id} queued as task {task_id}");

    let checks = checks.into_inner();
    tokio::spawn(async move {
        let failure = match ticket.wait().await {
            JobOutcome::Completed => return,
            JobOutcome::Failed { reason } => AssignmentCheck::Failed { reason },
            JobOutcome::TimedOut { .. } => AssignmentCheck::TimedOut,
            JobOutcome::Cancelled => AssignmentCheck::Failed {
                reason: "cancelled".to_string(),
            },
        };
        checks.update(&task_id, |check| {
            if matches!(check, AssignmentCheck::Pending) {
                *check = failure;
            }
        });
    });

    HttpResponse::Accepted().json(CheckCreated { task_id })
}

#[get("/tasks/{id}")]
pub async fn get_task_handler(
    checks: web::Data<CheckTasks>,
    path: web::Path<(u64,)>,
) -> impl Responder {
    let task_id = path.into_inner().0;
    match checks.get(&task_id) {
        Some(check) => HttpResponse::Ok().json(check),
        None => not_found(format!("Task {task_id} not found.")),
    }
}
