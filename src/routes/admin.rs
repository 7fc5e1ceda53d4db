use std::time::Duration;

use actix_web::{HttpResponse, Responder, get, put, web};
use serde::{Deserialize, Serialize};

use super::invalid_argument;
use crate::scheduler::Scheduler;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct AsyncSettings {
    pub timeout_secs: u64,
    pub pool_size: usize,
    pub queued: usize,
    pub synchronous: bool,
}

#[derive(Deserialize, Debug)]
pub struct AsyncSettingsUpdate {
    pub timeout_secs: Option<u64>,
    pub pool_size: Option<usize>,
}

async fn current_settings(scheduler: &Scheduler) -> AsyncSettings {
    AsyncSettings {
        timeout_secs: scheduler.timeout().as_secs(),
        pool_size: scheduler.pool_size(),
        queued: scheduler.queued().await,
        synchronous: scheduler.is_synchronous(),
    }
}

#[get("/admin/async")]
pub async fn get_async_handler(scheduler: web::Data<Scheduler>) -> impl Responder {
    HttpResponse::Ok().json(current_settings(&scheduler).await)
}

/// Changes apply to builds submitted afterwards.
#[put("/admin/async")]
pub async fn put_async_handler(
    scheduler: web::Data<Scheduler>,
    body: web::Json<AsyncSettingsUpdate>,
) -> impl Responder {
    let update = body.into_inner();

    if update.pool_size == Some(0) {
        return invalid_argument("The pool size must be at least 1.".to_string());
    }
    if update.timeout_secs == Some(0) {
        return invalid_argument("The timeout must be at least 1 second.".to_string());
    }

    if let Some(timeout_secs) = update.timeout_secs {
        scheduler.set_timeout(Duration::from_secs(timeout_secs));
    }
    if let Some(pool_size) = update.pool_size {
        scheduler.set_pool_size(pool_size);
    }

    HttpResponse::Ok().json(current_settings(&scheduler).await)
}
