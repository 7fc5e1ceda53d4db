use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use sqlx::sqlite::SqlitePool;

use crate::config::ServerConfig;
use crate::routes::{
    delete_submission_handler, get_async_handler, get_report_handler, get_submission_handler,
    get_task_handler, json_error_handler, post_assignment_check_handler, post_rebuild_handler,
    post_submission_handler, put_async_handler, put_final_handler, query_error_handler,
};
use crate::scheduler::Scheduler;
use crate::worker::{BuildTasks, BuildWorker, CheckTasks};

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub worker: Arc<BuildWorker>,
    pub scheduler: Scheduler,
    pub tasks: Arc<BuildTasks>,
    pub checks: Arc<CheckTasks>,
}

/// Registers state and routes; shared by the server and the API tests.
pub fn configure(state: AppState) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| {
        cfg.app_data(web::Data::new(state.pool))
            .app_data(web::Data::from(state.worker))
            .app_data(web::Data::new(state.scheduler))
            .app_data(web::Data::from(state.tasks))
            .app_data(web::Data::from(state.checks))
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .app_data(web::QueryConfig::default().error_handler(query_error_handler))
            .service(post_submission_handler)
            .service(get_report_handler)
            .service(get_submission_handler)
            .service(post_rebuild_handler)
            .service(put_final_handler)
            .service(delete_submission_handler)
            .service(get_async_handler)
            .service(put_async_handler)
            .service(post_assignment_check_handler)
            .service(get_task_handler);
    }
}

pub fn build_server(server_config: ServerConfig, state: AppState) -> std::io::Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .configure(configure(state.clone()))
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
