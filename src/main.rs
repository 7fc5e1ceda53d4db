use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use autograder::config::{CliArgs, Config};
use autograder::database as db;
use autograder::invoker::MavenInvoker;
use autograder::registry::TtlRegistry;
use autograder::scheduler::Scheduler;
use autograder::web_server::{AppState, build_server};
use autograder::worker::{BuildTasks, BuildWorker, CheckTasks};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let db_path = db::get_db_path();
    let cli = CliArgs::parse();

    if cli.threads == Some(0) {
        anyhow::bail!("The number of build threads must not be 0");
    }

    let Config {
        server: server_config,
        build: build_config,
        scheduler: scheduler_config,
        assignments,
    } = cli.to_config()?;

    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let db_pool = db::init_db(&db_path).await?;

    let invoker = MavenInvoker::new(build_config.clone());

    log::info!(
        "Loaded {} assignments, pool size {}, timeout {}s{}",
        assignments.len(),
        scheduler_config.pool_size,
        scheduler_config.timeout_secs,
        if scheduler_config.synchronous { " (synchronous)" } else { "" }
    );

    let worker = Arc::new(BuildWorker::new(
        db_pool.clone(),
        Arc::new(invoker),
        &build_config,
        assignments,
    ));
    let scheduler = Scheduler::new(&scheduler_config);
    let tasks: Arc<BuildTasks> = Arc::new(TtlRegistry::new(scheduler_config.task_ttl()));
    let checks: Arc<CheckTasks> = Arc::new(TtlRegistry::new(scheduler_config.task_ttl()));
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut services = JoinSet::new();
    {
        let scheduler = scheduler.clone();
        let token = shutdown_token.clone();
        services.spawn(async move { scheduler.run(token).await });
    }
    let sweepers = [
        tasks.spawn_sweeper(SWEEP_INTERVAL, shutdown_token.clone()),
        checks.spawn_sweeper(SWEEP_INTERVAL, shutdown_token.clone()),
    ];

    let server = build_server(
        server_config,
        AppState {
            pool: db_pool,
            worker,
            scheduler,
            tasks,
            checks,
        },
    )?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res) = services.join_next() => {
            log::error!("The scheduler terminated unexpectedly: {:?}", res);
        }
    }

    // 1. Stop accepting submissions
    server_handle.stop(true).await;

    // 2. Abort running builds and stop the sweepers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent, waiting for running builds to stop...");

    // 3. Wait until everything terminates
    while let Some(res) = services.join_next().await {
        if let Err(e) = res {
            log::error!("Scheduler task finished with error: {:?}", e);
        }
    }
    for sweeper in sweepers {
        if let Err(e) = sweeper.await {
            log::error!("Registry sweeper finished with error: {:?}", e);
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
