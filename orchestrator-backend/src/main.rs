use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;

mod agent;
mod config;
mod controllers;
mod db;
mod error;
mod models;
mod scheduler;

use agent::HttpAgentExecutor;
use config::Config;
use db::Database;
use scheduler::clock::SystemClock;
use scheduler::Scheduler;

pub struct AppState {
    pub db: Arc<Database>,
    pub config: Config,
    /// `None` when no agent executor is configured; the API still serves reads
    pub scheduler: Option<Arc<Scheduler>>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env();
    let port = config.port;

    log::info!("Initializing database at {}", config.database_url);
    let db = Database::new(&config.database_url).map_err(std::io::Error::other)?;
    let db = Arc::new(db);

    let scheduler = match (&config.agent_executor_url, config.scheduler_enabled) {
        (Some(url), true) => {
            log::info!("Initializing scheduler (agent executor at {})", url);
            let scheduler = Arc::new(Scheduler::new(
                Arc::clone(&db),
                Arc::new(HttpAgentExecutor::new(url.clone())),
                Arc::new(SystemClock),
                config.scheduler_config(),
            ));
            // Runs left over from a previous process must be resolved before polling
            scheduler.sweep_orphaned_runs().map_err(std::io::Error::other)?;
            scheduler.start();
            Some(scheduler)
        }
        (None, true) => {
            log::warn!(
                "{} not set - scheduler disabled, serving the API only",
                config::env_vars::AGENT_EXECUTOR_URL
            );
            None
        }
        (_, false) => {
            log::info!("Scheduler disabled via {}", config::env_vars::SCHEDULER_ENABLED);
            None
        }
    };

    log::info!("Starting orchestrator on port {}", port);

    let state_db = Arc::clone(&db);
    let state_config = config.clone();
    let state_scheduler = scheduler.clone();

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(AppState {
                db: Arc::clone(&state_db),
                config: state_config.clone(),
                scheduler: state_scheduler.clone(),
            }))
            .wrap(Logger::default())
            .wrap(cors)
            .configure(controllers::health::config)
            .configure(controllers::cron::config)
            .configure(controllers::tasks::config)
            .configure(controllers::sub_agents::config)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await?;

    if let Some(scheduler) = scheduler {
        log::info!("Shutting down scheduler");
        scheduler
            .stop(Duration::from_secs(config.shutdown_grace_secs))
            .await;
    }
    Ok(())
}
