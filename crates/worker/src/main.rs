use std::sync::Arc;

use atelier_core::job_class::JobClass;
use atelier_db::{JobStore, PgJobStore};
use atelier_worker::{Engine, HookRegistry, WorkerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atelier_worker=debug,atelier_db=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = Arc::new(WorkerConfig::from_env().expect("Invalid worker configuration"));
    for class in JobClass::ALL {
        let class_config = config.class(class);
        tracing::info!(
            job_class = %class,
            command = %class_config.command,
            max_concurrency = class_config.max_concurrency,
            wall_clock_timeout_secs = class_config.wall_clock_timeout.as_secs(),
            idle_timeout_secs = class_config.idle_timeout.as_secs(),
            "Loaded class configuration",
        );
    }

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = atelier_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    atelier_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    atelier_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Engine ---
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    let hooks = HookRegistry::with_defaults(&config);
    let engine = Engine::start(Arc::clone(&config), store, hooks)
        .await
        .expect("Failed to start engine");
    tracing::info!("Engine started");

    shutdown_signal().await;

    engine.shutdown().await;
    tracing::info!("Shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
