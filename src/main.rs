use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use minik8s::cli::Args;
use minik8s::cluster::{
    create_control_plane_router, ClusterController, ClusterStore, ControlPlaneState, FileStore,
};
use minik8s::config::{load_config, load_config_from};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    // Load config, then let flags and environment override it
    let loaded = match args.config {
        Some(ref path) => load_config_from(path),
        None => load_config(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            process::exit(1);
        }
    };
    args.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        error!("{}", e);
        process::exit(1);
    }

    // Open the durable store
    let store = match config.store_path {
        Some(ref path) => match FileStore::open(path) {
            Ok(file_store) => {
                info!("Using state file {}", path.display());
                ClusterStore::new(Arc::new(file_store))
            }
            Err(e) => {
                error!("Failed to open state file {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => {
            info!("Keeping cluster state in memory");
            ClusterStore::in_memory()
        }
    };

    // Build the control plane and restore persisted state
    let controller = ClusterController::over_http(config.controller_config(), store);
    match controller.recover().await {
        Ok(report) => info!(
            "Recovered {} node(s), {} pod(s), {} deployment(s)",
            report.nodes, report.pods, report.deployments
        ),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
    controller.start();

    let addr = config.listen_address();
    let app = create_control_plane_router(ControlPlaneState::with_controller(controller.clone()));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Control plane listening on {}", addr);
    info!("Advertising {} to workers", config.advertise_url());
    info!("Endpoints:");
    info!("  GET  /health                 - Health check");
    info!("  GET  /v1/status              - Cluster status");
    info!("  POST /v1/nodes               - Worker registration");
    info!("  POST /v1/deployments         - Apply a deployment");
    info!("  POST /v1/autoscalers         - Create an autoscaler");
    info!("  POST /v1/services            - Apply a service");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await;

    controller.shutdown();

    if let Err(e) = served {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
