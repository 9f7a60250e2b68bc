//! ClassGuard Agent - Main Entry Point
//!
//! One binary, two mount modes: a plain console process or a Windows
//! service registered through the service shim. Either way the same core
//! orchestrator runs underneath.

mod agent;
mod browser;
mod channel;
mod config;
mod enforcer;
mod events;
mod ipc;
mod journal;
mod platform;
mod policy;
mod session;
mod svc;

use tokio::sync::watch;

use config::Config;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Service-control verbs short-circuit normal startup.
    if args.len() > 1 && svc::handle_control_verb(&args[1]) {
        return;
    }

    let config_path = config::config_path_from_args(&args);
    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if config::has_flag(&args, "--debug") || config::has_flag(&args, "-d") {
        config.debug_mode = true;
    }
    if config::has_flag(&args, "--dry-run") {
        config.dry_run = true;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.effective_log_level(false)),
    )
    .init();

    log::info!(
        "starting ClassGuard Agent v{} ({} mode)",
        env!("CARGO_PKG_VERSION"),
        if svc::is_service_environment() {
            "service"
        } else {
            "console"
        }
    );
    if config.dry_run {
        log::warn!("dry run enabled: policy violations will be logged, not terminated");
    }

    // The only fatal startup condition: the agent's own directories.
    if let Err(e) = config.ensure_directories() {
        log::error!("fatal: {}", e);
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("stop signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    agent::run(config, shutdown_rx).await;
    log::info!("ClassGuard Agent stopped");
}
