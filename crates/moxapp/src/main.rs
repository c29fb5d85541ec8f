use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tokio::{net::TcpListener, sync::watch};
use tracing::{error, info, warn};

use moxapp::{
    app_state::AppState,
    client::{ClientOptions, HttpClient, TokenManager},
    config::ConfigStore,
    envfile::EnvSource,
    http,
    metrics::{IncomingCollector, OutgoingCollector},
    scheduler::{ResultHandler, Scheduler},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(
    name = "moxapp",
    version = moxapp::VERSION,
    about = "Bidirectional HTTP traffic generator with DNS timing metrics"
)]
struct Cli {
    /// Global load multiplier (e.g. 0.5 for half load).
    #[arg(short = 'm', long)]
    multiplier: Option<f64>,

    /// Maximum number of concurrent outgoing requests.
    #[arg(short = 'c', long)]
    concurrent: Option<usize>,

    /// Comma-separated endpoint name filters.
    #[arg(short = 'f', long)]
    filter: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    validate: bool,

    /// Show the configuration without generating traffic.
    #[arg(long)]
    dry_run: bool,

    /// Configuration file path.
    #[arg(long, default_value = "configs/endpoints.yaml")]
    config: String,

    /// Management API port (overrides API_PORT from the environment).
    #[arg(long)]
    port: Option<u16>,

    /// Log every individual request.
    #[arg(long)]
    log_requests: bool,

    /// Skip the confirmation prompt.
    #[arg(short = 'y', long)]
    yes: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let env = EnvSource::load(".env");
    let store = Arc::new(ConfigStore::new());

    if Path::new(&cli.config).exists() {
        store
            .load_from_file(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config))?;
        let config = store.snapshot();
        info!(
            path = %cli.config,
            endpoints = config.endpoints.len(),
            routes = config.incoming_routes.len(),
            auth_configs = config.auth_configs.len(),
            "configuration loaded"
        );
    } else {
        warn!(path = %cli.config, "config file not found, starting with defaults and no endpoints");
    }

    if let Some(multiplier) = cli.multiplier {
        store.set_global_multiplier(multiplier);
    }
    if let Some(concurrent) = cli.concurrent {
        store.set_concurrent_requests(concurrent);
    }
    store.set_log_all_requests(cli.log_requests);

    // Port priority: CLI flag, then API_PORT from the environment, then the
    // config file value.
    if let Some(port) = cli.port {
        store.set_api_port(port);
    } else if let Some(port) = env.api_port() {
        store.set_api_port(port);
    }

    if let Some(filter) = &cli.filter {
        let remaining = store.retain_endpoints(filter);
        if remaining == 0 {
            anyhow::bail!("no endpoints matched filter: {filter}");
        }
        info!(%filter, remaining, "endpoint filter applied");
    }

    let errors = store.validate();
    if cli.validate || cli.dry_run {
        print_summary(&store, &cli.config);
        if !errors.is_empty() {
            eprintln!("Configuration errors:");
            for error in &errors {
                eprintln!("  - {error}");
            }
            anyhow::bail!("configuration validation failed");
        }
        println!("Configuration is valid.");
        return Ok(());
    }
    for error in &errors {
        warn!(%error, "configuration issue");
    }

    print_summary(&store, &cli.config);
    if !cli.yes && !confirm_start()? {
        println!("Aborted.");
        return Ok(());
    }

    let config = store.snapshot();
    let metrics_handle = telemetry::init_metrics_recorder();

    let tokens = Arc::new(TokenManager::new(config.auth_configs.clone(), env.clone())?);
    let mut client_options = ClientOptions::new(env.clone());
    client_options.max_conns = config.concurrent_requests.max(1) * 2;
    client_options.timeout = Duration::from_secs(30);
    let client = Arc::new(HttpClient::new(client_options, Arc::clone(&tokens))?);

    let outgoing = Arc::new(OutgoingCollector::new());
    let incoming = Arc::new(IncomingCollector::new());

    let handler_collector = Arc::clone(&outgoing);
    let handler_store = Arc::clone(&store);
    let handler: ResultHandler = Arc::new(move |result| {
        handler_collector.record(&result);
        if handler_store.log_all_requests() {
            info!(
                endpoint = %result.endpoint_name,
                method = %result.method,
                host = %result.hostname,
                status = result.status_code,
                success = result.success,
                dns_ms = result.dns_time_ms,
                total_ms = result.total_time_ms,
                "request completed"
            );
        }
    });

    let scheduler = Scheduler::new(Arc::clone(&store), client, handler);

    let state = AppState::new(
        Arc::clone(&store),
        Arc::clone(&scheduler),
        Arc::clone(&outgoing),
        Arc::clone(&incoming),
        Arc::clone(&tokens),
        env.clone(),
        metrics_handle,
    );
    let router = http::build_router(state);

    // Failing to bind the management listener is the one fatal startup
    // condition after validation.
    let addr = format!("0.0.0.0:{}", config.api_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind management listener on {addr}"))?;
    info!(%addr, "management API listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokens.start_background_refresh();

    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx.clone()));

    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");
    let _ = shutdown_tx.send(true);
    tokens.stop_background_refresh();

    if let Err(err) = scheduler_task.await? {
        warn!(%err, "scheduler shutdown reported an error");
    }
    if let Err(err) = server_task.await? {
        error!(%err, "management server error");
    }

    print_final_stats(&outgoing, &incoming);
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_summary(store: &ConfigStore, config_path: &str) {
    let config = store.snapshot();

    println!("Configuration summary:");
    println!("  Config file:           {config_path}");
    println!("  Global multiplier:     {:.2}", config.global_multiplier);
    println!("  Concurrent requests:   {}", config.concurrent_requests);
    println!("  Outgoing endpoints:    {}", config.endpoints.len());
    println!("  Incoming routes:       {}", config.incoming_routes.len());
    println!(
        "  Base requests/min:     {:.2}",
        config.total_base_requests_per_min()
    );
    println!(
        "  Adjusted requests/min: {:.2}",
        config.adjusted_requests_per_min()
    );
    println!(
        "  Estimated requests/s:  {:.2}",
        config.adjusted_requests_per_min() / 60.0
    );
    println!("  API port:              {}", config.api_port);
    println!();
}

fn confirm_start() -> anyhow::Result<bool> {
    use std::io::Write;

    print!("Start traffic generation? (yes/no) [yes]: ");
    std::io::stdout().flush().ok();

    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    let answer = answer.trim().to_lowercase();
    Ok(answer.is_empty() || answer == "yes" || answer == "y")
}

fn print_final_stats(outgoing: &OutgoingCollector, incoming: &IncomingCollector) {
    let snapshot = outgoing.snapshot();
    println!();
    println!("Final statistics (outgoing):");
    println!("  Uptime:        {:.2}s", snapshot.uptime_seconds);
    println!("  Requests:      {}", snapshot.total_requests);
    println!(
        "  Successful:    {} ({:.2}%)",
        snapshot.total_successes, snapshot.success_rate
    );
    println!("  Failed:        {}", snapshot.total_failures);
    println!("  Requests/sec:  {:.2}", snapshot.requests_per_second);

    let incoming = incoming.snapshot();
    if incoming.total_requests > 0 {
        println!();
        println!("Final statistics (incoming):");
        println!("  Requests:      {}", incoming.total_requests);
        println!("  Requests/sec:  {:.2}", incoming.requests_per_second);
        for (name, route) in &incoming.routes {
            println!(
                "  {name} ({}): {} requests, avg {:.2}ms, p95 {:.2}ms",
                route.route_path, route.total_requests, route.avg_response_ms, route.p95_response_ms
            );
        }
    }
}
