use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{ConnectInfo, Request},
    routing::any,
};
use clap::Parser;
use color_eyre::{Result, eyre::Context};
use portcullis::{
    adapters::{self, FileConfigProvider, HttpClientAdapter, HttpHandler},
    config,
    core::GatewayService,
    metrics,
    ports::{config_provider::ConfigProvider, http_client::HttpClient},
    tracing_setup,
    utils::GracefulShutdown,
};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer};

/// Delay between a config-file event and the reload attempt, so editor
/// write bursts collapse into one reload.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "configs/gateway.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate a configuration file and exit
    Validate {
        #[clap(short, long, default_value = "configs/gateway.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "configs/gateway.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (validate_only, config_path) = match args.command {
        Some(Commands::Validate { config }) => (true, config),
        Some(Commands::Serve { config }) => (false, config),
        None => (false, args.config),
    };

    if validate_only {
        return validate_command(&config_path);
    }

    // Any failure from here until the listeners are up exits non-zero.
    let cfg = config::load_config(&config_path)?;
    tracing_setup::init_tracing(&cfg.logging)?;
    let metrics_handle = metrics::install_recorder()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        routes = cfg.routes.len(),
        "starting portcullis"
    );

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("failed to create HTTP client")?);
    let gateway = Arc::new(GatewayService::new(&cfg, http_client)?);

    // Config watcher: debounce, re-parse, re-validate; a bad file keeps the
    // current routes serving.
    let provider = FileConfigProvider::new(&config_path)?;
    let mut updates = provider.watch();
    let reload_gateway = gateway.clone();
    let reload_path = config_path.clone();
    tokio::spawn(async move {
        while updates.recv().await.is_some() {
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            while updates.try_recv().is_ok() {}

            match provider.load().await {
                Ok(new_cfg) => match reload_gateway.reload(&new_cfg) {
                    Ok(()) => tracing::info!(config = %reload_path, "configuration reloaded"),
                    Err(e) => {
                        tracing::warn!(error = %e, "reload failed; keeping current routes");
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "config reload failed; keeping current config");
                }
            }
        }
    });

    let shutdown = Arc::new(GracefulShutdown::new());
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_shutdown.run_signal_handler().await {
            tracing::error!(error = %e, "signal handler error");
        }
    });

    // Admin surface on its own port.
    let admin_addr: SocketAddr = cfg
        .admin
        .addr
        .parse()
        .context("failed to parse admin address")?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("failed to bind admin address {admin_addr}"))?;
    let admin_router = adapters::admin::router(gateway.clone(), metrics_handle);
    let admin_shutdown = shutdown.clone();
    let admin_task = tokio::spawn(async move {
        axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(async move {
                admin_shutdown.wait_for_shutdown_signal().await;
            })
            .await
    });

    // Data plane.
    let handler = Arc::new(HttpHandler::new(gateway));
    let make_route = |handler: Arc<HttpHandler>| {
        any(
            move |ConnectInfo(peer): ConnectInfo<SocketAddr>, req: Request| {
                let handler = handler.clone();
                async move { handler.handle(req, peer).await }
            },
        )
    };
    let app = Router::new()
        .route("/", make_route(handler.clone()))
        .route("/{*path}", make_route(handler))
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(
            cfg.server.write_timeout_seconds,
        )));

    let addr: SocketAddr = cfg
        .server
        .addr
        .parse()
        .context("failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind listen address {addr}"))?;

    tracing::info!(listen = %addr, admin = %admin_addr, "portcullis listening");

    let serve_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            serve_shutdown.wait_for_shutdown_signal().await;
        })
        .await
    });

    shutdown.wait_for_shutdown_signal().await;
    tracing::info!("shutting down; draining in-flight requests");

    let drained = tokio::time::timeout(shutdown.drain_timeout(), async {
        let _ = server_task.await;
        let _ = admin_task.await;
    })
    .await;
    match drained {
        Ok(()) => tracing::info!("graceful shutdown complete"),
        Err(_) => tracing::warn!("drain window exceeded, exiting anyway"),
    }

    Ok(())
}

fn validate_command(config_path: &str) -> Result<()> {
    match config::load_config(config_path) {
        Ok(cfg) => {
            println!("configuration OK: {config_path}");
            println!("  listen: {}", cfg.server.addr);
            println!("  admin:  {}", cfg.admin.addr);
            println!("  routes: {}", cfg.routes.len());
            for route in &cfg.routes {
                println!(
                    "    {} -> {} backend(s), {:?}",
                    route.path_prefix,
                    route.backends.len(),
                    route.lb_algorithm
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("configuration invalid: {e:#}");
            std::process::exit(1);
        }
    }
}
