// ADS-B hub - main entry point

use std::sync::Arc;

use adsb_hub::app::App;
use adsb_hub::clock::now_ms;
use adsb_hub::config::Config;
use adsb_hub::net::{connector, listener};
use adsb_hub::{periodic, state};
use clap::Parser;
use tokio::signal;
use tower_http::services::ServeDir;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = Config::parse();

    init_logging(config.verbose);

    info!(version = env!("CARGO_PKG_VERSION"), "starting adsb-hub");

    let app = Arc::new(App::new(config));

    // warm restart from the persisted per-aircraft state
    if let Some(base) = periodic::state_base_dir(&app) {
        state::load_all(&app, &base, now_ms());
    }

    // listeners are mandatory infrastructure: a failed bind is fatal
    if let Err(e) = listener::start_all(&app).await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }

    match connector::start_all(&app) {
        Ok(count) if count > 0 => info!(count, "outbound connectors running"),
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    }

    let workers = periodic::spawn_all(&app);

    // optionally expose the JSON directory over HTTP
    if let (Ok(port_str), Some(json_dir)) =
        (std::env::var("HTTP_PORT"), app.config.json_dir.clone())
    {
        if let Ok(port) = port_str.parse::<u16>() {
            tokio::spawn(async move {
                let listener = match tokio::net::TcpListener::bind((
                    std::net::Ipv4Addr::UNSPECIFIED,
                    port,
                ))
                .await
                {
                    Ok(l) => l,
                    Err(e) => {
                        error!(port, error = %e, "HTTP server failed to bind");
                        return;
                    }
                };
                info!(port, dir = %json_dir, "HTTP server serving the JSON directory");
                let router = axum::Router::new().fallback_service(ServeDir::new(json_dir));
                if let Err(e) = axum::serve(listener, router).await {
                    error!(error = %e, "HTTP server error");
                }
            });
        }
    }

    info!("server ready");

    match signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "unable to listen for shutdown signal"),
    }

    app.request_exit();

    // final state save before the workers wind down
    if let Some(base) = periodic::state_base_dir(&app) {
        state::save_all(&app, &base, now_ms());
    }

    for handle in workers {
        handle.abort();
    }

    info!(aircraft = app.store.len(), "server stopped");
}

/// Initialize the logging subsystem: INFO by default, DEBUG with
/// --verbose.
fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::fmt().with_target(false).with_level(true);

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("verbose logging enabled");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
