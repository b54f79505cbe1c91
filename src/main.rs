use ssc_call::{config, logger, peer, signaling};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// `ssc-relay` поднимает сигнальный ретранслятор,
/// `ssc-relay probe` проверяет доступность настроенных STUN/TURN серверов.
#[tokio::main]
async fn main() {
    logger::init();

    let code = match std::env::args().nth(1).as_deref() {
        Some("probe") => probe().await,
        _ => serve().await,
    };
    std::process::exit(code);
}

async fn serve() -> i32 {
    let addr = config::relay_addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind relay on {}: {}", addr, e);
            return 1;
        }
    };

    let relay = signaling::Relay::new();
    match signaling::serve_ws(listener, relay).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Relay stopped: {}", e);
            1
        }
    }
}

async fn probe() -> i32 {
    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    let mut unreachable = 0;
    for server in &config.ice_servers {
        if peer::probe_ice_server(server, PROBE_TIMEOUT).await {
            info!("{} {:?} OK", server.id, server.normalized_urls());
        } else {
            error!("{} {:?} unreachable", server.id, server.normalized_urls());
            unreachable += 1;
        }
    }
    if unreachable > 0 {
        2
    } else {
        0
    }
}
