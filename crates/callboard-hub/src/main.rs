use callboard_hub::config::load_config;
use callboard_hub::logging::init_logging;
use callboard_hub::Switchboard;
use std::net::SocketAddr;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config.log_dir, &config.instance, config.debug);
    let addr: SocketAddr = match config.listen.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.listen);
            return;
        }
    };

    let board = Switchboard::start(config.board.clone());
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };
    match board.attach_broadcast_channel(listener, &config.ws_path).await {
        Ok(bound) => info!(event = "hub_start", addr = %bound, path = %config.ws_path),
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    }

    if let Some(settings) = config.switch.clone() {
        let report = board.connect(settings).await;
        if report.success {
            info!(event = "switch_connected", message = %report.message);
        } else {
            warn!(
                event = "switch_connect_failed",
                message = %report.message,
                kind = ?report.failure
            );
            if let Some(info) = &report.diagnostic_info {
                warn!(event = "switch_diagnostics", report = %info);
            }
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    info!(event = "hub_stop");
    board.close().await;
}
