use crate::hub::HubConfig;
use crate::probe::ProbeConfig;
use crate::session::SessionConfig;
use crate::store::StoreConfig;
use crate::switchboard::SwitchboardConfig;
use callboard_core::ConnectionSettings;
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8090";
pub const DEFAULT_WS_PATH: &str = "/ws";
pub const DEFAULT_MANAGER_PORT: u16 = 5038;
pub const DEFAULT_LOG_DIR: &str = ".callboard/logs";

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "callboard-hub", about = "Live call-center aggregation and push hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub listen: String,
    #[arg(long, default_value = "")]
    pub ws_path: String,
    #[arg(long, default_value = "")]
    pub switch_host: String,
    #[arg(long)]
    pub switch_port: Option<u16>,
    #[arg(long, default_value = "")]
    pub switch_user: String,
    #[arg(long, default_value = "")]
    pub switch_secret: String,
    #[arg(long, default_value_t = 1000)]
    pub history_capacity: usize,
    #[arg(long, default_value_t = 20)]
    pub sla_seconds: u64,
    #[arg(long, default_value_t = 30)]
    pub keepalive_interval: u64,
    #[arg(long, default_value_t = 10)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value = "")]
    pub instance: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub listen: String,
    pub ws_path: String,
    /// Set when a switch host is configured; the binary connects at startup.
    pub switch: Option<ConnectionSettings>,
    pub instance: String,
    pub debug: bool,
    pub log_dir: String,
    pub board: SwitchboardConfig,
}

pub fn load_config() -> Config {
    Config::from_args(Args::parse())
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        let debug = args.debug || env_true("CALLBOARD_DEBUG");
        let switch = resolve_switch(&args);
        let instance = if args.instance.trim().is_empty() {
            format!("pid-{}", std::process::id())
        } else {
            args.instance.clone()
        };
        let board = SwitchboardConfig {
            probe: ProbeConfig::default(),
            session: SessionConfig {
                keepalive_interval: Duration::from_secs(args.keepalive_interval.max(1)),
                ..SessionConfig::default()
            },
            store: StoreConfig {
                history_capacity: args.history_capacity,
                sla_threshold_secs: args.sla_seconds,
            },
            hub: HubConfig {
                ping_interval: Duration::from_secs(args.ping_interval),
                write_timeout: Duration::from_secs(args.write_timeout.max(1)),
                debug,
                ..HubConfig::default()
            },
            ..SwitchboardConfig::default()
        };
        Self {
            listen: resolve_value(&args.listen, "CALLBOARD_LISTEN", DEFAULT_LISTEN),
            ws_path: resolve_value(&args.ws_path, "CALLBOARD_WS_PATH", DEFAULT_WS_PATH),
            switch,
            instance,
            debug,
            log_dir: resolve_value(&args.log_dir, "CALLBOARD_LOG_DIR", DEFAULT_LOG_DIR),
            board,
        }
    }
}

fn resolve_switch(args: &Args) -> Option<ConnectionSettings> {
    let host = resolve_value(&args.switch_host, "CALLBOARD_SWITCH_HOST", "");
    if host.trim().is_empty() {
        return None;
    }
    let port = args
        .switch_port
        .or_else(|| env_value("CALLBOARD_SWITCH_PORT").and_then(|value| value.trim().parse().ok()))
        .unwrap_or(DEFAULT_MANAGER_PORT);
    Some(ConnectionSettings::new(
        host,
        port,
        resolve_value(&args.switch_user, "CALLBOARD_SWITCH_USER", ""),
        resolve_value(&args.switch_secret, "CALLBOARD_SWITCH_SECRET", ""),
    ))
}

/// Flag, then environment, then default.
fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env_value(env_key).unwrap_or_else(|| default.to_string())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_win_and_defaults_fill_in() {
        let args = Args::try_parse_from([
            "callboard-hub",
            "--listen",
            "0.0.0.0:9000",
            "--switch-host",
            "pbx.example.net",
            "--switch-port",
            "5039",
            "--switch-user",
            "monitor",
            "--sla-seconds",
            "30",
            "--history-capacity",
            "50",
            "--log-dir",
            "/tmp/callboard-test-logs",
        ])
        .expect("parse");
        let config = Config::from_args(args);
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.log_dir, "/tmp/callboard-test-logs");
        let switch = config.switch.expect("switch settings");
        assert_eq!(switch.host, "pbx.example.net");
        assert_eq!(switch.port, 5039);
        assert_eq!(switch.username, "monitor");
        assert_eq!(config.board.store.sla_threshold_secs, 30);
        assert_eq!(config.board.store.history_capacity, 50);
        assert_eq!(config.board.hub.ping_interval, Duration::from_secs(10));
    }

    #[test]
    fn resolve_value_prefers_flag() {
        assert_eq!(resolve_value("flag", "CALLBOARD_TEST_UNSET_KEY", "default"), "flag");
        assert_eq!(resolve_value("  ", "CALLBOARD_TEST_UNSET_KEY", "default"), "default");
    }
}
