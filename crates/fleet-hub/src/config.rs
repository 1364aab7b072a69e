use clap::Parser;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub db_path: String,
    pub debug: bool,
    pub stale_seconds: u64,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub sent_timeout: Option<Duration>,
    pub strict_status: bool,
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9443".to_string(),
            db_path: "fleet.db".to_string(),
            debug: false,
            stale_seconds: 30,
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            sent_timeout: None,
            strict_status: false,
            log_dir: String::new(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "fleet-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub db: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value_t = 30)]
    pub stale_seconds: u64,
    #[arg(long, default_value_t = 10)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    /// Seconds before a task stuck in `sent` is failed with reason "timeout".
    /// 0 disables the watchdog; the wire protocol itself never times out.
    #[arg(long, default_value_t = 0)]
    pub sent_timeout_seconds: u64,
    /// Treat absent or unrecognized result statuses as failure instead of the
    /// protocol's permissive success default.
    #[arg(long, default_value_t = false)]
    pub strict_status: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

pub fn load_config() -> Config {
    let args = Args::parse();
    let addr = resolve_env(&args.addr, "FLEET_HUB_ADDR", "127.0.0.1:9443");
    let db_path = resolve_env(&args.db, "FLEET_HUB_DB", "fleet.db");
    let debug = args.debug || env_true("FLEET_HUB_DEBUG");
    let log_dir = resolve_env(&args.log_dir, "FLEET_LOG_DIR", "");
    Config {
        addr,
        db_path,
        debug,
        stale_seconds: args.stale_seconds,
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        sent_timeout: match args.sent_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
        strict_status: args.strict_status,
        log_dir,
    }
}

fn resolve_env(flag: &str, env_key: &str, fallback: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    fallback.to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
