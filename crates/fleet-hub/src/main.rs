mod config;
mod correlate;
mod dispatch;
mod http;
mod hvnc;
mod liveness;
mod registry;
mod socket;
mod state;
mod watchdog;

use anyhow::Context;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use crate::config::{load_config, Config};
use crate::state::Hub;
use fleet_store::TaskStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_logging(&config);

    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;
    let store = TaskStore::open(&config.db_path)
        .with_context(|| format!("opening task store at {}", config.db_path))?;

    let hub = Arc::new(Hub::new(config.clone(), store));
    liveness::spawn_stale_reaper(hub.clone());
    watchdog::spawn_sent_watchdog(hub.clone());

    let app = http::router(hub);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(event = "hub_start", addr = %addr, db = %config.db_path);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("serving")?;

    Ok(())
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FLEET_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file = open_log_file(&config.log_dir);
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn open_log_file(log_dir: &str) -> Option<Arc<Mutex<std::fs::File>>> {
    if log_dir.trim().is_empty() {
        return None;
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return None;
    }
    let path = dir.join(format!("fleet-hub-{}.log", std::process::id()));
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
        .map(|file| Arc::new(Mutex::new(file)))
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.flush();
        }
        Ok(())
    }
}
