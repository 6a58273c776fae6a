use anyhow::{Context, Result};
use chrono::Local;
use std::path::Path;
use std::sync::Arc;
use tomate::clock::SystemClock;
use tomate::config::{config_path, load_config, Settings, TimerConfig};
use tomate::ipc::server::{self, ServerState};
use tomate::notify::{DesktopNotifier, LogNotifier, NotificationSink};
use tomate::persistence::JsonSessionStore;
use tomate::recorder::{MemorySessionStore, SessionHistory, SessionRecorder};
use tomate::timer::Timer;
use tomate_ipc::SOCKET_PATH;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Stores = (Arc<dyn SessionRecorder>, Arc<dyn SessionHistory>);

fn open_store(ephemeral: bool) -> Result<Stores> {
    if ephemeral {
        let store = Arc::new(MemorySessionStore::new());
        return Ok((store.clone(), store));
    }
    let path = JsonSessionStore::default_path()?;
    let store = Arc::new(
        JsonSessionStore::open(&path)
            .with_context(|| format!("Failed to open session store at {:?}", path))?,
    );
    Ok((store.clone(), store))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let ephemeral = std::env::args().any(|arg| arg == "--ephemeral");
    let headless = std::env::args().any(|arg| arg == "--headless");

    // A broken config file should not keep the timer from running
    let config = load_config().unwrap_or_else(|err| {
        warn!("{err:#}; using default settings");
        TimerConfig::default()
    });
    let settings = Settings::new(config);

    let (recorder, history) = open_store(ephemeral)?;
    match history.purge_older_than(settings.snapshot().retention_days, Local::now()) {
        Ok(purged) => info!(purged, "retention cleanup done"),
        Err(err) => warn!(%err, "retention cleanup failed"),
    }

    let notifier: Arc<dyn NotificationSink> = if headless {
        Arc::new(LogNotifier)
    } else {
        Arc::new(DesktopNotifier)
    };
    let timer = Arc::new(Timer::new(
        settings.snapshot(),
        Arc::new(SystemClock),
        recorder,
        notifier,
    )?);
    timer.follow(&settings);

    let state = Arc::new(ServerState {
        timer: timer.clone(),
        history,
        settings,
        config_path: config_path(),
    });

    tokio::select! {
        res = server::start(state, Path::new(SOCKET_PATH)) => {
            if let Err(err) = res {
                warn!("IPC server stopped: {err:#}");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }

    timer.shutdown().await;
    let _ = std::fs::remove_file(SOCKET_PATH);
    Ok(())
}
