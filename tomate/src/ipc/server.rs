//! Unix domain socket server for IPC

use crate::config::{load_config_from, Settings};
use crate::recorder::SessionHistory;
use crate::timer::Timer;
use anyhow::Result;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tomate_ipc::{Command, Response, SessionSummary, TimerStatus};
use tracing::{debug, error, info, warn};

/// Longest range `Stats` reports on.
pub const MAX_STATS_DAYS: u32 = 366;

/// Everything a client command can reach.
pub struct ServerState {
    pub timer: Arc<Timer>,
    pub history: Arc<dyn SessionHistory>,
    pub settings: Settings,
    pub config_path: Option<PathBuf>,
}

pub async fn start(state: Arc<ServerState>, socket_path: &Path) -> Result<()> {
    // Remove old socket if it exists
    let _ = std::fs::remove_file(socket_path);

    // Bind to socket
    let listener = UnixListener::bind(socket_path)?;
    info!("IPC server listening on {}", socket_path.display());

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, state).await {
                        error!("Error handling client: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, state: Arc<ServerState>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    // One command per line until the client hangs up
    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<Command>(line.trim()) {
            Ok(command) => {
                debug!(?command, "command received");
                handle_command(&state, command)
            }
            Err(e) => {
                warn!("Malformed command: {}", e);
                Response::Error(format!("malformed command: {e}"))
            }
        };

        // Send response
        let mut response_json = serde_json::to_vec(&response)?;
        response_json.push(b'\n');
        writer.write_all(&response_json).await?;
        line.clear();
    }

    Ok(())
}

pub fn handle_command(state: &ServerState, command: Command) -> Response {
    let timer = &state.timer;
    match command {
        Command::Start => {
            timer.start();
            Response::Ok
        }
        Command::Pause => {
            timer.pause();
            Response::Ok
        }
        Command::Resume => {
            timer.resume();
            Response::Ok
        }
        Command::Stop => {
            timer.stop();
            Response::Ok
        }
        Command::Next => {
            timer.start_next_session();
            Response::Ok
        }
        Command::Status => Response::Status(TimerStatus::from(&timer.snapshot())),
        Command::Link { task_id } => {
            timer.link_task(task_id);
            Response::Ok
        }
        Command::Stats { days } => {
            let days = days.clamp(1, MAX_STATS_DAYS);
            match state.history.daily_range(Local::now().date_naive(), days) {
                Ok(stats) => Response::Stats(stats),
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Command::Recent { limit } => match state.history.recent(limit) {
            Ok(sessions) => Response::Sessions(sessions.iter().map(SessionSummary::from).collect()),
            Err(e) => Response::Error(e.to_string()),
        },
        Command::Purge { days } => match state.history.purge_older_than(days, Local::now()) {
            Ok(purged) => Response::Purged(purged),
            Err(e) => Response::Error(e.to_string()),
        },
        Command::Reload => reload(state),
    }
}

fn reload(state: &ServerState) -> Response {
    let Some(path) = &state.config_path else {
        return Response::Error("no configuration file location on this platform".to_string());
    };
    match load_config_from(path) {
        Ok(config) => {
            let changed = state.settings.replace(config);
            info!(?changed, "configuration reloaded");
            Response::Ok
        }
        Err(e) => Response::Error(format!("{e:#}")),
    }
}
