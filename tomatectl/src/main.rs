use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::ErrorKind;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tomate_ipc::{Command, IpcError, Response, TimerStatus, SOCKET_PATH};

#[derive(Parser)]
#[command(name = "tomatectl")]
#[command(about = "Control the tomate pomodoro timer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the timer
    Start,
    /// Pause the timer
    Pause,
    /// Resume the timer
    Resume,
    /// Reset to a fresh work interval (only while paused)
    Stop,
    /// Begin the next interval now
    Next,
    /// Get timer status
    Status,
    /// Attach a task to the current interval, or detach with no id
    Link { task_id: Option<i64> },
    /// Daily totals
    Stats {
        #[arg(short, long, default_value_t = 7)]
        days: u32,
    },
    /// Most recent recorded intervals
    Recent {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Delete recorded intervals older than the given age
    Purge {
        #[arg(short, long, default_value_t = 90)]
        days: u32,
    },
    /// Re-read the configuration file
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Convert CLI command to IPC command
    let command = match cli.command {
        Commands::Start => Command::Start,
        Commands::Pause => Command::Pause,
        Commands::Resume => Command::Resume,
        Commands::Stop => Command::Stop,
        Commands::Next => Command::Next,
        Commands::Status => Command::Status,
        Commands::Link { task_id } => Command::Link { task_id },
        Commands::Stats { days } => Command::Stats { days },
        Commands::Recent { limit } => Command::Recent { limit },
        Commands::Purge { days } => Command::Purge { days },
        Commands::Reload => Command::Reload,
    };

    // Send command and get response
    let response = send_command(command).await?;

    // Handle response
    match response {
        Response::Ok => println!("OK"),
        Response::Status(status) => print_status(&status),
        Response::Stats(days) => {
            for day in days {
                println!(
                    "{}  {:>2} pomodoros  focus {}  break {}",
                    day.day,
                    day.pomodoros,
                    format_mmss(day.focus_seconds as u64),
                    format_mmss(day.break_seconds as u64)
                );
            }
        }
        Response::Sessions(sessions) => {
            for session in sessions {
                let task = session
                    .task_id
                    .map_or(String::new(), |id| format!(" (task {id})"));
                println!(
                    "#{:<4} {} {:<11} {}{}",
                    session.id,
                    session.start_time.format("%Y-%m-%d %H:%M"),
                    session.kind.label(),
                    format_mmss(session.duration_seconds.round() as u64),
                    task
                );
            }
        }
        Response::Purged(count) => println!("Removed {count} sessions"),
        Response::Error(e) => eprintln!("Error: {}", e),
    }

    Ok(())
}

fn print_status(status: &TimerStatus) {
    println!("State: {:?}", status.state);
    println!("Kind: {}", status.kind);
    println!(
        "Remaining: {} / {}",
        format_mmss(status.remaining),
        format_mmss(status.total)
    );
    println!("Pomodoros: {}", status.pomodoros);
    if let Some(task) = status.task_id {
        println!("Task: {task}");
    }
    if status.can_reset {
        println!("(paused - `tomatectl stop` resets)");
    }
}

fn format_mmss(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

async fn send_command(cmd: Command) -> Result<Response, IpcError> {
    let stream = UnixStream::connect(SOCKET_PATH)
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::NotFound => IpcError::ConnectionRefused,
            _ => IpcError::Io(e),
        })?;
    let (reader, mut writer) = stream.into_split();

    // Send command
    let mut msg = serde_json::to_vec(&cmd)?;
    msg.push(b'\n');
    writer.write_all(&msg).await?;

    // Read response
    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    let response: Response = serde_json::from_str(&line)?;

    Ok(response)
}
