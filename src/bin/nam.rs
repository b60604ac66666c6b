//! nam - NodeAccessManager command-line front-end.
//!
//! Thin wrapper over the library: `start` runs or detaches the daemon,
//! `stop`/`reload` signal it through the PID file, `status` probes it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

use nam::config::Config;
use nam::core::pid::{self, DaemonStatus};
use nam::core::App;
use nam::logging;

#[derive(Parser, Debug)]
#[command(
    name = "nam",
    version,
    about = "NodeAccessManager - per-port concurrent IP limiting for proxy nodes",
    long_about = "Monitors established TCP connections on configured ports, evicts \
clients once a port exceeds its distinct-IP limit, and blocks them for a \
configurable cool-down. Designed for Linux nodes running Xray or Sing-box."
)]
struct Cli {
    /// Configuration file path.
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        value_name = "PATH",
        default_value = "/etc/nam/config.yaml"
    )]
    config: String,

    /// PID file path.
    #[arg(
        long = "pid-file",
        global = true,
        value_name = "PATH",
        default_value = pid::DEFAULT_PID_FILE
    )]
    pid_file: String,

    /// Force debug-level logging.
    #[arg(short = 'd', long = "debug", global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the daemon.
    Start {
        /// Run in the foreground instead of detaching.
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the running daemon.
    Stop,
    /// Show whether the daemon is running.
    Status,
    /// Signal the running daemon to reload its configuration.
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { foreground: true } => {
            start_foreground(&cli.config, &cli.pid_file, cli.debug).await
        }
        Commands::Start { foreground: false } => {
            start_detached(&cli.config, &cli.pid_file, cli.debug)
        }
        Commands::Stop => cmd_stop(&cli.pid_file),
        Commands::Status => cmd_status(&cli.config, &cli.pid_file),
        Commands::Reload => cmd_reload(&cli.pid_file),
    }
}

/// Run the controller in place until a terminating signal arrives.
async fn start_foreground(config_path: &str, pid_file: &str, debug: bool) -> Result<()> {
    if let DaemonStatus::Running { pid } = pid::check_daemon(pid_file) {
        anyhow::bail!("NAM is already running (PID {pid})");
    }

    let config = Config::from_file(config_path)?;
    let _log_guard = logging::init(&config.global, debug)?;

    if let Err(err) = pid::write_pid_file(pid_file) {
        tracing::error!("writing PID file failed: {err:#}");
    }

    let app = App::new(config_path).await?;
    app.start().await?;
    let result = app.run().await;

    pid::remove_pid_file(pid_file).ok();
    result
}

/// Detach a child in its own session and report its PID.
fn start_detached(config_path: &str, pid_file: &str, debug: bool) -> Result<()> {
    if let DaemonStatus::Running { pid } = pid::check_daemon(pid_file) {
        anyhow::bail!("NAM is already running (PID {pid})");
    }

    let executable = std::env::current_exe().context("failed to locate executable")?;

    let mut command = Command::new(executable);
    command
        .args([
            "start",
            "--foreground",
            "--config",
            config_path,
            "--pid-file",
            pid_file,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if debug {
        command.arg("--debug");
    }

    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let child = command.spawn().context("failed to start daemon process")?;

    println!("NAM started (PID {})", child.id());
    println!("  config:   {config_path}");
    println!("  pid file: {pid_file}");
    println!("  use 'nam status' to check it, 'nam stop' to stop it");
    Ok(())
}

fn cmd_stop(pid_file: &str) -> Result<()> {
    match pid::check_daemon(pid_file) {
        DaemonStatus::NoPidFile => {
            println!("NAM is not running");
            std::process::exit(1);
        }
        DaemonStatus::Stale { pid } => {
            pid::remove_pid_file(pid_file)?;
            println!("NAM is not running (removed stale PID file for process {pid})");
            std::process::exit(1);
        }
        DaemonStatus::Running { pid } => {
            println!("stopping NAM (PID {pid})");
            pid::stop_daemon(pid_file)?;

            for _ in 0..20 {
                std::thread::sleep(Duration::from_millis(500));
                if !pid::is_process_running(pid) {
                    break;
                }
            }

            if pid::is_process_running(pid) {
                anyhow::bail!("process {pid} did not stop in time");
            }

            pid::remove_pid_file(pid_file)?;
            println!("NAM stopped");
            Ok(())
        }
    }
}

fn cmd_status(config_path: &str, pid_file: &str) -> Result<()> {
    match pid::check_daemon(pid_file) {
        DaemonStatus::Running { pid } => {
            println!("status: running");
            println!("pid:    {pid}");
            println!("config: {config_path}");
            Ok(())
        }
        DaemonStatus::Stale { pid } => {
            println!("status: not running (stale PID file for process {pid})");
            std::process::exit(1);
        }
        DaemonStatus::NoPidFile => {
            println!("status: not running");
            std::process::exit(1);
        }
    }
}

fn cmd_reload(pid_file: &str) -> Result<()> {
    match pid::check_daemon(pid_file) {
        DaemonStatus::Running { .. } => {
            let pid = pid::reload_daemon(pid_file)?;
            println!("reload signal sent to PID {pid}");
            Ok(())
        }
        _ => anyhow::bail!("NAM is not running, nothing to reload"),
    }
}
