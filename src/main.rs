//! molproxy - relay between a molecular viewer client and a PyMOL render server
//!
//! molproxy is started with its stdin and stdout connected to a client. It
//! spawns PyMOL (or any engine speaking the same prompt protocol) on a set
//! of pipes, translates the client's high-level commands into engine
//! commands, and streams rendered frames back to the client.
//!
//! # Quick Start
//!
//! ```text
//! molproxy                                 # engine command from config.toml
//! molproxy -- pymol -p -q -i -x -K         # explicit engine command
//! molproxy -vv --stats-file ''             # trace logging, no session record
//! ```
//!
//! # Client Commands
//!
//! | Verb | Effect |
//! |------|--------|
//! | rotate, pan, zoom | move the camera |
//! | atomscale, bondthickness | resize atoms and bonds |
//! | ballnstick, spheres, lines, cartoon | change representation |
//! | loadpdb | load a structure sent inline |
//! | png, bmp, ppm, print | capture an image |
//! | raw | pass a command through unchanged |

mod config;
mod core;
mod proxy;
mod stats;

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::core::child::{exit_code, shutdown, EngineProcess};
use crate::proxy::session::{Channels, Session};

/// Exit status used when the engine's own status is unknown.
const FAILURE_STATUS: i32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "molproxy",
    version,
    about = "Relay proxy between a molecular viewer client (stdin/stdout) and a PyMOL render server"
)]
struct Cli {
    /// Configuration file (default: ~/.molproxy/config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write logs to this file instead of the temp directory
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Append the session record here; an empty value disables it
    #[arg(long, value_name = "PATH")]
    stats_file: Option<String>,

    /// Milliseconds to wait for an engine reply before giving up
    #[arg(long, value_name = "MS")]
    timeout: Option<u64>,

    /// Engine command line, overriding the configured one
    #[arg(last = true, value_name = "ENGINE")]
    engine: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.log_file {
            config.files.log_file = Some(path.clone());
        }
        if let Some(path) = &self.stats_file {
            config.files.stats_file = PathBuf::from(path);
        }
        if let Some(ms) = self.timeout {
            config.engine.io_timeout_ms = ms;
        }
        if !self.engine.is_empty() {
            config.engine.command = self.engine.clone();
        }
    }

    fn log_filter(&self, config: &Config) -> EnvFilter {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
        let level = match self.verbose {
            0 => config.log_level.as_str(),
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Log to a file; stdout belongs to the client and stderr may be closed.
fn init_logging(cli: &Cli, config: &Config) {
    let log_path = config.log_path();
    if let Some(parent) = log_path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let log_file = OpenOptions::new().create(true).append(true).open(&log_path).ok();

    if let Some(file) = log_file {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(cli.log_filter(config))
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Duplicate one of our standard streams as an owned file.
fn dup_stdio<F: AsFd>(stream: F, name: &str) -> Result<File> {
    let fd = stream
        .as_fd()
        .try_clone_to_owned()
        .with_context(|| format!("Failed to duplicate {}", name))?;
    Ok(File::from(fd))
}

fn run(config: &Config) -> Result<i32> {
    if config.engine.command.is_empty() {
        bail!("No engine command configured");
    }

    let (mut child, pipes) = EngineProcess::spawn(&config.engine.command)?;
    let channels = Channels {
        engine_in: pipes.stdin,
        engine_out: pipes.stdout,
        engine_err: pipes.stderr,
        client_in: dup_stdio(std::io::stdin(), "stdin")?,
        client_out: dup_stdio(std::io::stdout(), "stdout")?,
    };

    let mut session = match Session::new(config, channels) {
        Ok(session) => session,
        Err(e) => {
            shutdown(&mut child, &config.shutdown_policy());
            return Err(e).context("Failed to set up session");
        }
    };
    let reason = proxy::event_loop::run(&mut session);
    info!("Session ended: {}", reason);

    let status = shutdown(&mut child, &config.shutdown_policy());
    let code = match status.as_ref().map(exit_code) {
        Some(code) => code,
        None => {
            warn!("Engine exit status unknown");
            FAILURE_STATUS
        }
    };
    info!("Engine exited with status {}", code);

    if let Some(path) = config.stats_file() {
        session.stats().save(path, code);
    }
    Ok(code)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);

    init_logging(&cli, &config);
    info!("molproxy {} starting...", env!("CARGO_PKG_VERSION"));

    match run(&config) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            Err(e)
        }
    }
}
