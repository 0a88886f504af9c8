//! Render engine process supervision.
//!
//! The engine runs in its own process group with all three standard
//! streams piped back to the proxy. Shutdown signals the whole group so
//! helper processes the engine forks are reaped with it.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{self, killpg, SigHandler, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("No engine command configured")]
    EmptyCommand,

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Engine {0} is missing a piped stream")]
    MissingPipe(&'static str),

    #[error("Failed to configure descriptor: {0}")]
    Descriptor(#[source] Errno),

    #[error("Failed to send {signal:?} to process group {pgid}: {source}")]
    Signal {
        signal: Signal,
        pgid: i32,
        #[source]
        source: Errno,
    },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Control surface of a supervised engine process.
pub trait ChildProcess {
    fn id(&self) -> u32;

    /// Non-blocking reap.
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;

    /// Ask the process group to exit (SIGTERM).
    fn terminate(&mut self) -> Result<()>;

    /// Kill the process group (SIGKILL).
    fn force_kill(&mut self) -> Result<()>;

    fn wait(&mut self) -> io::Result<ExitStatus>;
}

/// Engine side of the three pipes, as plain files.
pub struct EnginePipes {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
}

pub struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    /// Start `argv[0]` with `argv[1..]` in a new process group.
    ///
    /// The returned stdout and stderr are non-blocking. SIGPIPE is ignored
    /// so that writing to a dead engine surfaces as `EPIPE` instead of
    /// killing the proxy.
    pub fn spawn(argv: &[String]) -> Result<(Self, EnginePipes)> {
        let (program, args) = argv.split_first().ok_or(SupervisorError::EmptyCommand)?;

        ignore_sigpipe()?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SupervisorError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SupervisorError::MissingPipe("stderr"))?;

        let pipes = EnginePipes {
            stdin: File::from(OwnedFd::from(stdin)),
            stdout: File::from(OwnedFd::from(stdout)),
            stderr: File::from(OwnedFd::from(stderr)),
        };
        set_nonblocking(&pipes.stdout)?;
        set_nonblocking(&pipes.stderr)?;

        info!("Started engine {} (pid {})", program, child.id());
        Ok((Self { child }, pipes))
    }

    fn signal_group(&self, signal: Signal) -> Result<()> {
        let pgid = self.child.id() as i32;
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(SupervisorError::Signal { signal, pgid, source }),
        }
    }
}

impl ChildProcess for EngineProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    fn terminate(&mut self) -> Result<()> {
        self.signal_group(Signal::SIGTERM)
    }

    fn force_kill(&mut self) -> Result<()> {
        self.signal_group(Signal::SIGKILL)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }
}

/// Timing of the graceful-then-forceful shutdown sequence.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownPolicy {
    pub grace: Duration,
    pub kill_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            kill_wait: Duration::from_secs(10),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Reap the engine, escalating SIGTERM then SIGKILL to its process group.
///
/// Returns `None` only when the exit status could not be collected.
pub fn shutdown<C: ChildProcess + ?Sized>(child: &mut C, policy: &ShutdownPolicy) -> Option<ExitStatus> {
    match child.try_wait() {
        Ok(Some(status)) => {
            info!("Engine {} already exited: {}", child.id(), status);
            return Some(status);
        }
        Ok(None) => {}
        Err(e) => warn!("Failed to poll engine {}: {}", child.id(), e),
    }

    info!("Sending SIGTERM to engine process group {}", child.id());
    if let Err(e) = child.terminate() {
        warn!("{}", e);
    }
    if let Some(status) = wait_until(child, policy.grace, policy.poll_interval) {
        return Some(status);
    }

    warn!(
        "Engine {} still running after {:?}, sending SIGKILL",
        child.id(),
        policy.grace
    );
    if let Err(e) = child.force_kill() {
        error!("{}", e);
    }
    if let Some(status) = wait_until(child, policy.kill_wait, policy.poll_interval) {
        return Some(status);
    }

    warn!("Engine {} ignored SIGKILL for {:?}, blocking", child.id(), policy.kill_wait);
    match child.wait() {
        Ok(status) => Some(status),
        Err(e) => {
            error!("Failed to reap engine {}: {}", child.id(), e);
            None
        }
    }
}

fn wait_until<C: ChildProcess + ?Sized>(
    child: &mut C,
    limit: Duration,
    interval: Duration,
) -> Option<ExitStatus> {
    let deadline = Instant::now() + limit;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Engine {} exited: {}", child.id(), status);
                return Some(status);
            }
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Failed to poll engine {}: {}", child.id(), e);
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(interval);
    }
}

/// Process exit code mirroring the engine's status.
pub fn exit_code(status: &ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

pub fn set_nonblocking<F: AsFd>(fd: &F) -> Result<()> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL).map_err(SupervisorError::Descriptor)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags)).map_err(SupervisorError::Descriptor)?;
    Ok(())
}

fn ignore_sigpipe() -> Result<()> {
    // SAFETY: SIG_IGN installs no handler code.
    let previous = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) };
    previous.map(|_| ()).map_err(|source| SupervisorError::Signal {
        signal: Signal::SIGPIPE,
        pgid: 0,
        source,
    })
}
