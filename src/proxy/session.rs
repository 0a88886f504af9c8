//! Session state
//!
//! One [`Session`] exists per proxy run. It owns the engine link, both
//! client descriptors, the pending transform, the render flags and the
//! outgoing frame queue. Handlers receive it as `&mut Session`.

use std::fs::{self, File};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, info, trace, warn};

use super::command::{self, CommandError, Update};
use super::dispatch::CommandTable;
use super::frame::{Delivery, Frame, ImageFormat, Outbox};
use super::pending::PendingTransform;
use super::ProxyError;
use crate::config::{Config, TuningConfig};
use crate::core::buffer::{self, BufferError, ReadCursor};
use crate::core::child::set_nonblocking;
use crate::core::engine::{EngineError, EngineLink};
use crate::stats::SessionStats;

bitflags! {
    /// Render scheduling state.
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct RenderFlags: u8 {
        /// A frame should be produced once the client goes quiet.
        const UPDATE_PENDING = 0x01;
        /// Produce the frame now, without waiting for a lull.
        const FORCE_UPDATE = 0x02;
        /// The next frame gets a new cache id.
        const INVALIDATE_CACHE = 0x04;
    }
}

/// Values reported in every frame header.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub cache_id: u64,
    pub frame: i32,
    pub rock_offset: f64,
    /// Whether atom labels are shown
    pub labels: bool,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            cache_id: 0,
            frame: 1,
            rock_offset: 0.0,
            labels: false,
        }
    }
}

/// The five descriptors a session works with.
pub struct Channels {
    pub engine_in: File,
    pub engine_out: File,
    pub engine_err: File,
    pub client_in: File,
    pub client_out: File,
}

pub struct Session {
    engine: EngineLink<File, File>,
    /// `None` once the engine closes stderr
    engine_err: Option<ReadCursor<File>>,
    client: ReadCursor<File>,
    client_out: File,
    /// Client text not yet forming whole commands
    partial: String,
    pending: PendingTransform,
    flags: RenderFlags,
    view: ViewState,
    outbox: Outbox,
    stats: SessionStats,
    commands: CommandTable,
    tuning: TuningConfig,
    image_marker: String,
    auto_format: ImageFormat,
    io_timeout: Duration,
    idle_timeout: Duration,
    pdb_path: PathBuf,
    pdb_written: bool,
}

impl Session {
    /// Build a session over `channels`. Every read side is switched to
    /// non-blocking, as is the client's output.
    pub fn new(config: &Config, channels: Channels) -> Result<Self, ProxyError> {
        set_nonblocking(&channels.engine_out)?;
        set_nonblocking(&channels.engine_err)?;
        set_nonblocking(&channels.client_in)?;
        set_nonblocking(&channels.client_out)?;

        let stdout = ReadCursor::new("engine", channels.engine_out, config.engine.buffer_size);
        let engine = EngineLink::new(
            channels.engine_in,
            stdout,
            config.engine.prompt.clone(),
            config.io_timeout(),
        );
        let client = ReadCursor::new("client", channels.client_in, config.client.buffer_size)
            .with_line_limit(config.client.max_line_bytes);

        let mut session = Self {
            engine,
            engine_err: Some(ReadCursor::new("engine stderr", channels.engine_err, 4096)),
            client,
            client_out: channels.client_out,
            partial: String::new(),
            pending: PendingTransform::default(),
            flags: RenderFlags::empty(),
            view: ViewState::default(),
            outbox: Outbox::default(),
            stats: SessionStats::new(),
            commands: CommandTable::standard(),
            tuning: config.tuning.clone(),
            image_marker: config.render.image_marker.clone(),
            auto_format: config.render.auto_format,
            io_timeout: config.io_timeout(),
            idle_timeout: config.idle_timeout(),
            pdb_path: config.pdb_path(),
            pdb_written: false,
        };
        if let Some(greeting) = config.render.greeting.as_deref().filter(|g| !g.is_empty()) {
            session.outbox.push_reply(format!("{}\n", greeting));
        }
        Ok(session)
    }

    pub fn flags(&self) -> RenderFlags {
        self.flags
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut ViewState {
        &mut self.view
    }

    pub fn pending(&self) -> &PendingTransform {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingTransform {
        &mut self.pending
    }

    pub fn tuning(&self) -> &TuningConfig {
        &self.tuning
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut SessionStats {
        &mut self.stats
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn engine_failure(&self) -> Option<&EngineError> {
        self.engine.failure()
    }

    pub fn pdb_path(&self) -> &Path {
        &self.pdb_path
    }

    /// Descriptors the event loop polls.
    pub(crate) fn client_in(&self) -> &File {
        self.client.get_ref()
    }

    pub(crate) fn client_out(&self) -> &File {
        &self.client_out
    }

    pub(crate) fn engine_out(&self) -> &File {
        self.engine.stdout().get_ref()
    }

    pub(crate) fn engine_err(&self) -> Option<&File> {
        self.engine_err.as_ref().map(ReadCursor::get_ref)
    }

    /// Record the effect of a state-changing command on rendering.
    pub fn mark_update(&mut self, update: Update, invalidate: bool) {
        if invalidate {
            self.flags |= RenderFlags::INVALIDATE_CACHE;
        }
        if !update.defer || update.push {
            self.flags |= RenderFlags::UPDATE_PENDING;
        }
        if update.push {
            self.flags |= RenderFlags::FORCE_UPDATE;
        }
    }

    /// Send one native command, honoring the sticky engine error.
    pub fn send(&mut self, command: &str) -> command::Result<()> {
        self.engine.send(command).map_err(CommandError::from)
    }

    /// Apply every coalesced change to the engine.
    pub fn flush_pending(&mut self) -> command::Result<()> {
        for command in self.pending.drain() {
            self.send(&command)?;
        }
        Ok(())
    }

    /// Flush, refresh and capture a frame in `format`, then queue it.
    pub fn capture(&mut self, format: ImageFormat) -> command::Result<()> {
        // Cleared up front so a failed capture is not retried every pass
        if self.flags.contains(RenderFlags::INVALIDATE_CACHE) {
            self.view.cache_id += 1;
        }
        self.flags.remove(RenderFlags::UPDATE_PENDING | RenderFlags::FORCE_UPDATE | RenderFlags::INVALIDATE_CACHE);
        self.flush_pending()?;

        self.send("refresh")?;
        let ViewState {
            cache_id,
            frame,
            rock_offset,
            ..
        } = self.view;
        let marker = self.image_marker.clone();
        let (data, size) = self.engine.capture(format.capture_command(), |n| {
            format!("{} {} {} {} {}\n", marker, n, cache_id, frame, rock_offset)
        })?;
        self.outbox.push_frame(Frame::new(data, size));
        debug!("Queued {:?} frame {} ({} bytes)", format, cache_id, size);
        Ok(())
    }

    /// Capture with an arbitrary native command, tagging the frame with
    /// `token` instead of the cache id.
    pub fn capture_tagged(&mut self, command: &str, token: &str) -> command::Result<()> {
        let marker = self.image_marker.clone();
        let (data, size) = self
            .engine
            .capture(command, |n| format!("{} {} {} 0 0\n", marker, n, token))?;
        self.outbox.push_frame(Frame::new(data, size));
        debug!("Queued frame for {} ({} bytes)", token, size);
        Ok(())
    }

    /// Render triggered by the loop rather than the client.
    pub fn auto_render(&mut self) {
        trace!("Idle render");
        if let Err(e) = self.capture(self.auto_format) {
            warn!("Automatic render failed: {}", e);
        }
    }

    /// Run client text holding one or more whole commands.
    ///
    /// Failures are reported to the client; they never end the session.
    pub fn execute(&mut self, text: &str) {
        let commands = match command::split_commands(text) {
            Ok(commands) => commands,
            Err(e) => {
                self.reply_error(&CommandError::from(e));
                return;
            }
        };
        for words in commands {
            self.engine.clear_error();
            let started = Instant::now();
            let result = self.dispatch(&words);
            self.stats.record_command(started.elapsed());
            if let Err(e) = result {
                warn!("{}: {}", words[0], e);
                self.reply_error(&e);
            }
        }
    }

    fn dispatch(&mut self, words: &[String]) -> command::Result<()> {
        let Some((verb, args)) = words.split_first() else {
            return Ok(());
        };
        let handler = self
            .commands
            .lookup(verb)
            .ok_or_else(|| CommandError::Unknown(verb.clone()))?;
        trace!("client: {}", words.join(" "));
        handler(self, args)
    }

    fn reply_error(&mut self, err: &CommandError) {
        self.outbox
            .push_reply(format!("nv>error -type command -message {{{}}}\n", err));
    }

    /// Whether a client line was read but not yet executed.
    pub fn has_client_line(&self) -> bool {
        self.client.has_line()
    }

    /// Read and execute whatever complete commands the client has sent.
    ///
    /// Stops early when a command asks for an immediate render; the rest
    /// stays buffered and [`has_client_line`](Self::has_client_line)
    /// reports it.
    pub fn read_client(&mut self) -> Result<(), ProxyError> {
        loop {
            let line = match self.client.get_line() {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(BufferError::Closed(_)) => return Err(ProxyError::ClientDisconnected),
                Err(e) => return Err(ProxyError::Client(e)),
            };
            self.partial.push_str(&String::from_utf8_lossy(&line));
            if !command::is_complete(&self.partial) {
                continue;
            }
            let text = std::mem::take(&mut self.partial);
            self.execute(&text);
            if self.flags.contains(RenderFlags::FORCE_UPDATE) {
                return Ok(());
            }
        }
    }

    /// Read exactly `len` raw bytes that follow a command on the client
    /// stream, waiting up to the I/O timeout for them.
    pub fn read_client_bytes(&mut self, len: usize) -> command::Result<Vec<u8>> {
        let mut data = vec![0; len];
        let deadline = Instant::now() + self.io_timeout;
        self.client
            .get_bytes_with(&mut data, |source| buffer::wait_readable(source.as_fd(), deadline, "client"))
            .map_err(|e| CommandError::Invalid(format!("can't read data from client: {}", e)))?;
        Ok(data)
    }

    /// Store PDB text in the per-process file and return its path.
    pub fn write_pdb(&mut self, data: &[u8]) -> command::Result<PathBuf> {
        fs::write(&self.pdb_path, data).map_err(|source| CommandError::Io {
            context: format!("can't write PDB data to {}", self.pdb_path.display()),
            source,
        })?;
        self.pdb_written = true;
        Ok(self.pdb_path.clone())
    }

    /// Log and discard unsolicited engine output.
    pub fn drain_engine_stdout(&mut self) -> Result<(), ProxyError> {
        match self.engine.drain_unsolicited() {
            Ok(_) => Ok(()),
            Err(EngineError::Disconnected) => Err(ProxyError::EngineDisconnected),
            Err(e) => {
                warn!("Engine output: {}", e);
                Ok(())
            }
        }
    }

    /// Log and discard engine diagnostics.
    pub fn drain_engine_stderr(&mut self) -> Result<(), ProxyError> {
        let Some(stderr) = self.engine_err.as_mut() else {
            return Ok(());
        };
        loop {
            match stderr.get_line() {
                Ok(Some(line)) => debug!("engine stderr: {}", String::from_utf8_lossy(&line).trim_end()),
                Ok(None) => return Ok(()),
                Err(BufferError::Closed(_)) => {
                    info!("Engine closed stderr");
                    self.engine_err = None;
                    return Ok(());
                }
                Err(BufferError::LineTooLong { .. }) => {
                    // Overlong diagnostics are skipped wholesale
                    let mut skipped = vec![0; stderr.buffered()];
                    stderr.get_bytes(&mut skipped).map_err(ProxyError::Engine)?;
                }
                Err(e) => return Err(ProxyError::Engine(e)),
            }
        }
    }

    /// Push queued output toward the client with one write.
    pub fn deliver(&mut self) -> Result<Delivery, ProxyError> {
        let delivery = self.outbox.deliver(&mut self.client_out).map_err(|e| {
            debug!("Client write failed: {}", e);
            ProxyError::ClientDisconnected
        })?;
        if let Delivery::FrameSent { payload_len, .. } = delivery {
            self.stats.record_frame(payload_len);
        }
        Ok(delivery)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.pdb_written {
            match fs::remove_file(&self.pdb_path) {
                Ok(()) => debug!("Removed {}", self.pdb_path.display()),
                Err(e) => warn!("Failed to remove {}: {}", self.pdb_path.display(), e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    use crate::core::engine::tests::{spawn_fake, FakeEngine, Reply};

    /// A session wired to a fake engine and a socket-pair client.
    pub struct Harness {
        pub session: Session,
        pub engine: FakeEngine,
        /// Client's end: write commands here, read frames back
        pub client: UnixStream,
        /// Keeps the engine's stderr open
        pub stderr: UnixStream,
        pub dir: tempfile::TempDir,
    }

    impl Harness {
        /// Every command the engine received so far.
        pub fn sent(&self) -> Vec<String> {
            self.engine.commands.try_iter().collect()
        }

        /// Read back everything written to the client.
        pub fn client_output(&mut self) -> Vec<u8> {
            while !self.session.outbox().is_empty() {
                self.session.deliver().unwrap();
            }
            self.client.set_nonblocking(true).unwrap();
            let mut out = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match self.client.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => out.extend_from_slice(&chunk[..n]),
                    Err(_) => break,
                }
            }
            out
        }
    }

    /// Engine that answers captures with `image` and everything else with
    /// a prompt.
    pub fn image_engine(image: Vec<u8>) -> impl FnMut(&str) -> Reply + Send + 'static {
        move |cmd| {
            if cmd.starts_with("png") || cmd.starts_with("bmp") {
                Reply::Image(image.clone())
            } else {
                Reply::Prompt
            }
        }
    }

    pub fn harness<F>(respond: F, configure: impl FnOnce(&mut Config)) -> Harness
    where
        F: FnMut(&str) -> Reply + Send + 'static,
    {
        let engine = spawn_fake(respond);
        let dir = tempfile::tempdir().unwrap();
        let (client_side, client) = UnixStream::pair().unwrap();
        let client_out = client_side.try_clone().unwrap();
        let (engine_err, stderr) = UnixStream::pair().unwrap();

        let mut config = Config::default();
        config.files.temp_dir = Some(dir.path().to_path_buf());
        config.engine.io_timeout_ms = 2_000;
        configure(&mut config);

        let channels = Channels {
            engine_in: engine.stdin.try_clone().unwrap(),
            engine_out: engine.stdout.try_clone().unwrap(),
            engine_err: File::from(OwnedFd::from(engine_err)),
            client_in: File::from(OwnedFd::from(client_side)),
            client_out: File::from(OwnedFd::from(client_out)),
        };
        let session = Session::new(&config, channels).unwrap();
        Harness {
            session,
            engine,
            client,
            stderr,
            dir,
        }
    }

    #[test]
    fn test_mark_update_flags() {
        let mut h = harness(|_| Reply::Prompt, |_| {});

        h.session.mark_update(Update { defer: true, push: false }, false);
        assert_eq!(h.session.flags(), RenderFlags::empty());

        h.session.mark_update(Update::default(), true);
        assert_eq!(h.session.flags(), RenderFlags::UPDATE_PENDING | RenderFlags::INVALIDATE_CACHE);

        h.session.mark_update(Update { defer: true, push: true }, false);
        assert!(h.session.flags().contains(RenderFlags::FORCE_UPDATE));
    }

    #[test]
    fn test_capture_header_and_cache_id() {
        let mut h = harness(image_engine(b"IMG".to_vec()), |_| {});

        h.session.mark_update(Update::default(), true);
        h.session.capture(ImageFormat::Bmp).unwrap();
        assert_eq!(h.session.flags(), RenderFlags::empty());
        assert_eq!(h.session.view().cache_id, 1);

        // No invalidation: the id stays
        h.session.capture(ImageFormat::Bmp).unwrap();
        assert_eq!(h.session.view().cache_id, 1);

        assert_eq!(h.sent(), vec!["refresh", "bmp -", "refresh", "bmp -"]);
        let out = h.client_output();
        // Only the newest of the two queued frames is delivered
        assert_eq!(out, b"nv>image 3 1 1 0\nIMG");
        assert_eq!(h.session.stats().frames(), 1);
    }

    #[test]
    fn test_greeting_is_first_reply() {
        let mut h = harness(|_| Reply::Prompt, |config| {
            config.render.greeting = Some("PyMol 1.0".to_string());
        });
        assert_eq!(h.client_output(), b"PyMol 1.0\n");
    }

    #[test]
    fn test_unknown_command_is_reported() {
        let mut h = harness(|_| Reply::Prompt, |_| {});

        h.session.execute("frobnicate 1 2\n");

        assert!(h.sent().is_empty());
        let out = String::from_utf8(h.client_output()).unwrap();
        assert_eq!(out, "nv>error -type command -message {invalid command name \"frobnicate\"}\n");
        assert_eq!(h.session.stats().commands(), 1);
    }

    #[test]
    fn test_read_client_accumulates_braced_commands() {
        let mut h = harness(|_| Reply::Prompt, |_| {});

        h.client.write_all(b"raw {set a,1\n").unwrap();
        h.session.read_client().unwrap();
        assert!(h.sent().is_empty());

        h.client.write_all(b"}\n").unwrap();
        h.session.read_client().unwrap();
        assert_eq!(h.sent(), vec!["set a,1"]);
    }

    #[test]
    fn test_client_eof_is_a_disconnect() {
        let mut h = harness(|_| Reply::Prompt, |_| {});
        h.client.shutdown(std::net::Shutdown::Write).unwrap();

        assert!(matches!(h.session.read_client(), Err(ProxyError::ClientDisconnected)));
    }

    #[test]
    fn test_stderr_is_drained_and_closed() {
        let mut h = harness(|_| Reply::Prompt, |_| {});
        h.stderr.write_all(b"warning: something\n").unwrap();
        h.session.drain_engine_stderr().unwrap();
        assert!(h.session.engine_err().is_some());

        h.stderr.shutdown(std::net::Shutdown::Write).unwrap();
        h.session.drain_engine_stderr().unwrap();
        assert!(h.session.engine_err().is_none());
    }

    #[test]
    fn test_pdb_file_removed_on_drop() {
        let h = harness(|_| Reply::Prompt, |_| {});
        let Harness { mut session, dir, .. } = h;

        let path = session.write_pdb(b"ATOM      1  N\n").unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());

        drop(session);
        assert!(!path.exists());
    }

    #[test]
    fn test_client_write_failure_is_a_disconnect() {
        let mut h = harness(image_engine(vec![7; 16]), |_| {});
        h.session.capture(ImageFormat::Png).unwrap();
        drop(h.client);

        let mut result = Ok(Delivery::Idle);
        for _ in 0..4 {
            result = h.session.deliver();
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(ProxyError::ClientDisconnected)));
    }

    #[test]
    fn test_semicolon_separated_commands_run_in_order() {
        let mut h = harness(|_| Reply::Prompt, |_| {});

        h.session.execute("raw {a}; raw {b}\nraw c\n");
        assert_eq!(h.sent(), vec!["a", "b", "c"]);
        assert_eq!(h.session.stats().commands(), 3);
    }
}
