//! Line protocol spoken with the render engine.
//!
//! Every native command is written as one line, after which the engine's
//! stdout is scanned until a line starting with the prompt token appears.
//! An exchange that never sees its token leaves the link in a sticky
//! error state: further exchanges fail immediately with the same error
//! until [`EngineLink::clear_error`] is called.

use std::io::{self, Write};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace, warn};

use super::buffer::{self, BufferError, ReadCursor};

/// Line the engine prints in front of a raw image payload.
pub const IMAGE_FOLLOWS: &str = "image follows: ";

/// Largest image payload accepted from the engine.
const MAX_IMAGE_BYTES: usize = 1 << 30;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Engine did not answer with {expected:?} within {waited_ms} ms")]
    Timeout { waited_ms: u64, expected: String },

    #[error("Engine closed its output")]
    Disconnected,

    #[error("Failed to write to engine: {0}")]
    Write(String),

    #[error("Failed to read from engine: {0}")]
    Read(String),

    #[error("Malformed image header from engine: {0:?}")]
    MalformedImageHeader(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    fn from_buffer(err: BufferError, expected: &str, timeout: Duration) -> Self {
        match err {
            BufferError::Closed(_) => EngineError::Disconnected,
            BufferError::TimedOut(_) => EngineError::Timeout {
                waited_ms: timeout.as_millis() as u64,
                expected: expected.to_string(),
            },
            other => EngineError::Read(other.to_string()),
        }
    }
}

pub struct EngineLink<W, R> {
    stdin: W,
    stdout: ReadCursor<R>,
    prompt: String,
    timeout: Duration,
    failure: Option<EngineError>,
}

impl<W: Write, R: io::Read + AsFd> EngineLink<W, R> {
    pub fn new(stdin: W, stdout: ReadCursor<R>, prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stdin,
            stdout,
            prompt: prompt.into(),
            timeout,
            failure: None,
        }
    }

    /// The sticky error, if an exchange has failed since the last clear.
    pub fn failure(&self) -> Option<&EngineError> {
        self.failure.as_ref()
    }

    pub fn clear_error(&mut self) {
        if let Some(err) = self.failure.take() {
            debug!("Clearing engine error: {}", err);
        }
    }

    pub fn stdout(&self) -> &ReadCursor<R> {
        &self.stdout
    }

    /// Send one native command and wait for the prompt.
    pub fn send(&mut self, command: &str) -> Result<()> {
        self.submit(command)?;
        let prompt = self.prompt.clone();
        self.expect(&prompt).map(|_| ())
    }

    /// Run a capture command and read the image it produces.
    ///
    /// `header` receives the payload length and returns the text placed in
    /// front of the payload. Returns the header and payload in one buffer,
    /// plus the payload length.
    pub fn capture<F>(&mut self, command: &str, header: F) -> Result<(Vec<u8>, usize)>
    where
        F: FnOnce(usize) -> String,
    {
        self.submit(command)?;
        let line = self.expect(IMAGE_FOLLOWS)?;
        let size = parse_image_size(&line)
            .filter(|&n| n <= MAX_IMAGE_BYTES)
            .ok_or_else(|| self.fail(EngineError::MalformedImageHeader(line.clone())))?;

        let mut data = header(size).into_bytes();
        let offset = data.len();
        let total = offset
            .checked_add(size)
            .ok_or_else(|| self.fail(EngineError::MalformedImageHeader(line.clone())))?;
        data.resize(total, 0);
        self.read_payload(&mut data[offset..])?;

        let prompt = self.prompt.clone();
        self.expect(&prompt)?;
        debug!("Captured {} image bytes", size);
        Ok((data, size))
    }

    /// Read lines until one starts with `token`; returns that line.
    pub fn expect(&mut self, token: &str) -> Result<String> {
        self.check()?;
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.stdout.get_line() {
                Ok(Some(raw)) => {
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches(&['\n', '\r'][..]);
                    if line.starts_with(token) {
                        trace!("engine> {}", line);
                        return Ok(line.to_string());
                    }
                    debug!("engine: {}", line);
                }
                Ok(None) => {
                    let ready = buffer::wait_readable(self.stdout.get_ref().as_fd(), deadline, "engine");
                    if let Err(e) = ready {
                        return Err(self.fail(EngineError::from_buffer(e, token, self.timeout)));
                    }
                }
                Err(e) => return Err(self.fail(EngineError::from_buffer(e, token, self.timeout))),
            }
        }
    }

    /// Log and discard complete lines the engine printed on its own.
    ///
    /// Returns [`EngineError::Disconnected`] once stdout reaches end of file.
    pub fn drain_unsolicited(&mut self) -> Result<usize> {
        let mut lines = 0;
        loop {
            match self.stdout.get_line() {
                Ok(Some(raw)) => {
                    lines += 1;
                    debug!("engine: {}", String::from_utf8_lossy(&raw).trim_end());
                }
                Ok(None) => return Ok(lines),
                Err(e) => return Err(EngineError::from_buffer(e, &self.prompt, self.timeout)),
            }
        }
    }

    fn submit(&mut self, command: &str) -> Result<()> {
        self.check()?;
        trace!("engine< {}", command);
        let written = self
            .stdin
            .write_all(command.as_bytes())
            .and_then(|_| self.stdin.write_all(b"\n"))
            .and_then(|_| self.stdin.flush());
        written.map_err(|e| self.fail(EngineError::Write(e.to_string())))
    }

    fn read_payload(&mut self, out: &mut [u8]) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let copied = self
            .stdout
            .get_bytes_with(out, |source| buffer::wait_readable(source.as_fd(), deadline, "engine"));
        copied.map_err(|e| self.fail(EngineError::from_buffer(e, "image data", self.timeout)))
    }

    fn check(&self) -> Result<()> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: EngineError) -> EngineError {
        warn!("{}", err);
        self.failure = Some(err.clone());
        err
    }
}

/// Byte count from an `image follows: <N>` line.
fn parse_image_size(line: &str) -> Option<usize> {
    line.strip_prefix(IMAGE_FOLLOWS)?.split_whitespace().next()?.parse().ok()
}
