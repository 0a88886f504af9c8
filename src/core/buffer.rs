//! Read cursor over a non-blocking byte source.
//!
//! A [`ReadCursor`] owns a byte window with a fill extent and a consumed
//! mark. Lines are carved out of the window by scanning for `\n`; known
//! length payloads (image data, uploaded PDB files) are copied out with
//! [`ReadCursor::get_bytes_with`].
//!
//! ```text
//! 0           mark            fill            capacity
//! |  consumed  |    unread     |     free       |
//! ```
//!
//! Consumed bytes are slid out before every read so that the full window
//! is available to a line in progress. A window that is full of unread
//! bytes without a newline is doubled, up to the configured line limit.

use std::io::{self, Read};
use std::os::fd::BorrowedFd;
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("{0} closed the connection")]
    Closed(&'static str),

    #[error("Failed to read from {ident}: {source}")]
    Io {
        ident: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Line from {ident} exceeds {limit} bytes")]
    LineTooLong { ident: &'static str, limit: usize },

    #[error("Timed out waiting for {0}")]
    TimedOut(&'static str),
}

pub type Result<T> = std::result::Result<T, BufferError>;

/// Outcome of a single [`ReadCursor::fill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The window is full.
    Full,
    /// Fewer bytes than requested were available; retry after the
    /// source becomes readable again.
    Short,
}

pub struct ReadCursor<R> {
    ident: &'static str,
    source: R,
    window: Vec<u8>,
    fill: usize,
    mark: usize,
    max_window: usize,
}

impl<R: Read> ReadCursor<R> {
    /// Create a cursor with a window of `capacity` bytes that never grows.
    pub fn new(ident: &'static str, source: R, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ident,
            source,
            window: vec![0; capacity],
            fill: 0,
            mark: 0,
            max_window: capacity,
        }
    }

    /// Allow the window to grow up to `limit` bytes to hold one long line.
    pub fn with_line_limit(mut self, limit: usize) -> Self {
        self.max_window = limit.max(self.window.len());
        self
    }

    pub fn ident(&self) -> &'static str {
        self.ident
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.window.len()
    }

    /// Bytes read from the source but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.fill - self.mark
    }

    /// Whether a whole line is already buffered.
    pub fn has_line(&self) -> bool {
        self.window[self.mark..self.fill].contains(&b'\n')
    }

    pub fn get_ref(&self) -> &R {
        &self.source
    }

    /// Perform one read into the free tail of the window.
    ///
    /// `WouldBlock` and short reads report [`Fill::Short`]; end of file
    /// reports [`BufferError::Closed`].
    pub fn fill(&mut self) -> Result<Fill> {
        self.compact();
        let room = self.window.len() - self.fill;
        if room == 0 {
            return Ok(Fill::Full);
        }
        loop {
            match self.source.read(&mut self.window[self.fill..]) {
                Ok(0) => return Err(BufferError::Closed(self.ident)),
                Ok(n) => {
                    self.fill += n;
                    trace!("{}: read {} bytes", self.ident, n);
                    return Ok(if n == room { Fill::Full } else { Fill::Short });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Short),
                Err(source) => {
                    return Err(BufferError::Io {
                        ident: self.ident,
                        source,
                    })
                }
            }
        }
    }

    /// Extract the next line, including its trailing `\n`.
    ///
    /// Returns `Ok(None)` once the source has nothing more to offer
    /// right now; the caller retries on the next readiness event.
    pub fn get_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scanned = 0;
        loop {
            let unread = &self.window[self.mark + scanned..self.fill];
            if let Some(pos) = unread.iter().position(|&b| b == b'\n') {
                let end = self.mark + scanned + pos + 1;
                let line = self.window[self.mark..end].to_vec();
                self.mark = end;
                return Ok(Some(line));
            }
            scanned = self.fill - self.mark;

            if self.mark == 0 && self.fill == self.window.len() {
                self.grow()?;
            }
            if self.fill()? == Fill::Short && self.fill - self.mark == scanned {
                return Ok(None);
            }
        }
    }

    /// Copy exactly `out.len()` bytes out of the source, calling `wait`
    /// whenever the source has nothing to read.
    pub fn get_bytes_with<F>(&mut self, out: &mut [u8], mut wait: F) -> Result<()>
    where
        F: FnMut(&R) -> Result<()>,
    {
        let mut copied = 0;
        while copied < out.len() {
            let available = self.fill - self.mark;
            if available > 0 {
                let n = available.min(out.len() - copied);
                out[copied..copied + n].copy_from_slice(&self.window[self.mark..self.mark + n]);
                self.mark += n;
                copied += n;
                continue;
            }
            if self.fill()? == Fill::Short && self.fill == self.mark {
                wait(&self.source)?;
            }
        }
        Ok(())
    }

    /// [`get_bytes_with`](Self::get_bytes_with) for blocking sources.
    pub fn get_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        self.get_bytes_with(out, |_| Ok(()))
    }

    fn compact(&mut self) {
        if self.mark == 0 {
            return;
        }
        self.window.copy_within(self.mark..self.fill, 0);
        self.fill -= self.mark;
        self.mark = 0;
    }

    fn grow(&mut self) -> Result<()> {
        let current = self.window.len();
        let grown = current.saturating_mul(2).min(self.max_window);
        if grown <= current {
            return Err(BufferError::LineTooLong {
                ident: self.ident,
                limit: self.max_window,
            });
        }
        trace!("{}: growing line window to {} bytes", self.ident, grown);
        self.window.resize(grown, 0);
        Ok(())
    }
}

/// Block until `fd` is readable or `deadline` passes.
pub fn wait_readable(fd: BorrowedFd<'_>, deadline: Instant, ident: &'static str) -> Result<()> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(BufferError::TimedOut(ident));
        }
        let millis = (deadline - now).as_millis().min(u128::from(u16::MAX)) as u16;
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => continue,
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                return Err(BufferError::Io {
                    ident,
                    source: io::Error::from(errno),
                })
            }
        }
    }
}
