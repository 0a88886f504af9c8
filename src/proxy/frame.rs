//! Outgoing frames and their delivery to the client.
//!
//! Frames are queued newest first. Only one frame is ever on the wire: the
//! one already partially written, or else the newest. When it completes,
//! it and every older frame behind it are dropped, so a slow client only
//! ever sees the latest view.
//!
//! Text replies (command errors, the greeting) travel in their own queue
//! and are written between frames, never inside one.

use std::collections::VecDeque;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Image encodings the engine can stream back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Bmp,
    Ppm,
}

impl ImageFormat {
    /// Native command that writes the current scene to stdout.
    pub fn capture_command(self) -> &'static str {
        match self {
            ImageFormat::Png => "png -",
            ImageFormat::Bmp => "bmp -",
            ImageFormat::Ppm => "png -,format=1",
        }
    }
}

/// Header line plus payload, with a write cursor.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    payload_len: usize,
    written: usize,
}

impl Frame {
    /// `data` holds the header immediately followed by `payload_len`
    /// payload bytes.
    pub fn new(data: Vec<u8>, payload_len: usize) -> Self {
        Self {
            data,
            payload_len,
            written: 0,
        }
    }

    /// Plain text with no payload.
    pub fn text(line: String) -> Self {
        Self::new(line.into_bytes(), 0)
    }

    #[cfg(test)]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn remaining(&self) -> &[u8] {
        &self.data[self.written..]
    }

    fn is_done(&self) -> bool {
        self.written >= self.data.len()
    }
}

/// Result of one delivery attempt.
#[derive(Debug, PartialEq)]
pub enum Delivery {
    /// Nothing queued.
    Idle,
    /// The client accepted no bytes this time.
    Blocked,
    /// Some bytes went out; more remain.
    Partial,
    /// A frame finished; `dropped` older frames were discarded with it.
    FrameSent { payload_len: usize, dropped: usize },
    /// A text reply finished.
    ReplySent,
}

#[derive(Debug, Default)]
pub struct Outbox {
    /// Newest first.
    frames: VecDeque<Frame>,
    /// Index of the partially written frame, if any.
    in_flight: Option<usize>,
    replies: VecDeque<Frame>,
}

impl Outbox {
    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push_front(frame);
        if let Some(index) = self.in_flight.as_mut() {
            *index += 1;
        }
        trace!("Queued frame, {} waiting", self.frames.len());
    }

    pub fn push_reply(&mut self, line: String) {
        self.replies.push_back(Frame::text(line));
    }

    pub fn has_frames(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.replies.is_empty()
    }

    #[cfg(test)]
    pub fn queued_frames(&self) -> usize {
        self.frames.len()
    }

    /// Issue a single write for whatever is next in line.
    ///
    /// A frame already on the wire is always continued first. Otherwise a
    /// started or waiting reply goes ahead of the newest frame.
    pub fn deliver<W: Write>(&mut self, out: &mut W) -> io::Result<Delivery> {
        if self.in_flight.is_none() && !self.replies.is_empty() {
            return self.deliver_reply(out);
        }
        if self.frames.is_empty() {
            return Ok(Delivery::Idle);
        }
        let index = *self.in_flight.get_or_insert(0);
        let frame = &mut self.frames[index];

        let Some(n) = write_once(out, frame.remaining())? else {
            return Ok(Delivery::Blocked);
        };
        frame.written += n;
        if !frame.is_done() {
            return Ok(Delivery::Partial);
        }

        let payload_len = frame.payload_len;
        let dropped = self.frames.len() - index - 1;
        self.frames.truncate(index);
        self.in_flight = None;
        if dropped > 0 {
            debug!("Discarded {} superseded frame(s)", dropped);
        }
        Ok(Delivery::FrameSent { payload_len, dropped })
    }

    fn deliver_reply<W: Write>(&mut self, out: &mut W) -> io::Result<Delivery> {
        let Some(reply) = self.replies.front_mut() else {
            return Ok(Delivery::Idle);
        };
        let Some(n) = write_once(out, reply.remaining())? else {
            return Ok(Delivery::Blocked);
        };
        reply.written += n;
        if reply.is_done() {
            self.replies.pop_front();
            Ok(Delivery::ReplySent)
        } else {
            Ok(Delivery::Partial)
        }
    }
}

/// One `write` call. `None` when the writer would block.
fn write_once<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<Option<usize>> {
    match out.write(bytes) {
        Ok(0) if !bytes.is_empty() => Err(io::ErrorKind::WriteZero.into()),
        Ok(n) => Ok(Some(n)),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(None),
        Err(e) => Err(e),
    }
}
