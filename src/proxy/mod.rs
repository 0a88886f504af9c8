//! Client-facing side of the proxy.
//!
//! - **command**: client command syntax and argument helpers
//! - **dispatch**: verb to handler table
//! - **handlers**: one function per client command
//! - **pending**: coalesced camera and scale changes
//! - **frame**: captured images and their delivery queue
//! - **session**: all state for one proxy run
//! - **event_loop**: poll-driven scheduling of the above
//!
//! # Data flow
//!
//! ```text
//! client stdin ──> ReadCursor ──> CommandTable ──> handler
//!                                                   ├──> PendingTransform
//!                                                   └──> EngineLink::send
//! EngineLink::capture ──> Frame ──> Outbox ──> client stdout
//! ```

pub mod command;
pub mod dispatch;
pub mod event_loop;
pub mod frame;
pub mod handlers;
pub mod pending;
pub mod session;

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::core::buffer::BufferError;
use crate::core::child::SupervisorError;

/// Reasons a session ends.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Client closed the connection")]
    ClientDisconnected,

    #[error("Engine closed its output")]
    EngineDisconnected,

    #[error("Client stream failed: {0}")]
    Client(#[source] BufferError),

    #[error("Engine stream failed: {0}")]
    Engine(#[source] BufferError),

    #[error("poll failed: {0}")]
    Poll(Errno),

    #[error("Failed to write to client: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Setup(#[from] SupervisorError),
}
