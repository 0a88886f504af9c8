//! Low-level plumbing between the proxy and the render engine.
//!
//! - **buffer**: read cursor over non-blocking descriptors
//! - **child**: engine process spawn and process-group shutdown
//! - **engine**: native command exchange (write a line, expect a prompt)
//!
//! # Architecture
//!
//! ```text
//! EngineProcess (pid, process group)
//! └── EnginePipes
//!     ├── stdin  ──> EngineLink::send / capture
//!     ├── stdout ──> ReadCursor ──> EngineLink::expect
//!     └── stderr ──> ReadCursor (logged, discarded)
//! ```

pub mod buffer;
pub mod child;
pub mod engine;
