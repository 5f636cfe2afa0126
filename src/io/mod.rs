//! I/O layer - process management and frame transport
//!
//! Protocol-agnostic building blocks used by the MCP client:
//!
//! - **Transport**: newline-delimited frame reader/writer over byte streams
//! - **Process**: child process lifecycle with stderr capture

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, ProcessError, ProcessManager, ProcessState, StderrLine, StderrLog,
    StderrMonitor, StopMode,
};
pub use transport::{FrameReader, FrameWriter, ReadOutcome, StdioTransport, TransportError};
