//! Core terminal emulation components.
//!
//! This module contains the low-level terminal emulation logic:
//!
//! - **pty**: pseudo terminal wrapper that spawns the child process
//! - **term**: VT100/ANSI terminal engine (parser, screen model, notifications)
//! - **session**: PTY + terminal engine, pumped from one thread
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── Pty (child process I/O)
//! ├── reader thread ──channel──▶ pump
//! └── VirtualTerminal
//!     ├── VtParser (escape sequences, UTF-8)
//!     ├── TerminalState (cell grid, cursor, modes)
//!     └── Observer (notifications)
//! ```

pub mod pty;
pub mod session;
pub mod term;
