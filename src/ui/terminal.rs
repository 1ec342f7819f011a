//! Controlling terminal setup

use std::io;

use crossterm::terminal;
use crossterm::tty::IsTty;

/// Keeps the controlling terminal in raw mode until dropped
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        tracing::debug!("Raw mode enabled");
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            tracing::error!("Failed to restore terminal mode: {}", e);
        }
    }
}

/// Get terminal size as (rows, cols)
pub fn size() -> io::Result<(u16, u16)> {
    let (cols, rows) = terminal::size()?;
    Ok((rows, cols))
}

/// Whether stdin is attached to a terminal
pub fn stdin_is_tty() -> bool {
    io::stdin().is_tty()
}
