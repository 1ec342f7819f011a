//! User interface rendering and terminal handling.
//!
//! - **renderer**: inline renderer drawing the virtual terminal below the prompt
//! - **terminal**: raw mode and size of the controlling terminal

pub mod renderer;
pub mod terminal;

pub use renderer::InlineRenderer;
pub use terminal::RawModeGuard;
