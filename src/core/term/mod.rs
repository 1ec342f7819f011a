//! Virtual terminal emulation

pub mod charset;
pub mod parser;
pub mod state;
pub mod vt;

pub use state::{AttrFlags, Cell, CellAttrs, Color, CursorShape, Row};
pub use vt::{Cursor, Frame, Message, Observer, ScreenView, TermError, VirtualTerminal};
