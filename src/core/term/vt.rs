//! Virtual terminal engine
//!
//! [`VirtualTerminal`] owns the screen model and the parser. Bytes go in
//! through [`VirtualTerminal::feed`]; changes come out as [`Message`]s
//! delivered synchronously to the [`Observer`] the terminal was opened with.
//!
//! Delivery order within one `feed` call:
//!
//! - `Bell`, `Answerback` and `CursorVisibilityChanged` are delivered inline,
//!   at the byte that caused them.
//! - After the last byte, one `ScreenUpdate` if any row is dirty, then one
//!   `CursorMoved` if the cursor ended up somewhere other than where the call
//!   started.
//!
//! Dirty flags persist until [`Frame::mark_clean`] or
//! [`VirtualTerminal::mark_clean`], so an observer that skips a redraw sees
//! the same rows again on the next `ScreenUpdate`.

use std::collections::TryReserveError;

use thiserror::Error;

use super::parser::{Signal, VtParser};
use super::state::{Cell, CursorShape, Row, TerminalState};

#[derive(Debug, Error)]
pub enum TermError {
    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },

    #[error("failed to allocate screen: {0}")]
    Allocation(#[from] TryReserveError),
}

/// Cursor snapshot (0-indexed)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub row: u16,
    pub col: u16,
    pub visible: bool,
}

/// Notification delivered to an [`Observer`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message<'a> {
    Bell,
    /// One or more rows are dirty
    ScreenUpdate,
    CursorMoved(Cursor),
    /// Bytes to send back to whatever produced the input
    Answerback(&'a [u8]),
    CursorVisibilityChanged(bool),
}

/// Receiver of terminal notifications.
///
/// Implemented for any `FnMut(Message<'_>, &mut Frame<'_>)`.
pub trait Observer {
    fn notify(&mut self, message: Message<'_>, frame: &mut Frame<'_>);
}

impl<F> Observer for F
where
    F: FnMut(Message<'_>, &mut Frame<'_>),
{
    fn notify(&mut self, message: Message<'_>, frame: &mut Frame<'_>) {
        self(message, frame)
    }
}

/// What an observer may touch while handling a message
pub struct Frame<'a> {
    state: &'a mut TerminalState,
}

impl Frame<'_> {
    pub fn view(&self) -> ScreenView<'_> {
        ScreenView { state: self.state }
    }

    /// Acknowledge the current contents: clears every dirty flag
    pub fn mark_clean(&mut self) {
        self.state.active_screen_mut().clear_dirty();
    }
}

/// Read-only view of the active screen
#[derive(Clone, Copy)]
pub struct ScreenView<'a> {
    state: &'a TerminalState,
}

impl<'a> ScreenView<'a> {
    pub fn rows(&self) -> u16 {
        self.state.rows
    }

    pub fn cols(&self) -> u16 {
        self.state.cols
    }

    pub fn cursor(&self) -> Cursor {
        cursor_of(self.state)
    }

    pub fn cursor_shape(&self) -> CursorShape {
        self.state.active_cursor().shape
    }

    pub fn row(&self, index: usize) -> Option<&'a Row> {
        self.state.active_screen().rows.get(index)
    }

    pub fn lines(&self) -> impl Iterator<Item = &'a Row> + 'a {
        self.state.active_screen().rows.iter()
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&'a Cell> {
        self.row(row).and_then(|r| r.cells.get(col))
    }

    /// Indices of the rows changed since the last `mark_clean`
    pub fn dirty_rows(&self) -> impl Iterator<Item = usize> + 'a {
        self.state
            .active_screen()
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.dirty)
            .map(|(index, _)| index)
    }

    pub fn is_dirty(&self) -> bool {
        self.state.active_screen().is_dirty()
    }

    pub fn row_text(&self, index: usize) -> Option<String> {
        self.row(index).map(Row::text)
    }

    pub fn title(&self) -> &'a str {
        &self.state.title
    }

    pub fn application_cursor(&self) -> bool {
        self.state.modes.application_cursor
    }

    pub fn bracketed_paste(&self) -> bool {
        self.state.modes.bracketed_paste
    }

    pub fn using_alternate(&self) -> bool {
        self.state.using_alternate
    }
}

fn cursor_of(state: &TerminalState) -> Cursor {
    let cursor = state.active_cursor();
    Cursor {
        row: cursor.row,
        col: cursor.col,
        visible: state.modes.cursor_visible,
    }
}

fn check_size(rows: u16, cols: u16) -> Result<(), TermError> {
    if rows == 0 || cols == 0 {
        return Err(TermError::InvalidSize { rows, cols });
    }
    Ok(())
}

/// A virtual terminal instance
pub struct VirtualTerminal<O: Observer> {
    state: TerminalState,
    parser: VtParser,
    observer: O,
}

impl<O: Observer> VirtualTerminal<O> {
    /// Create a blank terminal of `rows` x `cols`
    pub fn open(rows: u16, cols: u16, observer: O) -> Result<Self, TermError> {
        check_size(rows, cols)?;
        let state = TerminalState::new(rows, cols)?;
        tracing::debug!("Opened virtual terminal {}x{}", rows, cols);
        Ok(Self {
            state,
            parser: VtParser::new(),
            observer,
        })
    }

    /// Process output bytes. Chunks may split sequences anywhere.
    pub fn feed(&mut self, bytes: &[u8]) {
        let start = cursor_of(&self.state);
        let mut visible = start.visible;

        for &byte in bytes {
            match self.parser.feed(byte, &mut self.state) {
                Some(Signal::Bell) => self.dispatch(Message::Bell),
                Some(Signal::Respond(response)) => {
                    let answer = response.to_bytes();
                    self.dispatch(Message::Answerback(&answer));
                }
                None => {}
            }

            let now = self.state.modes.cursor_visible;
            if now != visible {
                visible = now;
                self.dispatch(Message::CursorVisibilityChanged(now));
            }
        }

        self.finish(start);
    }

    /// Resize the grid. On error the terminal is left as it was.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), TermError> {
        check_size(rows, cols)?;
        let start = cursor_of(&self.state);
        self.state.resize(rows, cols)?;
        tracing::debug!("Resized virtual terminal to {}x{}", rows, cols);
        self.finish(start);
        Ok(())
    }

    pub fn screen(&self) -> ScreenView<'_> {
        ScreenView { state: &self.state }
    }

    pub fn mark_clean(&mut self) {
        self.state.active_screen_mut().clear_dirty();
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    /// Destroy the terminal, handing back the observer
    pub fn close(self) -> O {
        self.observer
    }

    fn dispatch(&mut self, message: Message<'_>) {
        let mut frame = Frame {
            state: &mut self.state,
        };
        self.observer.notify(message, &mut frame);
    }

    fn finish(&mut self, start: Cursor) {
        if self.state.active_screen().is_dirty() {
            self.dispatch(Message::ScreenUpdate);
        }
        let end = cursor_of(&self.state);
        if (end.row, end.col) != (start.row, start.col) {
            self.dispatch(Message::CursorMoved(end));
        }
    }
}
