//! Inline terminal renderer using crossterm
//!
//! Draws the virtual terminal into a band of lines starting at the line the
//! program was started on, below the user's prompt. Only dirty rows are
//! redrawn. Between updates the real cursor is parked where the virtual
//! cursor is, so all movement is relative to the band.

use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveDown, MoveToColumn, MoveUp, Show},
    queue,
    style::{
        Attribute, Color as CrosstermColor, Print, ResetColor, SetAttribute, SetBackgroundColor,
        SetForegroundColor,
    },
    terminal::{Clear, ClearType},
};

use crate::core::term::{AttrFlags, CellAttrs, Color, Cursor, Frame, Message, Observer, Row};

/// Renders notifications from a virtual terminal to `W`
pub struct InlineRenderer<W: Write> {
    out: W,
    bell: bool,
    /// Band row the real cursor is on; `None` until the first draw
    parked: Option<u16>,
    /// Real cursor column, when known
    parked_col: Option<u16>,
    /// Band height at the last draw
    rows: u16,
}

impl<W: Write> InlineRenderer<W> {
    pub fn new(out: W, bell: bool) -> Self {
        Self {
            out,
            bell,
            parked: None,
            parked_col: None,
            rows: 0,
        }
    }

    pub fn writer(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Leave the band: move below it and restore default attributes
    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(row) = self.parked.take() {
            let below = self.rows.saturating_sub(1).saturating_sub(row);
            if below > 0 {
                queue!(self.out, MoveDown(below))?;
            }
            queue!(self.out, Print("\r\n"))?;
        }
        queue!(
            self.out,
            ResetColor,
            SetAttribute(Attribute::Reset),
            Show
        )?;
        self.out.flush()
    }

    fn draw(&mut self, frame: &mut Frame<'_>) -> io::Result<()> {
        let view = frame.view();
        let rows = view.rows();

        queue!(self.out, Print('\r'))?;
        if let Some(row) = self.parked {
            if row > 0 {
                queue!(self.out, MoveUp(row))?;
            }
        }

        for (index, row) in view.lines().enumerate() {
            if row.dirty {
                queue!(self.out, Clear(ClearType::UntilNewLine))?;
                self.draw_row(row)?;
            }
            if index + 1 < rows as usize {
                queue!(self.out, Print("\r\n"))?;
            }
        }

        let cursor = view.cursor();
        self.rows = rows;
        self.parked = Some(rows.saturating_sub(1));
        self.parked_col = None;
        self.park(cursor)?;

        frame.mark_clean();
        Ok(())
    }

    fn draw_row(&mut self, row: &Row) -> io::Result<()> {
        let mut current_attrs = CellAttrs::default();
        let mut line_buffer = String::with_capacity(row.cells.len());

        for cell in row.cells.iter().filter(|cell| !cell.is_continuation()) {
            if cell.attrs != current_attrs && !line_buffer.is_empty() {
                apply_attrs(&mut self.out, &current_attrs)?;
                queue!(self.out, Print(&line_buffer))?;
                line_buffer.clear();
            }
            current_attrs = cell.attrs;
            line_buffer.push(cell.ch);
        }

        if !line_buffer.is_empty() {
            apply_attrs(&mut self.out, &current_attrs)?;
            queue!(self.out, Print(&line_buffer))?;
        }
        queue!(self.out, ResetColor, SetAttribute(Attribute::Reset))?;
        Ok(())
    }

    /// Move the real cursor from its parked row to the virtual cursor
    fn park(&mut self, cursor: Cursor) -> io::Result<()> {
        let Some(from) = self.parked else {
            return Ok(());
        };
        if from == cursor.row && self.parked_col == Some(cursor.col) {
            return Ok(());
        }
        if cursor.row < from {
            queue!(self.out, MoveUp(from - cursor.row))?;
        } else if cursor.row > from {
            queue!(self.out, MoveDown(cursor.row - from))?;
        }
        queue!(self.out, MoveToColumn(cursor.col))?;
        self.parked = Some(cursor.row);
        self.parked_col = Some(cursor.col);
        Ok(())
    }

    fn handle(&mut self, message: Message<'_>, frame: &mut Frame<'_>) -> io::Result<()> {
        match message {
            Message::ScreenUpdate => self.draw(frame)?,
            Message::CursorMoved(cursor) => self.park(cursor)?,
            Message::Bell => {
                if self.bell {
                    queue!(self.out, Print('\x07'))?;
                }
            }
            Message::CursorVisibilityChanged(true) => queue!(self.out, Show)?,
            Message::CursorVisibilityChanged(false) => queue!(self.out, Hide)?,
            // Answerbacks go to the PTY, not the screen
            Message::Answerback(_) => return Ok(()),
        }
        self.out.flush()
    }
}

impl<W: Write> Observer for InlineRenderer<W> {
    fn notify(&mut self, message: Message<'_>, frame: &mut Frame<'_>) {
        if let Err(e) = self.handle(message, frame) {
            tracing::warn!("Render failed: {}", e);
        }
    }
}

/// Apply cell attributes
fn apply_attrs<W: Write>(out: &mut W, attrs: &CellAttrs) -> io::Result<()> {
    // Reset first
    queue!(out, SetAttribute(Attribute::Reset))?;

    let flags = [
        (AttrFlags::BOLD, Attribute::Bold),
        (AttrFlags::DIM, Attribute::Dim),
        (AttrFlags::ITALIC, Attribute::Italic),
        (AttrFlags::UNDERLINE, Attribute::Underlined),
        (AttrFlags::BLINK, Attribute::SlowBlink),
        (AttrFlags::INVERSE, Attribute::Reverse),
        (AttrFlags::HIDDEN, Attribute::Hidden),
        (AttrFlags::STRIKETHROUGH, Attribute::CrossedOut),
    ];
    for (flag, attribute) in flags {
        if attrs.flags.contains(flag) {
            queue!(out, SetAttribute(attribute))?;
        }
    }

    if let Some(fg) = crossterm_color(attrs.fg) {
        queue!(out, SetForegroundColor(fg))?;
    }
    if let Some(bg) = crossterm_color(attrs.bg) {
        queue!(out, SetBackgroundColor(bg))?;
    }
    Ok(())
}

fn crossterm_color(color: Color) -> Option<CrosstermColor> {
    match color {
        Color::Default => None,
        Color::Indexed(n) => Some(CrosstermColor::AnsiValue(n)),
        Color::Rgb(r, g, b) => Some(CrosstermColor::Rgb { r, g, b }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::term::VirtualTerminal;

    fn open(rows: u16, cols: u16, bell: bool) -> VirtualTerminal<InlineRenderer<Vec<u8>>> {
        VirtualTerminal::open(rows, cols, InlineRenderer::new(Vec::new(), bell)).unwrap()
    }

    fn take_output(vt: &mut VirtualTerminal<InlineRenderer<Vec<u8>>>) -> String {
        let out = std::mem::take(&mut vt.observer_mut().out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_first_draw_covers_every_row_and_parks() {
        let mut vt = open(3, 5, true);
        vt.feed(b"hi");
        let out = take_output(&mut vt);

        assert!(out.starts_with('\r'));
        assert!(out.contains("hi   "));
        assert_eq!(out.matches("\r\n").count(), 2);
        // Nothing was parked before the first draw
        assert!(!out.contains("\x1b[0A"));
        // Back up from the last row to the cursor at row 0, column 2
        assert!(out.ends_with("\x1b[2A\x1b[3G"));
        assert!(!vt.screen().is_dirty());
    }

    #[test]
    fn test_only_dirty_rows_are_redrawn() {
        let mut vt = open(3, 5, true);
        vt.feed(b"top");
        take_output(&mut vt);

        vt.feed(b"\x1b[3;1Hend");
        let out = take_output(&mut vt);
        assert!(out.contains("end"));
        assert!(!out.contains("top"));
        // Parked at row 0, so the redraw starts by moving up zero rows: no move
        assert!(!out.contains('A'));
    }

    #[test]
    fn test_attributes_are_applied_per_run() {
        let mut vt = open(1, 6, true);
        vt.feed(b"a\x1b[1;31mb\x1b[0mc");
        let out = take_output(&mut vt);
        assert!(out.contains("a"));
        assert!(out.contains("\x1b[1m"));
        assert!(out.contains("\x1b[38;5;1mb"));
    }

    #[test]
    fn test_bell_and_visibility() {
        let mut vt = open(1, 4, true);
        vt.feed(b"x");
        take_output(&mut vt);

        vt.feed(b"\x07\x1b[?25l");
        let out = take_output(&mut vt);
        assert!(out.contains('\x07'));
        assert!(out.contains("\x1b[?25l"));

        let mut quiet = open(1, 4, false);
        quiet.feed(b"\x07");
        assert!(!take_output(&mut quiet).contains('\x07'));
    }

    #[test]
    fn test_cursor_move_without_redraw() {
        let mut vt = open(4, 10, true);
        vt.feed(b"x");
        take_output(&mut vt);

        vt.feed(b"\x1b[3;5H");
        assert_eq!(take_output(&mut vt), "\x1b[2B\x1b[5G");
    }

    #[test]
    fn test_finish_moves_below_band() {
        let mut vt = open(3, 4, true);
        vt.feed(b"x");
        let mut renderer = vt.close();
        renderer.out.clear();
        renderer.finish().unwrap();
        let out = String::from_utf8(renderer.into_inner()).unwrap();
        assert!(out.starts_with("\x1b[2B\r\n"));
        assert!(out.ends_with("\x1b[?25h"));
    }
}
