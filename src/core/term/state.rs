//! Terminal state management
//!
//! This module defines the terminal's screen buffers, cursor state, and attributes.
//! All grids are allocated up front (`TerminalState::new` and `resize`); editing
//! operations never allocate, they rotate and clear rows in place.

use std::collections::TryReserveError;

use bitflags::bitflags;
use unicode_width::UnicodeWidthChar;

use super::charset::{Charset, CharsetSlot, CharsetState};

/// Tab stop interval used at open, after resize and after RIS
const TAB_WIDTH: usize = 8;

/// Terminal state holding all screen data
pub struct TerminalState {
    pub rows: u16,
    pub cols: u16,
    pub primary_screen: ScreenBuffer,
    pub alternate_screen: ScreenBuffer,
    pub using_alternate: bool,
    pub primary_cursor: CursorState,
    pub alternate_cursor: CursorState,
    pub current_attrs: CellAttrs,
    pub modes: TerminalModes,
    pub charsets: CharsetState,
    pub tab_stops: Vec<bool>,
    pub title: String,
    /// Scroll region (top, bottom) - 0-indexed, inclusive
    pub scroll_region: (u16, u16),
    /// Last printed character, repeated by REP
    pub last_char: Option<char>,
}

/// Region cleared by ED / EL
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EraseScope {
    ToEndOfLine,
    ToStartOfLine,
    WholeLine,
    ToEndOfScreen,
    ToStartOfScreen,
    WholeScreen,
}

/// Direction of content movement inside the scroll region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrollDirection {
    /// Content moves up, blank lines appear at the bottom
    Up,
    /// Content moves down, blank lines appear at the top
    Down,
}

/// A single change to the attribute context
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttrChange {
    Reset,
    Set(AttrFlags),
    Clear(AttrFlags),
    Foreground(Color),
    Background(Color),
}

impl TerminalState {
    pub fn new(rows: u16, cols: u16) -> Result<Self, TryReserveError> {
        Ok(Self {
            rows,
            cols,
            primary_screen: ScreenBuffer::new(rows, cols)?,
            alternate_screen: ScreenBuffer::new(rows, cols)?,
            using_alternate: false,
            primary_cursor: CursorState::default(),
            alternate_cursor: CursorState::default(),
            current_attrs: CellAttrs::default(),
            modes: TerminalModes::default(),
            charsets: CharsetState::default(),
            tab_stops: default_tab_stops(cols)?,
            title: String::new(),
            scroll_region: (0, rows.saturating_sub(1)),
            last_char: None,
        })
    }

    pub fn active_screen(&self) -> &ScreenBuffer {
        if self.using_alternate {
            &self.alternate_screen
        } else {
            &self.primary_screen
        }
    }

    pub fn active_screen_mut(&mut self) -> &mut ScreenBuffer {
        if self.using_alternate {
            &mut self.alternate_screen
        } else {
            &mut self.primary_screen
        }
    }

    pub fn active_cursor(&self) -> &CursorState {
        if self.using_alternate {
            &self.alternate_cursor
        } else {
            &self.primary_cursor
        }
    }

    pub fn active_cursor_mut(&mut self) -> &mut CursorState {
        if self.using_alternate {
            &mut self.alternate_cursor
        } else {
            &mut self.primary_cursor
        }
    }

    /// Resize the terminal.
    ///
    /// New grids are built before anything is replaced, so a failed allocation
    /// leaves the state untouched.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), TryReserveError> {
        let primary = self.primary_screen.resized(rows, cols)?;
        let alternate = self.alternate_screen.resized(rows, cols)?;
        let mut tab_stops = default_tab_stops(cols)?;
        let keep = tab_stops.len().min(self.tab_stops.len());
        tab_stops[..keep].copy_from_slice(&self.tab_stops[..keep]);

        self.rows = rows;
        self.cols = cols;
        self.primary_screen = primary;
        self.alternate_screen = alternate;
        self.tab_stops = tab_stops;
        self.scroll_region = (0, rows.saturating_sub(1));

        let max_row = rows.saturating_sub(1);
        let max_col = cols.saturating_sub(1);
        for cursor in [&mut self.primary_cursor, &mut self.alternate_cursor] {
            cursor.clamp(max_row, max_col);
        }
        Ok(())
    }

    /// Put a character at the current cursor position
    pub fn put_char(&mut self, ch: char) {
        let ch = self.charsets.translate(ch);
        let width = match ch.width() {
            Some(w) if w > 0 => w.min(2) as u16,
            // Zero-width and combining code points have no cell of their own
            _ => return,
        };
        if width > self.cols {
            return;
        }

        let (mut row, mut col) = {
            let cursor = self.active_cursor();
            (cursor.row, cursor.col)
        };

        // A wide character that does not fit goes to the next line
        if col as usize + width as usize > self.cols as usize {
            if self.modes.auto_wrap {
                self.active_screen_mut().rows[row as usize].wrapped = true;
                self.active_cursor_mut().col = 0;
                self.linefeed();
                row = self.active_cursor().row;
                col = 0;
            } else {
                col = self.cols - width;
            }
        }

        if self.modes.insert_mode {
            self.shift_right(row as usize, col as usize, width as usize);
        }

        let (r, c) = (row as usize, col as usize);
        self.handle_wide_char_overwrite(r, c);
        if width == 2 {
            self.handle_wide_char_overwrite(r, c + 1);
        }

        let attrs = self.current_attrs;
        let screen = self.active_screen_mut();
        screen.rows[r].cells[c] = Cell {
            ch,
            width: width as u8,
            attrs,
        };
        if width == 2 {
            screen.rows[r].cells[c + 1] = Cell::continuation(attrs);
        }
        screen.mark_dirty(r);
        self.last_char = Some(ch);

        let next = c + width as usize;
        if next < self.cols as usize {
            self.active_cursor_mut().col = next as u16;
        } else if self.modes.auto_wrap {
            self.active_screen_mut().rows[r].wrapped = true;
            self.active_cursor_mut().col = 0;
            self.linefeed();
        } else {
            self.active_cursor_mut().col = self.cols - 1;
        }
    }

    fn handle_wide_char_overwrite(&mut self, row: usize, col: usize) {
        let blank = Cell::blank(self.current_attrs.erase_attrs());
        let screen = self.active_screen_mut();
        let cells = &mut screen.rows[row].cells;
        if col >= cells.len() {
            return;
        }

        // Overwriting the right half of a wide char
        if col > 0 && cells[col].is_continuation() {
            cells[col - 1] = blank;
        }

        // Overwriting the left half of a wide char
        if cells[col].width == 2 && col + 1 < cells.len() {
            cells[col + 1] = blank;
        }
    }

    /// Open `n` blank cells at `col`, pushing the rest of the line right
    fn shift_right(&mut self, row: usize, col: usize, n: usize) {
        let attrs = self.current_attrs.erase_attrs();
        let screen = self.active_screen_mut();
        let line = &mut screen.rows[row];
        line.split_wide_at(col, attrs);
        let cells = &mut line.cells[col..];
        let n = n.min(cells.len());
        cells.rotate_right(n);
        cells[..n].fill(Cell::blank(attrs));
        line.repair_edges(attrs);
        screen.mark_dirty(row);
    }

    /// Carriage return - move cursor to column 0
    pub fn carriage_return(&mut self) {
        self.active_cursor_mut().col = 0;
    }

    /// Line feed - move cursor down, scroll if needed
    pub fn linefeed(&mut self) {
        let cursor_row = self.active_cursor().row;
        let scroll_bottom = self.scroll_region.1;

        if cursor_row == scroll_bottom {
            self.scroll(ScrollDirection::Up, 1);
        } else if cursor_row < self.rows.saturating_sub(1) {
            self.active_cursor_mut().row += 1;
        }
    }

    /// Backspace - move cursor left
    pub fn backspace(&mut self) {
        let cursor = self.active_cursor_mut();
        cursor.col = cursor.col.saturating_sub(1);
    }

    /// Horizontal tab, `n` stops forward
    pub fn horizontal_tab(&mut self, n: u16) {
        let last = self.cols.saturating_sub(1);
        let mut col = self.active_cursor().col;
        for _ in 0..n {
            if col >= last {
                break;
            }
            col += 1;
            while col < last && !self.tab_stops[col as usize] {
                col += 1;
            }
        }
        self.active_cursor_mut().col = col;
    }

    /// Cursor backward tabulation, `n` stops back
    pub fn back_tab(&mut self, n: u16) {
        let mut col = self.active_cursor().col;
        for _ in 0..n {
            if col == 0 {
                break;
            }
            col -= 1;
            while col > 0 && !self.tab_stops[col as usize] {
                col -= 1;
            }
        }
        self.active_cursor_mut().col = col;
    }

    /// HTS
    pub fn set_tab_stop(&mut self) {
        let col = self.active_cursor().col as usize;
        if let Some(stop) = self.tab_stops.get_mut(col) {
            *stop = true;
        }
    }

    /// TBC: 0 clears the stop at the cursor, 3 clears all stops
    pub fn clear_tab_stop(&mut self, mode: u16) {
        match mode {
            0 => {
                let col = self.active_cursor().col as usize;
                if let Some(stop) = self.tab_stops.get_mut(col) {
                    *stop = false;
                }
            }
            3 => self.tab_stops.fill(false),
            _ => {}
        }
    }

    /// Scroll the scroll region by `n` lines
    pub fn scroll(&mut self, direction: ScrollDirection, n: u16) {
        let (top, bottom) = self.scroll_region;
        self.scroll_rows(top as usize, bottom as usize, direction, n as usize);
    }

    /// Rotate rows `top..=bottom` and blank the lines that came in
    fn scroll_rows(&mut self, top: usize, bottom: usize, direction: ScrollDirection, n: usize) {
        let blank = self.current_attrs.erase_attrs();
        let screen = self.active_screen_mut();
        if top > bottom || bottom >= screen.rows.len() {
            return;
        }
        let region = &mut screen.rows[top..=bottom];
        let n = n.min(region.len());
        if n == 0 {
            return;
        }

        match direction {
            ScrollDirection::Up => {
                region.rotate_left(n);
                let len = region.len();
                for row in &mut region[len - n..] {
                    row.clear(blank);
                }
            }
            ScrollDirection::Down => {
                region.rotate_right(n);
                for row in &mut region[..n] {
                    row.clear(blank);
                }
            }
        }
        screen.mark_range_dirty(top, bottom);
    }

    /// Cursor up
    pub fn cursor_up(&mut self, n: u16) {
        let top = self.scroll_region.0;
        let cursor = self.active_cursor_mut();
        let limit = if cursor.row >= top { top } else { 0 };
        cursor.row = cursor.row.saturating_sub(n).max(limit);
    }

    /// Cursor down
    pub fn cursor_down(&mut self, n: u16) {
        let bottom = self.scroll_region.1;
        let last = self.rows.saturating_sub(1);
        let cursor = self.active_cursor_mut();
        let limit = if cursor.row <= bottom { bottom } else { last };
        cursor.row = cursor.row.saturating_add(n).min(limit);
    }

    /// Cursor forward (right)
    pub fn cursor_forward(&mut self, n: u16) {
        let cols = self.cols;
        let cursor = self.active_cursor_mut();
        cursor.col = cursor.col.saturating_add(n).min(cols.saturating_sub(1));
    }

    /// Cursor backward (left)
    pub fn cursor_backward(&mut self, n: u16) {
        let cursor = self.active_cursor_mut();
        cursor.col = cursor.col.saturating_sub(n);
    }

    /// Move the cursor to a 0-indexed position, clamped to the grid
    pub fn move_cursor(&mut self, row: u16, col: u16) {
        let max_row = self.rows.saturating_sub(1);
        let max_col = self.cols.saturating_sub(1);
        let cursor = self.active_cursor_mut();
        cursor.row = row.min(max_row);
        cursor.col = col.min(max_col);
    }

    /// Set cursor position (1-indexed parameters, relative to the margins in origin mode)
    pub fn cursor_position(&mut self, row: u16, col: u16) {
        let row = row.saturating_sub(1);
        let col = col.saturating_sub(1);
        if self.modes.origin_mode {
            let (top, bottom) = self.scroll_region;
            self.move_cursor(top.saturating_add(row).min(bottom), col);
        } else {
            self.move_cursor(row, col);
        }
    }

    /// VPA (1-indexed)
    pub fn set_row(&mut self, row: u16) {
        let col = self.active_cursor().col;
        let row = row.saturating_sub(1);
        if self.modes.origin_mode {
            let (top, bottom) = self.scroll_region;
            self.move_cursor(top.saturating_add(row).min(bottom), col);
        } else {
            self.move_cursor(row, col);
        }
    }

    /// CHA (1-indexed)
    pub fn set_col(&mut self, col: u16) {
        let row = self.active_cursor().row;
        self.move_cursor(row, col.saturating_sub(1));
    }

    /// Erase part of the line or screen relative to the cursor
    pub fn erase(&mut self, scope: EraseScope) {
        let (cursor_row, cursor_col) = {
            let cursor = self.active_cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let blank = self.current_attrs.erase_attrs();
        let screen = self.active_screen_mut();
        let last_row = screen.rows.len().saturating_sub(1);

        let (first, last) = match scope {
            EraseScope::ToEndOfLine => {
                screen.rows[cursor_row].clear_range(cursor_col, usize::MAX, blank);
                (cursor_row, cursor_row)
            }
            EraseScope::ToStartOfLine => {
                screen.rows[cursor_row].clear_range(0, cursor_col + 1, blank);
                (cursor_row, cursor_row)
            }
            EraseScope::WholeLine => {
                screen.rows[cursor_row].clear(blank);
                (cursor_row, cursor_row)
            }
            EraseScope::ToEndOfScreen => {
                screen.rows[cursor_row].clear_range(cursor_col, usize::MAX, blank);
                for row in &mut screen.rows[cursor_row + 1..] {
                    row.clear(blank);
                }
                (cursor_row, last_row)
            }
            EraseScope::ToStartOfScreen => {
                for row in &mut screen.rows[..cursor_row] {
                    row.clear(blank);
                }
                screen.rows[cursor_row].clear_range(0, cursor_col + 1, blank);
                (0, cursor_row)
            }
            EraseScope::WholeScreen => {
                for row in &mut screen.rows {
                    row.clear(blank);
                }
                (0, last_row)
            }
        };
        screen.mark_range_dirty(first, last);
    }

    /// Insert lines at cursor position
    pub fn insert_lines(&mut self, n: u16) {
        let cursor_row = self.active_cursor().row;
        let (top, bottom) = self.scroll_region;
        if cursor_row < top || cursor_row > bottom {
            return;
        }
        self.scroll_rows(cursor_row as usize, bottom as usize, ScrollDirection::Down, n as usize);
        self.carriage_return();
    }

    /// Delete lines at cursor position
    pub fn delete_lines(&mut self, n: u16) {
        let cursor_row = self.active_cursor().row;
        let (top, bottom) = self.scroll_region;
        if cursor_row < top || cursor_row > bottom {
            return;
        }
        self.scroll_rows(cursor_row as usize, bottom as usize, ScrollDirection::Up, n as usize);
        self.carriage_return();
    }

    /// ICH
    pub fn insert_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.active_cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        self.shift_right(row, col, n as usize);
    }

    /// DCH
    pub fn delete_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.active_cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let attrs = self.current_attrs.erase_attrs();
        let screen = self.active_screen_mut();
        let line = &mut screen.rows[row];
        line.split_wide_at(col, attrs);
        line.split_wide_at(col.saturating_add(n as usize), attrs);
        let cells = &mut line.cells[col..];
        let n = (n as usize).min(cells.len());
        cells.rotate_left(n);
        let len = cells.len();
        cells[len - n..].fill(Cell::blank(attrs));
        line.repair_edges(attrs);
        screen.mark_dirty(row);
    }

    /// ECH
    pub fn erase_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.active_cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let blank = self.current_attrs.erase_attrs();
        let screen = self.active_screen_mut();
        screen.rows[row].clear_range(col, col.saturating_add(n as usize), blank);
        screen.mark_dirty(row);
    }

    /// REP - repeat the last printed character
    pub fn repeat_last(&mut self, n: u16) {
        if let Some(ch) = self.last_char {
            for _ in 0..n.min(self.cols.saturating_mul(self.rows)) {
                self.put_char(ch);
            }
        }
    }

    /// Set scroll region (1-indexed, inclusive)
    pub fn set_scroll_region(&mut self, top: u16, bottom: u16) {
        let rows = self.rows;
        let top = top.saturating_sub(1).min(rows.saturating_sub(1));
        let bottom = bottom.saturating_sub(1).min(rows.saturating_sub(1));
        if top < bottom {
            self.scroll_region = (top, bottom);
            self.cursor_position(1, 1);
        }
    }

    /// Apply one SGR change to the attribute context
    pub fn set_attribute(&mut self, change: AttrChange) {
        let attrs = &mut self.current_attrs;
        match change {
            AttrChange::Reset => attrs.reset(),
            AttrChange::Set(flags) => attrs.flags |= flags,
            AttrChange::Clear(flags) => attrs.flags &= !flags,
            AttrChange::Foreground(color) => attrs.fg = color,
            AttrChange::Background(color) => attrs.bg = color,
        }
    }

    /// Save cursor position
    pub fn save_cursor(&mut self) {
        let (col, row) = {
            let cursor = self.active_cursor();
            (cursor.col, cursor.row)
        };
        let saved = SavedCursor {
            col,
            row,
            attrs: self.current_attrs,
            charsets: self.charsets,
            origin_mode: self.modes.origin_mode,
        };
        self.active_cursor_mut().saved = Some(saved);
    }

    /// Restore cursor position
    pub fn restore_cursor(&mut self) {
        let saved = self.active_cursor().saved.clone();
        if let Some(saved) = saved {
            self.move_cursor(saved.row, saved.col);
            self.current_attrs = saved.attrs;
            self.charsets = saved.charsets;
            self.modes.origin_mode = saved.origin_mode;
        }
    }

    pub fn designate_charset(&mut self, slot: CharsetSlot, charset: Charset) {
        self.charsets.designate(slot, charset);
    }

    pub fn shift_charset(&mut self, slot: CharsetSlot) {
        self.charsets.shift(slot);
    }

    /// Set private mode
    pub fn set_private_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            1 => self.modes.application_cursor = enable,
            6 => {
                self.modes.origin_mode = enable;
                self.cursor_position(1, 1);
            }
            7 => self.modes.auto_wrap = enable,
            25 => self.modes.cursor_visible = enable,
            47 | 1047 => {
                if enable {
                    self.enter_alternate_screen();
                } else {
                    self.leave_alternate_screen();
                }
            }
            1048 => {
                if enable {
                    self.save_cursor();
                } else {
                    self.restore_cursor();
                }
            }
            1049 => {
                if enable {
                    self.save_cursor();
                    self.enter_alternate_screen();
                    self.alternate_cursor = CursorState::default();
                } else {
                    self.leave_alternate_screen();
                    self.restore_cursor();
                }
            }
            2004 => self.modes.bracketed_paste = enable,
            _ => tracing::debug!("Ignoring private mode {}", mode),
        }
    }

    /// Set ANSI mode (SM / RM)
    pub fn set_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            4 => self.modes.insert_mode = enable,
            20 => self.modes.linefeed_newline = enable,
            _ => tracing::debug!("Ignoring mode {}", mode),
        }
    }

    fn enter_alternate_screen(&mut self) {
        if self.using_alternate {
            return;
        }
        self.using_alternate = true;
        let blank = CellAttrs::default();
        for row in &mut self.alternate_screen.rows {
            row.clear(blank);
        }
        self.alternate_screen.mark_all_dirty();
    }

    fn leave_alternate_screen(&mut self) {
        if !self.using_alternate {
            return;
        }
        self.using_alternate = false;
        self.primary_screen.mark_all_dirty();
    }

    /// Reverse index - cursor up, scroll if at top
    pub fn reverse_index(&mut self) {
        let cursor_row = self.active_cursor().row;
        let scroll_top = self.scroll_region.0;

        if cursor_row == scroll_top {
            self.scroll(ScrollDirection::Down, 1);
        } else {
            self.cursor_up(1);
        }
    }

    /// Index - cursor down, scroll if at bottom
    pub fn index(&mut self) {
        self.linefeed();
    }

    /// DECALN - fill the screen with `E`
    pub fn alignment_fill(&mut self) {
        self.scroll_region = (0, self.rows.saturating_sub(1));
        let screen = self.active_screen_mut();
        for row in &mut screen.rows {
            row.cells.fill(Cell {
                ch: 'E',
                width: 1,
                attrs: CellAttrs::default(),
            });
            row.wrapped = false;
        }
        screen.mark_all_dirty();
        self.move_cursor(0, 0);
    }

    /// RIS - full reset without reallocating
    pub fn reset(&mut self) {
        let blank = CellAttrs::default();
        for screen in [&mut self.primary_screen, &mut self.alternate_screen] {
            for row in &mut screen.rows {
                row.clear(blank);
            }
            screen.mark_all_dirty();
        }
        self.using_alternate = false;
        self.primary_cursor = CursorState::default();
        self.alternate_cursor = CursorState::default();
        self.current_attrs = CellAttrs::default();
        self.modes = TerminalModes::default();
        self.charsets = CharsetState::default();
        for (col, stop) in self.tab_stops.iter_mut().enumerate() {
            *stop = col > 0 && col % TAB_WIDTH == 0;
        }
        self.title.clear();
        self.scroll_region = (0, self.rows.saturating_sub(1));
        self.last_char = None;
    }
}

fn default_tab_stops(cols: u16) -> Result<Vec<bool>, TryReserveError> {
    let mut stops = Vec::new();
    stops.try_reserve_exact(cols as usize)?;
    stops.extend((0..cols as usize).map(|col| col > 0 && col % TAB_WIDTH == 0));
    Ok(stops)
}

/// Screen buffer: the visible rows of one screen
pub struct ScreenBuffer {
    pub rows: Vec<Row>,
}

impl ScreenBuffer {
    pub fn new(rows: u16, cols: u16) -> Result<Self, TryReserveError> {
        let mut out = Vec::new();
        out.try_reserve_exact(rows as usize)?;
        for _ in 0..rows {
            out.push(Row::new(cols)?);
        }
        Ok(Self { rows: out })
    }

    /// Copy of this buffer at a new size, keeping the top-left intersection
    pub fn resized(&self, rows: u16, cols: u16) -> Result<Self, TryReserveError> {
        let mut buffer = Self::new(rows, cols)?;
        let keep_cols = (cols as usize).min(self.rows.first().map_or(0, |r| r.cells.len()));

        for (new_row, old_row) in buffer.rows.iter_mut().zip(&self.rows) {
            new_row.cells[..keep_cols].clone_from_slice(&old_row.cells[..keep_cols]);
            new_row.wrapped = old_row.wrapped && keep_cols == old_row.cells.len();
            // A wide character cut in half by the new right edge
            if let Some(last) = new_row.cells[..keep_cols].last_mut() {
                if last.width == 2 {
                    *last = Cell::blank(last.attrs);
                }
            }
        }
        Ok(buffer)
    }

    pub fn mark_dirty(&mut self, line: usize) {
        if let Some(row) = self.rows.get_mut(line) {
            row.dirty = true;
        }
    }

    pub fn mark_range_dirty(&mut self, first: usize, last: usize) {
        for row in self.rows.iter_mut().take(last.saturating_add(1)).skip(first) {
            row.dirty = true;
        }
    }

    pub fn mark_all_dirty(&mut self) {
        for row in &mut self.rows {
            row.dirty = true;
        }
    }

    pub fn clear_dirty(&mut self) {
        for row in &mut self.rows {
            row.dirty = false;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.rows.iter().any(|row| row.dirty)
    }
}

/// A single row
#[derive(Clone)]
pub struct Row {
    pub cells: Vec<Cell>,
    /// Set on any change, cleared by the caller's acknowledgment
    pub dirty: bool,
    /// The line was continued onto the next one by autowrap
    pub wrapped: bool,
}

impl Row {
    pub fn new(cols: u16) -> Result<Self, TryReserveError> {
        let mut cells = Vec::new();
        cells.try_reserve_exact(cols as usize)?;
        cells.resize(cols as usize, Cell::default());
        Ok(Self {
            cells,
            dirty: true,
            wrapped: false,
        })
    }

    pub fn clear(&mut self, attrs: CellAttrs) {
        self.cells.fill(Cell::blank(attrs));
        self.wrapped = false;
    }

    /// Blank cells `start..end`, clamped to the row
    pub fn clear_range(&mut self, start: usize, end: usize, attrs: CellAttrs) {
        let end = end.min(self.cells.len());
        if start < end {
            self.split_wide_at(start, attrs);
            self.split_wide_at(end, attrs);
            self.cells[start..end].fill(Cell::blank(attrs));
        }
    }

    /// Blank a wide character straddling the boundary between `col - 1` and `col`
    pub fn split_wide_at(&mut self, col: usize, attrs: CellAttrs) {
        if col > 0 && col < self.cells.len() && self.cells[col].is_continuation() {
            self.cells[col - 1] = Cell::blank(attrs);
            self.cells[col] = Cell::blank(attrs);
        }
    }

    /// Blank half characters left at the edges after cells were shifted
    pub fn repair_edges(&mut self, attrs: CellAttrs) {
        if let Some(first) = self.cells.first_mut() {
            if first.is_continuation() {
                *first = Cell::blank(attrs);
            }
        }
        if let Some(last) = self.cells.last_mut() {
            if last.width == 2 {
                *last = Cell::blank(attrs);
            }
        }
    }

    /// The row's characters, one per column, continuation cells skipped
    pub fn text(&self) -> String {
        self.cells
            .iter()
            .filter(|cell| !cell.is_continuation())
            .map(|cell| cell.ch)
            .collect()
    }
}

/// A single cell
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cell {
    pub ch: char,
    /// 1 for normal, 2 for the left half of a wide char, 0 for its right half
    pub width: u8,
    pub attrs: CellAttrs,
}

impl Default for Cell {
    fn default() -> Self {
        Self::blank(CellAttrs::default())
    }
}

impl Cell {
    pub fn blank(attrs: CellAttrs) -> Self {
        Self {
            ch: ' ',
            width: 1,
            attrs,
        }
    }

    pub fn continuation(attrs: CellAttrs) -> Self {
        Self {
            ch: ' ',
            width: 0,
            attrs,
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.width == 0
    }
}

/// Cell attributes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CellAttrs {
    pub fg: Color,
    pub bg: Color,
    pub flags: AttrFlags,
}

impl CellAttrs {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Attributes for erased cells: only the background survives
    pub fn erase_attrs(&self) -> Self {
        Self {
            bg: self.bg,
            ..Self::default()
        }
    }
}

/// Color definition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AttrFlags: u16 {
        const BOLD          = 0b0000_0000_0001;
        const DIM           = 0b0000_0000_0010;
        const ITALIC        = 0b0000_0000_0100;
        const UNDERLINE     = 0b0000_0000_1000;
        const BLINK         = 0b0000_0001_0000;
        const INVERSE       = 0b0000_0010_0000;
        const HIDDEN        = 0b0000_0100_0000;
        const STRIKETHROUGH = 0b0000_1000_0000;
    }
}

/// Cursor shape
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CursorShape {
    /// Default (terminal dependent)
    #[default]
    Default,
    BlinkingBlock,
    SteadyBlock,
    BlinkingUnderline,
    SteadyUnderline,
    /// Blinking bar (|)
    BlinkingBar,
    /// Steady bar (|)
    SteadyBar,
}

impl CursorShape {
    /// Create from DECSCUSR parameter
    pub fn from_decscusr(n: u16) -> Self {
        match n {
            1 => CursorShape::BlinkingBlock,
            2 => CursorShape::SteadyBlock,
            3 => CursorShape::BlinkingUnderline,
            4 => CursorShape::SteadyUnderline,
            5 => CursorShape::BlinkingBar,
            6 => CursorShape::SteadyBar,
            _ => CursorShape::Default,
        }
    }
}

/// Cursor state
#[derive(Clone, Debug)]
pub struct CursorState {
    pub col: u16,
    pub row: u16,
    pub shape: CursorShape,
    pub saved: Option<SavedCursor>,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            col: 0,
            row: 0,
            shape: CursorShape::Default,
            saved: None,
        }
    }
}

impl CursorState {
    fn clamp(&mut self, max_row: u16, max_col: u16) {
        self.row = self.row.min(max_row);
        self.col = self.col.min(max_col);
        if let Some(saved) = self.saved.as_mut() {
            saved.row = saved.row.min(max_row);
            saved.col = saved.col.min(max_col);
        }
    }
}

/// Saved cursor state (DECSC)
#[derive(Clone, Debug)]
pub struct SavedCursor {
    pub col: u16,
    pub row: u16,
    pub attrs: CellAttrs,
    pub charsets: CharsetState,
    pub origin_mode: bool,
}

/// Terminal modes
#[derive(Clone, Debug)]
pub struct TerminalModes {
    pub application_cursor: bool,
    pub application_keypad: bool,
    pub auto_wrap: bool,
    pub origin_mode: bool,
    pub insert_mode: bool,
    pub linefeed_newline: bool,
    pub bracketed_paste: bool,
    /// DECTCEM, shared by both screens
    pub cursor_visible: bool,
}

impl Default for TerminalModes {
    fn default() -> Self {
        Self {
            application_cursor: false,
            application_keypad: false,
            auto_wrap: true,
            origin_mode: false,
            insert_mode: false,
            linefeed_newline: false,
            bracketed_paste: false,
            cursor_visible: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(rows: u16, cols: u16) -> TerminalState {
        let mut state = TerminalState::new(rows, cols).unwrap();
        state.active_screen_mut().clear_dirty();
        state
    }

    fn print(state: &mut TerminalState, text: &str) {
        for ch in text.chars() {
            state.put_char(ch);
        }
    }

    fn dirty_rows(state: &TerminalState) -> Vec<usize> {
        state
            .active_screen()
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.dirty)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_new_grid_is_blank_and_dirty() {
        let state = TerminalState::new(3, 4).unwrap();
        let screen = state.active_screen();
        assert_eq!(screen.rows.len(), 3);
        for row in &screen.rows {
            assert!(row.dirty);
            assert_eq!(row.cells.len(), 4);
            assert!(row.cells.iter().all(|cell| *cell == Cell::default()));
        }
    }

    #[test]
    fn test_print_applies_attrs_at_write_time() {
        let mut state = state(2, 10);
        print(&mut state, "ab");
        state.set_attribute(AttrChange::Set(AttrFlags::BOLD));
        state.set_attribute(AttrChange::Foreground(Color::Indexed(2)));
        print(&mut state, "c");

        let row = &state.active_screen().rows[0];
        assert_eq!(row.cells[0].attrs, CellAttrs::default());
        assert_eq!(row.cells[2].ch, 'c');
        assert!(row.cells[2].attrs.flags.contains(AttrFlags::BOLD));
        assert_eq!(row.cells[2].attrs.fg, Color::Indexed(2));
        assert_eq!(state.active_cursor().col, 3);
    }

    #[test]
    fn test_wrap_and_scroll() {
        let mut state = state(2, 3);
        print(&mut state, "abcd");
        assert_eq!(state.active_screen().rows[0].text(), "abc");
        assert!(state.active_screen().rows[0].wrapped);
        assert_eq!(state.active_screen().rows[1].text(), "d  ");
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (1, 1));

        print(&mut state, "ef");
        // The last cell of the last row scrolls immediately
        assert_eq!(state.active_screen().rows[0].text(), "def");
        assert_eq!(state.active_screen().rows[1].text(), "   ");
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (1, 0));
    }

    #[test]
    fn test_no_autowrap_overwrites_last_column() {
        let mut state = state(2, 3);
        state.set_private_mode(7, false);
        print(&mut state, "abcde");
        assert_eq!(state.active_screen().rows[0].text(), "abe");
        assert_eq!(state.active_cursor().col, 2);
        assert_eq!(state.active_cursor().row, 0);
    }

    #[test]
    fn test_wide_char_occupies_two_cells() {
        let mut state = state(2, 4);
        print(&mut state, "a日");
        let row = &state.active_screen().rows[0];
        assert_eq!(row.cells[1].ch, '日');
        assert_eq!(row.cells[1].width, 2);
        assert!(row.cells[2].is_continuation());
        assert_eq!(state.active_cursor().col, 3);

        // Does not fit in the last column, goes to the next line
        print(&mut state, "本");
        assert_eq!(state.active_screen().rows[1].cells[0].ch, '本');
    }

    #[test]
    fn test_overwriting_half_of_wide_char_blanks_other_half() {
        let mut state = state(1, 4);
        print(&mut state, "日");
        state.move_cursor(0, 1);
        print(&mut state, "x");
        let row = &state.active_screen().rows[0];
        assert_eq!(row.cells[0], Cell::default());
        assert_eq!(row.cells[1].ch, 'x');
    }

    #[test]
    fn test_dirty_tracking_is_per_row() {
        let mut state = state(3, 5);
        state.move_cursor(1, 0);
        assert!(dirty_rows(&state).is_empty());
        print(&mut state, "x");
        assert_eq!(dirty_rows(&state), vec![1]);
        state.carriage_return();
        state.backspace();
        assert_eq!(dirty_rows(&state), vec![1]);
    }

    #[test]
    fn test_erase_scopes() {
        let mut state = state(3, 4);
        for r in 0..3 {
            state.move_cursor(r, 0);
            print(&mut state, "abc");
        }
        state.move_cursor(1, 1);
        state.erase(EraseScope::ToEndOfLine);
        assert_eq!(state.active_screen().rows[1].text(), "a   ");

        state.erase(EraseScope::ToStartOfScreen);
        assert_eq!(state.active_screen().rows[0].text(), "    ");
        assert_eq!(state.active_screen().rows[1].text(), "    ");
        assert_eq!(state.active_screen().rows[2].text(), "abc ");

        state.active_screen_mut().clear_dirty();
        state.move_cursor(2, 2);
        state.erase(EraseScope::ToStartOfLine);
        assert_eq!(state.active_screen().rows[2].text(), "    ");
        assert_eq!(dirty_rows(&state), vec![2]);

        state.erase(EraseScope::WholeScreen);
        assert_eq!(dirty_rows(&state), vec![0, 1, 2]);
    }

    #[test]
    fn test_scroll_region() {
        let mut state = state(4, 2);
        for (r, text) in ["a", "b", "c", "d"].iter().enumerate() {
            state.move_cursor(r as u16, 0);
            print(&mut state, text);
        }
        state.set_scroll_region(2, 3);
        assert_eq!(state.active_cursor().row, 0);
        state.active_screen_mut().clear_dirty();

        state.scroll(ScrollDirection::Up, 1);
        let texts: Vec<_> = state.active_screen().rows.iter().map(Row::text).collect();
        assert_eq!(texts, vec!["a ", "c ", "  ", "d "]);
        assert_eq!(dirty_rows(&state), vec![1, 2]);

        state.scroll(ScrollDirection::Down, 5);
        let texts: Vec<_> = state.active_screen().rows.iter().map(Row::text).collect();
        assert_eq!(texts, vec!["a ", "  ", "  ", "d "]);
    }

    #[test]
    fn test_insert_and_delete_chars() {
        let mut state = state(2, 5);
        print(&mut state, "abcde");
        state.move_cursor(0, 1);
        state.insert_chars(2);
        assert_eq!(state.active_screen().rows[0].text(), "a  bc");
        state.delete_chars(3);
        assert_eq!(state.active_screen().rows[0].text(), "ac   ");
        state.erase_chars(10);
        assert_eq!(state.active_screen().rows[0].text(), "a    ");
    }

    fn widths(state: &TerminalState, row: usize) -> Vec<u8> {
        state.active_screen().rows[row]
            .cells
            .iter()
            .map(|cell| cell.width)
            .collect()
    }

    #[test]
    fn test_erase_chars_through_half_of_wide_char() {
        let mut state = state(2, 4);
        print(&mut state, "日a");
        state.move_cursor(0, 0);
        state.erase_chars(1);
        assert_eq!(state.active_screen().rows[0].text(), "  a ");
        assert_eq!(widths(&state, 0), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_delete_chars_through_half_of_wide_char() {
        let mut state = state(2, 4);
        print(&mut state, "日a");
        state.move_cursor(0, 0);
        state.delete_chars(1);
        assert_eq!(state.active_screen().rows[0].text(), " a  ");
        assert_eq!(widths(&state, 0), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_delete_chars_ending_inside_wide_char() {
        let mut state = state(2, 5);
        print(&mut state, "a日bc");
        state.move_cursor(0, 0);
        state.delete_chars(2);
        assert_eq!(state.active_screen().rows[0].text(), " bc  ");
        assert_eq!(widths(&state, 0), vec![1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_insert_chars_pushes_wide_char_off_the_edge() {
        let mut state = state(2, 4);
        print(&mut state, "ab日");
        state.move_cursor(0, 0);
        state.insert_chars(1);
        assert_eq!(state.active_screen().rows[0].text(), " ab ");
        assert_eq!(widths(&state, 0), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_insert_chars_inside_wide_char() {
        let mut state = state(2, 4);
        print(&mut state, "日b");
        state.move_cursor(0, 1);
        state.insert_chars(1);
        assert_eq!(state.active_screen().rows[0].text(), "   b");
        assert_eq!(widths(&state, 0), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_erase_to_start_of_line_through_wide_char() {
        let mut state = state(2, 4);
        print(&mut state, "日a");
        state.move_cursor(0, 0);
        state.erase(EraseScope::ToStartOfLine);
        assert_eq!(state.active_screen().rows[0].text(), "  a ");
        assert_eq!(widths(&state, 0), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_erase_to_end_of_line_from_right_half() {
        let mut state = state(2, 4);
        print(&mut state, "a日");
        state.move_cursor(0, 2);
        state.erase(EraseScope::ToEndOfLine);
        assert_eq!(state.active_screen().rows[0].text(), "a   ");
        assert_eq!(widths(&state, 0), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_wide_char_at_last_column_of_widest_grid() {
        let mut state = state(1, u16::MAX);
        state.move_cursor(0, u16::MAX - 1);
        print(&mut state, "日");
        // Wrapped onto the (scrolled) only row
        assert_eq!(state.active_screen().rows[0].cells[0].ch, '日');
        assert_eq!(state.active_cursor().col, 2);

        state.set_private_mode(7, false);
        state.move_cursor(0, u16::MAX - 1);
        print(&mut state, "本");
        let cells = &state.active_screen().rows[0].cells;
        assert_eq!(cells[u16::MAX as usize - 2].ch, '本');
        assert!(cells[u16::MAX as usize - 1].is_continuation());
        assert_eq!(state.active_cursor().col, u16::MAX - 1);
    }

    #[test]
    fn test_insert_mode_shifts_line() {
        let mut state = state(1, 4);
        print(&mut state, "abc");
        state.move_cursor(0, 0);
        state.set_mode(4, true);
        print(&mut state, "x");
        assert_eq!(state.active_screen().rows[0].text(), "xabc");
    }

    #[test]
    fn test_tab_stops() {
        let mut state = state(1, 20);
        state.horizontal_tab(1);
        assert_eq!(state.active_cursor().col, 8);
        state.horizontal_tab(5);
        assert_eq!(state.active_cursor().col, 19);
        state.back_tab(1);
        assert_eq!(state.active_cursor().col, 16);

        state.clear_tab_stop(3);
        state.move_cursor(0, 3);
        state.set_tab_stop();
        state.move_cursor(0, 0);
        state.horizontal_tab(1);
        assert_eq!(state.active_cursor().col, 3);
    }

    #[test]
    fn test_resize_preserves_intersection() {
        let mut state = state(2, 3);
        print(&mut state, "abcde");
        state.move_cursor(1, 2);
        state.resize(4, 5).unwrap();

        let screen = state.active_screen();
        assert_eq!(screen.rows[0].text(), "abc  ");
        assert_eq!(screen.rows[1].text(), "de   ");
        assert_eq!(screen.rows[3].cells[4], Cell::default());
        assert!(screen.rows.iter().all(|row| row.dirty));
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (1, 2));

        state.resize(1, 2).unwrap();
        assert_eq!(state.active_screen().rows[0].text(), "ab");
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (0, 1));
        assert_eq!(state.scroll_region, (0, 0));
    }

    #[test]
    fn test_alternate_screen_round_trip() {
        let mut state = state(2, 3);
        print(&mut state, "ab");
        state.set_private_mode(1049, true);
        assert!(state.using_alternate);
        assert_eq!(state.active_screen().rows[0].text(), "   ");
        print(&mut state, "zz");
        state.set_private_mode(1049, false);
        assert!(!state.using_alternate);
        assert_eq!(state.active_screen().rows[0].text(), "ab ");
        assert_eq!(state.active_cursor().col, 2);
    }

    #[test]
    fn test_save_restore_cursor_keeps_attrs() {
        let mut state = state(3, 3);
        state.move_cursor(2, 1);
        state.set_attribute(AttrChange::Set(AttrFlags::UNDERLINE));
        state.save_cursor();
        state.set_attribute(AttrChange::Reset);
        state.move_cursor(0, 0);
        state.restore_cursor();
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (2, 1));
        assert!(state.current_attrs.flags.contains(AttrFlags::UNDERLINE));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut state = state(2, 3);
        print(&mut state, "abc");
        state.set_private_mode(25, false);
        state.title.push_str("x");
        state.reset();
        assert_eq!(state.active_screen().rows[0].text(), "   ");
        assert!(state.modes.cursor_visible);
        assert!(state.title.is_empty());
        assert_eq!(state.tab_stops.len(), 3);
    }
}
