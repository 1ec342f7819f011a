//! VT sequence parser
//!
//! Parses ANSI/VT escape sequences and updates terminal state. The parser is
//! fed one byte at a time and keeps its state between calls, so sequences and
//! UTF-8 characters may be split across arbitrary chunk boundaries.

use super::charset::{Charset, CharsetSlot};
use super::state::{
    AttrChange, AttrFlags, Color, CursorShape, EraseScope, ScrollDirection, TerminalState,
};

/// Parameters beyond this count are dropped
const MAX_PARAMS: usize = 16;
const MAX_INTERMEDIATES: usize = 4;
/// Colon subparameters kept per sequence
const MAX_SUBPARAMS: usize = 16;
/// OSC payload bytes beyond this length are dropped
const MAX_OSC_LEN: usize = 1024;

const REPLACEMENT_CHARACTER: char = '\u{FFFD}';

/// Response that needs to be sent back to the PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Cursor position report: ESC [ row ; col R
    CursorPosition(u16, u16),
    /// Operating status report: ESC [ 0 n
    Status,
    /// Device attributes response
    DeviceAttributes,
    /// Secondary device attributes response
    SecondaryDeviceAttributes,
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::CursorPosition(row, col) => format!("\x1b[{};{}R", row, col).into_bytes(),
            Response::Status => b"\x1b[0n".to_vec(),
            // VT220 response
            Response::DeviceAttributes => b"\x1b[?62;c".to_vec(),
            Response::SecondaryDeviceAttributes => b"\x1b[>1;10;0c".to_vec(),
        }
    }
}

/// Something the parser needs its owner to act on beyond the screen edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Bell,
    Respond(Response),
}

/// Parser state machine
pub struct VtParser {
    state: ParserState,
    params: Vec<u16>,
    intermediates: Vec<u8>,
    private_marker: Option<u8>,
    current_param: Option<u16>,
    /// Colon subparameters and the index of the parameter each belongs to
    sub_owners: Vec<usize>,
    sub_values: Vec<u16>,
    /// Digits being read belong to a subparameter of this parameter
    sub_owner: Option<usize>,
    osc_string: Vec<u8>,
    utf8: Utf8Decoder,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ParserState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    /// Malformed CSI, swallowed up to its final byte
    CsiIgnore,
    OscString,
    /// ESC received within OSC, waiting for backslash
    OscEscape,
    /// DCS / SOS / PM / APC payload
    IgnoreString,
    IgnoreEscape,
}

impl ParserState {
    fn in_string(self) -> bool {
        matches!(
            self,
            ParserState::OscString
                | ParserState::OscEscape
                | ParserState::IgnoreString
                | ParserState::IgnoreEscape
        )
    }
}

impl Default for VtParser {
    fn default() -> Self {
        Self::new()
    }
}

impl VtParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Ground,
            params: Vec::with_capacity(MAX_PARAMS),
            intermediates: Vec::with_capacity(MAX_INTERMEDIATES),
            private_marker: None,
            current_param: None,
            sub_owners: Vec::with_capacity(MAX_SUBPARAMS),
            sub_values: Vec::with_capacity(MAX_SUBPARAMS),
            sub_owner: None,
            osc_string: Vec::with_capacity(MAX_OSC_LEN),
            utf8: Utf8Decoder::default(),
        }
    }

    /// Drop any sequence in progress
    pub fn reset(&mut self) {
        self.state = ParserState::Ground;
        self.clear_sequence();
        self.osc_string.clear();
        self.utf8 = Utf8Decoder::default();
    }

    /// Feed a single byte to the parser
    pub fn feed(&mut self, byte: u8, state: &mut TerminalState) -> Option<Signal> {
        // Finish (or abandon) a multi-byte character first
        if self.utf8.is_pending() {
            match self.utf8.push(byte) {
                Utf8Step::Pending => return None,
                Utf8Step::Char(ch) => {
                    state.put_char(ch);
                    return None;
                }
                Utf8Step::Invalid => {
                    state.put_char(REPLACEMENT_CHARACTER);
                    return None;
                }
                Utf8Step::Interrupted => state.put_char(REPLACEMENT_CHARACTER),
            }
        }

        // Handle C0 controls anywhere (except in string states)
        if byte < 0x20 && !self.state.in_string() {
            return self.execute(byte, state);
        }
        if byte == 0x7F && !self.state.in_string() {
            return None;
        }

        match self.state {
            ParserState::Ground => self.ground(byte, state),
            ParserState::Escape => self.escape(byte, state),
            ParserState::EscapeIntermediate => self.escape_intermediate(byte, state),
            ParserState::CsiEntry => self.csi_entry(byte, state),
            ParserState::CsiParam => self.csi_param(byte, state),
            ParserState::CsiIntermediate => self.csi_intermediate(byte, state),
            ParserState::CsiIgnore => {
                if (0x40..=0x7E).contains(&byte) {
                    self.state = ParserState::Ground;
                }
                None
            }
            ParserState::OscString => self.osc_string_state(byte, state),
            ParserState::OscEscape => self.osc_escape(byte, state),
            ParserState::IgnoreString => {
                match byte {
                    0x1B => self.state = ParserState::IgnoreEscape,
                    0x18 | 0x1A => self.state = ParserState::Ground,
                    _ => {}
                }
                None
            }
            ParserState::IgnoreEscape => {
                if byte == b'\\' {
                    self.state = ParserState::Ground;
                    None
                } else {
                    self.enter_escape();
                    self.escape(byte, state)
                }
            }
        }
    }

    /// Execute a C0 control
    fn execute(&mut self, byte: u8, state: &mut TerminalState) -> Option<Signal> {
        match byte {
            0x07 => return Some(Signal::Bell),
            0x08 => state.backspace(),
            0x09 => state.horizontal_tab(1),
            0x0A..=0x0C => {
                state.linefeed();
                if state.modes.linefeed_newline {
                    state.carriage_return();
                }
            }
            0x0D => state.carriage_return(),
            0x0E => state.shift_charset(CharsetSlot::G1),
            0x0F => state.shift_charset(CharsetSlot::G0),
            0x18 | 0x1A => {
                // CAN / SUB abort the sequence in progress
                self.state = ParserState::Ground;
            }
            0x1B => self.enter_escape(),
            _ => {}
        }
        None
    }

    fn clear_sequence(&mut self) {
        self.params.clear();
        self.intermediates.clear();
        self.private_marker = None;
        self.current_param = None;
        self.sub_owners.clear();
        self.sub_values.clear();
        self.sub_owner = None;
    }

    fn enter_escape(&mut self) {
        self.state = ParserState::Escape;
        self.clear_sequence();
    }

    fn ground(&mut self, byte: u8, state: &mut TerminalState) -> Option<Signal> {
        if (0x20..0x7F).contains(&byte) {
            state.put_char(byte as char);
        } else if byte >= 0x80 {
            match self.utf8.push(byte) {
                Utf8Step::Char(ch) => state.put_char(ch),
                Utf8Step::Pending => {}
                Utf8Step::Invalid | Utf8Step::Interrupted => state.put_char(REPLACEMENT_CHARACTER),
            }
        }
        None
    }

    fn escape(&mut self, byte: u8, state: &mut TerminalState) -> Option<Signal> {
        self.state = ParserState::Ground;
        match byte {
            b'[' => {
                self.clear_sequence();
                self.state = ParserState::CsiEntry;
            }
            b']' => {
                self.osc_string.clear();
                self.state = ParserState::OscString;
            }
            b'P' | b'X' | b'^' | b'_' => self.state = ParserState::IgnoreString,
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = ParserState::EscapeIntermediate;
            }
            // DECSC - Save cursor
            b'7' => state.save_cursor(),
            // DECRC - Restore cursor
            b'8' => state.restore_cursor(),
            // IND - Index
            b'D' => state.index(),
            // NEL - Next line
            b'E' => {
                state.carriage_return();
                state.linefeed();
            }
            // HTS - Set tab stop
            b'H' => state.set_tab_stop(),
            // RI - Reverse index
            b'M' => state.reverse_index(),
            // RIS - Full reset
            b'c' => {
                state.reset();
                self.reset();
            }
            b'=' => state.modes.application_keypad = true,
            b'>' => state.modes.application_keypad = false,
            _ => tracing::debug!("Unknown ESC final {:?}", byte as char),
        }
        None
    }

    fn escape_intermediate(&mut self, byte: u8, state: &mut TerminalState) -> Option<Signal> {
        match byte {
            0x20..=0x2F => {
                if self.intermediates.len() < MAX_INTERMEDIATES {
                    self.intermediates.push(byte);
                }
            }
            0x30..=0x7E => {
                self.state = ParserState::Ground;
                match (self.intermediates.as_slice(), byte) {
                    ([b'('], _) | ([b')'], _) => {
                        let slot = if self.intermediates[0] == b'(' {
                            CharsetSlot::G0
                        } else {
                            CharsetSlot::G1
                        };
                        match Charset::from_final(byte) {
                            Some(charset) => state.designate_charset(slot, charset),
                            None => tracing::debug!("Unsupported charset {:?}", byte as char),
                        }
                    }
                    // DECALN - Screen alignment test
                    ([b'#'], b'8') => state.alignment_fill(),
                    _ => tracing::debug!(
                        "Unknown ESC: intermediates={:?}, final={:?}",
                        self.intermediates,
                        byte as char
                    ),
                }
            }
            _ => self.state = ParserState::Ground,
        }
        None
    }

    fn push_param(&mut self, value: u16) {
        if self.params.len() < MAX_PARAMS {
            self.params.push(value);
        }
    }

    /// `;` ends a parameter and its subparameters
    fn end_param(&mut self) {
        let value = self.current_param.take().unwrap_or(0);
        match self.sub_owner.take() {
            Some(owner) => self.push_subparam(owner, value),
            None => self.push_param(value),
        }
    }

    /// `:` starts or continues the subparameters of the current parameter
    fn end_subparam(&mut self) {
        let value = self.current_param.take().unwrap_or(0);
        match self.sub_owner {
            Some(owner) => self.push_subparam(owner, value),
            None if self.params.len() < MAX_PARAMS => {
                self.params.push(value);
                self.sub_owner = Some(self.params.len() - 1);
            }
            // The owner was dropped; so are its subparameters
            None => self.sub_owner = Some(usize::MAX),
        }
    }

    fn push_subparam(&mut self, owner: usize, value: u16) {
        if owner < self.params.len() && self.sub_values.len() < MAX_SUBPARAMS {
            self.sub_owners.push(owner);
            self.sub_values.push(value);
        }
    }

    /// Close the parameter list before an intermediate or final byte
    fn finish_params(&mut self) {
        if self.sub_owner.is_some() || self.current_param.is_some() {
            self.end_param();
        }
    }

    /// Subparameters given to parameter `index` with `:`
    fn subparams(&self, index: usize) -> &[u16] {
        match self.sub_owners.iter().position(|&owner| owner == index) {
            Some(start) => {
                let len = self.sub_owners[start..]
                    .iter()
                    .take_while(|&&owner| owner == index)
                    .count();
                &self.sub_values[start..start + len]
            }
            None => &[],
        }
    }

    fn csi_entry(&mut self, byte: u8, state: &mut TerminalState) -> Option<Signal> {
        match byte {
            b'0'..=b'9' => {
                self.current_param = Some((byte - b'0') as u16);
                self.state = ParserState::CsiParam;
            }
            b';' => {
                self.push_param(0);
                self.state = ParserState::CsiParam;
            }
            b':' => {
                self.end_subparam();
                self.state = ParserState::CsiParam;
            }
            b'<' | b'=' | b'>' | b'?' => {
                self.private_marker = Some(byte);
                self.state = ParserState::CsiParam;
            }
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7E => return self.execute_csi(byte, state),
            _ => self.state = ParserState::Ground,
        }
        None
    }

    fn csi_param(&mut self, byte: u8, state: &mut TerminalState) -> Option<Signal> {
        match byte {
            b'0'..=b'9' => {
                let digit = (byte - b'0') as u16;
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit),
                );
            }
            b';' => self.end_param(),
            b':' => self.end_subparam(),
            b'<' | b'=' | b'>' | b'?' => self.state = ParserState::CsiIgnore,
            0x20..=0x2F => {
                self.finish_params();
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7E => {
                self.finish_params();
                return self.execute_csi(byte, state);
            }
            _ => self.state = ParserState::Ground,
        }
        None
    }

    fn csi_intermediate(&mut self, byte: u8, state: &mut TerminalState) -> Option<Signal> {
        match byte {
            0x20..=0x2F => {
                if self.intermediates.len() < MAX_INTERMEDIATES {
                    self.intermediates.push(byte);
                }
            }
            0x30..=0x3F => self.state = ParserState::CsiIgnore,
            0x40..=0x7E => return self.execute_csi(byte, state),
            _ => self.state = ParserState::Ground,
        }
        None
    }

    fn osc_string_state(&mut self, byte: u8, state: &mut TerminalState) -> Option<Signal> {
        match byte {
            // BEL terminates OSC
            0x07 => {
                self.execute_osc(state);
                self.state = ParserState::Ground;
            }
            // Could be ST (ESC \)
            0x1B => self.state = ParserState::OscEscape,
            0x18 | 0x1A => self.state = ParserState::Ground,
            0x00..=0x1F => {}
            _ => {
                if self.osc_string.len() < MAX_OSC_LEN {
                    self.osc_string.push(byte);
                }
            }
        }
        None
    }

    fn osc_escape(&mut self, byte: u8, state: &mut TerminalState) -> Option<Signal> {
        self.execute_osc(state);
        if byte == b'\\' {
            self.state = ParserState::Ground;
            None
        } else {
            // Not ST: the ESC started a new sequence
            self.enter_escape();
            self.escape(byte, state)
        }
    }

    /// Parameter `index`, with 0 or absent meaning `default`
    fn param(&self, index: usize, default: u16) -> u16 {
        match self.params.get(index) {
            Some(&p) if p > 0 => p,
            _ => default,
        }
    }

    fn param_or_zero(&self, index: usize) -> u16 {
        self.params.get(index).copied().unwrap_or(0)
    }

    fn execute_csi(&mut self, final_byte: u8, state: &mut TerminalState) -> Option<Signal> {
        self.state = ParserState::Ground;

        match (self.private_marker, self.intermediates.as_slice(), final_byte) {
            // Cursor movement
            (None, [], b'A') => state.cursor_up(self.param(0, 1)),
            (None, [], b'B') | (None, [], b'e') => state.cursor_down(self.param(0, 1)),
            (None, [], b'C') | (None, [], b'a') => state.cursor_forward(self.param(0, 1)),
            (None, [], b'D') => state.cursor_backward(self.param(0, 1)),
            // CNL - Cursor Next Line
            (None, [], b'E') => {
                state.cursor_down(self.param(0, 1));
                state.carriage_return();
            }
            // CPL - Cursor Previous Line
            (None, [], b'F') => {
                state.cursor_up(self.param(0, 1));
                state.carriage_return();
            }
            // CHA / HPA - Cursor Character Absolute
            (None, [], b'G') | (None, [], b'`') => state.set_col(self.param(0, 1)),
            // CUP - Cursor Position
            (None, [], b'H') | (None, [], b'f') => {
                state.cursor_position(self.param(0, 1), self.param(1, 1))
            }
            // VPA - Line Position Absolute
            (None, [], b'd') => state.set_row(self.param(0, 1)),
            (None, [], b'I') => state.horizontal_tab(self.param(0, 1)),
            (None, [], b'Z') => state.back_tab(self.param(0, 1)),

            // Erase
            (None, [], b'J') | (Some(b'?'), [], b'J') => match self.param_or_zero(0) {
                0 => state.erase(EraseScope::ToEndOfScreen),
                1 => state.erase(EraseScope::ToStartOfScreen),
                2 | 3 => state.erase(EraseScope::WholeScreen),
                mode => tracing::debug!("Unknown ED mode {}", mode),
            },
            (None, [], b'K') | (Some(b'?'), [], b'K') => match self.param_or_zero(0) {
                0 => state.erase(EraseScope::ToEndOfLine),
                1 => state.erase(EraseScope::ToStartOfLine),
                2 => state.erase(EraseScope::WholeLine),
                mode => tracing::debug!("Unknown EL mode {}", mode),
            },

            // Line and character operations
            (None, [], b'L') => state.insert_lines(self.param(0, 1)),
            (None, [], b'M') => state.delete_lines(self.param(0, 1)),
            (None, [], b'@') => state.insert_chars(self.param(0, 1)),
            (None, [], b'P') => state.delete_chars(self.param(0, 1)),
            (None, [], b'X') => state.erase_chars(self.param(0, 1)),
            (None, [], b'b') => state.repeat_last(self.param(0, 1)),

            // Scroll
            (None, [], b'S') => state.scroll(ScrollDirection::Up, self.param(0, 1)),
            // With more parameters this is xterm's mouse highlight tracking
            (None, [], b'T') if self.params.len() <= 1 => {
                state.scroll(ScrollDirection::Down, self.param(0, 1))
            }

            // Scroll region
            (None, [], b'r') => {
                let bottom = self.param(1, state.rows);
                state.set_scroll_region(self.param(0, 1), bottom);
            }

            // Tab clear
            (None, [], b'g') => state.clear_tab_stop(self.param_or_zero(0)),

            // SGR - Select Graphic Rendition
            (None, [], b'm') => self.execute_sgr(state),

            // Save/restore cursor
            (None, [], b's') => state.save_cursor(),
            (None, [], b'u') => state.restore_cursor(),

            // Device Status Report
            (None, [], b'n') => match self.param_or_zero(0) {
                5 => return Some(Signal::Respond(Response::Status)),
                6 => {
                    let cursor = state.active_cursor();
                    let row = if state.modes.origin_mode {
                        cursor.row.saturating_sub(state.scroll_region.0)
                    } else {
                        cursor.row
                    };
                    return Some(Signal::Respond(Response::CursorPosition(
                        row + 1,
                        cursor.col + 1,
                    )));
                }
                _ => {}
            },

            // Device Attributes
            (None, [], b'c') if self.param_or_zero(0) == 0 => {
                return Some(Signal::Respond(Response::DeviceAttributes));
            }
            (Some(b'>'), [], b'c') if self.param_or_zero(0) == 0 => {
                return Some(Signal::Respond(Response::SecondaryDeviceAttributes));
            }

            // Private modes (DEC)
            (Some(b'?'), [], b'h') | (Some(b'?'), [], b'l') => {
                let enable = final_byte == b'h';
                for &p in &self.params {
                    state.set_private_mode(p, enable);
                }
            }

            // Standard modes
            (None, [], b'h') | (None, [], b'l') => {
                let enable = final_byte == b'h';
                for &p in &self.params {
                    state.set_mode(p, enable);
                }
            }

            // DECSCUSR - Set cursor style
            (None, [b' '], b'q') => {
                state.active_cursor_mut().shape = CursorShape::from_decscusr(self.param_or_zero(0));
            }

            _ => {
                tracing::debug!(
                    "Unknown CSI: private={:?}, intermediates={:?}, params={:?}, final={:?}",
                    self.private_marker.map(|b| b as char),
                    self.intermediates,
                    self.params,
                    final_byte as char
                );
            }
        }
        None
    }

    fn execute_sgr(&self, state: &mut TerminalState) {
        if self.params.is_empty() {
            state.set_attribute(AttrChange::Reset);
            return;
        }

        let mut iter = self.params.iter().copied().enumerate();

        while let Some((index, param)) = iter.next() {
            let subs = self.subparams(index);
            let change = match param {
                0 => AttrChange::Reset,
                1 => AttrChange::Set(AttrFlags::BOLD),
                2 => AttrChange::Set(AttrFlags::DIM),
                3 => AttrChange::Set(AttrFlags::ITALIC),
                // 4:0 is "no underline"; other styles draw as a plain underline
                4 if subs.first() == Some(&0) => AttrChange::Clear(AttrFlags::UNDERLINE),
                4 | 21 => AttrChange::Set(AttrFlags::UNDERLINE),
                5 | 6 => AttrChange::Set(AttrFlags::BLINK),
                7 => AttrChange::Set(AttrFlags::INVERSE),
                8 => AttrChange::Set(AttrFlags::HIDDEN),
                9 => AttrChange::Set(AttrFlags::STRIKETHROUGH),

                22 => AttrChange::Clear(AttrFlags::BOLD | AttrFlags::DIM),
                23 => AttrChange::Clear(AttrFlags::ITALIC),
                24 => AttrChange::Clear(AttrFlags::UNDERLINE),
                25 => AttrChange::Clear(AttrFlags::BLINK),
                27 => AttrChange::Clear(AttrFlags::INVERSE),
                28 => AttrChange::Clear(AttrFlags::HIDDEN),
                29 => AttrChange::Clear(AttrFlags::STRIKETHROUGH),

                // Foreground colors (standard)
                30..=37 => AttrChange::Foreground(Color::Indexed((param - 30) as u8)),
                38 => match sgr_color(subs, &mut iter) {
                    Some(color) => AttrChange::Foreground(color),
                    None => continue,
                },
                39 => AttrChange::Foreground(Color::Default),

                // Background colors (standard)
                40..=47 => AttrChange::Background(Color::Indexed((param - 40) as u8)),
                48 => match sgr_color(subs, &mut iter) {
                    Some(color) => AttrChange::Background(color),
                    None => continue,
                },
                49 => AttrChange::Background(Color::Default),

                // Bright foreground
                90..=97 => AttrChange::Foreground(Color::Indexed((param - 90 + 8) as u8)),
                // Bright background
                100..=107 => AttrChange::Background(Color::Indexed((param - 100 + 8) as u8)),

                _ => continue,
            };
            state.set_attribute(change);
        }
    }

    fn execute_osc(&mut self, state: &mut TerminalState) {
        // Parse OSC: "code;text"
        let payload = String::from_utf8_lossy(&self.osc_string);
        if let Some((code, text)) = payload.split_once(';') {
            match code {
                // Set title
                "0" | "1" | "2" => {
                    state.title.clear();
                    state.title.push_str(text);
                }
                _ => tracing::debug!("Ignoring OSC {}", code),
            }
        }
        self.osc_string.clear();
    }
}

/// `5;n` (256 colors) or `2;r;g;b` (RGB) after SGR 38 / 48
/// Color for SGR 38/48, from `:` subparameters or the following `;` parameters
fn sgr_color(
    subs: &[u16],
    iter: &mut impl Iterator<Item = (usize, u16)>,
) -> Option<Color> {
    if !subs.is_empty() {
        return colon_color(subs);
    }
    extended_color(&mut iter.map(|(_, param)| param))
}

/// `5:n`, `2:colorspace:r:g:b` or `2:r:g:b`
fn colon_color(subs: &[u16]) -> Option<Color> {
    let channel = |value: u16| value.min(255) as u8;
    match *subs {
        [5, n, ..] => Some(Color::Indexed(channel(n))),
        [2, _, r, g, b, ..] | [2, r, g, b] => Some(Color::Rgb(channel(r), channel(g), channel(b))),
        _ => None,
    }
}

fn extended_color(iter: &mut impl Iterator<Item = u16>) -> Option<Color> {
    match iter.next()? {
        5 => iter.next().map(|n| Color::Indexed(n.min(255) as u8)),
        2 => {
            let r = iter.next().unwrap_or(0).min(255) as u8;
            let g = iter.next().unwrap_or(0).min(255) as u8;
            let b = iter.next().unwrap_or(0).min(255) as u8;
            Some(Color::Rgb(r, g, b))
        }
        _ => None,
    }
}

/// Incremental UTF-8 assembly
#[derive(Default)]
struct Utf8Decoder {
    buf: [u8; 4],
    len: usize,
    need: usize,
}

enum Utf8Step {
    Pending,
    Char(char),
    /// Not a valid sequence; the bytes so far are dropped
    Invalid,
    /// The byte is not a continuation; it still has to be processed
    Interrupted,
}

impl Utf8Decoder {
    fn is_pending(&self) -> bool {
        self.len > 0
    }

    fn push(&mut self, byte: u8) -> Utf8Step {
        if self.len == 0 {
            self.need = match byte {
                0xC2..=0xDF => 2,
                0xE0..=0xEF => 3,
                0xF0..=0xF4 => 4,
                _ => return Utf8Step::Invalid,
            };
            self.buf[0] = byte;
            self.len = 1;
            return Utf8Step::Pending;
        }

        if byte & 0xC0 != 0x80 {
            self.len = 0;
            return Utf8Step::Interrupted;
        }

        self.buf[self.len] = byte;
        self.len += 1;
        if self.len < self.need {
            return Utf8Step::Pending;
        }

        let len = self.len;
        self.len = 0;
        match std::str::from_utf8(&self.buf[..len]) {
            Ok(s) => s.chars().next().map_or(Utf8Step::Invalid, Utf8Step::Char),
            // Overlong forms and surrogates
            Err(_) => Utf8Step::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut VtParser, state: &mut TerminalState, bytes: &[u8]) -> Vec<Signal> {
        bytes
            .iter()
            .filter_map(|byte| parser.feed(*byte, state))
            .collect()
    }

    fn setup() -> (VtParser, TerminalState) {
        (VtParser::new(), TerminalState::new(24, 80).unwrap())
    }

    fn row_text(state: &TerminalState, row: usize) -> String {
        state.active_screen().rows[row].text().trim_end().to_string()
    }

    #[test]
    fn test_cursor_movement() {
        let (mut parser, mut state) = setup();

        // Move to position (5, 10)
        feed(&mut parser, &mut state, b"\x1b[5;10H");

        assert_eq!(state.active_cursor().row, 4);
        assert_eq!(state.active_cursor().col, 9);
    }

    #[test]
    fn test_cursor_position_split_across_feeds() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"\x1b");
        feed(&mut parser, &mut state, b"[5;1");
        feed(&mut parser, &mut state, b"0H");
        assert_eq!(state.active_cursor().row, 4);
        assert_eq!(state.active_cursor().col, 9);
    }

    #[test]
    fn test_missing_params_use_defaults() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"\x1b[10;10H\x1b[;5H");
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (0, 4));
        feed(&mut parser, &mut state, b"\x1b[0B\x1b[C");
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (1, 5));
        feed(&mut parser, &mut state, b"\x1b[999;999H");
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (23, 79));
    }

    #[test]
    fn test_sgr_colors() {
        let (mut parser, mut state) = setup();

        // Set red foreground
        feed(&mut parser, &mut state, b"\x1b[31m");
        assert_eq!(state.current_attrs.fg, Color::Indexed(1));

        feed(&mut parser, &mut state, b"\x1b[1;4;38;5;200;48;2;1;2;3m");
        assert_eq!(state.current_attrs.fg, Color::Indexed(200));
        assert_eq!(state.current_attrs.bg, Color::Rgb(1, 2, 3));
        assert!(state.current_attrs.flags.contains(AttrFlags::BOLD | AttrFlags::UNDERLINE));

        feed(&mut parser, &mut state, b"\x1b[22;97m");
        assert!(!state.current_attrs.flags.contains(AttrFlags::BOLD));
        assert_eq!(state.current_attrs.fg, Color::Indexed(15));

        feed(&mut parser, &mut state, b"\x1b[m");
        assert_eq!(state.current_attrs, Default::default());
    }

    #[test]
    fn test_sgr_colon_subparameters() {
        let (mut parser, mut state) = setup();

        // Curly underline is an underline, not underline plus italic
        feed(&mut parser, &mut state, b"\x1b[4:3m");
        assert_eq!(state.current_attrs.flags, AttrFlags::UNDERLINE);
        feed(&mut parser, &mut state, b"\x1b[4:0m");
        assert!(state.current_attrs.flags.is_empty());

        feed(&mut parser, &mut state, b"\x1b[38:2::10:20:30;1m");
        assert_eq!(state.current_attrs.fg, Color::Rgb(10, 20, 30));
        assert_eq!(state.current_attrs.flags, AttrFlags::BOLD);

        feed(&mut parser, &mut state, b"\x1b[0;48:5:123;38:2:1:2:3m");
        assert_eq!(state.current_attrs.bg, Color::Indexed(123));
        assert_eq!(state.current_attrs.fg, Color::Rgb(1, 2, 3));
        assert!(state.current_attrs.flags.is_empty());

        // Subparameters do not shift the parameters after them
        feed(&mut parser, &mut state, b"\x1b[0;58:2::9:9:9;3m");
        assert_eq!(state.current_attrs.flags, AttrFlags::ITALIC);
        assert_eq!(state.current_attrs.fg, Color::Default);
    }

    #[test]
    fn test_bell_is_a_signal_without_screen_change() {
        let (mut parser, mut state) = setup();
        state.active_screen_mut().clear_dirty();
        let signals = feed(&mut parser, &mut state, b"\x07\x07");
        assert_eq!(signals, vec![Signal::Bell, Signal::Bell]);
        assert!(!state.active_screen().is_dirty());
    }

    #[test]
    fn test_device_status_reports() {
        let (mut parser, mut state) = setup();
        let signals = feed(&mut parser, &mut state, b"\x1b[3;7H\x1b[6n\x1b[5n\x1b[c\x1b[>c");
        assert_eq!(
            signals,
            vec![
                Signal::Respond(Response::CursorPosition(3, 7)),
                Signal::Respond(Response::Status),
                Signal::Respond(Response::DeviceAttributes),
                Signal::Respond(Response::SecondaryDeviceAttributes),
            ]
        );
        assert_eq!(Response::CursorPosition(3, 7).to_bytes(), b"\x1b[3;7R");
    }

    #[test]
    fn test_malformed_csi_is_discarded() {
        let (mut parser, mut state) = setup();
        // '?' after a parameter is invalid: skipped up to the final byte
        feed(&mut parser, &mut state, b"\x1b[1;2?Hab");
        assert_eq!(row_text(&state, 0), "ab");
        assert_eq!(state.active_cursor().col, 2);

        // Unknown final byte
        feed(&mut parser, &mut state, b"\x1b[5ycd");
        assert_eq!(row_text(&state, 0), "abcd");
    }

    #[test]
    fn test_cancel_aborts_sequence() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"\x1b[5\x18A");
        assert_eq!(row_text(&state, 0), "A");
        assert_eq!(state.active_cursor().row, 0);
    }

    #[test]
    fn test_controls_inside_csi_are_executed() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"abc\x1b[\r1Cx");
        assert_eq!(row_text(&state, 0), "axc");
    }

    #[test]
    fn test_param_count_is_capped() {
        let (mut parser, mut state) = setup();
        let mut seq = b"\x1b[".to_vec();
        for _ in 0..100 {
            seq.extend_from_slice(b"65535;");
        }
        seq.extend_from_slice(b"99999999m");
        feed(&mut parser, &mut state, &seq);
        assert!(parser.params.len() <= MAX_PARAMS);
        feed(&mut parser, &mut state, b"ok");
        assert_eq!(row_text(&state, 0), "ok");
    }

    #[test]
    fn test_osc_title() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"\x1b]0;hello\x07x");
        assert_eq!(state.title, "hello");
        feed(&mut parser, &mut state, "\x1b]2;ünï\x1b\\y".as_bytes());
        assert_eq!(state.title, "ünï");
        assert_eq!(row_text(&state, 0), "xy");
    }

    #[test]
    fn test_bel_terminating_osc_is_not_a_bell() {
        let (mut parser, mut state) = setup();
        let signals = feed(&mut parser, &mut state, b"\x1b]2;t\x07");
        assert!(signals.is_empty());
    }

    #[test]
    fn test_dcs_payload_is_ignored() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"\x1bPq#0;2;0;0;0\x1b\\x");
        assert_eq!(row_text(&state, 0), "x");
    }

    #[test]
    fn test_utf8_split_across_feeds() {
        let (mut parser, mut state) = setup();
        let bytes = "é日".as_bytes();
        for byte in bytes {
            feed(&mut parser, &mut state, &[*byte]);
        }
        let row = &state.active_screen().rows[0];
        assert_eq!(row.cells[0].ch, 'é');
        assert_eq!(row.cells[1].ch, '日');
        assert_eq!(state.active_cursor().col, 3);
    }

    #[test]
    fn test_invalid_utf8_becomes_replacement() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"\xff\xe6\x97a\xc0\x80");
        let row = &state.active_screen().rows[0];
        assert_eq!(row.cells[0].ch, REPLACEMENT_CHARACTER);
        assert_eq!(row.cells[1].ch, REPLACEMENT_CHARACTER);
        assert_eq!(row.cells[2].ch, 'a');
        assert_eq!(row.cells[3].ch, REPLACEMENT_CHARACTER);
    }

    #[test]
    fn test_line_drawing_charset() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"\x1b(0lqk\x1b(Bq");
        assert_eq!(row_text(&state, 0), "┌─┐q");

        feed(&mut parser, &mut state, b"\r\n\x1b)0a\x0eq\x0fq");
        assert_eq!(row_text(&state, 1), "a─q");
    }

    #[test]
    fn test_private_modes() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"\x1b[?25l\x1b[?1;2004h");
        assert!(!state.modes.cursor_visible);
        assert!(state.modes.application_cursor);
        assert!(state.modes.bracketed_paste);
        feed(&mut parser, &mut state, b"\x1b[?1049h");
        assert!(state.using_alternate);
        feed(&mut parser, &mut state, b"\x1b[?1049l");
        assert!(!state.using_alternate);
    }

    #[test]
    fn test_linefeed_newline_mode() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"ab\n");
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (1, 2));
        feed(&mut parser, &mut state, b"\x1b[20hcd\n");
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (2, 0));
    }

    #[test]
    fn test_full_reset() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"\x1b[31mabc\x1b[?25l\x1b(0\x1bc");
        assert_eq!(row_text(&state, 0), "");
        assert_eq!(state.current_attrs, Default::default());
        assert!(state.modes.cursor_visible);
        feed(&mut parser, &mut state, b"q");
        assert_eq!(row_text(&state, 0), "q");
    }

    #[test]
    fn test_repeat_and_erase_chars() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"-\x1b[4b");
        assert_eq!(row_text(&state, 0), "-----");
        feed(&mut parser, &mut state, b"\x1b[1G\x1b[2X");
        assert_eq!(row_text(&state, 0), "  ---");
    }

    #[test]
    fn test_cursor_style() {
        let (mut parser, mut state) = setup();
        feed(&mut parser, &mut state, b"\x1b[5 q");
        assert_eq!(state.active_cursor().shape, CursorShape::BlinkingBar);
    }
}
