//! Character set designation and translation
//!
//! Tracks the G0/G1 slots selected with `ESC ( F` / `ESC ) F` and the
//! SO/SI shift between them. Only 7-bit sets are supported.

/// A designatable 94-character set
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Charset {
    /// US ASCII (`B`)
    #[default]
    Ascii,
    /// United Kingdom (`A`), `#` becomes a pound sign
    Uk,
    /// DEC Special Graphics (`0`), line drawing
    DecSpecialGraphics,
}

impl Charset {
    /// Map a designation final byte to a charset
    pub fn from_final(byte: u8) -> Option<Self> {
        match byte {
            b'B' => Some(Charset::Ascii),
            b'A' => Some(Charset::Uk),
            b'0' => Some(Charset::DecSpecialGraphics),
            _ => None,
        }
    }

    pub fn translate(self, ch: char) -> char {
        match self {
            Charset::Ascii => ch,
            Charset::Uk => {
                if ch == '#' {
                    '\u{00A3}'
                } else {
                    ch
                }
            }
            Charset::DecSpecialGraphics => dec_special_graphics(ch),
        }
    }
}

/// Which slot is invoked into GL
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CharsetSlot {
    #[default]
    G0,
    G1,
}

/// Designated sets plus the active slot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CharsetState {
    pub g0: Charset,
    pub g1: Charset,
    pub active: CharsetSlot,
}

impl CharsetState {
    pub fn designate(&mut self, slot: CharsetSlot, charset: Charset) {
        match slot {
            CharsetSlot::G0 => self.g0 = charset,
            CharsetSlot::G1 => self.g1 = charset,
        }
    }

    /// SO / SI
    pub fn shift(&mut self, slot: CharsetSlot) {
        self.active = slot;
    }

    pub fn active_charset(&self) -> Charset {
        match self.active {
            CharsetSlot::G0 => self.g0,
            CharsetSlot::G1 => self.g1,
        }
    }

    /// Translate a printable character through the active set
    pub fn translate(&self, ch: char) -> char {
        if ch.is_ascii() {
            self.active_charset().translate(ch)
        } else {
            ch
        }
    }
}

/// DEC Special Graphics, 0x60..=0x7E mapped to their Unicode equivalents.
fn dec_special_graphics(ch: char) -> char {
    match ch {
        '`' => '\u{25C6}', // ◆
        'a' => '\u{2592}', // ▒
        'b' => '\u{2409}', // ␉
        'c' => '\u{240C}', // ␌
        'd' => '\u{240D}', // ␍
        'e' => '\u{240A}', // ␊
        'f' => '\u{00B0}', // °
        'g' => '\u{00B1}', // ±
        'h' => '\u{2424}', // ␤
        'i' => '\u{240B}', // ␋
        'j' => '\u{2518}', // ┘
        'k' => '\u{2510}', // ┐
        'l' => '\u{250C}', // ┌
        'm' => '\u{2514}', // └
        'n' => '\u{253C}', // ┼
        'o' => '\u{23BA}', // ⎺
        'p' => '\u{23BB}', // ⎻
        'q' => '\u{2500}', // ─
        'r' => '\u{23BC}', // ⎼
        's' => '\u{23BD}', // ⎽
        't' => '\u{251C}', // ├
        'u' => '\u{2524}', // ┤
        'v' => '\u{2534}', // ┴
        'w' => '\u{252C}', // ┬
        'x' => '\u{2502}', // │
        'y' => '\u{2264}', // ≤
        'z' => '\u{2265}', // ≥
        '{' => '\u{03C0}', // π
        '|' => '\u{2260}', // ≠
        '}' => '\u{00A3}', // £
        '~' => '\u{00B7}', // ·
        _ => ch,
    }
}
