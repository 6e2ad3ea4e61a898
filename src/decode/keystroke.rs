//! Reassemble typed text from Linux evdev keyboard events.
//!
//! Keyboard-emulating sensors "type" their readings. Reading their evdev node
//! directly (instead of whatever has keyboard focus) gives one ordered stream
//! of key events; this decoder turns it back into lines.

/// `struct input_event` size: a `timeval` followed by type, code and value.
#[cfg(target_pointer_width = "64")]
pub const INPUT_EVENT_SIZE: usize = 24;
#[cfg(not(target_pointer_width = "64"))]
pub const INPUT_EVENT_SIZE: usize = 16;

const TIMEVAL_SIZE: usize = INPUT_EVENT_SIZE - 8;

const EV_KEY: u16 = 0x01;

const KEY_RELEASED: i32 = 0;
const KEY_PRESSED: i32 = 1;

const KEY_ENTER: u16 = 28;
const KEY_LEFTSHIFT: u16 = 42;
const KEY_RIGHTSHIFT: u16 = 54;
const KEY_CAPSLOCK: u16 = 58;
const KEY_KPENTER: u16 = 96;

/// Longest line kept before the buffer is treated as runaway input.
const MAX_LINE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub fn key(code: u16, value: i32) -> Self {
        Self {
            kind: EV_KEY,
            code,
            value,
        }
    }

    /// Parse one native-endian `input_event` record.
    pub fn parse(record: &[u8]) -> Option<Self> {
        let fields = record.get(TIMEVAL_SIZE..INPUT_EVENT_SIZE)?;
        Some(Self {
            kind: u16::from_ne_bytes([fields[0], fields[1]]),
            code: u16::from_ne_bytes([fields[2], fields[3]]),
            value: i32::from_ne_bytes([fields[4], fields[5], fields[6], fields[7]]),
        })
    }
}

/// Unshifted and shifted character for a key code (US layout).
fn key_chars(code: u16) -> Option<(char, char)> {
    const DIGITS: &[(char, char)] = &[
        ('1', '!'),
        ('2', '@'),
        ('3', '#'),
        ('4', '$'),
        ('5', '%'),
        ('6', '^'),
        ('7', '&'),
        ('8', '*'),
        ('9', '('),
        ('0', ')'),
        ('-', '_'),
        ('=', '+'),
    ];
    const ROW_Q: &str = "qwertyuiop";
    const ROW_A: &str = "asdfghjkl";
    const ROW_Z: &str = "zxcvbnm";

    let letter = |row: &str, first: u16| {
        row.chars()
            .nth(usize::from(code - first))
            .map(|c| (c, c.to_ascii_uppercase()))
    };

    match code {
        2..=13 => DIGITS.get(usize::from(code - 2)).copied(),
        15 => Some(('\t', '\t')),
        16..=25 => letter(ROW_Q, 16),
        26 => Some(('[', '{')),
        27 => Some((']', '}')),
        30..=38 => letter(ROW_A, 30),
        39 => Some((';', ':')),
        40 => Some(('\'', '"')),
        41 => Some(('`', '~')),
        43 => Some(('\\', '|')),
        44..=50 => letter(ROW_Z, 44),
        51 => Some((',', '<')),
        52 => Some(('.', '>')),
        53 => Some(('/', '?')),
        57 => Some((' ', ' ')),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct KeystrokeDecoder {
    left_shift: bool,
    right_shift: bool,
    caps_lock: bool,
    line: String,
}

impl KeystrokeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event; returns a completed line when Enter is pressed.
    pub fn feed(&mut self, event: InputEvent) -> Option<String> {
        if event.kind != EV_KEY {
            return None;
        }

        match (event.code, event.value) {
            (KEY_LEFTSHIFT, v) => self.left_shift = v != KEY_RELEASED,
            (KEY_RIGHTSHIFT, v) => self.right_shift = v != KEY_RELEASED,
            (KEY_CAPSLOCK, KEY_PRESSED) => self.caps_lock = !self.caps_lock,
            (KEY_ENTER | KEY_KPENTER, KEY_PRESSED) => {
                return Some(std::mem::take(&mut self.line));
            }
            // Autorepeat (2) is ignored: sensors never hold keys
            (code, KEY_PRESSED) => {
                if let Some((plain, shifted)) = key_chars(code) {
                    let shift = self.left_shift || self.right_shift;
                    let c = if plain.is_ascii_alphabetic() {
                        if shift != self.caps_lock { shifted } else { plain }
                    } else if shift {
                        shifted
                    } else {
                        plain
                    };
                    if self.line.len() >= MAX_LINE_LEN {
                        log::debug!("Discarding runaway keystroke buffer");
                        self.line.clear();
                    }
                    self.line.push(c);
                }
            }
            _ => {}
        }
        None
    }

    /// Feed a buffer of raw records, collecting completed lines.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        bytes
            .chunks_exact(INPUT_EVENT_SIZE)
            .filter_map(InputEvent::parse)
            .filter_map(|event| self.feed(event))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Key codes (with shift flag) for typing `text`, US layout.
    fn keys_for(text: &str) -> Vec<(u16, bool)> {
        text.chars()
            .map(|c| {
                (2..=57u16)
                    .find_map(|code| match key_chars(code) {
                        Some((plain, _)) if plain == c => Some((code, false)),
                        Some((_, shifted)) if shifted == c => Some((code, true)),
                        _ => None,
                    })
                    .unwrap_or_else(|| panic!("no key for {:?}", c))
            })
            .collect()
    }

    fn type_line(decoder: &mut KeystrokeDecoder, text: &str) -> Option<String> {
        for (code, shift) in keys_for(text) {
            if shift {
                decoder.feed(InputEvent::key(KEY_LEFTSHIFT, KEY_PRESSED));
            }
            decoder.feed(InputEvent::key(code, KEY_PRESSED));
            decoder.feed(InputEvent::key(code, KEY_RELEASED));
            if shift {
                decoder.feed(InputEvent::key(KEY_LEFTSHIFT, KEY_RELEASED));
            }
        }
        decoder.feed(InputEvent::key(KEY_ENTER, KEY_PRESSED))
    }

    #[test]
    fn test_types_reading_line() {
        let mut decoder = KeystrokeDecoder::new();
        assert_eq!(
            type_line(&mut decoder, "29.54[C]39.58[%RH]1S").as_deref(),
            Some("29.54[C]39.58[%RH]1S")
        );
        assert_eq!(
            type_line(&mut decoder, "-3.20[C]40.38[%RH]2S").as_deref(),
            Some("-3.20[C]40.38[%RH]2S")
        );
    }

    #[test]
    fn test_caps_lock_inverts_letters() {
        let mut decoder = KeystrokeDecoder::new();
        decoder.feed(InputEvent::key(KEY_CAPSLOCK, KEY_PRESSED));
        decoder.feed(InputEvent::key(KEY_CAPSLOCK, KEY_RELEASED));
        // 's' key without shift, caps on
        decoder.feed(InputEvent::key(31, KEY_PRESSED));
        // '5' key is unaffected by caps lock
        decoder.feed(InputEvent::key(6, KEY_PRESSED));
        assert_eq!(
            decoder.feed(InputEvent::key(KEY_ENTER, KEY_PRESSED)).as_deref(),
            Some("S5")
        );
    }

    #[test]
    fn test_ignores_non_key_events_and_releases() {
        let mut decoder = KeystrokeDecoder::new();
        assert_eq!(decoder.feed(InputEvent { kind: 0x04, code: 4, value: 7 }), None);
        assert_eq!(decoder.feed(InputEvent::key(KEY_ENTER, KEY_RELEASED)), None);
    }

    #[test]
    fn test_parse_raw_records() {
        let mut bytes = Vec::new();
        for (code, value) in [(2u16, 1i32), (2, 0), (KEY_ENTER, 1)] {
            bytes.extend_from_slice(&[0u8; TIMEVAL_SIZE]);
            bytes.extend_from_slice(&EV_KEY.to_ne_bytes());
            bytes.extend_from_slice(&code.to_ne_bytes());
            bytes.extend_from_slice(&value.to_ne_bytes());
        }
        let mut decoder = KeystrokeDecoder::new();
        assert_eq!(decoder.feed_bytes(&bytes), vec!["1".to_string()]);
    }
}
