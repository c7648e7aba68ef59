//! Canonical key codes and conversion to and from platform keys.
//!
//! A [`KeyCode`] is what gets persisted: `char:<c>` for keys that type a
//! printable character, `key:<name>` for everything else, and
//! `combo:<mods>+<key>` for modifier chords. The string form only exists at
//! serialization boundaries; everywhere else the tagged enum is used.
//!
//! Platform keys are [`rdev::Key`] values. [`encode`] and [`decode`] are
//! inverse for every key the listener can report.

use std::fmt;
use std::str::FromStr;

use rdev::Key;
use serde::{Deserialize, Serialize};

use crate::error::{KsrError, Result};

/// Modifier part of a key combination.
///
/// Variant order is the canonical (alphabetical) order used when a combo is
/// written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Modifier {
    Alt,
    Cmd,
    Ctrl,
    Shift,
}

impl Modifier {
    /// Parse a modifier name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "alt" | "option" => Some(Modifier::Alt),
            "cmd" | "command" | "win" | "windows" | "super" | "meta" => Some(Modifier::Cmd),
            "ctrl" | "control" => Some(Modifier::Ctrl),
            "shift" => Some(Modifier::Shift),
            _ => None,
        }
    }

    /// Lowercase name used in `combo:` codes and scripts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Modifier::Alt => "alt",
            Modifier::Cmd => "cmd",
            Modifier::Ctrl => "ctrl",
            Modifier::Shift => "shift",
        }
    }

    /// Title-cased name used in hotkey specs and display strings.
    pub fn title(&self) -> &'static str {
        match self {
            Modifier::Alt => "Alt",
            Modifier::Cmd => "Cmd",
            Modifier::Ctrl => "Ctrl",
            Modifier::Shift => "Shift",
        }
    }

    /// Platform key pressed to hold this modifier.
    pub fn native(&self) -> Key {
        match self {
            Modifier::Alt => Key::Alt,
            Modifier::Cmd => Key::MetaLeft,
            Modifier::Ctrl => Key::ControlLeft,
            Modifier::Shift => Key::ShiftLeft,
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Canonical key code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyCode {
    /// Key identified by the character it types. Normally a single
    /// character; script import keeps unrecognized words verbatim.
    Char(String),
    /// Non-printing key identified by its canonical name (`space`, `f5`, `ctrl_l`).
    Named(String),
    /// Modifiers held around one terminal key. Modifiers are sorted and
    /// deduplicated; the terminal is never itself a combo.
    Combo {
        modifiers: Vec<Modifier>,
        terminal: Box<KeyCode>,
    },
}

/// Platform keys to press for one key code: modifiers first, then `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct Keystroke {
    pub modifiers: Vec<Key>,
    pub key: Key,
}

impl Keystroke {
    pub fn single(key: Key) -> Self {
        Self {
            modifiers: Vec::new(),
            key,
        }
    }

    fn shifted(key: Key) -> Self {
        Self {
            modifiers: vec![Key::ShiftLeft],
            key,
        }
    }
}

// (canonical name, platform key, display name)
const NAMED_KEYS: &[(&str, Key, &str)] = &[
    ("alt_l", Key::Alt, "Left Alt"),
    ("alt_gr", Key::AltGr, "Alt Gr"),
    ("backspace", Key::Backspace, "Backspace"),
    ("caps_lock", Key::CapsLock, "Caps Lock"),
    ("cmd_l", Key::MetaLeft, "Left Cmd"),
    ("cmd_r", Key::MetaRight, "Right Cmd"),
    ("ctrl_l", Key::ControlLeft, "Left Ctrl"),
    ("ctrl_r", Key::ControlRight, "Right Ctrl"),
    ("delete", Key::Delete, "Delete"),
    ("down", Key::DownArrow, "Down Arrow"),
    ("end", Key::End, "End"),
    ("enter", Key::Return, "Enter"),
    ("esc", Key::Escape, "Escape"),
    ("f1", Key::F1, "F1"),
    ("f2", Key::F2, "F2"),
    ("f3", Key::F3, "F3"),
    ("f4", Key::F4, "F4"),
    ("f5", Key::F5, "F5"),
    ("f6", Key::F6, "F6"),
    ("f7", Key::F7, "F7"),
    ("f8", Key::F8, "F8"),
    ("f9", Key::F9, "F9"),
    ("f10", Key::F10, "F10"),
    ("f11", Key::F11, "F11"),
    ("f12", Key::F12, "F12"),
    ("fn", Key::Function, "Fn"),
    ("home", Key::Home, "Home"),
    ("insert", Key::Insert, "Insert"),
    ("intl_backslash", Key::IntlBackslash, "Intl Backslash"),
    ("left", Key::LeftArrow, "Left Arrow"),
    ("num_0", Key::Kp0, "Numpad 0"),
    ("num_1", Key::Kp1, "Numpad 1"),
    ("num_2", Key::Kp2, "Numpad 2"),
    ("num_3", Key::Kp3, "Numpad 3"),
    ("num_4", Key::Kp4, "Numpad 4"),
    ("num_5", Key::Kp5, "Numpad 5"),
    ("num_6", Key::Kp6, "Numpad 6"),
    ("num_7", Key::Kp7, "Numpad 7"),
    ("num_8", Key::Kp8, "Numpad 8"),
    ("num_9", Key::Kp9, "Numpad 9"),
    ("num_delete", Key::KpDelete, "Numpad Delete"),
    ("num_divide", Key::KpDivide, "Numpad /"),
    ("num_enter", Key::KpReturn, "Numpad Enter"),
    ("num_lock", Key::NumLock, "Num Lock"),
    ("num_minus", Key::KpMinus, "Numpad -"),
    ("num_multiply", Key::KpMultiply, "Numpad *"),
    ("num_plus", Key::KpPlus, "Numpad +"),
    ("page_down", Key::PageDown, "Page Down"),
    ("page_up", Key::PageUp, "Page Up"),
    ("pause", Key::Pause, "Pause"),
    ("print_screen", Key::PrintScreen, "Print Screen"),
    ("right", Key::RightArrow, "Right Arrow"),
    ("scroll_lock", Key::ScrollLock, "Scroll Lock"),
    ("shift_l", Key::ShiftLeft, "Left Shift"),
    ("shift_r", Key::ShiftRight, "Right Shift"),
    ("space", Key::Space, "Space"),
    ("tab", Key::Tab, "Tab"),
    ("up", Key::UpArrow, "Up Arrow"),
];

// Unshifted US layout.
const CHAR_KEYS: &[(char, Key)] = &[
    ('a', Key::KeyA),
    ('b', Key::KeyB),
    ('c', Key::KeyC),
    ('d', Key::KeyD),
    ('e', Key::KeyE),
    ('f', Key::KeyF),
    ('g', Key::KeyG),
    ('h', Key::KeyH),
    ('i', Key::KeyI),
    ('j', Key::KeyJ),
    ('k', Key::KeyK),
    ('l', Key::KeyL),
    ('m', Key::KeyM),
    ('n', Key::KeyN),
    ('o', Key::KeyO),
    ('p', Key::KeyP),
    ('q', Key::KeyQ),
    ('r', Key::KeyR),
    ('s', Key::KeyS),
    ('t', Key::KeyT),
    ('u', Key::KeyU),
    ('v', Key::KeyV),
    ('w', Key::KeyW),
    ('x', Key::KeyX),
    ('y', Key::KeyY),
    ('z', Key::KeyZ),
    ('0', Key::Num0),
    ('1', Key::Num1),
    ('2', Key::Num2),
    ('3', Key::Num3),
    ('4', Key::Num4),
    ('5', Key::Num5),
    ('6', Key::Num6),
    ('7', Key::Num7),
    ('8', Key::Num8),
    ('9', Key::Num9),
    ('`', Key::BackQuote),
    ('-', Key::Minus),
    ('=', Key::Equal),
    ('[', Key::LeftBracket),
    (']', Key::RightBracket),
    ('\\', Key::BackSlash),
    (';', Key::SemiColon),
    ('\'', Key::Quote),
    (',', Key::Comma),
    ('.', Key::Dot),
    ('/', Key::Slash),
];

// Shifted symbol -> unshifted character on the same key.
const SHIFTED_CHARS: &[(char, char)] = &[
    ('~', '`'),
    ('!', '1'),
    ('@', '2'),
    ('#', '3'),
    ('$', '4'),
    ('%', '5'),
    ('^', '6'),
    ('&', '7'),
    ('*', '8'),
    ('(', '9'),
    (')', '0'),
    ('_', '-'),
    ('+', '='),
    ('{', '['),
    ('}', ']'),
    ('|', '\\'),
    (':', ';'),
    ('"', '\''),
    ('<', ','),
    ('>', '.'),
    ('?', '/'),
];

const VK_PREFIX: &str = "vk_";

/// Convert a platform key into its canonical code.
///
/// Keys that type a printable character map to `char:<lowercase char>`,
/// all others to `key:<name>`.
pub fn encode(key: Key) -> KeyCode {
    if let Some(c) = char_for_key(key) {
        return KeyCode::Char(c.to_string());
    }
    if let Some((name, _, _)) = NAMED_KEYS.iter().find(|(_, k, _)| *k == key) {
        return KeyCode::Named((*name).to_string());
    }
    match key {
        Key::Unknown(code) => KeyCode::Named(format!("{VK_PREFIX}{code}")),
        other => KeyCode::Named(format!("{other:?}").to_lowercase()),
    }
}

/// Decode a canonical code string into the platform keys that produce it.
pub fn decode(code: &str) -> Result<Keystroke> {
    code.parse::<KeyCode>()?.keystroke()
}

/// Human-readable name of a platform key.
pub fn display_name(key: Key) -> String {
    if let Some(c) = char_for_key(key) {
        return c.to_uppercase().to_string();
    }
    if let Some((_, _, display)) = NAMED_KEYS.iter().find(|(_, k, _)| *k == key) {
        return (*display).to_string();
    }
    match key {
        Key::Unknown(code) => format!("Key {code}"),
        other => format!("{other:?}"),
    }
}

fn char_for_key(key: Key) -> Option<char> {
    CHAR_KEYS.iter().find(|(_, k)| *k == key).map(|(c, _)| *c)
}

fn key_for_char(c: char) -> Option<Keystroke> {
    if c == ' ' {
        return Some(Keystroke::single(Key::Space));
    }
    if let Some((_, key)) = CHAR_KEYS.iter().find(|(ch, _)| *ch == c) {
        return Some(Keystroke::single(*key));
    }
    if c.is_ascii_uppercase() {
        return key_for_char(c.to_ascii_lowercase()).map(|k| Keystroke::shifted(k.key));
    }
    SHIFTED_CHARS
        .iter()
        .find(|(shifted, _)| *shifted == c)
        .and_then(|(_, base)| key_for_char(*base))
        .map(|k| Keystroke::shifted(k.key))
}

fn is_function_key_name(name: &str) -> bool {
    name.strip_prefix('f')
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

fn vk_code(name: &str) -> Option<u32> {
    name.strip_prefix(VK_PREFIX)?.parse().ok()
}

/// Resolve a user-facing key name to its canonical `key:` name.
///
/// Accepts aliases (`escape`, `return`, `page-up`, `ctrl`, ...) and any
/// `f<number>` function key. Returns `None` for names outside the vocabulary.
pub fn canonical_name(name: &str) -> Option<String> {
    let cleaned = name.trim().to_lowercase().replace(['-', ' '], "_");
    let resolved = match cleaned.as_str() {
        "escape" => "esc",
        "return" => "enter",
        "pageup" | "pgup" => "page_up",
        "pagedown" | "pgdn" => "page_down",
        "arrowup" | "up_arrow" => "up",
        "arrowdown" | "down_arrow" => "down",
        "arrowleft" | "left_arrow" => "left",
        "arrowright" | "right_arrow" => "right",
        "alt" | "option" => "alt_l",
        "altgr" => "alt_gr",
        "ctrl" | "control" => "ctrl_l",
        "shift" => "shift_l",
        "cmd" | "win" | "windows" | "super" | "meta" => "cmd_l",
        "capslock" => "caps_lock",
        "numlock" => "num_lock",
        "scrolllock" => "scroll_lock",
        "printscreen" | "prtsc" => "print_screen",
        "ins" => "insert",
        "del" => "delete",
        other => other,
    };
    let known = NAMED_KEYS.iter().any(|(n, _, _)| *n == resolved)
        || is_function_key_name(resolved)
        || vk_code(resolved).is_some();
    known.then(|| resolved.to_string())
}

fn terminal_from_part(part: &str) -> Option<KeyCode> {
    let mut chars = part.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(KeyCode::Char(c.to_lowercase().to_string())),
        _ => canonical_name(part).map(KeyCode::Named),
    }
}

/// Parse `mod+mod+key` into a canonical combo.
///
/// Every part must be a known modifier, except exactly one terminal part
/// which must be a single character or a known key name.
pub(crate) fn parse_combo(text: &str) -> std::result::Result<KeyCode, String> {
    let mut modifiers = Vec::new();
    let mut terminal: Option<KeyCode> = None;

    for part in text.split('+').map(str::trim) {
        if part.is_empty() {
            return Err("empty part".to_string());
        }
        if let Some(modifier) = Modifier::parse(part) {
            modifiers.push(modifier);
            continue;
        }
        if terminal.is_some() {
            return Err(format!("more than one non-modifier key ('{part}')"));
        }
        terminal =
            Some(terminal_from_part(part).ok_or_else(|| format!("unrecognized key '{part}'"))?);
    }

    let terminal = terminal.ok_or_else(|| "no terminal key".to_string())?;
    KeyCode::combo(modifiers, terminal)
}

impl KeyCode {
    /// Build a canonical combo: modifiers sorted and deduplicated.
    pub fn combo(
        mut modifiers: Vec<Modifier>,
        terminal: KeyCode,
    ) -> std::result::Result<KeyCode, String> {
        if matches!(terminal, KeyCode::Combo { .. }) {
            return Err("terminal key cannot be a combination".to_string());
        }
        modifiers.sort();
        modifiers.dedup();
        if modifiers.is_empty() {
            return Err("no modifier".to_string());
        }
        Ok(KeyCode::Combo {
            modifiers,
            terminal: Box::new(terminal),
        })
    }

    /// Platform keys for this code.
    pub fn keystroke(&self) -> Result<Keystroke> {
        match self {
            KeyCode::Char(text) => {
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => key_for_char(c).ok_or_else(|| {
                        KsrError::unknown_key(self.to_string(), "no key types this character")
                    }),
                    _ => Err(KsrError::unknown_key(
                        self.to_string(),
                        "not a single character",
                    )),
                }
            }
            KeyCode::Named(name) => {
                if let Some(code) = vk_code(name) {
                    return Ok(Keystroke::single(Key::Unknown(code)));
                }
                canonical_name(name)
                    .and_then(|n| NAMED_KEYS.iter().find(|(known, _, _)| *known == n))
                    .map(|(_, key, _)| Keystroke::single(*key))
                    .ok_or_else(|| {
                        KsrError::unknown_key(self.to_string(), "no platform key with this name")
                    })
            }
            KeyCode::Combo {
                modifiers,
                terminal,
            } => {
                let inner = terminal.keystroke()?;
                let mut keys: Vec<Key> = modifiers.iter().map(Modifier::native).collect();
                for extra in inner.modifiers {
                    if !keys.contains(&extra) {
                        keys.push(extra);
                    }
                }
                Ok(Keystroke {
                    modifiers: keys,
                    key: inner.key,
                })
            }
        }
    }

    /// Operand text for a `KEY:` script line that parses back to this code.
    pub fn script_spec(&self) -> String {
        match self {
            KeyCode::Char(text) => text.clone(),
            KeyCode::Named(name) => name.clone(),
            KeyCode::Combo {
                modifiers,
                terminal,
            } => {
                let mut parts: Vec<String> =
                    modifiers.iter().map(|m| m.as_str().to_string()).collect();
                parts.push(terminal.script_spec());
                parts.join("+")
            }
        }
    }

    /// Human-readable label (`A`, `Page Up`, `Ctrl+Shift+S`).
    pub fn display_name(&self) -> String {
        match self {
            KeyCode::Char(text) => text.to_uppercase(),
            KeyCode::Named(name) => NAMED_KEYS
                .iter()
                .find(|(n, _, _)| n == name)
                .map(|(_, _, display)| (*display).to_string())
                .unwrap_or_else(|| title_case(name)),
            KeyCode::Combo {
                modifiers,
                terminal,
            } => {
                let mut parts: Vec<String> =
                    modifiers.iter().map(|m| m.title().to_string()).collect();
                parts.push(terminal.display_name());
                parts.join("+")
            }
        }
    }
}

fn title_case(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyCode::Char(text) => write!(f, "char:{text}"),
            KeyCode::Named(name) => write!(f, "key:{name}"),
            KeyCode::Combo { .. } => write!(f, "combo:{}", self.script_spec()),
        }
    }
}

impl FromStr for KeyCode {
    type Err = KsrError;

    fn from_str(code: &str) -> Result<Self> {
        if let Some(text) = code.strip_prefix("char:") {
            if text.is_empty() {
                return Err(KsrError::unknown_key(code, "empty character"));
            }
            return Ok(KeyCode::Char(text.to_string()));
        }
        if let Some(name) = code.strip_prefix("key:") {
            if name.trim().is_empty() {
                return Err(KsrError::unknown_key(code, "empty key name"));
            }
            return Ok(KeyCode::Named(name.trim().to_lowercase()));
        }
        if let Some(combo) = code.strip_prefix("combo:") {
            return parse_combo(combo)
                .map_err(|reason| KsrError::invalid_key_combination(code, reason));
        }
        Err(KsrError::unknown_key(
            code,
            "expected a char:, key: or combo: prefix",
        ))
    }
}

impl TryFrom<String> for KeyCode {
    type Error = KsrError;

    fn try_from(code: String) -> Result<Self> {
        code.parse()
    }
}

impl From<KeyCode> for String {
    fn from(code: KeyCode) -> Self {
        code.to_string()
    }
}

impl From<Key> for KeyCode {
    fn from(key: Key) -> Self {
        encode(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_listener_keys() -> Vec<Key> {
        let mut keys: Vec<Key> = CHAR_KEYS.iter().map(|(_, k)| *k).collect();
        keys.extend(NAMED_KEYS.iter().map(|(_, k, _)| *k));
        keys.push(Key::Unknown(187));
        keys
    }

    #[test]
    fn test_encode_decode_roundtrip_for_every_key() {
        for key in all_listener_keys() {
            let code = encode(key);
            let decoded = decode(&code.to_string()).unwrap();
            assert_eq!(decoded, Keystroke::single(key), "round-trip of {code}");
        }
    }

    #[test]
    fn test_encode_shapes() {
        assert_eq!(encode(Key::KeyA).to_string(), "char:a");
        assert_eq!(encode(Key::Num7).to_string(), "char:7");
        assert_eq!(encode(Key::Space).to_string(), "key:space");
        assert_eq!(encode(Key::Escape).to_string(), "key:esc");
        assert_eq!(encode(Key::Kp7).to_string(), "key:num_7");
        assert_eq!(encode(Key::Unknown(42)).to_string(), "key:vk_42");
    }

    #[test]
    fn test_combo_is_canonicalized() {
        let code: KeyCode = "combo:shift+Ctrl+A".parse().unwrap();
        assert_eq!(code.to_string(), "combo:ctrl+shift+a");

        let code: KeyCode = "combo:ctrl+alt+ctrl+delete".parse().unwrap();
        assert_eq!(code.to_string(), "combo:alt+ctrl+delete");
    }

    #[test]
    fn test_malformed_combo_is_rejected() {
        for bad in [
            "combo:ctrl+",
            "combo:ctrl+shift",
            "combo:ctrl+a+b",
            "combo:ctrl+bogus",
            "combo:a",
        ] {
            let err = bad.parse::<KeyCode>().unwrap_err();
            assert!(
                matches!(err, KsrError::InvalidKeyCombination { .. }),
                "{bad} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_decode_combo_presses_modifiers_in_order() {
        let stroke = decode("combo:shift+ctrl+c").unwrap();
        assert_eq!(stroke.modifiers, vec![Key::ControlLeft, Key::ShiftLeft]);
        assert_eq!(stroke.key, Key::KeyC);
    }

    #[test]
    fn test_decode_shifted_characters() {
        assert_eq!(
            decode("char:!").unwrap(),
            Keystroke {
                modifiers: vec![Key::ShiftLeft],
                key: Key::Num1
            }
        );
        assert_eq!(
            decode("char:A").unwrap(),
            Keystroke {
                modifiers: vec![Key::ShiftLeft],
                key: Key::KeyA
            }
        );
    }

    #[test]
    fn test_decode_unknown_keys_fail() {
        for bad in ["char:hello", "char:é", "key:f20", "key:warp_drive", "nonsense"] {
            let err = decode(bad).unwrap_err();
            assert!(matches!(err, KsrError::UnknownKey { .. }), "{bad} gave {err:?}");
        }
    }

    #[test]
    fn test_named_aliases_decode() {
        assert_eq!(decode("key:escape").unwrap().key, Key::Escape);
        assert_eq!(decode("key:ctrl").unwrap().key, Key::ControlLeft);
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("Page-Up").as_deref(), Some("page_up"));
        assert_eq!(canonical_name("ESCAPE").as_deref(), Some("esc"));
        assert_eq!(canonical_name("f17").as_deref(), Some("f17"));
        assert_eq!(canonical_name("fx"), None);
        assert_eq!(canonical_name("hello"), None);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(display_name(Key::KeyQ), "Q");
        assert_eq!(display_name(Key::ControlRight), "Right Ctrl");
        assert_eq!(display_name(Key::PageDown), "Page Down");
        assert_eq!(display_name(Key::Unknown(9)), "Key 9");

        let combo: KeyCode = "combo:ctrl+shift+s".parse().unwrap();
        assert_eq!(combo.display_name(), "Ctrl+Shift+S");
        assert_eq!(KeyCode::Named("f17".into()).display_name(), "F17");
    }

    #[test]
    fn test_serde_uses_string_form() {
        let code: KeyCode = "combo:alt+tab".parse().unwrap();
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"combo:alt+tab\"");
        let back: KeyCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
        assert!(serde_json::from_str::<KeyCode>("\"bogus\"").is_err());
    }
}
