//! Line-oriented script format for hand-editing sequences.
//!
//! ```text
//! # comment
//! KEY: ctrl+a
//! DELAY: 250
//! KEY: Enter
//! ```
//!
//! Keywords are case-insensitive. Blank lines and `#` lines are ignored but
//! still count toward the line numbers reported in parse errors.

use chrono::Local;

use crate::error::{KsrError, ParseErrorKind, Result};
use crate::keycode::{self, KeyCode};
use crate::sequence::{ActionKind, KeyAction, Sequence};

/// Synthetic clock advance after every `KEY:` line, in seconds.
pub const KEY_STEP_SECS: f64 = 0.1;

const KEY_KEYWORD: &str = "KEY:";
const DELAY_KEYWORD: &str = "DELAY:";

/// Parse script text into a sequence.
///
/// The first offending line aborts the parse; no partial sequence is
/// returned.
pub fn parse_script(text: &str, name: impl Into<String>) -> Result<Sequence> {
    let mut sequence = Sequence::new(name);
    let mut clock = 0.0_f64;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(operand) = strip_keyword(line, KEY_KEYWORD) {
            let key = parse_key_spec(operand).map_err(|kind| KsrError::parse(kind, line_no))?;
            sequence.append(KeyAction::press(key, clock));
            clock += KEY_STEP_SECS;
        } else if let Some(operand) = strip_keyword(line, DELAY_KEYWORD) {
            let millis: u64 = operand
                .parse()
                .map_err(|_| KsrError::parse(ParseErrorKind::InvalidDelay, line_no))?;
            let seconds = millis as f64 / 1000.0;
            clock += seconds;
            sequence.append(KeyAction::delay(seconds, clock));
        } else {
            return Err(KsrError::parse(ParseErrorKind::UnknownCommand, line_no));
        }
    }

    tracing::debug!(
        name = %sequence.name,
        actions = sequence.len(),
        "Parsed script"
    );
    Ok(sequence)
}

/// Convert the operand of a `KEY:` line into a key code.
///
/// `ctrl+c` style operands become combos, single characters become
/// `char:`, known key names become `key:`, and any other word is kept
/// verbatim as `char:`.
pub fn parse_key_spec(spec: &str) -> std::result::Result<KeyCode, ParseErrorKind> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(ParseErrorKind::EmptyKey);
    }

    let mut chars = spec.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return Ok(KeyCode::Char(c.to_lowercase().to_string()));
    }

    if spec.contains('+') {
        return keycode::parse_combo(spec).map_err(|reason| {
            tracing::debug!(spec, %reason, "Rejected key combination");
            ParseErrorKind::InvalidCombo
        });
    }

    Ok(match keycode::canonical_name(spec) {
        Some(name) => KeyCode::Named(name),
        None => KeyCode::Char(spec.to_string()),
    })
}

/// Render a sequence as script text.
///
/// Key releases are omitted; each press becomes a `KEY:` line and each
/// delay a `DELAY:` line in milliseconds.
pub fn export_script(sequence: &Sequence) -> String {
    let mut lines = vec![
        format!("# Script: {}", sequence.name),
        format!("# Generated: {}", Local::now().format("%Y-%m-%d %H:%M:%S")),
        format!("# Actions: {}", sequence.len()),
        String::new(),
    ];

    for action in sequence.actions() {
        match (action.kind, &action.key) {
            (ActionKind::KeyPress, Some(key)) => {
                if let Some(operand) = script_operand(key) {
                    lines.push(format!("{KEY_KEYWORD} {operand}"));
                }
            }
            (ActionKind::Delay, _) => {
                let millis = (action.hold_duration * 1000.0).round().max(0.0) as u64;
                lines.push(format!("{DELAY_KEYWORD} {millis}"));
            }
            _ => {}
        }
    }

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// `KEY:` operand for `key`, falling back to a named key for bare
/// whitespace. Codes with no script spelling are dropped with a warning.
fn script_operand(key: &KeyCode) -> Option<String> {
    let spec = key.script_spec();
    match parse_key_spec(&spec) {
        Ok(parsed) if parsed == *key => Some(spec),
        Ok(parsed) => {
            tracing::warn!(key = %key, exported = %parsed, "Key changes when exported to a script");
            Some(spec)
        }
        Err(_) => {
            let named = match key {
                KeyCode::Char(text) => match text.as_str() {
                    " " => Some("space"),
                    "\t" => Some("tab"),
                    "\n" | "\r" | "\r\n" => Some("enter"),
                    _ => None,
                },
                _ => None,
            };
            match named {
                Some(name) => {
                    tracing::warn!(key = %key, exported = name, "Whitespace key exported as a named key");
                    Some(name.to_string())
                }
                None => {
                    tracing::warn!(key = %key, "Key has no script form, skipped");
                    None
                }
            }
        }
    }
}

fn strip_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let head = line.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| line[keyword.len()..].trim())
}
