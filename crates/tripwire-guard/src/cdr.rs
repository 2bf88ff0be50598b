//! Content Disarm for descriptor text and server diagnostics
//!
//! Finds characters a human reviewer can not see but a model still reads
//! (zero-width, bidi overrides, tag characters), and strips terminal control
//! sequences from captured server output before it reaches our own report.

use std::sync::OnceLock;

use regex::Regex;

/// Maximum number of bytes kept from sanitized diagnostics.
pub const MAX_DIAGNOSTIC_SIZE: usize = 64 * 1024;

/// An invisible or direction-changing character found in text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiddenChar {
    /// Byte offset in the input.
    pub offset: usize,
    /// The character.
    pub ch: char,
}

/// Returns true for characters that render as nothing or reorder text.
pub fn is_hidden(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}'     // zero-width, LRM/RLM
            | '\u{202A}'..='\u{202E}' // directional formatting
            | '\u{2060}'..='\u{2064}' // word joiner, invisible operators
            | '\u{2066}'..='\u{2069}' // directional isolates
            | '\u{FEFF}'              // BOM
            | '\u{E0000}'..='\u{E007F}' // tag characters
    )
}

/// Lists every hidden character in `input`.
pub fn find_hidden_characters(input: &str) -> Vec<HiddenChar> {
    input
        .char_indices()
        .filter(|(_, c)| is_hidden(*c))
        .map(|(offset, ch)| HiddenChar { offset, ch })
        .collect()
}

/// Sanitizes captured text for display.
///
/// - Strips ANSI escape sequences
/// - Drops control characters (except newline, tab) and hidden characters
/// - Truncates to [`MAX_DIAGNOSTIC_SIZE`] bytes on a char boundary
pub fn sanitize_text(input: &str) -> String {
    let stripped = strip_ansi(input);
    let mut output = String::with_capacity(stripped.len().min(MAX_DIAGNOSTIC_SIZE));

    for c in stripped.chars() {
        if output.len() + c.len_utf8() > MAX_DIAGNOSTIC_SIZE {
            break;
        }
        match c {
            '\n' | '\t' => output.push(c),
            '\r' => {}
            c if is_hidden(c) => {}
            c if c.is_control() => {}
            c => output.push(c),
        }
    }

    output
}

fn ansi_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07]*\x07").ok())
        .as_ref()
}

/// Strip ANSI escape sequences from text
pub fn strip_ansi(input: &str) -> String {
    match ansi_regex() {
        Some(re) => re.replace_all(input, "").into_owned(),
        None => input.to_string(),
    }
}
