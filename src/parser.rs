//! Output parser for agent status detection.
//!
//! Turns raw terminal bytes into clean text and semantic detections:
//! - ANSI/control stripping (CSI, OSC, DCS/PM/APC/SOS, C0/C1 controls)
//! - A bounded line buffer that only ever trims whole lines from the head
//! - Prioritized question / prompt / menu / limit detection over the tail

use crate::patterns::PatternTable;
use regex::Regex;
use std::sync::OnceLock;

/// Lines of tail considered by the detection rules
pub const ANALYSIS_LINES: usize = 12;
/// Lines of tail searched for a visible prompt
pub const PROMPT_TAIL_LINES: usize = 5;

/// Escape sequences held back between chunks are capped at this size
const MAX_CARRY: usize = 4096;

static ANSI_PATTERN: OnceLock<Regex> = OnceLock::new();
static ANSI_PREFIX_PATTERN: OnceLock<Regex> = OnceLock::new();

const ANSI_SEQUENCES: &str = concat!(
    // CSI
    r"\x1B\[[0-?]*[ -/]*[@-~]",
    // OSC, terminated by BEL or ST
    r"|\x1B\][^\x07\x1B]*(?:\x07|\x1B\\)",
    // DCS, SOS, PM, APC, terminated by ST
    r"|\x1B[PX^_][^\x1B]*\x1B\\",
    // Two-byte and charset escapes; finals that open longer sequences excluded
    r"|\x1B[ -/]*[0-OQ-WYZ\\`-~]",
);

fn ansi_pattern() -> &'static Regex {
    ANSI_PATTERN.get_or_init(|| {
        Regex::new(&format!(
            r"{}|[\x00-\x08\x0B\x0C\x0E-\x1F\x7F\u{{80}}-\u{{9F}}]",
            ANSI_SEQUENCES
        ))
        .unwrap()
    })
}

fn ansi_prefix_pattern() -> &'static Regex {
    ANSI_PREFIX_PATTERN.get_or_init(|| Regex::new(&format!(r"\A(?:{})", ANSI_SEQUENCES)).unwrap())
}

/// Strip ANSI escape sequences and control bytes, keeping `\n`, `\r` and `\t`
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").to_string()
}

/// Chunk-aware stripper: escape sequences and UTF-8 characters split across
/// reads are completed on the next chunk instead of leaking fragments.
#[derive(Debug, Default)]
pub struct AnsiStripper {
    pending_bytes: Vec<u8>,
    pending_escape: String,
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending_bytes);
        bytes.extend_from_slice(chunk);

        // Hold back an incomplete trailing UTF-8 sequence
        let valid_up_to = match std::str::from_utf8(&bytes) {
            Ok(_) => bytes.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => bytes.len(),
        };
        self.pending_bytes = bytes.split_off(valid_up_to);

        let mut text = std::mem::take(&mut self.pending_escape);
        text.push_str(&String::from_utf8_lossy(&bytes));

        // Hold back an escape sequence that has not terminated yet
        if let Some(esc) = text.rfind('\x1b') {
            let tail = &text[esc..];
            if tail.len() < MAX_CARRY && !ansi_prefix_pattern().is_match(tail) {
                self.pending_escape = tail.to_string();
                text.truncate(esc);
            }
        }

        strip_ansi(&text)
    }

    pub fn reset(&mut self) {
        self.pending_bytes.clear();
        self.pending_escape.clear();
    }
}

/// Bounded output buffer.
///
/// Offsets are tracked absolutely (bytes ever appended) so a submission
/// mark survives head trimming.
#[derive(Debug)]
pub struct OutputBuffer {
    text: String,
    max_size: usize,
    /// Absolute offset of `text[0]`
    trimmed: usize,
    /// Absolute offset of the last submission
    mark: usize,
}

impl OutputBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            text: String::new(),
            max_size,
            trimmed: 0,
            mark: 0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }

    /// Append stripped text, trimming whole lines from the head on overflow
    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() <= self.max_size {
            return;
        }

        let overflow = self.text.len() - self.max_size;
        let cut = match self.text.as_bytes()[overflow..]
            .iter()
            .position(|&b| b == b'\n')
        {
            Some(pos) => overflow + pos + 1,
            None => self.text.len(),
        };
        self.text.drain(..cut);
        self.trimmed += cut;
    }

    pub fn clear(&mut self) {
        self.trimmed += self.text.len();
        self.text.clear();
        self.mark = self.trimmed;
    }

    /// Remember the current end; detection ignores output before it
    pub fn mark_submission(&mut self) {
        self.mark = self.trimmed + self.text.len();
    }

    /// Trailing window of at most `max_bytes`, starting on a char boundary
    pub fn tail(&self, max_bytes: usize) -> &str {
        let mut start = self.text.len().saturating_sub(max_bytes);
        while !self.text.is_char_boundary(start) {
            start += 1;
        }
        &self.text[start..]
    }

    /// Last `n` non-blank display lines
    pub fn last_lines(&self, n: usize) -> Vec<&str> {
        display_lines(&self.text, n)
    }

    /// Last `n` non-blank display lines written since the last submission
    pub fn lines_since_mark(&self, n: usize) -> Vec<&str> {
        let start = self.mark.saturating_sub(self.trimmed).min(self.text.len());
        display_lines(&self.text[start..], n)
    }
}

/// Split into lines as a terminal would show them: a carriage return
/// rewrites the line, so only the last non-empty `\r` segment counts.
fn display_lines(text: &str, n: usize) -> Vec<&str> {
    let mut lines: Vec<&str> = text
        .split('\n')
        .rev()
        .filter_map(|raw| raw.split('\r').rev().find(|seg| !seg.trim().is_empty()))
        .take(n)
        .collect();
    lines.reverse();
    lines
}

/// What the tail of the output says about the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// A question or selection menu; carries the line to report
    Question(String),
    /// The input prompt is visible
    Ready,
    /// A usage limit message, with the reset token if one was found
    LimitReached { reset_token: Option<String> },
    Nothing,
}

/// Apply the detection rules in priority order; first match wins
pub fn detect(lines: &[&str], patterns: &PatternTable) -> Detection {
    if let Some(line) = lines.iter().rev().find(|l| patterns.is_question(l)) {
        return Detection::Question(line.trim().to_string());
    }

    let prompt_tail = &lines[lines.len().saturating_sub(PROMPT_TAIL_LINES)..];
    if prompt_tail.iter().any(|l| patterns.is_prompt(l)) {
        return Detection::Ready;
    }

    if lines.iter().any(|l| patterns.is_menu_hint(l)) {
        let first_option = lines
            .windows(2)
            .find(|pair| patterns.is_option(pair[0]) && patterns.is_option(pair[1]))
            .map(|pair| pair[0]);
        if let Some(option) = first_option {
            return Detection::Question(option.trim().to_string());
        }
    }

    if let Some(pos) = lines.iter().position(|l| patterns.is_limit(l)) {
        let reset_token = lines[pos..]
            .iter()
            .find_map(|l| patterns.reset_token(l))
            .map(str::to_string);
        return Detection::LimitReached { reset_token };
    }

    Detection::Nothing
}

/// Whether a prompt is visible in the last few lines of `buffer`
pub fn prompt_visible(buffer: &OutputBuffer, patterns: &PatternTable) -> bool {
    buffer
        .last_lines(PROMPT_TAIL_LINES)
        .iter()
        .any(|l| patterns.is_prompt(l))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect_text(text: &str) -> Detection {
        let patterns = PatternTable::default();
        let mut buffer = OutputBuffer::new(10_000);
        buffer.push(text);
        detect(&buffer.last_lines(ANALYSIS_LINES), &patterns)
    }

    #[test]
    fn test_strip_ansi() {
        let input = "\x1b[32mgreen\x1b[0m \x1b]0;title\x07plain\x1bP1$r0m\x1b\\ done\r\n";
        assert_eq!(strip_ansi(input), "green plain done\r\n");
    }

    #[test]
    fn test_strip_ansi_controls() {
        let input = "a\x07b\x08c\x00d\x1b=e\x1b(Bf\x1b[?25lg\x1b[2K\u{9b}h\n";
        assert_eq!(strip_ansi(input), "abcdefgh\n");
    }

    #[test]
    fn test_strip_ansi_osc_with_st() {
        let input = "\x1b]8;;https://example.com\x1b\\link\x1b]8;;\x1b\\";
        assert_eq!(strip_ansi(input), "link");
    }

    #[test]
    fn test_stripper_joins_split_escape() {
        let mut stripper = AnsiStripper::new();
        let first = stripper.push(b"hello \x1b[3");
        let second = stripper.push(b"1mworld\x1b[0m");
        assert_eq!(first, "hello ");
        assert_eq!(second, "world");
    }

    #[test]
    fn test_stripper_joins_split_utf8() {
        let mut stripper = AnsiStripper::new();
        let bytes = "❯ 1. Yes".as_bytes();
        let first = stripper.push(&bytes[..2]);
        let second = stripper.push(&bytes[2..]);
        assert_eq!(format!("{}{}", first, second), "❯ 1. Yes");
    }

    #[test]
    fn test_buffer_trims_whole_lines() {
        let mut buffer = OutputBuffer::new(20);
        buffer.push("first line\n");
        buffer.push("second line\n");
        buffer.push("third");

        assert!(buffer.len() <= 20);
        assert_eq!(buffer.as_str(), "second line\nthird");

        for i in 0..50 {
            buffer.push(&format!("row {} of output\n", i));
            assert!(buffer.len() <= 20);
            assert!(buffer.as_str().is_empty() || buffer.as_str().starts_with("row"));
        }
    }

    #[test]
    fn test_buffer_without_newline_empties() {
        let mut buffer = OutputBuffer::new(8);
        buffer.push("0123456789abcdef");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_tail_respects_char_boundary() {
        let mut buffer = OutputBuffer::new(1000);
        buffer.push("ab❯cd");
        assert_eq!(buffer.tail(3), "cd");
        assert_eq!(buffer.tail(100), "ab❯cd");
    }

    #[test]
    fn test_display_lines_use_last_carriage_return_segment() {
        let mut buffer = OutputBuffer::new(1000);
        buffer.push("⠋ Thinking\r⠙ Thinking\r\n\n\nDone\r\n");
        assert_eq!(buffer.last_lines(5), vec!["⠙ Thinking", "Done"]);
        assert_eq!(buffer.line_count(), 4);
    }

    #[test]
    fn test_lines_since_mark() {
        let mut buffer = OutputBuffer::new(1000);
        buffer.push("Do you want to proceed? [y/n]\n");
        buffer.mark_submission();
        buffer.push("y\nWorking...\n");
        assert_eq!(buffer.lines_since_mark(12), vec!["y", "Working..."]);

        buffer.clear();
        assert!(buffer.lines_since_mark(12).is_empty());
    }

    #[test]
    fn test_detect_question() {
        assert_eq!(
            detect_text("Editing file\n  Do you want to proceed? [y/n]  \n"),
            Detection::Question("Do you want to proceed? [y/n]".to_string())
        );
    }

    #[test]
    fn test_question_beats_prompt() {
        assert_eq!(
            detect_text("Overwrite config? (y/n)\n> \n"),
            Detection::Question("Overwrite config? (y/n)".to_string())
        );
    }

    #[test]
    fn test_detect_prompt() {
        assert_eq!(detect_text("All tests pass.\n\n> \n"), Detection::Ready);
    }

    #[test]
    fn test_detect_menu() {
        let text = "Select a model\n❯ 1. Opus\n  2. Sonnet\n  3. Haiku\nUse arrow keys to navigate, Enter to select\n";
        assert_eq!(detect_text(text), Detection::Question("❯ 1. Opus".to_string()));
    }

    #[test]
    fn test_menu_needs_two_option_lines() {
        let text = "Use arrow keys to move\n1. only one option\nsome trailing text\n";
        assert_eq!(detect_text(text), Detection::Nothing);
    }

    #[test]
    fn test_detect_limit() {
        assert_eq!(
            detect_text("Usage limit reached. Resets at 2pm.\n"),
            Detection::LimitReached {
                reset_token: Some("2pm".to_string())
            }
        );
        assert_eq!(
            detect_text("Rate limit exceeded\n"),
            Detection::LimitReached { reset_token: None }
        );
    }

    #[test]
    fn test_detect_nothing() {
        assert_eq!(detect_text("Reading src/lib.rs\nThinking...\n"), Detection::Nothing);
    }

    #[test]
    fn test_prompt_visible() {
        let patterns = PatternTable::default();
        let mut buffer = OutputBuffer::new(1000);
        buffer.push("output\n> \n");
        assert!(prompt_visible(&buffer, &patterns));
        buffer.push("more output\n");
        assert!(prompt_visible(&buffer, &patterns));
        buffer.push("1\n2\n3\n4\n5\n");
        assert!(!prompt_visible(&buffer, &patterns));
    }
}
