//! Pattern table for agent output detection and the safety guard.
//!
//! Every heuristic the session uses lives here as a regex list so it can be
//! tuned (or replaced from a JSON file) without touching the state machine.

use crate::error::{Result, TerminalError};
use chrono::{DateTime, Duration, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Agent input prompt, tested per line against the tail of the buffer
const PROMPT_PATTERNS: &[&str] = &[
    r"^\s*[>❯›]\s*$",
    r"^\s*│\s*[>❯]\s",
    r"^[$%#] $",
    r"\? for shortcuts",
];

const QUESTION_PATTERNS: &[&str] = &[
    r"(?i)[\[(]\s*(?:y/n|yes/no)\s*[\])]",
    r"(?i)\bdo you want to\b.*\?",
    r"(?i)^\s*(?:would you like|shall i|should i)\b.*\?\s*$",
    r"(?i)\bpress enter to (?:continue|confirm)\b",
    r"(?i)\bare you sure\b.*\?",
];

const MENU_HINT_PATTERNS: &[&str] = &[
    r"(?i)\barrow keys\b",
    r"(?i)\bselect an option\b",
    r"(?i)\buse ↑/↓\b|↑/↓ to (?:navigate|select)",
    r"(?i)\benter to (?:select|confirm)\b",
];

/// Lines that look like selectable options: `> foo`, `(x) foo`, `[ ] foo`, `2. foo`
const OPTION_PATTERNS: &[&str] = &[
    r"^\s*[>❯›]\s+\S",
    r"^\s*(?:[>❯›]\s*)?\([ xX*•]\)\s*\S",
    r"^\s*(?:[>❯›]\s*)?\[[ xX*]\]\s*\S",
    r"^\s*(?:[>❯›]\s*)?\d{1,2}[.)]\s+\S",
];

const LIMIT_PATTERNS: &[&str] = &[
    r"(?i)\busage limit reached\b",
    r"(?i)\brate limit (?:reached|exceeded)\b",
    r"(?i)\byou(?:'ve| have) (?:hit|reached) your (?:usage )?limit\b",
    r"(?i)\blimit reached\b.*\bresets?\b",
];

/// Extracts the reset time token from a limit message
const RESET_TIME_PATTERN: &str = r"(?i)\bresets?\s+(?:at\s+)?(\d{1,2}(?::\d{2})?\s*(?:am|pm)?)";

const DANGEROUS_PATTERNS: &[&str] = &[
    // rm -rf of /, ~, $HOME or a top-level system directory
    r"\brm\s+(?:-[a-zA-Z]*\s+|--[a-z-]+\s+)*-[a-zA-Z]*[rR][a-zA-Z]*\s+(?:--?[a-zA-Z][a-zA-Z-]*\s+)*(?:/(?:home|root|etc|usr|var|bin|boot)?/?\*?|~/?\*?|\$HOME/?\*?)(?:\s|;|&|\||$)",
    r"\brm\s+(?:-[a-zA-Z]+\s+)*--recursive\s+(?:-[a-zA-Z-]+\s+)*(?:/|~|\$HOME)(?:\s|;|&|\||$)",
    r"\bsudo\s+dd\b",
    r"\bdd\b[^\n]*\bof=/dev/(?:sd|hd|vd|xvd|nvme|disk|mmcblk)",
    r">\s*/dev/(?:sd[a-z]|hd[a-z]|vd[a-z]|nvme\d|disk\d|mmcblk\d)",
    r"\bmkfs(?:\.\w+)?\s+[^\n]*/dev/",
    r"\bgit\s+push\b[^\n]*(?:--force\b|\s-f\b)[^\n]*\b(?:main|master|production|release)\b",
    r"\bgit\s+push\b[^\n]*\b(?:main|master|production|release)\b[^\n]*(?:--force\b|\s-f\b)",
    r"(?i)\bdrop\s+(?:table|database|schema)\b",
    r"(?i)\bdelete\s+from\s+[\w.`\x22]+\s*(?:;|$)",
    r"(?i)\btruncate\s+table\b",
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    r"\bchmod\s+(?:-[a-zA-Z]*R[a-zA-Z]*\s+)777\s+/(?:\s|$)",
];

/// Serializable pattern overrides. Missing lists keep the built-in set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub prompts: Option<Vec<String>>,
    pub questions: Option<Vec<String>>,
    pub menu_hints: Option<Vec<String>>,
    pub options: Option<Vec<String>>,
    pub limits: Option<Vec<String>>,
    pub reset_time: Option<String>,
    pub dangerous: Option<Vec<String>>,
}

impl PatternConfig {
    /// Load overrides from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TerminalError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            TerminalError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }
}

/// Compiled detection and safety patterns
#[derive(Debug, Clone)]
pub struct PatternTable {
    prompts: Vec<Regex>,
    questions: Vec<Regex>,
    menu_hints: Vec<Regex>,
    options: Vec<Regex>,
    limits: Vec<Regex>,
    reset_time: Regex,
    dangerous: Vec<Regex>,
}

impl Default for PatternTable {
    fn default() -> Self {
        Self::from_config(&PatternConfig::default()).expect("built-in patterns compile")
    }
}

fn compile_list(
    kind: &'static str,
    custom: Option<&Vec<String>>,
    builtin: &[&str],
) -> Result<Vec<Regex>> {
    let compile = |p: &str| {
        Regex::new(p).map_err(|source| TerminalError::InvalidPattern {
            kind,
            pattern: p.to_string(),
            source,
        })
    };
    match custom {
        Some(list) => list.iter().map(|p| compile(p.as_str())).collect(),
        None => builtin.iter().map(|p| compile(*p)).collect(),
    }
}

impl PatternTable {
    pub fn from_config(config: &PatternConfig) -> Result<Self> {
        let reset_source = config.reset_time.as_deref().unwrap_or(RESET_TIME_PATTERN);
        let reset_time = Regex::new(reset_source).map_err(|source| TerminalError::InvalidPattern {
            kind: "reset_time",
            pattern: reset_source.to_string(),
            source,
        })?;

        Ok(Self {
            prompts: compile_list("prompt", config.prompts.as_ref(), PROMPT_PATTERNS)?,
            questions: compile_list("question", config.questions.as_ref(), QUESTION_PATTERNS)?,
            menu_hints: compile_list("menu_hint", config.menu_hints.as_ref(), MENU_HINT_PATTERNS)?,
            options: compile_list("option", config.options.as_ref(), OPTION_PATTERNS)?,
            limits: compile_list("limit", config.limits.as_ref(), LIMIT_PATTERNS)?,
            reset_time,
            dangerous: compile_list("dangerous", config.dangerous.as_ref(), DANGEROUS_PATTERNS)?,
        })
    }

    /// Safety guard: the first dangerous pattern `content` matches, if any
    pub fn contains_dangerous_pattern(&self, content: &str) -> Option<&str> {
        self.dangerous
            .iter()
            .find(|re| re.is_match(content))
            .map(|re| re.as_str())
    }

    pub fn is_prompt(&self, line: &str) -> bool {
        self.prompts.iter().any(|re| re.is_match(line))
    }

    pub fn is_question(&self, line: &str) -> bool {
        self.questions.iter().any(|re| re.is_match(line))
    }

    pub fn is_menu_hint(&self, line: &str) -> bool {
        self.menu_hints.iter().any(|re| re.is_match(line))
    }

    pub fn is_option(&self, line: &str) -> bool {
        self.options.iter().any(|re| re.is_match(line))
    }

    pub fn is_limit(&self, line: &str) -> bool {
        self.limits.iter().any(|re| re.is_match(line))
    }

    /// Find a reset time token ("2pm", "2:30pm", "14:30") in `text`
    pub fn reset_token<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.reset_time
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
    }
}

/// Parse "2pm", "2:30 pm", "14:30" into (hour, minute) on a 24h clock
pub fn parse_time_of_day(token: &str) -> Option<(u32, u32)> {
    let lower = token.trim().to_ascii_lowercase();
    let (clock, meridiem) = if let Some(rest) = lower.strip_suffix("am") {
        (rest.trim(), Some(false))
    } else if let Some(rest) = lower.strip_suffix("pm") {
        (rest.trim(), Some(true))
    } else {
        (lower.as_str(), None)
    };

    let (hour, minute) = match clock.split_once(':') {
        Some((h, m)) => (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?),
        None => (clock.parse::<u32>().ok()?, 0),
    };
    if minute > 59 {
        return None;
    }

    let hour = match meridiem {
        Some(pm) => {
            if hour == 0 || hour > 12 {
                return None;
            }
            match (pm, hour) {
                (false, 12) => 0,
                (true, 12) => 12,
                (true, h) => h + 12,
                (false, h) => h,
            }
        }
        None if hour < 24 => hour,
        None => return None,
    };
    Some((hour, minute))
}

/// Turn a reset token into an absolute time relative to `now`.
///
/// Unparseable tokens fall back to one hour from now; a time of day that
/// has already passed today means tomorrow.
pub fn resolve_reset_time<Tz: TimeZone>(token: Option<&str>, now: DateTime<Tz>) -> DateTime<Tz> {
    let fallback = now.clone() + Duration::hours(1);
    let Some((hour, minute)) = token.and_then(parse_time_of_day) else {
        return fallback;
    };
    let Some(naive) = now.date_naive().and_hms_opt(hour, minute, 0) else {
        return fallback;
    };
    let Some(today) = now.timezone().from_local_datetime(&naive).earliest() else {
        return fallback;
    };

    if today <= now {
        today + Duration::days(1)
    } else {
        today
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_dangerous_corpus_blocked() {
        let table = PatternTable::default();
        let dangerous = [
            "rm -rf /",
            "rm -rf ~",
            "rm -fr /*",
            "sudo rm -rf $HOME",
            "rm -r -f /home",
            "rm --recursive --force /",
            "rm -rf --no-preserve-root /",
            "sudo rm -rf --no-preserve-root /",
            "sudo dd if=/dev/zero of=/dev/sda bs=1M",
            "dd if=image.iso of=/dev/nvme0n1",
            "cat junk > /dev/sda",
            "mkfs.ext4 /dev/sdb1",
            "git push --force origin main",
            "git push origin master -f",
            "DROP TABLE users;",
            "drop database prod",
            "DELETE FROM accounts;",
            "truncate table sessions",
            ":(){ :|:& };:",
            "chmod -R 777 /",
        ];
        for cmd in dangerous {
            assert!(
                table.contains_dangerous_pattern(cmd).is_some(),
                "expected {:?} to be blocked",
                cmd
            );
        }
    }

    #[test]
    fn test_benign_corpus_allowed() {
        let table = PatternTable::default();
        let benign = [
            "ls -la",
            "git status",
            "git push origin feature/login",
            "git push --force origin my-branch",
            "rm -rf ./target",
            "rm -rf /tmp/build-cache",
            "DELETE FROM sessions WHERE expires_at < now();",
            "please summarize the diff",
            "dd if=a.img of=b.img",
        ];
        for cmd in benign {
            assert!(
                table.contains_dangerous_pattern(cmd).is_none(),
                "expected {:?} to be allowed",
                cmd
            );
        }
    }

    #[test]
    fn test_line_classifiers() {
        let table = PatternTable::default();
        assert!(table.is_question("Do you want to proceed? [y/n]"));
        assert!(table.is_question("Overwrite file? (Y/n)"));
        assert!(!table.is_question("Reading file src/main.rs"));

        assert!(table.is_prompt("> "));
        assert!(table.is_prompt("│ > try \"fix lint errors\""));
        assert!(!table.is_prompt("> quoted reply text without box"));

        assert!(table.is_menu_hint("Use arrow keys to navigate"));
        assert!(table.is_option("❯ 1. Yes"));
        assert!(table.is_option("  2. No, and tell Claude what to do"));
        assert!(table.is_option("[x] include tests"));
        assert!(!table.is_option("Plain sentence."));

        assert!(table.is_limit("Claude usage limit reached. Your limit will reset at 2pm"));
    }

    #[test]
    fn test_reset_token_extraction() {
        let table = PatternTable::default();
        assert_eq!(
            table.reset_token("Usage limit reached. Resets at 2pm."),
            Some("2pm")
        );
        assert_eq!(table.reset_token("limit resets 2:30 pm (UTC)"), Some("2:30 pm"));
        assert_eq!(table.reset_token("resets at 14:30"), Some("14:30"));
        assert_eq!(table.reset_token("Usage limit reached."), None);
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("2pm"), Some((14, 0)));
        assert_eq!(parse_time_of_day("2:30PM"), Some((14, 30)));
        assert_eq!(parse_time_of_day("12am"), Some((0, 0)));
        assert_eq!(parse_time_of_day("12pm"), Some((12, 0)));
        assert_eq!(parse_time_of_day("14:30"), Some((14, 30)));
        assert_eq!(parse_time_of_day("25:00"), None);
        assert_eq!(parse_time_of_day("13pm"), None);
        assert_eq!(parse_time_of_day("soon"), None);
    }

    #[test]
    fn test_reset_later_today() {
        let reset = resolve_reset_time(Some("2pm"), at(10, 0));
        assert_eq!(reset, at(14, 0));
    }

    #[test]
    fn test_reset_rolls_to_tomorrow() {
        let reset = resolve_reset_time(Some("2pm"), at(15, 0));
        assert_eq!(reset, at(14, 0) + Duration::days(1));
    }

    #[test]
    fn test_reset_unparseable_defaults_to_one_hour() {
        let now = at(9, 15);
        assert_eq!(resolve_reset_time(None, now), now + Duration::hours(1));
        assert_eq!(resolve_reset_time(Some("later"), now), now + Duration::hours(1));
    }

    #[test]
    fn test_custom_patterns_replace_builtin() {
        let config = PatternConfig {
            prompts: Some(vec![r"^agent> $".to_string()]),
            ..Default::default()
        };
        let table = PatternTable::from_config(&config).unwrap();
        assert!(table.is_prompt("agent> "));
        assert!(!table.is_prompt("> "));
        // Untouched lists keep their defaults
        assert!(table.contains_dangerous_pattern("rm -rf /").is_some());
    }

    #[test]
    fn test_invalid_custom_pattern() {
        let config = PatternConfig {
            dangerous: Some(vec!["(unclosed".to_string()]),
            ..Default::default()
        };
        let err = PatternTable::from_config(&config).unwrap_err();
        assert!(matches!(err, TerminalError::InvalidPattern { kind: "dangerous", .. }));
    }
}
