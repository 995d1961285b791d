//! Strip attachment name badges that leak into answer text.
//!
//! When files are attached, the chat UI renders inline citation chips
//! holding the file name. Read back as plain text they show up as stray
//! `notes.md` / `notes` tokens glued to sentences.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
static SPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").expect("valid regex"));
static LEADING_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*\n").expect("valid regex"));

/// Remove citation badges for `attachments` from `text` and normalize the
/// whitespace they leave behind. Text without attachments is only trimmed
/// and normalized.
pub fn clean_citations(text: &str, attachments: &[PathBuf]) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut out = text.to_string();
    for path in attachments {
        for name in badge_names(path) {
            out = strip_badge(&out, &name);
        }
    }

    let out = BLANK_RUNS.replace_all(&out, "\n\n");
    let out = SPACE_RUNS.replace_all(&out, " ");
    let out = LEADING_BLANK_LINES.replace_all(&out, "\n");
    out.trim().to_string()
}

/// File name and stem, longest first.
fn badge_names(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = [path.file_name(), path.file_stem()]
        .into_iter()
        .flatten()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    names.sort_by_key(|n| std::cmp::Reverse(n.len()));
    names.dedup();
    names
}

fn strip_badge(text: &str, name: &str) -> String {
    let name = regex::escape(name);
    let rules = [
        // After closing punctuation: "works.notes" -> "works."
        (format!(r"([。、！？）)」】.,:;])\s*{name}([\s「（(]|$)"), "${1}${2}"),
        // Alone on its line.
        (format!(r"(?m)^\s*{name}\s*$"), ""),
        // Dangling at the end of a line.
        (format!(r"(?m)\s+{name}\s*$"), ""),
        // Repeated badges.
        (format!(r"(\s*{name}\s*){{2,}}"), " "),
        // Leading a line.
        (format!(r"(?m)^{name}\s+"), ""),
    ];

    let mut out = text.to_string();
    for (pattern, replacement) in rules {
        if let Ok(re) = Regex::new(&pattern) {
            out = re.replace_all(&out, replacement).into_owned();
        }
    }
    out
}
