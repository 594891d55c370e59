//! gcc-style compiler message extraction

use std::sync::OnceLock;

use regex::Regex;

use crate::core::result::Diagnostic;

/// Messages that only add noise to student reports
const IGNORED_MESSAGES: &[&str] = &[
    "this will be reported",
    "ISO C90 forbids mixed declarations and code",
    "C++ style comments are not allowed",
];

fn message_regex() -> &'static Regex {
    static MESSAGE: OnceLock<Regex> = OnceLock::new();
    MESSAGE.get_or_init(|| {
        Regex::new(
            r"^([^:\s]+):(\d+):(?:(\d+):)?\s*(fatal error|error|warning|note):\s*(.*)$",
        )
        .expect("valid diagnostic regex")
    })
}

/// Strips the typographic quotes gcc uses in localized builds
fn cleanup(message: &str) -> String {
    message
        .replace(['‘', '’'], "'")
        .trim()
        .to_string()
}

pub fn parse_gcc_output(output: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for line in output.lines() {
        let Some(caps) = message_regex().captures(line) else {
            continue;
        };
        let message = &caps[5];
        if IGNORED_MESSAGES.iter().any(|m| message.contains(m)) {
            continue;
        }
        let kind = match &caps[4] {
            "fatal error" => "error",
            other => other,
        };
        diagnostics.push(Diagnostic {
            kind: kind.to_string(),
            file: Some(caps[1].to_string()),
            line: caps[2].parse().ok(),
            column: caps.get(3).and_then(|c| c.as_str().parse().ok()),
            message: cleanup(message),
        });
    }
    diagnostics
}
