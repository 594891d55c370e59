//! Command template rendering
//!
//! Tool templates such as `{path} -o {output_file} {source_files} {options}`
//! are filled in a single pass, so a substituted value is never scanned for
//! further placeholders. Values that come from task files have shell
//! metacharacters neutralized; paths are quoted.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::{Captures, Regex};

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("valid placeholder regex"))
}

/// Replaces characters that would let a value chain or redirect commands
pub fn neutralize_metachars(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '&' | '>' | '<' | '|' | ';' | '`' | '$' | '\n' | '\r' => ' ',
            c => c,
        })
        .collect()
}

/// Quotes `value` for `sh` unless it is made of plainly safe characters
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./+=:,@%".contains(c));
    if safe {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', r"'\''")))
    }
}

/// True when `command` can be split on whitespace into an argument vector
pub fn is_plain_argv(command: &str) -> bool {
    !command.chars().any(|c| {
        matches!(
            c,
            '\'' | '"' | '\\' | '$' | '`' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '*' | '?' | '~'
                | '#' | '\n'
        )
    })
}

#[derive(Debug, Clone, Default)]
pub struct CommandLine {
    template: String,
    values: HashMap<String, String>,
}

impl CommandLine {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            values: HashMap::new(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn uses(&self, key: &str) -> bool {
        self.template.contains(&format!("{{{}}}", key))
    }

    /// Caller-controlled text, neutralized
    pub fn with_value(mut self, key: impl Into<String>, value: &str) -> Self {
        self.values.insert(key.into(), neutralize_metachars(value));
        self
    }

    /// A single filesystem path, quoted
    pub fn with_path(mut self, key: impl Into<String>, path: &Path) -> Self {
        let path = path.to_string_lossy();
        self.values.insert(key.into(), shell_quote(&path).into_owned());
        self
    }

    /// Several paths, quoted and space-joined
    pub fn with_paths<'a>(
        mut self,
        key: impl Into<String>,
        paths: impl IntoIterator<Item = &'a Path>,
    ) -> Self {
        let joined = paths
            .into_iter()
            .map(|p| shell_quote(&p.to_string_lossy()).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        self.values.insert(key.into(), joined);
        self
    }

    /// Unknown placeholders are left as they are
    pub fn render(&self) -> String {
        placeholder_regex()
            .replace_all(&self.template, |caps: &Captures| {
                self.values
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .trim()
            .to_string()
    }
}
