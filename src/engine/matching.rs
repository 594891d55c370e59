//! Output verification
//!
//! Checks a tool's captured output against its `expect` / `fail` /
//! `expect_exception` properties, after cutting the output down to the span
//! between the patch markers when a patch step ran.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::status::TestStatus;
use crate::language::{Markers, PatchOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    Exact,
    Substring,
    /// All whitespace removed on both sides
    Whitespace,
    Regex,
    /// Whitespace runs collapsed to one space, then trimmed
    #[default]
    Invisible,
}

impl MatchMode {
    fn parse(value: &str) -> Self {
        match value {
            "exact" | "full" => MatchMode::Exact,
            "substring" => MatchMode::Substring,
            "whitespace" => MatchMode::Whitespace,
            "regex" => MatchMode::Regex,
            _ => MatchMode::Invisible,
        }
    }

    fn normalize(self, text: &str) -> String {
        match self {
            MatchMode::Invisible => text.split_whitespace().collect::<Vec<_>>().join(" "),
            MatchMode::Whitespace => text.chars().filter(|c| !c.is_whitespace()).collect(),
            _ => text.to_string(),
        }
    }

    /// `output` must already be normalized
    fn matches(self, output: &str, pattern: &str) -> bool {
        match self {
            MatchMode::Exact => output == pattern,
            MatchMode::Substring => output.contains(pattern),
            MatchMode::Whitespace | MatchMode::Invisible => output == self.normalize(pattern),
            MatchMode::Regex => match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(output),
                Err(e) => {
                    warn!("Invalid expected pattern {:?}: {}", pattern, e);
                    false
                }
            },
        }
    }
}

fn patterns(value: Option<&Value>) -> Vec<String> {
    let text = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(text).collect(),
        Some(other) => text(other).into_iter().collect(),
        None => Vec::new(),
    }
}

/// What a tool declares about its output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub expect: Vec<String>,
    pub fail: Vec<String>,
    /// Expected exception text; empty accepts any exception
    pub exception: Option<String>,
    pub mode: MatchMode,
}

impl Expectation {
    /// `None` when the tool declares nothing to verify
    pub fn from_properties(properties: &Map<String, Value>) -> Option<Self> {
        let has = |key: &str| properties.contains_key(key);
        if !has("expect") && !has("fail") && !has("expect_exception") {
            return None;
        }
        let exception = match properties.get("expect_exception") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Bool(false)) | Some(Value::Null) | None => None,
            Some(_) => Some(String::new()),
        };
        Some(Self {
            expect: patterns(properties.get("expect")),
            fail: patterns(properties.get("fail")),
            exception,
            mode: properties
                .get("matching")
                .and_then(Value::as_str)
                .map(MatchMode::parse)
                .unwrap_or_default(),
        })
    }

    /// Verifies `output`; `patch` is the first patch step of the test and
    /// the markers it used.
    pub fn verify(&self, output: &str, patch: Option<(&PatchOptions, &Markers)>) -> Verification {
        let mut verification = Verification::default();
        let mut text = output;

        if let Some((options, markers)) = patch {
            let start = output.find(&markers.start);
            let end = output.find(&markers.end);
            let exception = output.find(&markers.exception);

            if options.use_markers && (start.is_none() || (end.is_none() && exception.is_none())) {
                debug!("Markers not found in output");
                verification.failure = Some(TestStatus::OutputNotFound);
                return verification;
            }

            if let (true, Some(at)) = (options.try_catch, exception) {
                let received = output[at + markers.exception.len()..].trim();
                match &self.exception {
                    Some(expected) if expected.is_empty() || expected.trim() == received => {
                        debug!("Exception {:?} accepted", received);
                    }
                    _ => {
                        debug!("Unexpected exception {:?}", received);
                        verification.failure = Some(TestStatus::UnexpectedException);
                    }
                }
            }

            if let Some(at) = start {
                let from = at + markers.start.len();
                let to = end.or(exception).unwrap_or(output.len()).max(from);
                text = output[from..to].trim();
                verification.output = Some(text.to_string());
            }

            if verification.failure.is_some() {
                return verification;
            }
        }

        if self.expect.is_empty() && self.fail.is_empty() {
            return verification;
        }

        let normalized = self.mode.normalize(text);
        let expected = self.expect.iter().any(|e| self.mode.matches(&normalized, e));
        let failed = self.fail.iter().any(|f| self.mode.matches(&normalized, f));
        if failed || !expected {
            debug!("Wrong output ({:?} matching)", self.mode);
            verification.failure = Some(TestStatus::WrongOutput);
        }
        verification
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    pub failure: Option<TestStatus>,
    /// Output cut down to the marked span
    pub output: Option<String>,
}
