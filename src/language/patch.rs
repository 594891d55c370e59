//! Patch step options, anti-cheat markers and line-number remapping

use serde_json::{Map, Value};

use crate::core::result::Diagnostic;

/// File name reported for diagnostics inside injected test code
pub const TEST_CODE_FILE: &str = "TEST_CODE";

/// Replacement for marker text found in student code
pub const CHEAT_PROTECTION: &str = "====cheat_protection====";

/// Sentinels printed around the injected test code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub start: String,
    pub end: String,
    pub exception: String,
}

impl Markers {
    pub fn for_instance(instance: u32) -> Self {
        Self {
            start: format!("====START_TEST_{}====", instance),
            end: format!("====END_TEST_{}====", instance),
            exception: format!("====EXCEPTION_TEST_{}====", instance),
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.start, &self.end, &self.exception]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    /// Replace the entry point with one running the test code
    #[default]
    Main,
    AboveMain,
    AboveMainClass,
    TopOfFile,
}

impl Position {
    fn parse(value: &str) -> Self {
        match value {
            "above_main" => Position::AboveMain,
            "above_main_class" => Position::AboveMainClass,
            "top_of_file" => Position::TopOfFile,
            _ => Position::Main,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOptions {
    pub position: Position,
    pub code: Option<String>,
    pub use_markers: bool,
    pub try_catch: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            position: Position::Main,
            code: None,
            use_markers: false,
            try_catch: true,
        }
    }
}

impl PatchOptions {
    /// `use_markers` is off unless set, `try_catch` is on unless cleared
    pub fn from_value(value: &Value) -> Self {
        let mut options = Self::default();
        let Some(map) = value.as_object() else {
            return options;
        };
        if let Some(position) = map.get("position").and_then(Value::as_str) {
            options.position = Position::parse(position);
        }
        options.code = map.get("code").and_then(Value::as_str).map(str::to_string);
        options.use_markers = matches!(
            map.get("use_markers"),
            Some(Value::Bool(true))
        ) || map.get("use_markers").and_then(Value::as_str) == Some("true");
        options.try_catch = !(matches!(map.get("try_catch"), Some(Value::Bool(false)))
            || map.get("try_catch").and_then(Value::as_str) == Some("false"));
        options
    }

    /// Patch steps of a tool: an `entries` list, or the properties themselves
    pub fn entries(properties: &Map<String, Value>) -> Vec<Self> {
        match properties.get("entries") {
            Some(Value::Array(entries)) => entries.iter().map(Self::from_value).collect(),
            _ if properties.contains_key("code") => {
                vec![Self::from_value(&Value::Object(properties.clone()))]
            }
            _ => Vec::new(),
        }
    }
}

/// Blocks of injected lines as `(first line, line count)`, sorted, in the
/// numbering of the fully patched file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineMap(Vec<(i64, i64)>);

impl LineMap {
    /// Records `added` lines inserted at `start` of the file as it is now
    pub fn record(&mut self, start: i64, added: i64) {
        for block in self.0.iter_mut().filter(|b| b.0 >= start) {
            block.0 += added;
        }
        let at = self.0.partition_point(|b| b.0 < start);
        self.0.insert(at, (start, added));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Maps a line of the patched file back to the submitted one.
    ///
    /// Returns the line and whether it falls inside injected code, in which
    /// case the line is counted from the start of the injected block.
    pub fn remap(&self, line: i64) -> (i64, bool) {
        let mut shift = 0;
        for &(start, added) in &self.0 {
            if line < start {
                break;
            }
            if line < start + added {
                return (line - start + 1, true);
            }
            shift += added;
        }
        (line - shift, false)
    }

    pub fn fix(&self, diagnostic: &mut Diagnostic) {
        let Some(line) = diagnostic.line else {
            return;
        };
        let (line, injected) = self.remap(line);
        diagnostic.line = Some(line);
        if injected {
            diagnostic.file = Some(TEST_CODE_FILE.to_string());
        }
    }
}
