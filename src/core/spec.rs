//! Task specification model
//!
//! A task arrives as JSON. Two test layouts are accepted: the legacy one,
//! where every key besides `id`, `name` and `options` names a tool, and the
//! list one, where tools sit in an ordered `tools` array. Both end up as an
//! ordered list of [`ToolRequest`]s.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Options attached to a tool key, as written in the task
pub type ToolOptions = Map<String, Value>;

/// Kind of work a tool performs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolKind {
    Compile,
    Execute,
    Debug,
    Profile,
    Patch,
    Parse,
    Http,
    Other(String),
}

impl ToolKind {
    pub fn as_str(&self) -> &str {
        match self {
            ToolKind::Compile => "compile",
            ToolKind::Execute => "execute",
            ToolKind::Debug => "debug",
            ToolKind::Profile => "profile",
            ToolKind::Patch => "patch",
            ToolKind::Parse => "parse",
            ToolKind::Http => "http",
            ToolKind::Other(kind) => kind,
        }
    }
}

impl From<&str> for ToolKind {
    fn from(kind: &str) -> Self {
        match kind {
            "compile" => ToolKind::Compile,
            "execute" => ToolKind::Execute,
            "debug" => ToolKind::Debug,
            "profile" => ToolKind::Profile,
            "patch" => ToolKind::Patch,
            "parse" => ToolKind::Parse,
            "http" => ToolKind::Http,
            other => ToolKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `(kind, disambiguator)` pair identifying a tool within a task.
///
/// Written as `kind` or `kind[disambiguator]` in task files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToolKey {
    pub kind: ToolKind,
    pub disambiguator: Option<String>,
}

impl ToolKey {
    pub fn new(kind: ToolKind) -> Self {
        Self {
            kind,
            disambiguator: None,
        }
    }

    pub fn with_disambiguator(mut self, disambiguator: impl Into<String>) -> Self {
        self.disambiguator = Some(disambiguator.into());
        self
    }
}

impl FromStr for ToolKey {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let key = match s.find('[') {
            Some(open) if s.ends_with(']') => {
                ToolKey::new(ToolKind::from(&s[..open])).with_disambiguator(&s[open + 1..s.len() - 1])
            }
            Some(_) => return Err(SpecError::InvalidToolKey(s.to_string())),
            None => ToolKey::new(ToolKind::from(s)),
        };
        if key.kind.as_str().is_empty() {
            return Err(SpecError::InvalidToolKey(s.to_string()));
        }
        Ok(key)
    }
}

impl fmt::Display for ToolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.disambiguator {
            Some(d) => write!(f, "{}[{}]", self.kind, d),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl Serialize for ToolKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One tool entry of a requirement map or a test chain
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub key: ToolKey,
    pub options: ToolOptions,
}

impl ToolRequest {
    fn parse(key: &str, options: Value) -> Result<Self, SpecError> {
        Ok(Self {
            key: key.parse()?,
            options: normalize_options(options),
        })
    }
}

/// Registry-only keys a task may not override
const DESCRIPTOR_KEYS: &[&str] = &["cmd", "path", "version_line", "name", "language", "languages"];

/// Caller options never carry their own command line or binary; arrays
/// (patch steps) are kept under `entries`.
fn normalize_options(value: Value) -> ToolOptions {
    let mut options = match value {
        Value::Object(map) => map,
        Value::Array(entries) if !entries.is_empty() => {
            let mut map = Map::new();
            map.insert("entries".into(), Value::Array(entries));
            map
        }
        _ => Map::new(),
    };
    for key in DESCRIPTOR_KEYS {
        options.shift_remove(*key);
    }
    options
}

fn parse_tool_list(value: Value) -> Result<Vec<ToolRequest>, SpecError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(key, options)| ToolRequest::parse(&key, options))
            .collect(),
        Value::Array(items) => {
            let mut requests = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(key) => requests.push(ToolRequest::parse(&key, Value::Null)?),
                    Value::Object(map) => {
                        for (key, options) in map {
                            requests.push(ToolRequest::parse(&key, options)?);
                        }
                    }
                    other => return Err(SpecError::InvalidToolList(other.to_string())),
                }
            }
            Ok(requests)
        }
        other => Err(SpecError::InvalidToolList(other.to_string())),
    }
}

/// Per-test policy flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestOptions {
    /// Keep the previous test's workspace and executable
    pub reuse: bool,
    /// Store only `{success}` for this test
    pub nodetail: bool,
    /// Drop the record entirely when the test passes
    pub silent: bool,
    /// Stop the task when this test fails
    pub terminate: bool,
}

impl TestOptions {
    fn from_value(value: &Value) -> Self {
        let mut options = Self::default();
        let mut set = |flag: &str| match flag {
            "reuse" => options.reuse = true,
            "nodetail" => options.nodetail = true,
            "silent" => options.silent = true,
            "terminate" => options.terminate = true,
            _ => {}
        };
        match value {
            Value::Array(flags) => flags.iter().filter_map(Value::as_str).for_each(&mut set),
            Value::String(flag) => set(flag),
            Value::Object(flags) => flags
                .iter()
                .filter(|(_, enabled)| is_truthy(enabled))
                .for_each(|(flag, _)| set(flag)),
            _ => {}
        }
        options
    }
}

/// `true`, `"true"` and non-zero numbers count as set
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestSpec {
    pub id: Option<String>,
    pub name: Option<String>,
    pub options: TestOptions,
    pub tools: Vec<ToolRequest>,
}

impl TestSpec {
    fn from_value(value: Value) -> Result<Self, SpecError> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => return Err(SpecError::InvalidTest(other.to_string())),
        };

        let id = fields.shift_remove("id").as_ref().and_then(id_string);
        let name = fields
            .shift_remove("name")
            .and_then(|v| v.as_str().map(str::to_string));
        let options = fields
            .shift_remove("options")
            .map(|v| TestOptions::from_value(&v))
            .unwrap_or_default();

        let tools = match fields.get("tools") {
            Some(Value::Array(_)) => {
                parse_tool_list(fields.shift_remove("tools").unwrap_or_default())?
            }
            _ => parse_tool_list(Value::Object(fields))?,
        };

        Ok(Self {
            id,
            name,
            options,
            tools,
        })
    }

    /// Synthetic first test built from a task-level `prepare` chain
    pub fn prepare(tools: Vec<ToolRequest>) -> Self {
        Self {
            id: Some(PREPARE_TEST_ID.to_string()),
            name: Some("prepare".to_string()),
            options: TestOptions {
                silent: true,
                terminate: true,
                ..Default::default()
            },
            tools,
        }
    }
}

pub const PREPARE_TEST_ID: &str = "prepare";

#[derive(Debug, Deserialize)]
struct RawTaskSpec {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: Value,
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    tools: Value,
    #[serde(default)]
    tests: Vec<Value>,
    #[serde(default)]
    prepare: Value,
}

/// Declarative grading job
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawTaskSpec")]
pub struct TaskSpec {
    pub id: Option<String>,
    pub name: String,
    pub version: Option<String>,
    pub languages: Vec<String>,
    /// Tool requirements, in declared order
    pub tools: Vec<ToolRequest>,
    pub tests: Vec<TestSpec>,
    pub prepare: Option<Vec<ToolRequest>>,
}

impl TryFrom<RawTaskSpec> for TaskSpec {
    type Error = SpecError;

    fn try_from(raw: RawTaskSpec) -> Result<Self, Self::Error> {
        let tests = raw
            .tests
            .into_iter()
            .map(TestSpec::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        let prepare = match raw.prepare {
            Value::Null => None,
            chain => Some(parse_tool_list(chain)?),
        };

        Ok(Self {
            id: id_string(&raw.id),
            name: raw.name,
            version: id_string(&raw.version),
            languages: raw.languages,
            tools: parse_tool_list(raw.tools)?,
            tests,
            prepare,
        })
    }
}

impl TaskSpec {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Declared tests, with the prepare chain spliced in front when present
    pub fn test_sequence(&self) -> Vec<TestSpec> {
        let mut tests = Vec::with_capacity(self.tests.len() + 1);
        if let Some(chain) = &self.prepare {
            tests.push(TestSpec::prepare(chain.clone()));
        }
        tests.extend(self.tests.iter().cloned());
        tests
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("Invalid tool key: {0}")]
    InvalidToolKey(String),
    #[error("Invalid tool list: {0}")]
    InvalidToolList(String),
    #[error("Invalid test: {0}")]
    InvalidTest(String),
}
