//! Result records emitted per tool, per test and per task

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::core::status::{ExecutionStatus, TaskStatus, TestStatus};

/// Insertion-ordered map serialized as a JSON object
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<K, V>(Vec<(K, V)>);

impl<K, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<K: PartialEq, V> OrderedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the value in place when the key is already present
    pub fn insert(&mut self, key: K, value: V) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: PartialEq<Q>,
        Q: ?Sized,
    {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        self.0.retain(|(k, v)| keep(k, v));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.0.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Serialize, V: Serialize> Serialize for OrderedMap<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// A compiler or tool message extracted from raw output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(rename = "col", skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
    pub message: String,
}

/// Outcome of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub status: ExecutionStatus,
    pub output: String,
    pub exit_code: i32,
    /// Wall time in seconds
    pub duration: f64,
    /// Core dump left by the process, relative to the workspace once stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_output: Option<Vec<Diagnostic>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
}

impl ToolResult {
    /// Result of an in-process step that did not spawn anything
    pub fn completed(success: bool, message: Option<String>) -> Self {
        Self {
            success,
            status: if success {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Fail
            },
            output: String::new(),
            exit_code: 0,
            duration: 0.0,
            core: None,
            message,
            parsed_output: None,
            symbols: None,
        }
    }

    /// A tool that could not be started at all
    pub fn failed(message: impl Into<String>) -> Self {
        Self::completed(false, Some(message.into()))
    }
}

/// Outcome of one test
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub success: bool,
    pub status: TestStatus,
    pub tools: OrderedMap<String, ToolResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Default for TestResult {
    fn default() -> Self {
        Self {
            success: true,
            status: TestStatus::Success,
            tools: OrderedMap::new(),
            message: None,
        }
    }
}

impl TestResult {
    pub fn fail(&mut self, status: TestStatus, message: Option<String>) {
        self.success = false;
        self.status = status;
        if message.is_some() {
            self.message = message;
        }
    }
}

/// What gets stored for a test, depending on its `nodetail` option
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TestRecord {
    Full(TestResult),
    Brief { success: bool },
}

impl TestRecord {
    pub fn success(&self) -> bool {
        match self {
            TestRecord::Full(result) => result.success,
            TestRecord::Brief { success } => *success,
        }
    }

    pub fn status(&self) -> Option<TestStatus> {
        match self {
            TestRecord::Full(result) => Some(result.status),
            TestRecord::Brief { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildhostDescription {
    pub id: String,
    pub os: String,
}

/// Per-program report, emitted after every test and once at the end
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub buildhost_description: BuildhostDescription,
    /// Version strings of the resolved tools, by tool key
    pub tools: OrderedMap<String, String>,
    pub status: TaskStatus,
    pub test_results: OrderedMap<String, TestRecord>,
    /// Unix timestamp of the last update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskResult {
    pub fn new(buildhost_description: BuildhostDescription, status: TaskStatus) -> Self {
        Self {
            buildhost_description,
            tools: OrderedMap::new(),
            status,
            test_results: OrderedMap::new(),
            time: None,
            message: None,
        }
    }

    /// A task that cannot run carries only the reason
    pub fn rejected(buildhost_description: BuildhostDescription, reason: impl Into<String>) -> Self {
        let mut result = Self::new(buildhost_description, TaskStatus::Rejected);
        result.message = Some(reason.into());
        result
    }

    pub fn touch(&mut self) {
        self.time = Some(chrono::Utc::now().timestamp());
    }
}
