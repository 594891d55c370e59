//! Execution environment
//!
//! The sandbox policy for one process run is layered: built-in defaults,
//! then the worker's `default_environment`, then the tool's `environment`
//! property, then the tool's top-level `stdin` property.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// How the process is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Shell run to completion with stdin from a file
    #[default]
    #[serde(alias = "exec")]
    Batch,
    /// Explicit stdin/stdout/stderr pipes
    #[serde(alias = "popen")]
    Piped,
}

/// Which stream(s) end up in the captured output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    #[default]
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutMethod {
    /// Wall clock, enforced by the `timeout` wrapper
    #[default]
    Timeout,
    /// CPU time, enforced by RLIMIT_CPU
    Ulimit,
}

/// One partial layer of the environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentLayer {
    #[serde(rename = "type", alias = "backend", skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_stream: Option<OutputStream>,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_method: Option<TimeoutMethod>,
    /// Bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_output: Option<usize>,
    /// KiB of address space
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nice: Option<i32>,
}

impl EnvironmentLayer {
    /// The tool's own layer; an unreadable `environment` property is ignored
    fn from_properties(properties: &Map<String, Value>) -> Self {
        let mut layer = match properties.get("environment") {
            Some(value @ Value::Object(_)) => {
                serde_json::from_value(value.clone()).unwrap_or_else(|e| {
                    warn!("Ignoring invalid tool environment {}: {}", value, e);
                    Self::default()
                })
            }
            _ => Self::default(),
        };
        if let Some(stdin) = properties.get("stdin").and_then(Value::as_str) {
            layer.stdin = Some(stdin.to_string());
        }
        layer
    }
}

/// Fully resolved sandbox policy
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionEnvironment {
    pub backend: Backend,
    pub stdin: String,
    pub output_stream: OutputStream,
    pub timeout: u64,
    pub timeout_method: TimeoutMethod,
    pub limit_output: usize,
    pub limit_memory: u64,
    pub nice: i32,
}

impl Default for ExecutionEnvironment {
    fn default() -> Self {
        Self {
            backend: Backend::Batch,
            stdin: String::new(),
            output_stream: OutputStream::Both,
            timeout: 60,
            timeout_method: TimeoutMethod::Timeout,
            limit_output: 10_000,
            limit_memory: 0,
            nice: 0,
        }
    }
}

impl ExecutionEnvironment {
    pub fn with_layer(mut self, layer: &EnvironmentLayer) -> Self {
        if let Some(backend) = layer.backend {
            self.backend = backend;
        }
        if let Some(stdin) = &layer.stdin {
            self.stdin = stdin.clone();
        }
        if let Some(stream) = layer.output_stream {
            self.output_stream = stream;
        }
        if let Some(timeout) = layer.timeout {
            self.timeout = timeout;
        }
        if let Some(method) = layer.timeout_method {
            self.timeout_method = method;
        }
        if let Some(limit) = layer.limit_output {
            self.limit_output = limit;
        }
        if let Some(limit) = layer.limit_memory {
            self.limit_memory = limit;
        }
        if let Some(nice) = layer.nice {
            self.nice = nice;
        }
        self
    }

    /// Environment for a tool with the given merged properties
    pub fn resolve(global: &EnvironmentLayer, properties: &Map<String, Value>) -> Self {
        Self::default()
            .with_layer(global)
            .with_layer(&EnvironmentLayer::from_properties(properties))
    }
}
