//! Tools
//!
//! A [`ResolvedTool`] is a registry descriptor (or a stand-alone plugin)
//! merged with the options a task declares for it. Tests clone the task's
//! tool and merge their own options on top, so nothing leaks between tests.

pub mod diagnostics;
pub mod plugins;
pub mod resolver;
mod run;
pub mod version;

use std::path::Path;

use serde_json::{Map, Value};

use crate::config::{Config, FeatureSet, ToolDescriptor};
use crate::core::spec::{ToolKey, ToolKind, ToolOptions};
use crate::engine::command::CommandLine;
use crate::engine::environment::ExecutionEnvironment;
use crate::engine::executer::first_line_of;

pub use plugins::Behavior;
pub use resolver::{ResolveError, Resolver};
pub use run::ToolContext;
use version::{InvalidConstraint, Version, VersionConstraint};

/// Option keys that steer resolution or belong to the registry entry; never
/// copied into properties
const RESOLUTION_KEYS: &[&str] = &[
    "require",
    "prefer",
    "features",
    "version",
    "cmd",
    "options",
    "path",
    "version_line",
    "name",
    "language",
    "languages",
];

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("tool {0} is required")]
    NameMismatch(String),
    #[error("feature {0} is not supported")]
    MissingFeature(String),
    #[error("version {0} is not available")]
    VersionMismatch(String),
    #[error(transparent)]
    InvalidConstraint(#[from] InvalidConstraint),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTool {
    key: ToolKey,
    name: String,
    behavior: Behavior,
    properties: Map<String, Value>,
    features: FeatureSet,
    /// Registry `options` before feature flags were added
    base_options: String,
    /// Flags of every feature requested so far, in request order
    flags: Vec<String>,
    version_line: Option<String>,
    version: Option<String>,
}

fn option_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(option_text).collect(),
        Some(other) => option_text(other).into_iter().collect(),
        None => Vec::new(),
    }
}

/// `path` is either absolute/relative with a slash, or looked up in `PATH`
fn binary_exists(path: &str) -> bool {
    if path.contains('/') {
        return Path::new(path).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(path).is_file()))
        .unwrap_or(false)
}

impl ResolvedTool {
    pub fn from_descriptor(key: ToolKey, descriptor: &ToolDescriptor, behavior: Behavior) -> Self {
        let base_options = descriptor
            .properties
            .get("options")
            .and_then(option_text)
            .unwrap_or_default();
        Self {
            key,
            name: descriptor.name.clone(),
            behavior,
            properties: descriptor.properties.clone(),
            features: descriptor.features.clone(),
            base_options,
            flags: Vec::new(),
            version_line: descriptor.version_line.clone(),
            version: None,
        }
    }

    /// A plugin-backed tool built from options alone
    pub fn standalone(
        key: ToolKey,
        behavior: Behavior,
        options: &ToolOptions,
    ) -> Result<Self, MergeError> {
        let mut properties = Map::new();
        if behavior == Behavior::Execute {
            properties.insert("cmd".into(), Value::String("{executable}".into()));
        }
        let mut tool = Self {
            name: key.kind.to_string(),
            key,
            behavior,
            properties,
            features: FeatureSet::default(),
            base_options: String::new(),
            flags: Vec::new(),
            version_line: None,
            version: None,
        };
        tool.merge(options)?;
        Ok(tool)
    }

    /// Applies declared options, failing closed on any unmet requirement
    pub fn merge(&mut self, options: &ToolOptions) -> Result<(), MergeError> {
        if let Some(required) = options.get("require").and_then(Value::as_str) {
            if required != self.name {
                return Err(MergeError::NameMismatch(required.to_string()));
            }
        }

        let mut flags = Vec::new();
        for requested in string_list(options.get("features")) {
            let feature = self
                .features
                .find(&requested)
                .ok_or_else(|| MergeError::MissingFeature(requested.clone()))?;
            if let Some(flag) = &feature.flag {
                flags.push(flag.clone());
            }
        }

        if let Some(wanted) = options.get("version").and_then(option_text) {
            let constraint: VersionConstraint = wanted.parse()?;
            let satisfied = self
                .version
                .as_deref()
                .and_then(Version::detect)
                .is_some_and(|v| constraint.matches(&v));
            if !satisfied {
                return Err(MergeError::VersionMismatch(wanted));
            }
        }

        for (key, value) in options {
            if RESOLUTION_KEYS.contains(&key.as_str()) {
                continue;
            }
            if key == "environment" {
                if let (Value::Object(layer), Some(Value::Object(current))) =
                    (value, self.properties.get_mut(key))
                {
                    for (k, v) in layer {
                        current.insert(k.clone(), v.clone());
                    }
                    continue;
                }
            }
            self.properties.insert(key.clone(), value.clone());
        }

        for flag in flags {
            if !self.flags.contains(&flag) {
                self.flags.push(flag);
            }
        }
        let mut rendered = self.flags.clone();
        if !self.base_options.is_empty() {
            rendered.push(self.base_options.clone());
        }
        if !rendered.is_empty() || self.properties.contains_key("options") {
            self.properties
                .insert("options".into(), Value::String(rendered.join(" ")));
        }
        Ok(())
    }

    pub fn key(&self) -> &ToolKey {
        &self.key
    }

    pub fn kind(&self) -> &ToolKind {
        &self.key.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn path(&self) -> Option<&str> {
        self.properties.get("path").and_then(Value::as_str)
    }

    /// Tools without a `path` run host-native commands and are always present
    pub fn is_installed(&self) -> bool {
        self.path().map_or(true, binary_exists)
    }

    /// Runs `version_line` once and keeps the first output line
    pub async fn detect_version(&mut self) {
        if self.version.is_some() {
            return;
        }
        let Some(line) = &self.version_line else {
            return;
        };
        let mut command = CommandLine::new(line.as_str());
        if let Some(path) = self.path() {
            command = command.with_path("path", Path::new(path));
        }
        self.version = first_line_of(&command.render(), &std::env::temp_dir()).await;
    }

    pub fn environment(&self, config: &Config) -> ExecutionEnvironment {
        ExecutionEnvironment::resolve(&config.default_environment, &self.properties)
    }
}
