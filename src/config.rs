//! Worker configuration
//!
//! Loaded once at startup from a TOML file and passed by reference to every
//! component that needs it.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::spec::ToolKind;
use crate::engine::environment::EnvironmentLayer;

/// A named capability of a tool, optionally mapped to a command-line flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub name: String,
    pub flag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFeatures {
    Flags(BTreeMap<String, String>),
    Names(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawFeatures")]
pub struct FeatureSet(Vec<Feature>);

impl From<RawFeatures> for FeatureSet {
    fn from(raw: RawFeatures) -> Self {
        match raw {
            RawFeatures::Flags(flags) => FeatureSet(
                flags
                    .into_iter()
                    .map(|(name, flag)| Feature {
                        name,
                        flag: Some(flag),
                    })
                    .collect(),
            ),
            RawFeatures::Names(names) => FeatureSet(
                names
                    .into_iter()
                    .map(|name| Feature { name, flag: None })
                    .collect(),
            ),
        }
    }
}

impl FeatureSet {
    /// Case-insensitive lookup
    pub fn find(&self, name: &str) -> Option<&Feature> {
        self.0.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

/// A registry entry describing an external tool
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub features: FeatureSet,
    /// Shell command printing the version; `{path}` is substituted
    #[serde(default)]
    pub version_line: Option<String>,
    /// `path`, `cmd`, `options`, `environment` and anything else
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl ToolDescriptor {
    pub fn applies_to(&self, language: &str) -> bool {
        if let Some(only) = &self.language {
            if !only.eq_ignore_ascii_case(language) {
                return false;
            }
        }
        self.languages.is_empty()
            || self
                .languages
                .iter()
                .any(|l| l.eq_ignore_ascii_case(language))
    }
}

fn default_buildhost_id() -> String {
    "autotester".into()
}

fn default_basepath() -> PathBuf {
    PathBuf::from("/tmp/autotester")
}

fn default_max_instances() -> u32 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identifier reported in every result
    #[serde(default = "default_buildhost_id")]
    pub buildhost_id: String,
    /// Parent directory of all test workspaces
    #[serde(default = "default_basepath")]
    pub basepath: PathBuf,
    /// Upper bound (exclusive) for workspace instance ids
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    /// Applied between the built-in defaults and each tool's own environment
    #[serde(default)]
    pub default_environment: EnvironmentLayer,
    /// Source file suffixes per language
    #[serde(default)]
    pub extensions: HashMap<String, Vec<String>>,
    /// Tool registry by kind, in preference order
    #[serde(default)]
    pub tools: HashMap<String, Vec<ToolDescriptor>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buildhost_id: default_buildhost_id(),
            basepath: default_basepath(),
            max_instances: default_max_instances(),
            default_environment: EnvironmentLayer::default(),
            extensions: HashMap::new(),
            tools: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.extensions = config
            .extensions
            .into_iter()
            .map(|(language, exts)| (language.to_lowercase(), exts))
            .collect();
        Ok(config)
    }

    pub fn extensions_for(&self, language: &str) -> &[String] {
        self.extensions
            .get(&language.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Registry entries of one kind, in declared order
    pub fn descriptors(&self, kind: &ToolKind) -> &[ToolDescriptor] {
        self.tools
            .get(kind.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
