//! Language capability plugins
//!
//! The engine never inspects source code itself. Locating the entry point,
//! naming the executable, lightweight source checks and test-code patching
//! all go through [`LanguagePlugin`].

pub mod patch;
mod source;

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Map, Value};

pub use patch::{LineMap, Markers, PatchOptions};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    pub success: bool,
    pub symbols: Vec<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    pub success: bool,
    pub message: Option<String>,
}

impl PatchOutcome {
    pub fn done() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait LanguagePlugin: Send + Sync {
    /// Source file holding the program entry point
    async fn find_primary_file(&self, sources: &[PathBuf]) -> Option<PathBuf>;

    /// What `{executable}` expands to when nothing was compiled
    async fn find_executable(&self, sources: &[PathBuf]) -> Option<String>;

    async fn parse(&self, sources: &[PathBuf], options: &Map<String, Value>) -> ParseOutcome;

    async fn patch(
        &self,
        sources: &[PathBuf],
        options: &PatchOptions,
        markers: &Markers,
        line_map: &mut LineMap,
    ) -> PatchOutcome;
}

/// Plugin for a language name, falling back to the generic one
pub fn plugin_for(language: &str) -> &'static dyn LanguagePlugin {
    source::for_language(language)
}
