//! Tool resolution
//!
//! Matches a task's declared tool requirements against the registry. The
//! first candidate (in registry order) whose merge succeeds wins, unless
//! the options `prefer` another name, in which case that first success is
//! only a fallback.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info};

use super::plugins::{find_plugin, find_standalone};
use super::{Behavior, ResolvedTool};
use crate::config::Config;
use crate::core::spec::{ToolKind, ToolRequest};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No suitable tool of type '{0}' found")]
    NoSuitableTool(ToolKind),
    #[error("Tool {tool} is not installed at {path}")]
    MissingBinary { tool: String, path: String },
}

pub struct Resolver<'a> {
    config: &'a Config,
    /// Detected versions by `version_line` and `path`
    versions: HashMap<(String, String), Option<String>>,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            versions: HashMap::new(),
        }
    }

    /// Runs the version command of each distinct binary at most once
    async fn detect(&mut self, tool: &mut ResolvedTool) {
        let Some(line) = tool.version_line.clone() else {
            return;
        };
        let cache_key = (line, tool.path().unwrap_or_default().to_string());
        if let Some(version) = self.versions.get(&cache_key) {
            tool.version = version.clone();
            return;
        }
        tool.detect_version().await;
        self.versions.insert(cache_key, tool.version.clone());
    }

    pub async fn resolve(
        &mut self,
        request: &ToolRequest,
        language: &str,
    ) -> Result<ResolvedTool, ResolveError> {
        let key = &request.key;
        let options = &request.options;
        let prefer = options.get("prefer").and_then(Value::as_str);
        let mut fallback = None;

        let config = self.config;
        let candidates = config
            .descriptors(&key.kind)
            .iter()
            .filter(|d| d.applies_to(language));
        for descriptor in candidates {
            let behavior = find_plugin(&key.kind, language, &descriptor.name)
                .unwrap_or(Behavior::External);
            let mut tool = ResolvedTool::from_descriptor(key.clone(), descriptor, behavior);
            if options.contains_key("version") {
                self.detect(&mut tool).await;
            }

            match tool.merge(options) {
                Ok(()) if prefer.map_or(true, |p| p == tool.name()) => {
                    return self.finish(tool).await;
                }
                Ok(()) => {
                    fallback.get_or_insert(tool);
                }
                Err(e) => debug!("{} for {} rejected: {}", descriptor.name, key, e),
            }
        }

        if let Some(tool) = fallback {
            return self.finish(tool).await;
        }

        if !options.contains_key("require") {
            if let Some(behavior) = find_standalone(&key.kind, language) {
                match ResolvedTool::standalone(key.clone(), behavior, options) {
                    Ok(tool) => return Ok(tool),
                    Err(e) => debug!("Stand-alone {} rejected: {}", key, e),
                }
            }
        }

        Err(ResolveError::NoSuitableTool(key.kind.clone()))
    }

    async fn finish(&mut self, mut tool: ResolvedTool) -> Result<ResolvedTool, ResolveError> {
        if !tool.is_installed() {
            return Err(ResolveError::MissingBinary {
                tool: tool.name().to_string(),
                path: tool.path().unwrap_or_default().to_string(),
            });
        }
        self.detect(&mut tool).await;
        info!(
            "Resolved {} to {} ({})",
            tool.key(),
            tool.name(),
            tool.version().unwrap_or("unknown version")
        );
        Ok(tool)
    }

    /// All requirements of one language, or the first failure
    pub async fn resolve_all(
        &mut self,
        requests: &[ToolRequest],
        language: &str,
    ) -> Result<Vec<ResolvedTool>, ResolveError> {
        let mut tools = Vec::with_capacity(requests.len());
        for request in requests {
            tools.push(self.resolve(request, language).await?);
        }
        Ok(tools)
    }
}
