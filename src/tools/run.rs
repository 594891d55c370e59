//! Running one resolved tool inside a test workspace

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

use super::diagnostics::parse_gcc_output;
use super::{Behavior, ResolvedTool};
use crate::config::Config;
use crate::core::result::ToolResult;
use crate::core::spec::ToolKind;
use crate::core::status::ExecutionStatus;
use crate::engine::command::CommandLine;
use crate::engine::executer::{execute, ExecutionSpec};
use crate::engine::instance::TestInstance;
use crate::language::{LanguagePlugin, LineMap, Markers, PatchOptions};

/// State shared by the tools of one test
pub struct ToolContext<'a> {
    pub config: &'a Config,
    pub plugin: &'a dyn LanguagePlugin,
    pub instance: &'a mut TestInstance,
    /// Core dump left by the last process, consumed by a debug step
    pub core_dump: Option<PathBuf>,
    pub line_map: LineMap,
}

impl<'a> ToolContext<'a> {
    pub fn new(
        config: &'a Config,
        plugin: &'a dyn LanguagePlugin,
        instance: &'a mut TestInstance,
    ) -> Self {
        Self {
            config,
            plugin,
            instance,
            core_dump: None,
            line_map: LineMap::default(),
        }
    }
}

impl ResolvedTool {
    pub async fn run(&self, ctx: &mut ToolContext<'_>) -> ToolResult {
        match self.behavior {
            Behavior::External => self.run_external(ctx).await,
            Behavior::Execute => {
                let mut result = self.run_external(ctx).await;
                if result.status == ExecutionStatus::CodeNotZero {
                    result.success = true;
                }
                result
            }
            Behavior::Gcc => {
                let mut result = self.run_external(ctx).await;
                result.parsed_output = Some(parse_gcc_output(&result.output));
                result
            }
            Behavior::Debug => self.run_debug(ctx).await,
            Behavior::Patch => self.run_patch(ctx).await,
            Behavior::Parse => self.run_parse(ctx).await,
        }
    }

    /// Explicit `files`, relative to the workspace, or the discovered sources
    fn source_files(&self, instance: &TestInstance) -> Vec<PathBuf> {
        let declared: Vec<PathBuf> = match self.properties.get("files") {
            Some(Value::Array(files)) => files
                .iter()
                .filter_map(Value::as_str)
                .map(|f| instance.path().join(f))
                .collect(),
            Some(Value::String(file)) => vec![instance.path().join(file)],
            _ => Vec::new(),
        };
        if declared.is_empty() {
            instance.sources().to_vec()
        } else {
            declared
        }
    }

    async fn command_line(&self, ctx: &mut ToolContext<'_>, template: &str) -> Result<String, String> {
        let mut command = CommandLine::new(template);
        for (key, value) in &self.properties {
            match value {
                Value::String(text) => command = command.with_value(key.as_str(), text),
                Value::Number(n) => command = command.with_value(key.as_str(), &n.to_string()),
                _ => {}
            }
        }

        command = command.with_path("test_path", ctx.instance.path());

        if command.uses("output_file") {
            let output = tempfile::Builder::new()
                .prefix("output")
                .tempfile_in(ctx.instance.path())
                .and_then(|file| file.into_temp_path().keep().map_err(|e| e.error))
                .map_err(|e| format!("Cannot create output file: {}", e))?;
            command = command.with_path("output_file", &output);
            if *self.kind() == ToolKind::Compile {
                ctx.instance.set_executable(output);
            }
        }

        if command.uses("source_files") {
            let files = self.source_files(ctx.instance);
            command = command.with_paths("source_files", files.iter().map(PathBuf::as_path));
        }

        if command.uses("executable") {
            let executable = match ctx.instance.executable() {
                Some(path) => Some(path.to_string_lossy().into_owned()),
                None => ctx.plugin.find_executable(ctx.instance.sources()).await,
            };
            let executable = executable.ok_or("Couldn't find executable")?;
            command = command.with_path("executable", Path::new(&executable));
        }

        if let Some(core) = &ctx.core_dump {
            command = command.with_path("coredump", core);
        }

        Ok(command.render())
    }

    async fn run_external(&self, ctx: &mut ToolContext<'_>) -> ToolResult {
        let Some(template) = self.properties.get("cmd").and_then(Value::as_str) else {
            return ToolResult::failed(format!("Tool {} has no command", self.key));
        };
        let command = match self.command_line(ctx, template).await {
            Ok(command) => command,
            Err(message) => return ToolResult::failed(message),
        };

        let spec = ExecutionSpec::new(ctx.instance.path(), command)
            .with_environment(self.environment(ctx.config));
        let outcome = match execute(&spec).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Tool {} could not start: {:#}", self.key, e);
                return ToolResult::failed(format!("{:#}", e));
            }
        };
        debug!(
            "Tool {} finished with {} (exit code {}) in {:.3}s",
            self.key, outcome.status, outcome.exit_code, outcome.duration
        );

        ctx.core_dump = outcome.core.clone();
        ToolResult {
            success: outcome.is_success(),
            status: outcome.status,
            exit_code: outcome.exit_code,
            duration: outcome.duration,
            core: outcome
                .core
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            output: outcome.output,
            message: None,
            parsed_output: None,
            symbols: None,
        }
    }

    /// Inspects the core dump of the last crash, then removes it
    async fn run_debug(&self, ctx: &mut ToolContext<'_>) -> ToolResult {
        let Some(core) = ctx.core_dump.clone() else {
            return ToolResult::completed(true, Some("Nothing to debug".into()));
        };
        let mut result = self.run_external(ctx).await;
        if let Err(e) = fs::remove_file(&core).await {
            warn!("Failed to remove core dump {}: {}", core.display(), e);
        }
        ctx.core_dump = None;
        result.success = true;
        result
    }

    async fn run_patch(&self, ctx: &mut ToolContext<'_>) -> ToolResult {
        let entries = PatchOptions::entries(&self.properties);
        if entries.is_empty() {
            return ToolResult::completed(true, Some("Nothing to do".into()));
        }
        let markers = Markers::for_instance(ctx.instance.id());
        for options in &entries {
            let outcome = ctx
                .plugin
                .patch(ctx.instance.sources(), options, &markers, &mut ctx.line_map)
                .await;
            if !outcome.success {
                return ToolResult::completed(false, outcome.message);
            }
        }
        ToolResult::completed(true, None)
    }

    async fn run_parse(&self, ctx: &mut ToolContext<'_>) -> ToolResult {
        let outcome = ctx
            .plugin
            .parse(ctx.instance.sources(), &self.properties)
            .await;
        let mut result = ToolResult::completed(outcome.success, outcome.message);
        result.symbols = Some(outcome.symbols);
        result
    }
}
