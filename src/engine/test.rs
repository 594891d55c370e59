//! Test orchestration
//!
//! A test runs its tools in declared order inside one workspace, turns the
//! first failure into a grading status and verifies tool output.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::result::{TestResult, ToolResult};
use crate::core::spec::{is_truthy, TestSpec, ToolKind};
use crate::core::status::{ExecutionStatus, TestStatus};
use crate::core::utils::remove_base_path;
use crate::engine::instance::TestInstance;
use crate::engine::matching::Expectation;
use crate::language::{plugin_for, Markers, PatchOptions};
use crate::tools::plugins::find_standalone;
use crate::tools::{ResolvedTool, ToolContext};

/// Bytes below `limit_output` at which a failed run counts as flooding
const EXCESSIVE_OUTPUT_MARGIN: usize = 10;

pub struct Test<'a> {
    config: &'a Config,
    language: &'a str,
    spec: &'a TestSpec,
    tools: Vec<ResolvedTool>,
    instance: TestInstance,
    result: TestResult,
}

impl<'a> Test<'a> {
    /// Sets up the workspace and the tool chain.
    ///
    /// Only host problems are errors; a broken archive or tool declaration
    /// is recorded in the result and the test will not run anything.
    pub async fn prepare(
        config: &'a Config,
        language: &'a str,
        spec: &'a TestSpec,
        task_tools: &[ResolvedTool],
        previous: Option<TestInstance>,
        archive: &Path,
    ) -> anyhow::Result<Test<'a>> {
        let mut result = TestResult::default();

        let instance = match previous {
            Some(previous) if spec.options.reuse => previous.reuse().await?,
            previous => {
                if let Some(previous) = previous {
                    previous.purge().await;
                }
                let mut instance = TestInstance::allocate(config).await?;
                if let Err(e) = instance
                    .unpack(archive, config.extensions_for(language))
                    .await
                {
                    warn!("Failed to unpack {}: {:#}", archive.display(), e);
                    result.fail(TestStatus::UnzipFailed, Some(format!("{:#}", e)));
                }
                instance
            }
        };

        let mut tools = Vec::with_capacity(spec.tools.len());
        if result.success {
            for request in &spec.tools {
                let tool = match task_tools.iter().find(|t| t.key() == &request.key) {
                    Some(task_tool) => {
                        let mut tool = task_tool.clone();
                        if let Err(e) = tool.merge(&request.options) {
                            debug!("Merge of {} failed: {}", request.key, e);
                            result.fail(
                                TestStatus::InternalError,
                                Some(format!(
                                    "Cannot instantiate tool {} with given options",
                                    request.key
                                )),
                            );
                            break;
                        }
                        tool
                    }
                    None => {
                        let standalone = find_standalone(&request.key.kind, language).and_then(
                            |behavior| {
                                ResolvedTool::standalone(
                                    request.key.clone(),
                                    behavior,
                                    &request.options,
                                )
                                .ok()
                            },
                        );
                        match standalone {
                            Some(tool) => tool,
                            None => {
                                result.fail(
                                    TestStatus::InternalError,
                                    Some(format!("Tool {} not found", request.key.kind)),
                                );
                                break;
                            }
                        }
                    }
                };
                tools.push(tool);
            }
        }

        Ok(Test {
            config,
            language,
            spec,
            tools,
            instance,
            result,
        })
    }

    /// False when the workspace holds no source for the language
    pub fn has_sources(&self) -> bool {
        !self.instance.sources().is_empty()
    }

    pub fn status(&self) -> TestStatus {
        self.result.status
    }

    pub async fn run(&mut self) {
        if !self.result.success {
            return;
        }
        debug!(
            "Running test {} in {}",
            self.spec.id.as_deref().unwrap_or("?"),
            self.instance.path().display()
        );

        let base = self.instance.path().to_path_buf();
        let mut ctx = ToolContext::new(self.config, plugin_for(self.language), &mut self.instance);
        let mut patch: Option<(PatchOptions, Markers)> = None;
        let mut patched = false;
        let mut excessive_output = false;

        for tool in &self.tools {
            let kind = tool.kind();
            if *kind == ToolKind::Profile
                && (self.result.status == TestStatus::ExecutionTimeout || excessive_output)
            {
                debug!("Skipping {}: execution timed out or flooded output", tool.key());
                continue;
            }
            if *kind == ToolKind::Patch {
                patched = true;
                if patch.is_none() {
                    patch = PatchOptions::entries(tool.properties())
                        .into_iter()
                        .next()
                        .map(|options| (options, Markers::for_instance(ctx.instance.id())));
                }
            }

            let mut tool_result = tool.run(&mut ctx).await;

            if !tool_result.success && self.result.success {
                reclassify(&mut self.result, tool, &mut tool_result, self.language);
            }

            if tool_result.success {
                if let Some(expectation) = Expectation::from_properties(tool.properties()) {
                    let verification = expectation.verify(
                        &tool_result.output,
                        patch.as_ref().map(|(options, markers)| (options, markers)),
                    );
                    if let Some(output) = verification.output {
                        tool_result.output = output;
                    }
                    if let Some(status) = verification.failure {
                        tool_result.success = false;
                        if self.result.success {
                            self.result.fail(status, None);
                        }
                    }
                }
            }

            strip_base_path(&mut tool_result, &base);
            if patched {
                for diagnostic in tool_result.parsed_output.iter_mut().flatten() {
                    ctx.line_map.fix(diagnostic);
                }
            }

            let failed = !tool_result.success;
            let limit = tool.environment(self.config).limit_output;
            let floods = failed
                && *kind == ToolKind::Execute
                && tool_result.output.len() > limit.saturating_sub(EXCESSIVE_OUTPUT_MARGIN);
            self.result.tools.insert(tool.key().to_string(), tool_result);

            if failed && *kind != ToolKind::Execute {
                break;
            }
            excessive_output |= floods;
        }

        info!(
            "Test {} finished: {}",
            self.spec.id.as_deref().unwrap_or("?"),
            self.result.status
        );
    }

    /// The result, and the workspace for a following `reuse` test
    pub fn finish(self) -> (TestResult, TestInstance) {
        (self.result, self.instance)
    }
}

/// Turns the first failing tool into the test's status
fn reclassify(result: &mut TestResult, tool: &ResolvedTool, tool_result: &mut ToolResult, language: &str) {
    let properties = tool.properties();
    match tool.kind() {
        ToolKind::Execute => match tool_result.status {
            ExecutionStatus::Timeout => result.fail(TestStatus::ExecutionTimeout, None),
            // Only set by output parsers. Reported as a compile failure for
            // compatibility with result consumers
            ExecutionStatus::RuntimeError => result.fail(TestStatus::CompileFailed, None),
            ExecutionStatus::Crash => {
                let expect_crash = properties.get("expect_crash").is_some_and(is_truthy)
                    || (properties.contains_key("expect_exception")
                        && language.eq_ignore_ascii_case("c++"));
                if expect_crash {
                    debug!("Crash of {} was expected", tool.key());
                    tool_result.success = true;
                } else {
                    result.fail(TestStatus::ExecutionCrash, None);
                }
            }
            _ => result.fail(TestStatus::InternalError, tool_result.message.clone()),
        },
        ToolKind::Parse => result.fail(TestStatus::SymbolNotFound, tool_result.message.clone()),
        ToolKind::Compile => result.fail(TestStatus::CompileFailed, None),
        ToolKind::Profile => result.fail(TestStatus::ProfilerError, None),
        _ => result.fail(
            TestStatus::ToolFailed,
            Some(format!("Tool {} failed", tool.key())),
        ),
    }
}

fn strip_base_path(tool_result: &mut ToolResult, base: &Path) {
    tool_result.output = remove_base_path(&tool_result.output, base);
    if let Some(core) = &tool_result.core {
        tool_result.core = Some(remove_base_path(core, base));
    }
    if let Some(message) = &tool_result.message {
        tool_result.message = Some(remove_base_path(message, base));
    }
    for diagnostic in tool_result.parsed_output.iter_mut().flatten() {
        if let Some(file) = &diagnostic.file {
            diagnostic.file = Some(remove_base_path(file, base));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::spec::{TaskSpec, ToolKey, ToolOptions};
    use crate::language::patch::TEST_CODE_FILE;
    use crate::tools::{Behavior, Resolver};
    use serde_json::json;
    use std::io::Write;

    const REGISTRY: &str = r#"
[extensions]
c = [".c"]

[[tools.compile]]
name = "fake-cc"
language = "C"
cmd = "printf '#!/bin/sh\\ncat {source_files}\\n' > {output_file} && chmod +x {output_file}"

[[tools.execute]]
name = "runner"
language = "C"
cmd = "{executable}"

[[tools.execute]]
name = "sleeper"
cmd = "sleep 3"

[[tools.profile]]
name = "fake-profiler"
cmd = "echo profiled"

[[tools.compile]]
name = "gcc"
language = "C"
cmd = "echo {test_path}/main.c:3:1: error: expected declaration; echo {test_path}/main.c:1:10: fatal error: x.h: No such file; exit 1"

[[tools.lint]]
name = "fake-lint"
cmd = "echo {test_path}/main.c: bad style; exit 1"
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        config: Config,
    }

    fn fixture(source: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_toml_str(REGISTRY).unwrap();
        config.basepath = dir.path().join("work");

        let file = std::fs::File::create(dir.path().join("program.zip")).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("main.c", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(source.as_bytes()).unwrap();
        zip.finish().unwrap();

        Fixture { dir, config }
    }

    async fn run_first_test(fixture: &Fixture, task: &str) -> TestResult {
        let spec = TaskSpec::from_json(task).unwrap();
        let tools = Resolver::new(&fixture.config)
            .resolve_all(&spec.tools, "C")
            .await
            .unwrap();
        let archive = fixture.dir.path().join("program.zip");

        let mut test = Test::prepare(&fixture.config, "C", &spec.tests[0], &tools, None, &archive)
            .await
            .unwrap();
        test.run().await;
        let (result, instance) = test.finish();
        instance.purge().await;
        result
    }

    #[tokio::test]
    async fn test_compile_and_execute_expected_output() {
        let fixture = fixture("42\n");
        let result = run_first_test(
            &fixture,
            r#"{
                "tools": { "compile": {}, "execute": {} },
                "tests": [{ "compile": {}, "execute": { "expect": ["42"] } }]
            }"#,
        )
        .await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.status, TestStatus::Success);
        assert_eq!(result.tools.len(), 2);
    }

    #[tokio::test]
    async fn test_wrong_output() {
        let fixture = fixture("41\n");
        let result = run_first_test(
            &fixture,
            r#"{
                "tools": { "compile": {}, "execute": {} },
                "tests": [{ "compile": {}, "execute": { "expect": ["42"] } }]
            }"#,
        )
        .await;

        assert_eq!(result.status, TestStatus::WrongOutput);
        assert!(!result.tools.get("execute").unwrap().success);
    }

    #[tokio::test]
    async fn test_timeout_skips_profiler() {
        let fixture = fixture("");
        let result = run_first_test(
            &fixture,
            r#"{
                "tools": {
                    "execute": { "require": "sleeper", "environment": { "timeout": 1 } },
                    "profile": {}
                },
                "tests": [{ "execute": {}, "profile": {} }]
            }"#,
        )
        .await;

        assert_eq!(result.status, TestStatus::ExecutionTimeout);
        assert_eq!(
            result.tools.get("execute").unwrap().status,
            ExecutionStatus::Timeout
        );
        assert!(result.tools.get("profile").is_none());
    }

    #[tokio::test]
    async fn test_crash_expectation() {
        let task = |expect_crash: bool| {
            format!(
                r#"{{
                    "tools": {{ "compile": {{}}, "execute": {{}} }},
                    "tests": [{{ "compile": {{}}, "execute": {{ "expect_crash": {} }} }}]
                }}"#,
                expect_crash
            )
        };

        let fixture = fixture("crash");
        let mut config = fixture.config.clone();
        config.tools.get_mut("compile").unwrap()[0].properties.insert(
            "cmd".into(),
            "printf '#!/bin/sh\\ntouch core\\n' > {output_file} && chmod +x {output_file}".into(),
        );
        let fixture = Fixture {
            dir: fixture.dir,
            config,
        };

        let result = run_first_test(&fixture, &task(true)).await;
        assert!(result.success, "{:?}", result);

        let result = run_first_test(&fixture, &task(false)).await;
        assert_eq!(result.status, TestStatus::ExecutionCrash);
        let execute = result.tools.get("execute").unwrap();
        assert_eq!(execute.core.as_deref(), Some("core"));
    }

    #[test]
    fn test_expected_exception_accepts_cpp_crash() {
        let options = json!({ "expect_exception": true }).as_object().unwrap().clone();
        let tool =
            ResolvedTool::standalone(ToolKey::new(ToolKind::Execute), Behavior::Execute, &options)
                .unwrap();
        let crashed = || {
            let mut tool_result = ToolResult::failed("core dumped");
            tool_result.status = ExecutionStatus::Crash;
            tool_result
        };

        let mut result = TestResult::default();
        let mut tool_result = crashed();
        reclassify(&mut result, &tool, &mut tool_result, "C++");
        assert!(tool_result.success);
        assert!(result.success);

        // only C++ reports uncaught exceptions as a crash
        let mut tool_result = crashed();
        reclassify(&mut result, &tool, &mut tool_result, "C");
        assert!(!tool_result.success);
        assert_eq!(result.status, TestStatus::ExecutionCrash);
    }

    #[test]
    fn test_parser_runtime_error_reports_compile_failure() {
        let tool = ResolvedTool::standalone(
            ToolKey::new(ToolKind::Execute),
            Behavior::Execute,
            &ToolOptions::new(),
        )
        .unwrap();
        let mut tool_result = ToolResult::failed("segfault in user code");
        tool_result.status = ExecutionStatus::RuntimeError;

        let mut result = TestResult::default();
        reclassify(&mut result, &tool, &mut tool_result, "C");
        assert_eq!(result.status, TestStatus::CompileFailed);
        assert!(!tool_result.success);
    }

    #[tokio::test]
    async fn test_patched_output_is_cut_to_markers() {
        let task = |expect: &str| {
            format!(
                r#"{{
                    "tools": {{ "compile": {{}}, "execute": {{}} }},
                    "tests": [{{
                        "patch": {{ "code": "magic();", "use_markers": true }},
                        "compile": {{}},
                        "execute": {{ "expect": ["{}"], "matching": "substring" }}
                    }}]
                }}"#,
                expect
            )
        };
        // the fake compiler's binary prints the patched source
        let fixture = fixture("int main() {\n}\n");

        let result = run_first_test(&fixture, &task("magic();")).await;
        assert!(result.success, "{:?}", result);
        let output = &result.tools.get("execute").unwrap().output;
        assert!(output.contains("magic();"));
        assert!(!output.contains("_main"));

        let result = run_first_test(&fixture, &task("_main")).await;
        assert_eq!(result.status, TestStatus::WrongOutput);
    }

    #[tokio::test]
    async fn test_compiler_lines_follow_the_submission() {
        let fixture = fixture("int main() {\n}\n");
        let result = run_first_test(
            &fixture,
            r##"{
                "tools": { "compile": { "require": "gcc" } },
                "tests": [{
                    "patch": { "code": "#include <x.h>", "position": "top_of_file" },
                    "compile": {}
                }]
            }"##,
        )
        .await;

        assert_eq!(result.status, TestStatus::CompileFailed);
        let diagnostics = result.tools.get("compile").unwrap().parsed_output.clone().unwrap();
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].file.as_deref(), Some("main.c"));
        assert_eq!(diagnostics[0].line, Some(2));
        assert_eq!(diagnostics[1].file.as_deref(), Some(TEST_CODE_FILE));
        assert_eq!(diagnostics[1].line, Some(1));
    }

    #[tokio::test]
    async fn test_failing_tool_stops_chain_and_hides_paths() {
        let fixture = fixture("42\n");
        let result = run_first_test(
            &fixture,
            r#"{
                "tools": { "lint": {}, "compile": {} },
                "tests": [{ "lint": {}, "compile": {} }]
            }"#,
        )
        .await;

        assert_eq!(result.status, TestStatus::ToolFailed);
        assert_eq!(result.message.as_deref(), Some("Tool lint failed"));
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools.get("lint").unwrap().output, "main.c: bad style\n");
    }

    #[tokio::test]
    async fn test_undeclared_options_fail_instantiation() {
        let fixture = fixture("42\n");
        let result = run_first_test(
            &fixture,
            r#"{
                "tools": { "compile": {} },
                "tests": [{ "compile": { "features": ["optimize"] } }]
            }"#,
        )
        .await;
        assert_eq!(result.status, TestStatus::InternalError);
        assert_eq!(
            result.message.as_deref(),
            Some("Cannot instantiate tool compile with given options")
        );

        let result = run_first_test(
            &fixture,
            r#"{ "tools": {}, "tests": [{ "debug": {} }] }"#,
        )
        .await;
        assert_eq!(result.message.as_deref(), Some("Tool debug not found"));
    }

    #[tokio::test]
    async fn test_broken_archive() {
        let fixture = fixture("");
        std::fs::write(fixture.dir.path().join("program.zip"), b"garbage").unwrap();
        let result = run_first_test(
            &fixture,
            r#"{ "tools": { "execute": {} }, "tests": [{ "execute": {} }] }"#,
        )
        .await;
        assert_eq!(result.status, TestStatus::UnzipFailed);
        assert!(result.tools.is_empty());
    }
}
