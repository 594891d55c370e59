//! Task driver
//!
//! Owns the test sequence of one program run: workspace hand-over between
//! tests, per-test reporting policy and the final aggregation.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::result::{BuildhostDescription, TaskResult, TestRecord};
use crate::core::spec::{TaskSpec, PREPARE_TEST_ID};
use crate::core::status::{TaskStatus, TestStatus};
use crate::engine::instance::TestInstance;
use crate::engine::test::Test;
use crate::tools::{ResolvedTool, Resolver};

/// Whether the driver should go on with the next test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receives the accumulated result after every test
#[async_trait]
pub trait TestObserver: Send {
    async fn after_test(&mut self, result: &TaskResult) -> Flow;
}

#[async_trait]
impl<F> TestObserver for F
where
    F: FnMut(&TaskResult) -> Flow + Send,
{
    async fn after_test(&mut self, result: &TaskResult) -> Flow {
        self(result)
    }
}

/// A submitted program
#[derive(Debug, Clone)]
pub struct Program {
    pub language: String,
    /// Zip archive with the sources
    pub archive: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task rejected: {0}")]
    Rejected(String),
}

pub fn buildhost_description(id: &str) -> BuildhostDescription {
    let os = match nix::sys::utsname::uname() {
        Ok(uts) => format!(
            "{} {} {}",
            uts.sysname().to_string_lossy(),
            uts.release().to_string_lossy(),
            uts.machine().to_string_lossy()
        ),
        Err(e) => {
            warn!("uname failed: {}", e);
            std::env::consts::OS.to_string()
        }
    };
    BuildhostDescription {
        id: id.to_string(),
        os,
    }
}

pub struct Task<'a> {
    config: &'a Config,
    spec: TaskSpec,
    /// Resolved tools of every usable language, by lowercased name
    tools: HashMap<String, Vec<ResolvedTool>>,
}

impl<'a> Task<'a> {
    /// Resolves the tools of every declared language.
    ///
    /// A language is usable only if all of its tools resolve; a task with no
    /// usable language is rejected before anything runs.
    pub async fn new(config: &'a Config, spec: TaskSpec) -> Result<Task<'a>, TaskError> {
        let mut resolver = Resolver::new(config);
        let mut tools = HashMap::new();
        let mut reasons = Vec::new();

        for language in &spec.languages {
            match resolver.resolve_all(&spec.tools, language).await {
                Ok(resolved) => {
                    tools.insert(language.to_lowercase(), resolved);
                }
                Err(e) => {
                    warn!("Language {} is not usable: {}", language, e);
                    reasons.push(format!("{}: {}", language, e));
                }
            }
        }

        if tools.is_empty() {
            let reason = if reasons.is_empty() {
                "Task declares no languages".to_string()
            } else {
                reasons.join("; ")
            };
            return Err(TaskError::Rejected(reason));
        }
        Ok(Task {
            config,
            spec,
            tools,
        })
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// First declared language this host can serve
    pub fn default_language(&self) -> Option<&str> {
        self.spec
            .languages
            .iter()
            .find(|l| self.tools.contains_key(&l.to_lowercase()))
            .map(String::as_str)
    }

    /// Runs every test against `program`.
    ///
    /// Errors are host failures only; everything about the program itself is
    /// in the returned result.
    pub async fn run(
        &self,
        program: &Program,
        observer: &mut dyn TestObserver,
    ) -> anyhow::Result<TaskResult> {
        let host = buildhost_description(&self.config.buildhost_id);
        let Some(tools) = self.tools.get(&program.language.to_lowercase()) else {
            return Ok(TaskResult::rejected(
                host,
                format!("Language {} is not supported by this task", program.language),
            ));
        };

        let mut result = TaskResult::new(host, TaskStatus::CurrentlyTesting);
        for tool in tools {
            if let Some(version) = tool.version() {
                result.tools.insert(tool.key().to_string(), version.to_string());
            }
        }

        let tests = self.spec.test_sequence();
        let has_prepare = self.spec.prepare.is_some();
        let mut instance: Option<TestInstance> = None;
        let mut prepare_status = None;
        let mut next_id: u64 = 1;

        for (index, spec) in tests.iter().enumerate() {
            let id = match &spec.id {
                Some(id) => {
                    if let Ok(n) = id.parse::<u64>() {
                        next_id = next_id.max(n + 1);
                    }
                    id.clone()
                }
                None => {
                    let id = next_id.to_string();
                    next_id += 1;
                    id
                }
            };

            let mut test = Test::prepare(
                self.config,
                &program.language,
                spec,
                tools,
                instance.take(),
                &program.archive,
            )
            .await?;

            if index == 0 && test.status() != TestStatus::UnzipFailed && !test.has_sources() {
                info!("No {} sources found in {}", program.language, program.archive.display());
                test.finish().1.purge().await;
                result.status = TaskStatus::NoSourcesFound;
                result.touch();
                return Ok(result);
            }

            test.run().await;
            let (test_result, workspace) = test.finish();
            instance = Some(workspace);

            if has_prepare && index == 0 {
                prepare_status = Some(test_result.status);
            }
            let success = test_result.success;
            if !(spec.options.silent && success) {
                let record = if spec.options.nodetail {
                    TestRecord::Brief { success }
                } else {
                    TestRecord::Full(test_result)
                };
                result.test_results.insert(id.clone(), record);
            }
            result.touch();

            if observer.after_test(&result).await == Flow::Stop {
                info!("Stop requested after test {}", id);
                break;
            }
            if spec.options.terminate && !success {
                info!("Test {} failed, terminating", id);
                break;
            }
        }

        if let Some(instance) = instance {
            instance.purge().await;
        }

        if prepare_status == Some(TestStatus::CompileFailed) {
            result.status = TaskStatus::CompileError;
            result.test_results.retain(|id, _| id == PREPARE_TEST_ID);
        } else {
            result.status = TaskStatus::FinishedTesting;
        }
        result.touch();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    const REGISTRY: &str = r#"
[extensions]
c = [".c"]

[[tools.compile]]
name = "fake-cc"
language = "C"
version_line = "echo 'fake-cc 1.2.3'"
cmd = "printf '#!/bin/sh\\ncat {source_files}\\n' > {output_file} && chmod +x {output_file}"

[[tools.compile]]
name = "broken-cc"
language = "C"
cmd = "echo 'main.c:1:1: error: nope'; exit 1"
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        config: Config,
    }

    impl Fixture {
        fn new(files: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config::from_toml_str(REGISTRY).unwrap();
            config.basepath = dir.path().join("work");

            let file = std::fs::File::create(dir.path().join("program.zip")).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            for (name, content) in files {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(content.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
            Fixture { dir, config }
        }

        fn program(&self) -> Program {
            Program {
                language: "C".into(),
                archive: self.dir.path().join("program.zip"),
            }
        }

        fn workspaces_left(&self) -> usize {
            std::fs::read_dir(&self.config.basepath)
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    async fn run(fixture: &Fixture, task: &str) -> TaskResult {
        let spec = TaskSpec::from_json(task).unwrap();
        let task = Task::new(&fixture.config, spec).await.unwrap();
        task.run(&fixture.program(), &mut |_: &TaskResult| Flow::Continue)
            .await
            .unwrap()
    }

    fn status_of(result: &TaskResult, id: &str) -> Option<TestStatus> {
        result.test_results.get(id).and_then(TestRecord::status)
    }

    #[tokio::test]
    async fn test_compile_and_execute() {
        let fixture = Fixture::new(&[("main.c", "42\n")]);
        let result = run(
            &fixture,
            r#"{
                "languages": ["C"],
                "tools": { "compile": {}, "execute": {} },
                "tests": [{ "compile": {}, "execute": { "expect": ["42"] } }]
            }"#,
        )
        .await;

        assert_eq!(result.status, TaskStatus::FinishedTesting);
        assert_eq!(status_of(&result, "1"), Some(TestStatus::Success));
        assert_eq!(result.tools.get("compile").map(String::as_str), Some("fake-cc 1.2.3"));
        assert!(result.time.is_some());
        assert_eq!(fixture.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_ids_and_reporting_options() {
        let fixture = Fixture::new(&[("main.c", "42\n")]);
        let result = run(
            &fixture,
            r#"{
                "languages": ["C"],
                "tools": { "compile": {}, "execute": {} },
                "tests": [
                    { "id": 5, "compile": {} },
                    { "options": ["reuse", "nodetail"], "execute": { "expect": "42" } },
                    { "options": "reuse", "execute": { "expect": "41" } },
                    { "options": ["reuse", "silent"], "execute": { "expect": "42" } }
                ]
            }"#,
        )
        .await;

        let ids: Vec<&String> = result.test_results.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, ["5", "6", "7"]);
        assert_eq!(
            serde_json::to_value(result.test_results.get("6").unwrap()).unwrap(),
            serde_json::json!({ "success": true })
        );
        assert_eq!(status_of(&result, "7"), Some(TestStatus::WrongOutput));
    }

    #[tokio::test]
    async fn test_workspace_is_purged_without_reuse() {
        let fixture = Fixture::new(&[("main.c", "42\n")]);
        let result = run(
            &fixture,
            r#"{
                "languages": ["C"],
                "tools": { "compile": {}, "execute": {} },
                "tests": [
                    { "compile": {} },
                    { "execute": { "expect": "42" } }
                ]
            }"#,
        )
        .await;

        // fresh workspace, so the compiled program is gone
        assert_eq!(status_of(&result, "1"), Some(TestStatus::Success));
        assert!(!result.test_results.get("2").unwrap().success());
    }

    #[tokio::test]
    async fn test_terminate_and_stop() {
        let fixture = Fixture::new(&[("main.c", "42\n")]);
        let task = r#"{
            "languages": ["C"],
            "tools": { "compile": {}, "execute": {} },
            "tests": [
                { "options": ["terminate"], "compile": {}, "execute": { "expect": "0" } },
                { "compile": {} }
            ]
        }"#;
        let result = run(&fixture, task).await;
        assert_eq!(result.test_results.len(), 1);

        let spec = TaskSpec::from_json(&task.replace(r#""terminate""#, r#""nodetail""#)).unwrap();
        let task = Task::new(&fixture.config, spec).await.unwrap();
        let mut seen = 0;
        let result = task
            .run(&fixture.program(), &mut |_: &TaskResult| {
                seen += 1;
                Flow::Stop
            })
            .await
            .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(result.test_results.len(), 1);
    }

    #[tokio::test]
    async fn test_prepare_compile_failure_collapses() {
        let fixture = Fixture::new(&[("main.c", "42\n")]);
        let result = run(
            &fixture,
            r#"{
                "languages": ["C"],
                "tools": { "compile": { "require": "broken-cc" } },
                "prepare": ["compile"],
                "tests": [{ "compile": {} }]
            }"#,
        )
        .await;

        assert_eq!(result.status, TaskStatus::CompileError);
        assert_eq!(result.test_results.len(), 1);
        assert_eq!(status_of(&result, PREPARE_TEST_ID), Some(TestStatus::CompileFailed));
    }

    #[tokio::test]
    async fn test_silent_prepare_is_hidden_when_it_passes() {
        let fixture = Fixture::new(&[("main.c", "42\n")]);
        let result = run(
            &fixture,
            r#"{
                "languages": ["C"],
                "tools": { "compile": {}, "execute": {} },
                "prepare": ["compile"],
                "tests": [{ "compile": {}, "execute": { "expect": "42" } }]
            }"#,
        )
        .await;

        assert_eq!(result.status, TaskStatus::FinishedTesting);
        assert!(result.test_results.get(PREPARE_TEST_ID).is_none());
        assert_eq!(status_of(&result, "1"), Some(TestStatus::Success));
    }

    #[tokio::test]
    async fn test_no_sources_found() {
        let fixture = Fixture::new(&[("README.md", "nothing here")]);
        let result = run(
            &fixture,
            r#"{ "languages": ["C"], "tools": { "compile": {} }, "tests": [{ "compile": {} }] }"#,
        )
        .await;

        assert_eq!(result.status, TaskStatus::NoSourcesFound);
        assert!(result.test_results.is_empty());
        assert_eq!(fixture.workspaces_left(), 0);
    }

    #[tokio::test]
    async fn test_rejections() {
        let fixture = Fixture::new(&[("main.c", "42\n")]);

        let spec = TaskSpec::from_json(
            r#"{ "languages": ["C", "Java"], "tools": { "compile": { "features": ["c++17"] } } }"#,
        )
        .unwrap();
        let err = Task::new(&fixture.config, spec).await.err().unwrap();
        assert!(err
            .to_string()
            .contains("No suitable tool of type 'compile' found"));

        let spec = TaskSpec::from_json(r#"{ "languages": ["C"], "tools": { "execute": {} } }"#)
            .unwrap();
        let task = Task::new(&fixture.config, spec).await.unwrap();
        assert_eq!(task.default_language(), Some("C"));

        let program = Program {
            language: "Python".into(),
            archive: Path::new("/nonexistent.zip").to_path_buf(),
        };
        let result = task
            .run(&program, &mut |_: &TaskResult| Flow::Continue)
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Rejected);
        assert!(result.test_results.is_empty());
        assert!(result.message.is_some());
    }
}
