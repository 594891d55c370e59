//! Transport layer
//!
//! Where programs and task specs come from and where results go. The engine
//! itself only sees a [`Transport`]; retries and persistence live behind it.

pub mod redis;
pub mod storage;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::result::TaskResult;
use crate::core::spec::TaskSpec;
use crate::engine::task::{buildhost_description, Flow, Program, Task, TaskError, TestObserver};
use storage::StorageClient;

/// Where a program's zip archive lives
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchiveSource {
    /// Already on this host
    Path { path: PathBuf },
    /// Base64 encoded zip
    Inline { data: String },
    /// Object key in the program bucket
    Storage { key: String },
}

impl ArchiveSource {
    /// Materializes the archive as a local file, downloading or decoding
    /// into `dir` when needed.
    pub async fn fetch(&self, storage: Option<&StorageClient>, dir: &Path) -> Result<PathBuf> {
        match self {
            ArchiveSource::Path { path } => Ok(path.clone()),
            ArchiveSource::Inline { data } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .context("Invalid base64 archive")?;
                let path = dir.join("program.zip");
                tokio::fs::write(&path, bytes)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                Ok(path)
            }
            ArchiveSource::Storage { key } => {
                let storage = storage.context("No storage configured for archive download")?;
                let path = dir.join("program.zip");
                storage.download_to(key, &path).await?;
                Ok(path)
            }
        }
    }
}

/// One program to grade
#[derive(Debug, Clone, Deserialize)]
pub struct ProgramJob {
    pub id: String,
    pub task_id: String,
    /// Defaults to the first language of the task this host can serve
    #[serde(default)]
    pub language: Option<String>,
    pub archive: ArchiveSource,
}

#[async_trait]
pub trait Transport: Send {
    /// Blocks until a program is available
    async fn next_program(&mut self) -> Result<ProgramJob>;

    async fn get_task(&mut self, task_id: &str) -> Result<TaskSpec>;

    /// Stores an intermediate or final result; `Flow::Stop` asks the worker
    /// to abandon the program.
    async fn set_result(&mut self, program_id: &str, result: &TaskResult) -> Result<Flow>;

    async fn reject_task(&mut self, task_id: &str, reason: &str) -> Result<()>;
}

/// Pushes every intermediate result to the transport
struct ResultSink<'t> {
    transport: &'t mut dyn Transport,
    program_id: &'t str,
}

#[async_trait]
impl<'t> TestObserver for ResultSink<'t> {
    async fn after_test(&mut self, result: &TaskResult) -> Flow {
        match self.transport.set_result(self.program_id, result).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!("Failed to store intermediate result for {}: {:#}", self.program_id, e);
                Flow::Continue
            }
        }
    }
}

/// Pull loop: grades programs until the transport fails for good.
pub async fn serve(
    config: &Config,
    transport: &mut dyn Transport,
    storage: Option<&StorageClient>,
) -> Result<()> {
    info!("Waiting for programs...");
    loop {
        let job = transport.next_program().await?;
        process_job(config, transport, storage, &job).await?;
    }
}

/// Grades one program and reports the final result.
///
/// Only host failures are returned; everything else ends up in a result.
pub async fn process_job(
    config: &Config,
    transport: &mut dyn Transport,
    storage: Option<&StorageClient>,
    job: &ProgramJob,
) -> Result<()> {
    info!("Received program {} for task {}", job.id, job.task_id);

    let spec = match transport.get_task(&job.task_id).await {
        Ok(spec) => spec,
        Err(e) => {
            error!("Failed to load task {}: {:#}", job.task_id, e);
            return report_rejection(config, transport, job, &format!("{:#}", e)).await;
        }
    };

    let task = match Task::new(config, spec).await {
        Ok(task) => task,
        Err(TaskError::Rejected(reason)) => {
            warn!("Task {} rejected: {}", job.task_id, reason);
            if let Err(e) = transport.reject_task(&job.task_id, &reason).await {
                error!("Failed to report rejection of task {}: {:#}", job.task_id, e);
            }
            return report_rejection(config, transport, job, &reason).await;
        }
    };

    let language = match job.language.as_deref().or(task.default_language()) {
        Some(language) => language.to_string(),
        None => {
            return report_rejection(config, transport, job, "Task has no usable language").await
        }
    };

    let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
    let archive = match job.archive.fetch(storage, scratch.path()).await {
        Ok(archive) => archive,
        Err(e) => {
            error!("Failed to fetch archive of program {}: {:#}", job.id, e);
            let reason = format!("Failed to fetch program archive: {:#}", e);
            return report_rejection(config, transport, job, &reason).await;
        }
    };

    let program = Program { language, archive };
    let result = {
        let mut sink = ResultSink {
            transport: &mut *transport,
            program_id: &job.id,
        };
        task.run(&program, &mut sink).await?
    };

    if let Err(e) = transport.set_result(&job.id, &result).await {
        error!("Failed to store result for program {}: {:#}", job.id, e);
    }
    info!("Program {} finished: {}", job.id, result.status);
    Ok(())
}

async fn report_rejection(
    config: &Config,
    transport: &mut dyn Transport,
    job: &ProgramJob,
    reason: &str,
) -> Result<()> {
    let mut result = TaskResult::rejected(buildhost_description(&config.buildhost_id), reason);
    result.touch();
    if let Err(e) = transport.set_result(&job.id, &result).await {
        error!("Failed to store result for program {}: {:#}", job.id, e);
    }
    Ok(())
}
