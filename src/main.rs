mod config;
mod core;
mod engine;
mod language;
mod tools;
mod transport;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::result::TaskResult;
use crate::core::spec::TaskSpec;
use crate::engine::task::{buildhost_description, Flow, Program, Task, TaskError};
use crate::transport::redis::RedisTransport;
use crate::transport::storage::StorageClient;

#[derive(Parser, Debug)]
#[command(name = "autotester")]
#[command(about = "Build, run, debug and profile submitted programs against task specs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull programs from the Redis queue and grade them
    Worker,
    /// Grade one program locally
    Run {
        /// Task spec (JSON)
        task: PathBuf,
        /// Program sources (zip)
        program: PathBuf,
        /// Write the result here instead of stdout
        #[arg(long)]
        result: Option<PathBuf>,
        /// Defaults to the first language of the task
        #[arg(long)]
        language: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("autotester=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config_path =
        std::env::var("AUTOTESTER_CONFIG").unwrap_or_else(|_| "./files/autotester.toml".into());
    let mut config = Config::load(&config_path)?;
    info!("Loaded configuration from {}", config_path);

    match cli.command {
        Command::Worker => {
            info!("Starting Autotester Worker...");
            let mut transport = RedisTransport::from_env().await?;
            config.buildhost_id = format!("{}-{}", config.buildhost_id, transport.worker_id());

            let storage = StorageClient::from_env().await?;
            transport::serve(&config, &mut transport, Some(&storage)).await
        }
        Command::Run {
            task,
            program,
            result,
            language,
        } => {
            let outcome = run_local(&config, &task, program, language).await?;
            let json = serde_json::to_string_pretty(&outcome)?;
            match result {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => println!("{}", json),
            }
            Ok(())
        }
    }
}

async fn run_local(
    config: &Config,
    task_path: &Path,
    archive: PathBuf,
    language: Option<String>,
) -> Result<TaskResult> {
    let json = std::fs::read_to_string(task_path)
        .with_context(|| format!("Failed to read {}", task_path.display()))?;
    let spec = TaskSpec::from_json(&json)
        .with_context(|| format!("Failed to parse {}", task_path.display()))?;

    let task = match Task::new(config, spec).await {
        Ok(task) => task,
        Err(TaskError::Rejected(reason)) => {
            warn!("{}", reason);
            let mut result =
                TaskResult::rejected(buildhost_description(&config.buildhost_id), reason);
            result.touch();
            return Ok(result);
        }
    };

    let language = match language.or_else(|| task.default_language().map(str::to_string)) {
        Some(language) => language,
        None => anyhow::bail!("Task declares no usable language"),
    };
    info!("Testing {} as {}", archive.display(), language);

    let program = Program { language, archive };
    task.run(&program, &mut |result: &TaskResult| {
        debug!("{} test result(s) so far", result.test_results.len());
        Flow::Continue
    })
    .await
}
