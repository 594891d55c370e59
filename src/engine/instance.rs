//! Test workspace
//!
//! Every test owns a directory `<basepath>/bs_<id>` until it is purged or
//! handed to the next test through `reuse`. The id is random and retried
//! until an unused directory name is found, up to a fixed number of draws.
//! The check is not atomic across hosts sharing `basepath`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::Rng;
use tokio::fs;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::utils::{extract_zip, find_source_files, is_core_dump};

/// Random draws before `allocate` gives up on a crowded `basepath`
const MAX_ALLOCATION_ATTEMPTS: u32 = 1000;

#[derive(Debug)]
pub struct TestInstance {
    id: u32,
    path: PathBuf,
    sources: Vec<PathBuf>,
    executable: Option<PathBuf>,
}

impl TestInstance {
    /// Creates a fresh, empty workspace.
    ///
    /// Failing to create the directory is a host problem, not a grading one.
    pub async fn allocate(config: &Config) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.basepath)
            .await
            .with_context(|| format!("Failed to create {}", config.basepath.display()))?;

        let upper = config.max_instances.max(1);
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let id = rand::thread_rng().gen_range(0..upper);
            let path = config.basepath.join(format!("bs_{}", id));
            if fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            match fs::create_dir(&path).await {
                Ok(()) => {
                    debug!("Allocated workspace {}", path.display());
                    return Ok(Self {
                        id,
                        path,
                        sources: Vec::new(),
                        executable: None,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create workspace {}", path.display()))
                }
            }
        }
        anyhow::bail!(
            "No free workspace under {} after {} attempts",
            config.basepath.display(),
            MAX_ALLOCATION_ATTEMPTS
        )
    }

    /// Unpacks the program archive and discovers its source files
    pub async fn unpack(&mut self, archive: &Path, extensions: &[String]) -> anyhow::Result<()> {
        let archive = archive.to_path_buf();
        let dest = self.path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let file = std::fs::File::open(&archive)
                .with_context(|| format!("Failed to open archive {}", archive.display()))?;
            extract_zip(file, &dest)
        })
        .await
        .context("Unpacking task panicked")??;

        self.sources = find_source_files(&self.path, extensions);
        debug!(
            "Workspace {} has {} source file(s)",
            self.path.display(),
            self.sources.len()
        );
        Ok(())
    }

    /// Hands the workspace to the next test, removing stray core dumps
    pub async fn reuse(self) -> anyhow::Result<Self> {
        let mut entries = fs::read_dir(&self.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if is_core_dump(&entry.file_name().to_string_lossy()) {
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(self)
    }

    pub async fn purge(self) {
        if let Err(e) = fs::remove_dir_all(&self.path).await {
            warn!("Failed to purge workspace {}: {}", self.path.display(), e);
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    pub fn set_executable(&mut self, executable: PathBuf) {
        self.executable = Some(executable);
    }
}
