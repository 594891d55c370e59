use std::io::{Seek, SeekFrom, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use anyhow::Context;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::core::status::ExecutionStatus;
use crate::core::utils::{clear_unicode, find_core_dump};
use crate::engine::command::is_plain_argv;
use crate::engine::environment::{Backend, ExecutionEnvironment, OutputStream, TimeoutMethod};

/// `ulimit -c 1000000`, in bytes
const CORE_LIMIT_BYTES: u64 = 1_000_000 * 1024;

/// Banner printed by coreutils `timeout` when the child dumps core
const TIMEOUT_CORE_BANNER: &str = "timeout: the monitored command dumped core\n";

/// Extra bytes read past the cap, so callers can tell a capped stream
const READ_SLACK: usize = 10;

#[derive(Debug)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// Captured output after truncation and cleanup
    pub output: String,
    pub exit_code: i32,
    /// Wall time in seconds
    pub duration: f64,
    /// Core dump found in the work directory after the run
    pub core: Option<PathBuf>,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub work_dir: PathBuf,
    /// Rendered command line
    pub command: String,
    pub environment: ExecutionEnvironment,
}

impl ExecutionSpec {
    pub fn new(work_dir: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            command: command.into(),
            environment: ExecutionEnvironment::default(),
        }
    }

    pub fn with_environment(mut self, environment: ExecutionEnvironment) -> Self {
        self.environment = environment;
        self
    }
}

/// Runs one command under the sandbox policy of its environment.
///
/// Errors are returned only when the process cannot be started at all;
/// anything the process itself does is classified in the outcome.
pub async fn execute(spec: &ExecutionSpec) -> anyhow::Result<ExecutionOutcome> {
    if spec.command.trim().is_empty() {
        anyhow::bail!("No command specified for execution");
    }
    let env = &spec.environment;
    debug!(
        "Executing ({:?}) in {}: {}",
        env.backend,
        spec.work_dir.display(),
        spec.command
    );

    let started = Instant::now();
    let (raw_output, status) = match env.backend {
        Backend::Batch => run_batch(spec).await?,
        Backend::Piped => run_piped(spec).await?,
    };
    let duration = started.elapsed().as_secs_f64();

    Ok(classify(spec, raw_output, exit_code_of(status), duration))
}

fn classify(
    spec: &ExecutionSpec,
    mut raw_output: Vec<u8>,
    exit_code: i32,
    duration: f64,
) -> ExecutionOutcome {
    let env = &spec.environment;

    if env.limit_output > 0 && raw_output.len() > env.limit_output {
        raw_output.truncate(env.limit_output);
    }
    let mut output = clear_unicode(&raw_output);

    let mut status = ExecutionStatus::Success;
    if env.timeout > 0 && duration >= env.timeout as f64 {
        status = ExecutionStatus::Timeout;
    }

    let core = find_core_dump(&spec.work_dir);
    if core.is_some() {
        status = ExecutionStatus::Crash;
        output = output.replace(TIMEOUT_CORE_BANNER, "");
    }

    if status == ExecutionStatus::Success && exit_code != 0 {
        status = ExecutionStatus::CodeNotZero;
    }

    ExecutionOutcome {
        status,
        output,
        exit_code,
        duration,
        core,
    }
}

/// Signals are reported the way a shell does, as 128 + signal
fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Outer wrappers: `nice`, then the wall-clock `timeout`
fn wrapper_argv(env: &ExecutionEnvironment) -> Vec<String> {
    let mut argv = Vec::new();
    if env.nice != 0 {
        argv.extend(["nice".to_string(), "-n".to_string(), env.nice.to_string()]);
    }
    if env.timeout > 0 && env.timeout_method == TimeoutMethod::Timeout {
        argv.extend(["timeout".to_string(), format!("{}s", env.timeout)]);
    }
    argv
}

fn build_command(argv: Vec<String>, spec: &ExecutionSpec) -> anyhow::Result<Command> {
    let mut full = wrapper_argv(&spec.environment);
    full.extend(argv);
    let (program, args) = full
        .split_first()
        .context("Empty command after wrapping")?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&spec.work_dir)
        .kill_on_drop(true);

    let env = &spec.environment;
    let cpu_seconds = (env.timeout > 0 && env.timeout_method == TimeoutMethod::Ulimit)
        .then_some(env.timeout);
    let memory_bytes = (env.limit_memory > 0).then(|| env.limit_memory.saturating_mul(1024));

    // SAFETY: only async-signal-safe setrlimit calls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            lower_soft_limit(Resource::RLIMIT_CORE, CORE_LIMIT_BYTES)?;
            if let Some(seconds) = cpu_seconds {
                lower_soft_limit(Resource::RLIMIT_CPU, seconds)?;
            }
            if let Some(bytes) = memory_bytes {
                lower_soft_limit(Resource::RLIMIT_AS, bytes)?;
            }
            Ok(())
        });
    }

    Ok(cmd)
}

/// Sets the soft limit, never above the inherited hard limit
fn lower_soft_limit(resource: Resource, value: u64) -> nix::Result<()> {
    let (_, hard) = getrlimit(resource)?;
    setrlimit(resource, value.min(hard), hard)
}

async fn run_batch(spec: &ExecutionSpec) -> anyhow::Result<(Vec<u8>, ExitStatus)> {
    let env = &spec.environment;
    let redirect = match env.output_stream {
        OutputStream::Both => "exec 2>&1",
        OutputStream::Stdout => "exec 2>/dev/null",
        OutputStream::Stderr => "exec 2>&1 1>/dev/null",
    };
    let script = format!("{}\n{}", redirect, spec.command);

    let mut stdin_file = tempfile::tempfile().context("Failed to create stdin file")?;
    stdin_file.write_all(env.stdin.as_bytes())?;
    stdin_file.write_all(b"\n")?;
    stdin_file.seek(SeekFrom::Start(0))?;

    let mut cmd = build_command(vec!["sh".into(), "-c".into(), script], spec)?;
    cmd.stdin(Stdio::from(stdin_file))
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("Failed to spawn shell")?;
    let stdout = child.stdout.take().context("Missing stdout pipe")?;

    let output = drain(stdout, cap_of(env), true).await?;
    let status = child.wait().await.context("Failed to wait for process")?;
    Ok((output, status))
}

async fn run_piped(spec: &ExecutionSpec) -> anyhow::Result<(Vec<u8>, ExitStatus)> {
    let env = &spec.environment;
    let argv = if is_plain_argv(&spec.command) {
        spec.command.split_whitespace().map(str::to_string).collect()
    } else {
        vec!["sh".into(), "-c".into(), spec.command.clone()]
    };

    let mut cmd = build_command(argv, spec)?;
    cmd.stdin(Stdio::piped());
    match env.output_stream {
        OutputStream::Both => cmd.stdout(Stdio::piped()).stderr(Stdio::piped()),
        OutputStream::Stdout => cmd.stdout(Stdio::piped()).stderr(Stdio::null()),
        OutputStream::Stderr => cmd.stdout(Stdio::null()).stderr(Stdio::piped()),
    };

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", spec.command))?;

    let stdin = child.stdin.take();
    let input = env.stdin.clone();
    let write_stdin = async move {
        if let Some(mut stdin) = stdin {
            // A child that exits without reading closes the pipe early
            let _ = stdin.write_all(input.as_bytes()).await;
        }
    };

    let cap = cap_of(env);
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let read_stdout = async move {
        match stdout {
            Some(pipe) => drain(pipe, cap, false).await,
            None => Ok(Vec::new()),
        }
    };
    let read_stderr = async move {
        match stderr {
            Some(pipe) => drain(pipe, cap, false).await,
            None => Ok(Vec::new()),
        }
    };

    let ((), out, err) = tokio::join!(write_stdin, read_stdout, read_stderr);
    let mut output = out?;
    output.extend(err?);

    let status = child.wait().await.context("Failed to wait for process")?;
    Ok((output, status))
}

fn cap_of(env: &ExecutionEnvironment) -> Option<usize> {
    (env.limit_output > 0).then(|| env.limit_output + READ_SLACK)
}

/// Reads up to `cap` bytes. With `keep_draining` the rest is read and
/// discarded so the process can run to completion.
async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: Option<usize>,
    keep_draining: bool,
) -> anyhow::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.map_or(n, |cap| cap.saturating_sub(kept.len()).min(n));
        kept.extend_from_slice(&buf[..room]);
        if room < n && !keep_draining {
            break;
        }
    }
    Ok(kept)
}

/// Runs a command to completion and returns its first output line
pub async fn first_line_of(command: &str, work_dir: &Path) -> Option<String> {
    let env = ExecutionEnvironment {
        timeout: 10,
        ..Default::default()
    };
    let spec = ExecutionSpec::new(work_dir, command).with_environment(env);
    let outcome = execute(&spec).await.ok()?;
    outcome
        .output
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
}
