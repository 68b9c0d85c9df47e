//! Runs tools as child processes.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use warden_model::{OutputHandle, normalize_tool_name};

use super::{
    ExecutionError, ExecutionLimits, FindingExtractor, JsonLinesExtractor,
    ToolInvocation, ToolOutcome, ToolRunner,
};

const TARGET_PLACEHOLDER: &str = "{target}";
const STDERR_TAIL_BYTES: usize = 2_048;

/// Runs each tool as a child process from a configured argv template.
///
/// Stdout goes to `<output_dir>/<run-id>.out` and is handed to the finding
/// extractor after the process exits. The soft timeout and cancellation send
/// SIGTERM; the child is also `kill_on_drop`, so dropping the future (hard
/// timeout) kills it.
pub struct ProcessToolRunner {
    commands: HashMap<String, Vec<String>>,
    output_dir: PathBuf,
    extractor: Arc<dyn FindingExtractor>,
}

impl std::fmt::Debug for ProcessToolRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessToolRunner")
            .field("tools", &self.commands.keys().collect::<Vec<_>>())
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}

impl ProcessToolRunner {
    /// Builds a runner from `tool -> argv` templates; `{target}` in any
    /// argument is replaced with the target value.
    pub fn new(
        commands: &BTreeMap<String, Vec<String>>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            commands: commands
                .iter()
                .map(|(tool, argv)| (normalize_tool_name(tool), argv.clone()))
                .collect(),
            output_dir: output_dir.into(),
            extractor: Arc::new(JsonLinesExtractor),
        }
    }

    /// Replaces the default JSON-lines finding extractor.
    pub fn with_extractor(mut self, extractor: Arc<dyn FindingExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    fn argv(&self, invocation: &ToolInvocation) -> Result<(String, Vec<String>), ExecutionError> {
        let template = self
            .commands
            .get(&normalize_tool_name(&invocation.tool))
            .ok_or_else(|| ExecutionError::UnknownTool(invocation.tool.clone()))?;
        let (program, args) = template
            .split_first()
            .ok_or_else(|| ExecutionError::UnknownTool(invocation.tool.clone()))?;
        let args = args
            .iter()
            .map(|arg| arg.replace(TARGET_PLACEHOLDER, &invocation.target))
            .collect();
        Ok((program.clone(), args))
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run_tool(
        &self,
        invocation: ToolInvocation,
        limits: ExecutionLimits,
    ) -> Result<ToolOutcome, ExecutionError> {
        let (program, args) = self.argv(&invocation)?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output_path = self.output_dir.join(format!("{}.out", invocation.run_id));
        let stdout = tokio::fs::File::create(&output_path).await?.into_std().await;

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                tool: invocation.tool.clone(),
                source,
            })?;

        let pid = child.id();
        tracing::debug!(
            target: "warden::execution",
            run = %invocation.run_id,
            tool = %invocation.tool,
            attempt = invocation.attempt,
            pid,
            "tool process started"
        );

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let soft_timeout = tokio::time::sleep(limits.soft_timeout);
        tokio::pin!(soft_timeout);
        let mut terminated = false;
        let mut cancelled = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = &mut soft_timeout, if !terminated => {
                    tracing::warn!(
                        target: "warden::execution",
                        run = %invocation.run_id,
                        tool = %invocation.tool,
                        "soft timeout reached, sending SIGTERM"
                    );
                    send_sigterm(pid);
                    terminated = true;
                }
                _ = limits.cancel.cancelled(), if !cancelled => {
                    send_sigterm(pid);
                    cancelled = true;
                    terminated = true;
                }
            }
        };

        let stderr_tail = match stderr_reader {
            Some(handle) => handle.await.ok().map(|bytes| tail(&bytes)),
            None => None,
        };

        if cancelled {
            return Err(ExecutionError::Cancelled);
        }

        let exit_code = status.code().unwrap_or(-1);
        if terminated && exit_code != 0 {
            return Err(ExecutionError::SoftTimeout(limits.soft_timeout));
        }

        let findings = if exit_code == 0 {
            // Tools are not required to write UTF-8; decode what is there.
            let bytes = tokio::fs::read(&output_path).await?;
            self.extractor
                .extract(&invocation.tool, &String::from_utf8_lossy(&bytes))
        } else {
            Vec::new()
        };

        Ok(ToolOutcome {
            exit_code,
            output: Some(OutputHandle(output_path.display().to_string())),
            stderr_tail: stderr_tail.filter(|tail| !tail.is_empty()),
            findings,
        })
    }
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!(target: "warden::execution", pid, %err, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) {}
