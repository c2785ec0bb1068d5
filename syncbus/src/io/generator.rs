//! Content generator collaborator.
//!
//! The [`ContentGenerator`] trait decouples the cycle from the text backend
//! (a local model CLI by default). Tests use scripted generators that return
//! predetermined bodies without spawning processes.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::routing::GenerationContext;
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::io::prompt::PromptBuilder;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorError {
    #[error("generator timed out after {0:?}")]
    TimedOut(Duration),
    #[error("generator failed: {0}")]
    Failed(String),
}

/// Produces packet and directive prose from an assembled context.
pub trait ContentGenerator {
    /// Generate text for `ctx`, giving up after `timeout`.
    fn generate(
        &self,
        ctx: &GenerationContext,
        timeout: Duration,
    ) -> Result<String, GeneratorError>;
}

/// Call `generator`, treating a result that arrives after `timeout` as a
/// timeout even when the generator itself ignored the deadline.
pub fn generate_with_deadline(
    generator: &dyn ContentGenerator,
    ctx: &GenerationContext,
    timeout: Duration,
) -> Result<String, GeneratorError> {
    let started = Instant::now();
    let result = generator.generate(ctx, timeout);
    let elapsed = started.elapsed();
    if elapsed > timeout && result.is_ok() {
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        warn!(elapsed_ms, "discarding late generator output");
        return Err(GeneratorError::TimedOut(timeout));
    }
    result
}

/// Generator that pipes a rendered prompt into a command's stdin and reads
/// the answer from stdout (e.g. `ollama run llama3.2:3b`).
pub struct CommandGenerator {
    argv: Vec<String>,
    workdir: PathBuf,
    output_limit_bytes: usize,
    prompts: PromptBuilder,
}

impl CommandGenerator {
    pub fn new(
        argv: Vec<String>,
        workdir: impl Into<PathBuf>,
        output_limit_bytes: usize,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            argv,
            workdir: workdir.into(),
            output_limit_bytes,
            prompts: PromptBuilder::new()?,
        })
    }
}

impl ContentGenerator for CommandGenerator {
    #[instrument(skip_all, fields(target = ctx.label(), timeout_secs = timeout.as_secs()))]
    fn generate(
        &self,
        ctx: &GenerationContext,
        timeout: Duration,
    ) -> Result<String, GeneratorError> {
        let prompt = self
            .prompts
            .render(ctx)
            .map_err(|err| GeneratorError::Failed(format!("{err:#}")))?;
        let mut cmd =
            command_from_argv(&self.argv).map_err(|err| GeneratorError::Failed(err.to_string()))?;
        cmd.current_dir(&self.workdir);

        info!(program = ?cmd.get_program(), "starting generator");
        let limit = self.output_limit_bytes;
        let output = run_command_with_timeout(cmd, Some(prompt.as_bytes()), timeout, limit)
            .map_err(|err| GeneratorError::Failed(format!("{err:#}")))?;

        if output.timed_out {
            return Err(GeneratorError::TimedOut(timeout));
        }
        if !output.status.success() {
            let tail = output.stderr_tail();
            warn!(exit_code = ?output.status.code(), stderr = %tail, "generator failed");
            return Err(GeneratorError::Failed(format!(
                "exit status {:?}: {tail}",
                output.status.code()
            )));
        }
        let text = output.stdout_lossy().trim().to_string();
        debug!(bytes = text.len(), "generator finished");
        Ok(text)
    }
}
