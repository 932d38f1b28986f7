use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::{CaptureSource, Frame, FrameSource};

/// Frames smaller than this are treated as a failed grab.
const MIN_FRAME_BYTES: usize = 64;

/// Default screenshot command writing a PNG to stdout.
pub fn default_capture_command() -> Vec<String> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "macos")] {
            ["screencapture", "-x", "-t", "png", "/dev/stdout"]
                .into_iter()
                .map(String::from)
                .collect()
        } else if #[cfg(windows)] {
            vec![]
        } else {
            ["grim", "-t", "png", "-"]
                .into_iter()
                .map(String::from)
                .collect()
        }
    }
}

/// Grabs the screen by running an external tool that prints a PNG to stdout.
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
}

impl CommandCapture {
    pub fn new(command: Vec<String>) -> Result<Self> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("No screen capture command is configured for this platform"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl CaptureSource for CommandCapture {
    /// Runs the command once so that missing tools or denied permissions show up before the
    /// session starts.
    #[instrument(skip(self), fields(program = %self.program))]
    async fn acquire(&self) -> Result<Box<dyn FrameSource>> {
        let source = CommandFrameSource {
            program: self.program.clone(),
            args: self.args.clone(),
        };
        let frame = source
            .current_frame()
            .await
            .context("Failed to start screen capture")?;
        info!("Screen capture ready, probe frame {} bytes", frame.data.len());
        Ok(Box::new(source))
    }
}

struct CommandFrameSource {
    program: String,
    args: Vec<String>,
}

#[async_trait]
impl FrameSource for CommandFrameSource {
    async fn current_frame(&self) -> Result<Frame> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if output.stdout.len() < MIN_FRAME_BYTES {
            bail!(
                "{} produced a suspiciously small frame ({} bytes)",
                self.program,
                output.stdout.len()
            );
        }
        debug!("Captured {} bytes", output.stdout.len());
        Ok(Frame::png(output.stdout))
    }

    async fn release(&self) {
        debug!("Released command capture {}", self.program);
    }
}
