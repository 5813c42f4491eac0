use std::time::{Duration, Instant};

use anyhow::bail;

use crate::{
    events::CancelToken,
    process::{self, Exit, ProcessSpec, ProcessStatus},
};

/// How often a running upload tool is checked for exit and cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Time a cancelled upload tool gets to stop before it is killed
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Puts the firmware onto the device. Called once, before the device link is opened.
/// Implementations return an error soon after `cancel` is set.
pub trait Uploader: Send {
    fn upload(&mut self, cancel: &CancelToken) -> anyhow::Result<()>;
}

/// Used when the firmware has been uploaded before the bridge was started
#[derive(Debug, Default)]
pub struct SkipUpload;

impl Uploader for SkipUpload {
    fn upload(&mut self, _: &CancelToken) -> anyhow::Result<()> {
        log::info!("No upload command configured, assuming the firmware is in place");
        Ok(())
    }
}

/// Runs an upload tool and waits for it. A non-zero exit fails the upload.
#[derive(Debug, Clone)]
pub struct CommandUploader {
    argv: Vec<String>,
}

impl CommandUploader {
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl Uploader for CommandUploader {
    fn upload(&mut self, cancel: &CancelToken) -> anyhow::Result<()> {
        if self.argv.is_empty() {
            bail!("empty upload command");
        }
        let spec = ProcessSpec::new("upload", self.argv.clone());
        log::info!("Uploading firmware: {}", spec.command_line());

        let started = Instant::now();
        let mut tool = process::spawn(&spec)?;
        loop {
            if let ProcessStatus::Exited(exit) = tool.poll() {
                if exit != Exit::Code(0) {
                    bail!("`{}` returned with {exit}", tool.command_line());
                }
                log::info!("Upload finished after {:?}", started.elapsed());
                return Ok(());
            }
            if cancel.sleep(POLL_INTERVAL) {
                tool.terminate(TERMINATE_GRACE);
                bail!("upload cancelled after {:?}", started.elapsed());
            }
        }
    }
}
