//! Screen frames for classification. [CaptureSource] acquires a live source, [FrameSource]
//! hands out the current frame until released. [command::CommandCapture] is the default
//! implementation, [file::StaticImageCapture] serves a fixed image.

pub mod command;
pub mod file;

use anyhow::Result;
use async_trait::async_trait;

/// One captured image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
}

impl Frame {
    pub fn png(data: Vec<u8>) -> Self {
        Self {
            data,
            mime_type: "image/png",
        }
    }
}

/// Entry point for getting a frame source. Acquisition failures (missing permission, missing
/// tool, unsupported platform) are reported to the user and not retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn FrameSource>>;
}

#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn current_frame(&self) -> Result<Frame>;

    async fn release(&self);
}
