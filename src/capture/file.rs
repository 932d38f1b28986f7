use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{CaptureSource, Frame, FrameSource};

/// Serves the same image for every scan. Handy for trying out classification settings.
pub struct StaticImageCapture {
    image: ImageOrigin,
}

enum ImageOrigin {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl StaticImageCapture {
    pub fn from_path(path: PathBuf) -> Self {
        Self {
            image: ImageOrigin::Path(path),
        }
    }

    pub fn from_bytes(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            image: ImageOrigin::Bytes(data.into()),
        }
    }
}

#[async_trait]
impl CaptureSource for StaticImageCapture {
    async fn acquire(&self) -> Result<Box<dyn FrameSource>> {
        let data: Arc<[u8]> = match &self.image {
            ImageOrigin::Path(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read capture image {path:?}"))?
                .into(),
            ImageOrigin::Bytes(data) => data.clone(),
        };
        Ok(Box::new(StaticFrameSource { data }))
    }
}

struct StaticFrameSource {
    data: Arc<[u8]>,
}

#[async_trait]
impl FrameSource for StaticFrameSource {
    async fn current_frame(&self) -> Result<Frame> {
        Ok(Frame::png(self.data.to_vec()))
    }

    async fn release(&self) {}
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_path_is_read_on_acquire() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("screen.png");
        tokio::fs::write(&path, [1u8, 2, 3]).await?;

        let frames = StaticImageCapture::from_path(path).acquire().await?;
        assert_eq!(frames.current_frame().await?, Frame::png(vec![1, 2, 3]));
        frames.release().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_fails_acquire() {
        let capture = StaticImageCapture::from_path("/nonexistent/screen.png".into());
        assert!(capture.acquire().await.is_err());
    }
}
