//! Hand-off points for accepted images: thumbnail generation and display.
//!
//! Neither is allowed to stop a scan; callers log failures and move on.

use crate::types::ImageFormat;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ThumbnailError {
    #[error("cannot decode {format}: {message}")]
    Decode {
        format: ImageFormat,
        message: String,
    },

    #[error("cannot write thumbnail: {0}")]
    Write(String),

    #[error("viewer failed: {0}")]
    Viewer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait Thumbnailer: Send + Sync {
    /// Writes a bounded-size raster of `data` under `dir` and returns its path.
    fn generate(
        &self,
        hash: &str,
        data: &[u8],
        format: ImageFormat,
        dir: &Path,
    ) -> Result<PathBuf, ThumbnailError>;
}

pub trait Presenter: Send + Sync {
    fn present(&self, data: &[u8], format: ImageFormat) -> Result<(), ThumbnailError>;
}

fn codec_format(format: ImageFormat) -> image::ImageFormat {
    match format {
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        ImageFormat::Gif => image::ImageFormat::Gif,
        ImageFormat::Bmp => image::ImageFormat::Bmp,
        ImageFormat::Webp => image::ImageFormat::WebP,
    }
}

/// Decodes with the `image` crate and writes `<hash>.png` no larger than
/// `edge` pixels on its longest side.
pub struct ImageThumbnailer {
    edge: u32,
}

impl ImageThumbnailer {
    pub fn new(edge: u32) -> Self {
        Self { edge: edge.max(1) }
    }

    pub fn edge(&self) -> u32 {
        self.edge
    }
}

impl Thumbnailer for ImageThumbnailer {
    fn generate(
        &self,
        hash: &str,
        data: &[u8],
        format: ImageFormat,
        dir: &Path,
    ) -> Result<PathBuf, ThumbnailError> {
        let img = image::load_from_memory_with_format(data, codec_format(format)).map_err(|e| {
            ThumbnailError::Decode {
                format,
                message: e.to_string(),
            }
        })?;
        let thumb = img.thumbnail(self.edge, self.edge);

        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{hash}.png"));
        thumb
            .save_with_format(&path, image::ImageFormat::Png)
            .map_err(|e| ThumbnailError::Write(e.to_string()))?;
        Ok(path)
    }
}

pub struct NoopPresenter;

impl Presenter for NoopPresenter {
    fn present(&self, _data: &[u8], _format: ImageFormat) -> Result<(), ThumbnailError> {
        Ok(())
    }
}

/// Writes the payload to a temporary file and runs an external viewer on it.
pub struct CommandPresenter {
    program: String,
    args: Vec<String>,
}

impl CommandPresenter {
    /// `command` is split on whitespace; the file path is appended last.
    pub fn new(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl Presenter for CommandPresenter {
    fn present(&self, data: &[u8], format: ImageFormat) -> Result<(), ThumbnailError> {
        let mut file = tempfile::Builder::new()
            .prefix("chainscry-")
            .suffix(&format!(".{}", format.extension()))
            .tempfile()?;
        file.write_all(data)?;
        file.flush()?;

        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(file.path())
            .status()?;
        if !status.success() {
            return Err(ThumbnailError::Viewer(format!(
                "{} exited with {status}",
                self.program
            )));
        }
        Ok(())
    }
}
