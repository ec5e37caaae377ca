use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::palette::Rgb;

const VALID_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("no image.png/.jpg/.jpeg found in {0}")]
    NotFound(PathBuf),
    #[error("failed to decode target image - {0}")]
    Decode(#[from] image::ImageError),
}

/// The image the bot is trying to paint. Decoded once at startup and never
/// mutated; alpha is dropped during decode.
#[derive(Debug, Clone)]
pub struct TargetImage {
    width: u32,
    height: u32,
    pixels: Vec<Rgb>,
}

impl TargetImage {
    /// Look for `image.<ext>` next to the process working directory, first
    /// matching extension wins.
    pub fn load_from_dir(dir: &Path) -> Result<(Self, PathBuf), TargetError> {
        for ext in VALID_EXTENSIONS {
            let path = dir.join(format!("image.{ext}"));
            if path.exists() {
                let target = Self::load(&path)?;
                return Ok((target, path));
            }
        }
        Err(TargetError::NotFound(dir.to_path_buf()))
    }

    pub fn load(path: &Path) -> Result<Self, TargetError> {
        let decoded = image::open(path)?.to_rgb8();
        let (width, height) = decoded.dimensions();
        let pixels = decoded
            .pixels()
            .map(|p| Rgb::new(p[0], p[1], p[2]))
            .collect();
        Ok(TargetImage {
            width,
            height,
            pixels,
        })
    }

    #[cfg(test)]
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<Rgb>) -> Self {
        assert_eq!(pixels.len(), (width * height) as usize);
        TargetImage {
            width,
            height,
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.pixels[(y * self.width + x) as usize])
    }
}
