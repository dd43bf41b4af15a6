use std::fs::File;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, ImageFormat, ImageReader, Limits};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Writes through a sibling `.tmp` file renamed into place. The temp file never outlives a failure.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let written = File::create(&tmp_path).and_then(|mut file| {
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    });
    if written.is_err() {
        match std::fs::remove_file(&tmp_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!(error = %e, path = %tmp_path.display(), "failed to remove temp file");
            }
            _ => {}
        }
    }
    written
}

/// Allowed image formats - explicit allowlist
const ALLOWED_FORMATS: &[ImageFormat] = &[ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP];

const PHOTO_EXTENSION: &str = "webp";

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: image::ImageError,
    },

    #[error("input too large: {size} bytes, max {max_size}")]
    CompressedTooLarge { size: usize, max_size: usize },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("webp encoding failed: width={width}, height={height}, reason={reason}")]
    WebpEncode {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("photo io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path is outside the photo directory: {0}")]
    ForeignPath(PathBuf),
}

#[derive(Clone, Debug)]
pub struct ImageLimits {
    pub max_input_bytes: usize,
    pub max_image_pixels: u64,
    pub max_dimension: u32,
    pub max_alloc_bytes: u64,
    /// Longest side of photos written to disk.
    pub storage_max_side: u32,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_input_bytes: 20 * 1024 * 1024,
            max_image_pixels: 100_000_000,
            max_dimension: 15_000,
            max_alloc_bytes: 512 * 1024 * 1024,
            storage_max_side: 1024,
        }
    }
}

/// Decodes an encoded photo, checking size, format and dimensions before the full decode.
#[instrument(skip(limits, raw_bytes), fields(input_size = raw_bytes.len()))]
pub fn decode_image(limits: &ImageLimits, raw_bytes: &[u8]) -> Result<DynamicImage, ImagingError> {
    if raw_bytes.is_empty() {
        return Err(ImagingError::EmptyInput);
    }

    if raw_bytes.len() > limits.max_input_bytes {
        return Err(ImagingError::CompressedTooLarge {
            size: raw_bytes.len(),
            max_size: limits.max_input_bytes,
        });
    }

    let format = image::guess_format(raw_bytes)
        .map_err(|_| ImagingError::UnsupportedFormat("unrecognised".into()))?;
    if !ALLOWED_FORMATS.contains(&format) {
        return Err(ImagingError::UnsupportedFormat(format!("{format:?}")));
    }

    // Dimension check before decode (prevents decompression bombs)
    let (width, height) = ImageReader::with_format(Cursor::new(raw_bytes), format).into_dimensions()?;
    if width == 0 || height == 0 {
        return Err(ImagingError::InvalidDimensions { width, height });
    }
    let pixels = u64::from(width) * u64::from(height);
    if pixels > limits.max_image_pixels {
        return Err(ImagingError::ImageTooLarge {
            width,
            height,
            pixels,
            max_pixels: limits.max_image_pixels,
        });
    }

    let mut decode_limits = Limits::default();
    decode_limits.max_image_width = Some(limits.max_dimension);
    decode_limits.max_image_height = Some(limits.max_dimension);
    decode_limits.max_alloc = Some(limits.max_alloc_bytes);

    let mut reader = ImageReader::with_format(Cursor::new(raw_bytes), format);
    reader.limits(decode_limits);

    let img = reader.decode()?;
    debug!(width, height, ?format, "image decoded");
    Ok(img)
}

/// Shrinks so the longest side is at most `max_side`. Never upscales.
#[must_use]
pub fn resize_for_storage(img: &DynamicImage, max_side: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w <= max_side && h <= max_side {
        return img.clone();
    }
    img.resize(max_side, max_side, image::imageops::FilterType::Triangle)
}

pub fn encode_webp(img: &DynamicImage) -> Result<Vec<u8>, ImagingError> {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();

    if width == 0 || height == 0 {
        return Err(ImagingError::WebpEncode {
            width,
            height,
            reason: "zero dimension".into(),
        });
    }

    let mut buffer = Vec::with_capacity((width * height * 4) as usize / 10);
    let encoder = WebPEncoder::new_lossless(&mut buffer);

    encoder
        .write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
        .map_err(|e| ImagingError::WebpEncode {
            width,
            height,
            reason: e.to_string(),
        })?;

    if buffer.len() < 12 || &buffer[0..4] != b"RIFF" || &buffer[8..12] != b"WEBP" {
        return Err(ImagingError::WebpEncode {
            width,
            height,
            reason: "invalid webp magic bytes".into(),
        });
    }

    Ok(buffer)
}

/// Directory of meal photos referenced by history entries.
#[derive(Debug, Clone)]
pub struct MealPhotoStore {
    dir: PathBuf,
    limits: ImageLimits,
}

impl MealPhotoStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ImagingError> {
        Self::with_limits(dir, ImageLimits::default())
    }

    pub fn with_limits(dir: impl Into<PathBuf>, limits: ImageLimits) -> Result<Self, ImagingError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, limits })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decodes, downsizes and stores a captured photo. Returns the written path.
    #[instrument(skip(self, raw_bytes), fields(input_size = raw_bytes.len()))]
    pub fn save(&self, raw_bytes: &[u8]) -> Result<PathBuf, ImagingError> {
        let img = decode_image(&self.limits, raw_bytes)?;
        self.save_image(&img)
    }

    pub fn save_image(&self, img: &DynamicImage) -> Result<PathBuf, ImagingError> {
        let resized = resize_for_storage(img, self.limits.storage_max_side);
        let encoded = encode_webp(&resized)?;

        let path = self
            .dir
            .join(format!("{}.{PHOTO_EXTENSION}", Uuid::new_v4().simple()));
        write_atomic(&path, &encoded)?;

        debug!(path = %path.display(), bytes = encoded.len(), "meal photo stored");
        Ok(path)
    }

    /// Removes a stored photo. Returns false when it was already gone.
    pub fn delete(&self, path: &Path) -> Result<bool, ImagingError> {
        if path.parent() != Some(self.dir.as_path()) {
            return Err(ImagingError::ForeignPath(path.to_path_buf()));
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "photo already removed");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
